use cudarc::driver::{CudaContext, CudaEvent, CudaStream};
use dayson_core::{CoreError, Result};
use log::warn;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_THRESHOLD: Duration = Duration::from_secs(1);

/// Owns the ordering barriers of the single command stream. All `finish`/
/// `flush`-equivalents are issued here and nowhere else.
pub struct SyncGuard {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl SyncGuard {
    pub fn new(ctx: Arc<CudaContext>, stream: Arc<CudaStream>) -> Self {
        Self { ctx, stream }
    }

    /// Blocks until every previously enqueued command has completed. Must be
    /// called before any host read of a device buffer.
    pub fn synchronize_before_read(&self, label: &str) -> Result<()> {
        let start = Instant::now();
        self.stream.synchronize().map_err(|e| {
            CoreError::DeviceFailure(format!("synchronize before read of {label}: {e}"))
        })?;
        self.note_slow("synchronize", label, start.elapsed());
        Ok(())
    }

    /// Same barrier, but failure is logged instead of raised: disposal must
    /// make progress even on a broken queue.
    pub fn synchronize_before_dispose(&self, label: &str, bytes: usize) {
        let start = Instant::now();
        if let Err(e) = self.stream.synchronize() {
            warn!("synchronize before dispose of {label} ({bytes} bytes) failed: {e}");
            return;
        }
        self.note_slow("dispose synchronize", label, start.elapsed());
    }

    /// Enqueues a marker whose completion implies that every prior command
    /// has completed.
    pub fn insert_marker(&self, label: &str) -> Result<CudaEvent> {
        let event = self.ctx.new_event(None).map_err(|e| {
            CoreError::DeviceFailure(format!("marker event for {label}: {e}"))
        })?;
        event.record(&self.stream).map_err(|e| {
            CoreError::DeviceFailure(format!("record marker for {label}: {e}"))
        })?;
        Ok(event)
    }

    /// Waits for a marker with a hard deadline. CUDA has no timed event
    /// wait, so the blocking wait runs on a helper thread and the deadline
    /// is enforced on the receiving side.
    pub fn wait_event(&self, event: CudaEvent, label: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(event.synchronize());
        });
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => {
                self.note_slow("event wait", label, start.elapsed());
                Ok(())
            }
            Ok(Err(e)) => Err(CoreError::DeviceFailure(format!(
                "event wait for {label}: {e}"
            ))),
            Err(_) => {
                warn!("event wait for {label} exceeded {timeout:?}");
                Err(CoreError::Timeout(format!(
                    "event {label} did not complete within {timeout:?}"
                )))
            }
        }
    }

    fn note_slow(&self, what: &str, label: &str, elapsed: Duration) {
        if elapsed > SLOW_THRESHOLD {
            warn!("slow {what} for {label}: {elapsed:?}");
        }
    }
}
