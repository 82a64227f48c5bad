use log::{info, warn};
use std::path::PathBuf;
use std::sync::Mutex;

/// Progress notifications emitted by the trainer. Tests inject a capturing
/// sink instead of scraping console output.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainEvent {
    EpochStarted {
        epoch: usize,
    },
    BatchCompleted {
        epoch: usize,
        batch: usize,
        mean_loss: f64,
    },
    BatchFailed {
        epoch: usize,
        batch: usize,
        error: String,
    },
    MemoryTrimmed {
        rss_bytes: u64,
    },
    ValidationCompleted {
        epoch: usize,
        mean_loss: f64,
    },
    ModelSaved {
        epoch: usize,
        path: PathBuf,
    },
    EpochCompleted {
        epoch: usize,
        train_loss: f64,
        validation_loss: f64,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TrainEvent);
}

/// Routes events through the `log` facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &TrainEvent) {
        match event {
            TrainEvent::EpochStarted { epoch } => info!("epoch {epoch} started"),
            TrainEvent::BatchCompleted {
                epoch,
                batch,
                mean_loss,
            } => info!("epoch {epoch} batch {batch}: loss {mean_loss:.4}"),
            TrainEvent::BatchFailed {
                epoch,
                batch,
                error,
            } => warn!("epoch {epoch} batch {batch} failed: {error}"),
            TrainEvent::MemoryTrimmed { rss_bytes } => {
                warn!("emergency memory trim at rss {} MiB", rss_bytes >> 20)
            }
            TrainEvent::ValidationCompleted { epoch, mean_loss } => {
                info!("epoch {epoch} validation loss {mean_loss:.4}")
            }
            TrainEvent::ModelSaved { epoch, path } => {
                info!("epoch {epoch} model catalog saved to {}", path.display())
            }
            TrainEvent::EpochCompleted {
                epoch,
                train_loss,
                validation_loss,
            } => info!(
                "epoch {epoch} complete: train {train_loss:.4}, validation {validation_loss:.4}"
            ),
        }
    }
}

/// Records every event; for tests.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<TrainEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrainEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, event: &TrainEvent) {
        self.events
            .lock()
            .expect("event log poisoned")
            .push(event.clone());
    }
}
