use dayson_core::{read_record, sanitize_name, write_record, CoreError, Result, Tensor};
use dayson_engine::MathEngine;
use log::warn;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Ephemeral write-through store for BPTT activations. The session
/// directory is deleted and recreated at construction; swap files live for
/// a single training step.
pub struct SwapStore {
    dir: PathBuf,
}

impl SwapStore {
    pub fn open(root: &Path, session: &str) -> Result<Self> {
        let dir = root.join("Swap").join(session);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serializes the tensor, makes the bytes durable, then destroys the
    /// in-memory tensor (releasing device memory). Consumes the tensor:
    /// after this returns, the only copy is on disk.
    pub fn swap_out(
        &self,
        engine: &dyn MathEngine,
        tensor: Tensor,
        label: &str,
    ) -> Result<PathBuf> {
        let shape = tensor.shape().to_vec();
        let data = engine.read_back(&tensor)?;
        let path = self.dir.join(format!(
            "{}_{:032x}.swap",
            sanitize_name(label),
            rand::random::<u128>()
        ));
        let mut file = File::create(&path)?;
        if let Err(e) = write_record(&mut file, &shape, &data) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        file.sync_all()?;
        drop(tensor);
        Ok(path)
    }

    /// Materializes a fresh tensor from a swap file; destruction is the
    /// caller's responsibility.
    pub fn load(&self, engine: &dyn MathEngine, path: &Path) -> Result<Tensor> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("swap file {}", path.display()))
            } else {
                CoreError::IoFailure(e)
            }
        })?;
        let (shape, data) = read_record(&mut file)?;
        engine.create_from(&data, &shape)
    }

    pub fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::IoFailure(e)),
        }
    }

    /// Removes every swap file in the session directory. Errors are
    /// swallowed per file: cleanup must make progress.
    pub fn clear_all(&self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("swap directory {} unreadable: {e}", self.dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("swap file {} not removed: {e}", entry.path().display());
            }
        }
    }

    pub fn file_count(&self) -> Result<usize> {
        Ok(fs::read_dir(&self.dir)?.count())
    }
}
