use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure taxonomy shared by every component. Components raise the most
/// specific variant they can; the trainer decides whether a failure kills a
/// batch or the epoch.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("device failure: {0}")]
    DeviceFailure(String),
    #[error("out of space: {0}")]
    OutOfSpace(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("sanity check failed: {0}")]
    SanityFailed(String),
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for CoreError {
    fn from(e: cudarc::driver::DriverError) -> Self {
        CoreError::DeviceFailure(e.to_string())
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::nvrtc::CompileError> for CoreError {
    fn from(e: cudarc::nvrtc::CompileError) -> Self {
        CoreError::DeviceFailure(format!("kernel compilation failed: {e:?}"))
    }
}
