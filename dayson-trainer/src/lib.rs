mod dataset;
pub use dataset::DatasetShardService;
mod events;
pub use events::{CapturingSink, EventSink, LogSink, TrainEvent};
mod memory;
pub use memory::current_rss_bytes;
mod trainer;
pub use trainer::{TrainReport, Trainer, TrainerConfig};
