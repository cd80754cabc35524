pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    CacheError, CompositingError, ConfigError, ErrorKind, HostError, JobError, PipelineError,
    RenderingError, StorageError,
};
pub use types::{
    DeliveredImage, Delivery, FitMode, Panel, PanelScript, Position, Rect, ReplaceOptions,
    WorkloadClass,
};
