pub mod cache;
pub mod compositing;
pub mod model_host;
pub mod rendering;
pub mod storage;
pub mod storyboard;

// Re-export commonly used services
pub use cache::{CacheStats, ResultCache};
pub use compositing::AlphaCompositor;
pub use model_host::{HttpModelHost, JobClient, ModelHost, ModelRef};
pub use rendering::BubbleRenderer;
pub use storage::{BlobStore, LocalBlobStore};
