pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    encode_png,
    mime_for,
    prescale_async,
    to_data_uri,
    PreparedImage,
    SizeLimit,
};
pub use metrics::Metrics;
