// Library exports for the image studio service
//
// Job orchestration (pools, retry, external jobs, result cache) lives in
// middleware/ and services/; the feature flows built on it live in pipelines/.

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod pipelines;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::Config,
    errors::{ErrorKind, JobError, PipelineError, RenderingError, StorageError},
    types::{DeliveredImage, Delivery, FitMode, PanelScript, Position, ReplaceOptions, WorkloadClass},
};

pub use middleware::{ConcurrencyPools, RateLimiter, RetryExecutor, RetryPolicy};

pub use orchestration::{Studio, StudioStats};

pub use pipelines::{
    BeautifyRequest, ClarityRequest, ComicGenerationRequest, ComicPageRequest, EnhanceRequest, GeneratedComic,
    RelightOptions, RelightRequest, ReplaceBackgroundRequest, RestyleRequest, Style,
};

pub use services::{BlobStore, BubbleRenderer, JobClient, LocalBlobStore, ModelHost, ResultCache};

pub use utils::Metrics;
