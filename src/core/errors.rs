// Error types for the studio service
//
// Using thiserror for ergonomic error definitions with:
// - Type-safe error matching per concern
// - Source error chaining
// - A coarse ErrorKind used by the HTTP layer to pick a status code

use std::time::Duration;
use thiserror::Error;

/// Coarse classification shared by every error the request path can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input malformed; never retried
    Validation,
    /// Network or 5xx from the model host; retried by the RetryExecutor
    TransientUpstream,
    /// Job reached the `failed` terminal state
    UpstreamFailed,
    /// Job reached the `canceled` terminal state
    UpstreamCanceled,
    /// Local deadline exceeded; the upstream job may still finish
    TimedOut,
    /// Everything else (decode failures, I/O, join errors)
    Internal,
}

/// Errors raised by the model host transport
#[derive(Debug, Error)]
pub enum HostError {
    #[error("model host returned {status}: {message}")]
    Transient { status: u16, message: String },

    #[error("model host rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid model host response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by the external job lifecycle
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job input: {0}")]
    Validation(String),

    #[error("model host call failed: {0}")]
    Host(#[from] HostError),

    #[error("job {job_id} failed upstream: {message}")]
    UpstreamFailed {
        job_id: String,
        message: String,
        logs: Option<String>,
    },

    #[error("job {job_id} was canceled upstream")]
    UpstreamCanceled { job_id: String },

    #[error("job {job_id} did not finish within {elapsed:?}")]
    TimedOut { job_id: String, elapsed: Duration },

    #[error("model returned unusable output: {0}")]
    InvalidOutput(String),

    #[error("admission to the {class} pool failed")]
    Admission { class: &'static str },
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Validation(_) => ErrorKind::Validation,
            JobError::Host(HostError::Rejected { .. }) => ErrorKind::UpstreamFailed,
            JobError::Host(_) => ErrorKind::TransientUpstream,
            JobError::UpstreamFailed { .. } => ErrorKind::UpstreamFailed,
            JobError::UpstreamCanceled { .. } => ErrorKind::UpstreamCanceled,
            JobError::TimedOut { .. } => ErrorKind::TimedOut,
            JobError::InvalidOutput(_) | JobError::Admission { .. } => ErrorKind::Internal,
        }
    }
}

/// Cache errors. Never surfaced to callers: a corrupt entry is a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry {key} has an unexpected shape: {source}")]
    Corruption {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache value could not be serialized: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Alpha compositing errors
#[derive(Debug, Error)]
pub enum CompositingError {
    #[error("invalid target dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("unknown fit mode: {0}")]
    UnknownFit(String),

    #[error("unknown position: {0}")]
    UnknownPosition(String),

    #[error("opacity must be in [0.0, 1.0], got {0}")]
    InvalidOpacity(f32),
}

/// Page layout and bubble rendering errors
#[derive(Debug, Error)]
pub enum RenderingError {
    #[error("page has no panels")]
    NoPanels,

    #[error("{count} panels do not fit on one page")]
    TooManyPanels { count: usize },

    #[error("bubble does not fit: {width}x{height} available")]
    BubbleTooSmall { width: u32, height: u32 },

    #[error("panel {index} image could not be decoded: {source}")]
    PanelDecode {
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("panel {index} image could not be fitted: {source}")]
    PanelFit {
        index: usize,
        #[source]
        source: CompositingError,
    },
}

/// Blob store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write blob {key}: {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read blob {key}: {source}")]
    ReadFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("signature invalid or expired for {0}")]
    InvalidSignature(String),

    #[error("signing secret rejected: {0}")]
    SigningKey(String),
}

/// Pipeline errors surfaced to request handlers
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("compositing failed: {0}")]
    Compositing(#[from] CompositingError),

    #[error("rendering failed: {0}")]
    Rendering(#[from] RenderingError),

    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("input is not a readable image: {0}")]
    UnreadableImage(#[source] image::ImageError),

    #[error("image processing failed: {0:#}")]
    Image(anyhow::Error),

    #[error("task join failed: {0}")]
    TaskJoinFailed(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) | PipelineError::UnreadableImage(_) => ErrorKind::Validation,
            PipelineError::Job(e) => e.kind(),
            PipelineError::Compositing(CompositingError::UnknownFit(_))
            | PipelineError::Compositing(CompositingError::UnknownPosition(_))
            | PipelineError::Rendering(RenderingError::NoPanels)
            | PipelineError::Rendering(RenderingError::TooManyPanels { .. })
            | PipelineError::Rendering(RenderingError::PanelDecode { .. })
            | PipelineError::Rendering(RenderingError::PanelFit { .. }) => ErrorKind::Validation,
            PipelineError::Storage(StorageError::InvalidSignature(_))
            | PipelineError::Storage(StorageError::InvalidKey(_)) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Pool capacity for {class} must be > 0")]
    InvalidPoolCapacity { class: &'static str },

    #[error("Retry policy invalid: {0}")]
    InvalidRetryPolicy(String),

    #[error("Cache max entries must be > 0")]
    InvalidCacheSize,

    #[error("Invalid model host config: {0}")]
    InvalidModelHostConfig(String),

    #[error("Invalid image config: {0}")]
    InvalidImageConfig(String),

    #[error("Invalid storage config: {0}")]
    InvalidStorageConfig(String),

    #[error("Invalid rate limit config: {0}")]
    InvalidRateLimit(String),
}

// Convenience type aliases for Results
pub type JobResult<T> = Result<T, JobError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type RenderingResult<T> = Result<T, RenderingError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
