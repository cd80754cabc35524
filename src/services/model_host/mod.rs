// Model host integration (Replicate-style predictions API)
//
// - `ModelHost`: the transport seam (create / get / fetch)
// - `HttpModelHost`: reqwest implementation
// - `JobClient`: submit -> poll -> terminal state, under pools and retry
// - `output`: URL-or-inline-blob decoding of prediction output

pub mod client;
pub mod job;
pub mod output;

pub use client::HttpModelHost;
pub use job::{ExternalJob, JobClient, JobHandle, JobState};
pub use output::{decode_output, decode_text, ModelOutput};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::errors::{HostError, JobError};

/// Reference to a hosted model: `owner/name` or `owner/name:version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub owner: String,
    pub name: String,
    pub version: Option<String>,
}

impl FromStr for ModelRef {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (path, version) = match s.split_once(':') {
            Some((path, version)) => (path, Some(version)),
            None => (s, None),
        };
        let (owner, name) = path
            .split_once('/')
            .ok_or_else(|| JobError::Validation(format!("model reference '{}' is not owner/name", s)))?;

        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(JobError::Validation(format!("model reference '{}' is not owner/name", s)));
        }
        if version.is_some_and(str::is_empty) {
            return Err(JobError::Validation(format!("model reference '{}' has an empty version", s)));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)?;
        if let Some(ref version) = self.version {
            write!(f, ":{}", version)?;
        }
        Ok(())
    }
}

/// Status strings reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

/// A prediction as returned by `create` and `get`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Option<String>,
}

impl Prediction {
    /// Upstream error rendered as text, whatever shape the host used
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => "unknown error".to_string(),
            Some(other) => other.to_string(),
        }
    }
}

/// Transport to an external model-hosting service
#[async_trait]
pub trait ModelHost: Send + Sync {
    /// Create a prediction; with `wait` the host may hold the call until the job settles
    async fn create(
        &self,
        model: &ModelRef,
        input: &serde_json::Value,
        wait: bool,
    ) -> Result<Prediction, HostError>;

    /// Read the current state of a prediction
    async fn get(&self, id: &str) -> Result<Prediction, HostError>;

    /// Download an output file referenced by URL
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ref_parsing() {
        let pinned: ModelRef = "851-labs/background-remover:a029dff3".parse().unwrap();
        assert_eq!(pinned.owner, "851-labs");
        assert_eq!(pinned.name, "background-remover");
        assert_eq!(pinned.version.as_deref(), Some("a029dff3"));
        assert_eq!(pinned.to_string(), "851-labs/background-remover:a029dff3");

        let latest: ModelRef = "google/nano-banana".parse().unwrap();
        assert_eq!(latest.version, None);

        assert!("no-slash".parse::<ModelRef>().is_err());
        assert!("a/b/c".parse::<ModelRef>().is_err());
        assert!("owner/name:".parse::<ModelRef>().is_err());
    }

    #[test]
    fn test_prediction_deserializes_host_payload() {
        let payload = serde_json::json!({
            "id": "p-123",
            "status": "processing",
            "urls": { "get": "https://host/predictions/p-123" },
            "logs": "step 1/20"
        });
        let prediction: Prediction = serde_json::from_value(payload).unwrap();
        assert_eq!(prediction.status, PredictionStatus::Processing);
        assert!(prediction.output.is_none());
        assert_eq!(prediction.error_message(), "unknown error");
    }
}
