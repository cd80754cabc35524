use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::{ModelHost, ModelRef, Prediction};
use crate::core::config::ModelHostConfig;
use crate::core::errors::HostError;
use crate::utils::Metrics;

/// Longest `Prefer: wait` the host accepts, in seconds
const MAX_SYNC_WAIT_SECS: u64 = 60;

/// Replicate-style REST client
pub struct HttpModelHost {
    http_client: reqwest::Client,
    base_url: String,
    api_token: String,
    metrics: Option<Metrics>,
}

impl HttpModelHost {
    pub fn new(config: &ModelHostConfig, metrics: Option<Metrics>) -> Result<Self, HostError> {
        // Create HTTP client with timeout and connection pooling
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        if config.api_token.is_empty() {
            warn!("REPLICATE_API_TOKEN is not set; model host calls will be rejected");
        }

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            metrics,
        })
    }

    fn create_url(&self, model: &ModelRef) -> String {
        match model.version {
            Some(_) => format!("{}/predictions", self.base_url),
            None => format!("{}/models/{}/{}/predictions", self.base_url, model.owner, model.name),
        }
    }

    fn record(&self, success: bool, started: Instant) {
        if let Some(ref m) = self.metrics {
            m.record_upstream_call(success, started.elapsed());
        }
    }

    /// Map the HTTP status to transient (429/5xx) or rejected, then decode the body
    async fn read_prediction(&self, response: reqwest::Response) -> Result<Prediction, HostError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message = truncate(&message, 500);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                HostError::Transient {
                    status: status.as_u16(),
                    message,
                }
            } else {
                HostError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| HostError::InvalidResponse(format!("{}: {}", e, truncate(&body, 200))))
    }
}

#[async_trait]
impl ModelHost for HttpModelHost {
    #[instrument(skip(self, input), fields(model = %model))]
    async fn create(
        &self,
        model: &ModelRef,
        input: &serde_json::Value,
        wait: bool,
    ) -> Result<Prediction, HostError> {
        let body = match model.version {
            Some(ref version) => json!({ "version": version, "input": input }),
            None => json!({ "input": input }),
        };

        let mut request = self
            .http_client
            .post(self.create_url(model))
            .bearer_auth(&self.api_token)
            .json(&body);
        if wait {
            request = request.header("Prefer", format!("wait={}", MAX_SYNC_WAIT_SECS));
        }

        let started = Instant::now();
        let result = match request.send().await {
            Ok(response) => self.read_prediction(response).await,
            Err(e) => Err(HostError::Network(e)),
        };
        self.record(result.is_ok(), started);

        if let Ok(ref prediction) = result {
            debug!("Created prediction {} ({:?})", prediction.id, prediction.status);
        }
        result
    }

    async fn get(&self, id: &str) -> Result<Prediction, HostError> {
        let started = Instant::now();
        let result = match self
            .http_client
            .get(format!("{}/predictions/{}", self.base_url, id))
            .bearer_auth(&self.api_token)
            .send()
            .await
        {
            Ok(response) => self.read_prediction(response).await,
            Err(e) => Err(HostError::Network(e)),
        };
        self.record(result.is_ok(), started);
        result
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HostError> {
        let started = Instant::now();
        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            self.record(false, started);
            let err = if status.as_u16() == 429 || status.is_server_error() {
                HostError::Transient {
                    status: status.as_u16(),
                    message: format!("fetching output {}", url),
                }
            } else {
                HostError::Rejected {
                    status: status.as_u16(),
                    message: format!("fetching output {}", url),
                }
            };
            return Err(err);
        }

        let bytes = response.bytes().await?;
        self.record(true, started);
        Ok(bytes.to_vec())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
