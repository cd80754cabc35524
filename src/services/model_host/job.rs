use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::output::{decode_output, resolve_bytes, ModelOutput};
use super::{ModelHost, ModelRef, Prediction, PredictionStatus};
use crate::core::config::ModelHostConfig;
use crate::core::errors::{HostError, JobError, JobResult};
use crate::core::types::WorkloadClass;
use crate::middleware::{ConcurrencyPools, RetryExecutor};
use crate::utils::Metrics;

/// Local view of an external job's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled | JobState::TimedOut
        )
    }

    /// Next state after the host reported `status`. Terminal states never change.
    pub fn transition(self, status: PredictionStatus) -> JobState {
        if self.is_terminal() {
            return self;
        }
        match (self, status) {
            (JobState::Pending, PredictionStatus::Starting) => JobState::Pending,
            // a running job never goes back to pending
            (_, PredictionStatus::Starting) | (_, PredictionStatus::Processing) => JobState::Running,
            (_, PredictionStatus::Succeeded) => JobState::Succeeded,
            (_, PredictionStatus::Failed) => JobState::Failed,
            (_, PredictionStatus::Canceled) => JobState::Canceled,
        }
    }

    /// Local deadline passed: pending and running jobs become `TimedOut`
    pub fn expire(self) -> JobState {
        if self.is_terminal() {
            self
        } else {
            JobState::TimedOut
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
            JobState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted job. Lives only as long as the caller waiting on it.
#[derive(Debug, Clone)]
pub struct ExternalJob {
    pub id: String,
    pub model: ModelRef,
    pub class: WorkloadClass,
    pub submitted_at: Instant,
    state: JobState,
}

impl ExternalJob {
    pub fn state(&self) -> JobState {
        self.state
    }

    fn observe(&mut self, status: PredictionStatus) {
        let next = self.state.transition(status);
        if next != self.state {
            debug!("Job {} {} -> {}", self.id, self.state, next);
            self.state = next;
        }
    }

    fn expire(&mut self) {
        let next = self.state.expire();
        if next != self.state {
            debug!("Job {} {} -> {}", self.id, self.state, next);
            self.state = next;
        }
    }
}

/// Handle returned by [`JobClient::submit`], consumed by [`JobClient::await_result`]
#[derive(Debug)]
pub struct JobHandle {
    job: ExternalJob,
    latest: Prediction,
}

impl JobHandle {
    pub fn job(&self) -> &ExternalJob {
        &self.job
    }
}

/// Submits work to the model host and drives it to a terminal state.
///
/// Every host call (create, each poll, output download) goes through the
/// class pool first and the retry executor inside it, so polling counts
/// against the same capacity as submission.
pub struct JobClient {
    host: Arc<dyn ModelHost>,
    pools: ConcurrencyPools,
    retry: RetryExecutor,
    poll_interval: Duration,
    max_job_duration: Duration,
    sync_wait: bool,
    metrics: Option<Metrics>,
}

/// Outer error: retry. Inner error: give up now.
type Attempt<T> = Result<Result<T, JobError>, JobError>;

/// Rejections (4xx other than 429) are not worth another attempt
fn classify<T>(result: Result<T, HostError>) -> Attempt<T> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e @ HostError::Rejected { .. }) => Ok(Err(JobError::Host(e))),
        Err(e) => Err(JobError::Host(e)),
    }
}

impl JobClient {
    pub fn new(
        host: Arc<dyn ModelHost>,
        pools: ConcurrencyPools,
        retry: RetryExecutor,
        config: &ModelHostConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            host,
            pools,
            retry,
            poll_interval: config.poll_interval,
            max_job_duration: config.max_job_duration,
            sync_wait: config.sync_wait,
            metrics,
        }
    }

    pub fn pools(&self) -> &ConcurrencyPools {
        &self.pools
    }

    /// Admit `op` to the class pool and retry it there
    async fn call<T, F, Fut>(&self, class: WorkloadClass, op: F) -> JobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let metrics = self.metrics.clone();
        self.pools
            .admit(class, async {
                self.retry
                    .run_with_hook(op, |_attempt| {
                        if let Some(ref m) = metrics {
                            m.record_retry();
                        }
                        Ok(())
                    })
                    .await
            })
            .await?
    }

    /// Create the job; returns once the host has assigned an id
    #[instrument(skip(self, input), fields(model = %model, class = %class))]
    pub async fn submit(&self, class: WorkloadClass, model: &ModelRef, input: Value) -> JobResult<JobHandle> {
        let host = &self.host;
        let input = &input;
        let wait = self.sync_wait;

        let prediction = self
            .call(class, || async move { classify(host.create(model, input, wait).await) })
            .await?;

        let mut job = ExternalJob {
            id: prediction.id.clone(),
            model: model.clone(),
            class,
            submitted_at: Instant::now(),
            state: JobState::Pending,
        };
        job.observe(prediction.status);
        info!("Submitted job {} to {} ({})", job.id, model, job.state);

        Ok(JobHandle {
            job,
            latest: prediction,
        })
    }

    /// Poll until the job settles or `max_job_duration` passes since submission.
    ///
    /// A timed-out job is only abandoned locally; no cancel request is sent
    /// upstream, so the host may still finish (and bill) it.
    pub async fn await_result(&self, handle: JobHandle) -> JobResult<Value> {
        let JobHandle { mut job, mut latest } = handle;

        loop {
            job.observe(latest.status);
            match job.state {
                JobState::Succeeded => {
                    self.record_outcome(job.state);
                    return latest.output.filter(|v| !v.is_null()).ok_or_else(|| {
                        JobError::InvalidOutput(format!("job {} succeeded without output", job.id))
                    });
                }
                JobState::Failed => {
                    self.record_outcome(job.state);
                    let message = latest.error_message();
                    warn!("Job {} failed upstream: {}", job.id, message);
                    return Err(JobError::UpstreamFailed {
                        job_id: job.id,
                        message,
                        logs: latest.logs,
                    });
                }
                JobState::Canceled => {
                    self.record_outcome(job.state);
                    return Err(JobError::UpstreamCanceled { job_id: job.id });
                }
                JobState::Pending | JobState::Running | JobState::TimedOut => {}
            }

            let Some(remaining) = self.remaining(&job) else {
                return Err(self.time_out(&mut job));
            };
            tokio::time::sleep(self.poll_interval.min(remaining)).await;

            let Some(remaining) = self.remaining(&job) else {
                return Err(self.time_out(&mut job));
            };
            let host = &self.host;
            let id = job.id.as_str();
            let poll = self.call(job.class, || async move { classify(host.get(id).await) });
            let polled = tokio::time::timeout(remaining, poll).await;
            latest = match polled {
                Ok(result) => result?,
                Err(_) => return Err(self.time_out(&mut job)),
            };
        }
    }

    /// Submit and wait in one go
    pub async fn run(&self, class: WorkloadClass, model: &ModelRef, input: Value) -> JobResult<Value> {
        let handle = self.submit(class, model, input).await?;
        self.await_result(handle).await
    }

    /// Decode an image output and download it if it is a URL
    pub async fn fetch_output(&self, class: WorkloadClass, output: &Value) -> JobResult<Vec<u8>> {
        let decoded = decode_output(output)?;
        if let ModelOutput::InlineBlob(bytes) = decoded {
            return Ok(bytes);
        }

        let host = self.host.as_ref();
        let decoded = &decoded;
        self.call(class, || async move {
            match resolve_bytes(host, decoded.clone()).await {
                Ok(bytes) => Ok(Ok(bytes)),
                Err(JobError::Host(e)) => classify(Err(e)),
                Err(other) => Ok(Err(other)),
            }
        })
        .await
    }

    fn remaining(&self, job: &ExternalJob) -> Option<Duration> {
        self.max_job_duration
            .checked_sub(job.submitted_at.elapsed())
            .filter(|d| !d.is_zero())
    }

    fn time_out(&self, job: &mut ExternalJob) -> JobError {
        job.expire();
        self.record_outcome(job.state);
        let elapsed = job.submitted_at.elapsed();
        warn!(
            "Job {} exceeded {:?}; abandoning locally (upstream job may still complete)",
            job.id, self.max_job_duration
        );
        JobError::TimedOut {
            job_id: job.id.clone(),
            elapsed,
        }
    }

    fn record_outcome(&self, state: JobState) {
        if let Some(ref m) = self.metrics {
            m.record_job_outcome(state.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConcurrencyConfig;
    use crate::middleware::RetryPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Host that replays scripted responses
    #[derive(Default)]
    struct ScriptedHost {
        creates: Mutex<VecDeque<Result<Prediction, HostError>>>,
        polls: Mutex<VecDeque<Result<Prediction, HostError>>>,
        create_calls: AtomicUsize,
        get_calls: AtomicUsize,
    }

    impl ScriptedHost {
        fn on_create(self, result: Result<Prediction, HostError>) -> Self {
            self.creates.lock().push_back(result);
            self
        }

        fn on_poll(self, result: Result<Prediction, HostError>) -> Self {
            self.polls.lock().push_back(result);
            self
        }
    }

    #[async_trait]
    impl ModelHost for ScriptedHost {
        async fn create(&self, _: &ModelRef, _: &Value, _: bool) -> Result<Prediction, HostError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.creates
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(prediction(PredictionStatus::Starting)))
        }

        async fn get(&self, _: &str) -> Result<Prediction, HostError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(prediction(PredictionStatus::Processing)))
        }

        async fn fetch(&self, _: &str) -> Result<Vec<u8>, HostError> {
            Ok(vec![0xAB])
        }
    }

    fn prediction(status: PredictionStatus) -> Prediction {
        Prediction {
            id: "p-1".to_string(),
            status,
            output: None,
            error: None,
            logs: None,
        }
    }

    fn succeeded(output: Value) -> Prediction {
        Prediction {
            output: Some(output),
            ..prediction(PredictionStatus::Succeeded)
        }
    }

    fn client(host: Arc<ScriptedHost>, max_job_ms: u64) -> JobClient {
        let pools = ConcurrencyPools::new(
            &ConcurrencyConfig { light: 2, heavy: 1, batch: 1 },
            Metrics::new(),
        )
        .unwrap();
        let retry = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100), 2.0).unwrap());
        let config = ModelHostConfig {
            api_token: "t".to_string(),
            base_url: "http://unused".to_string(),
            poll_interval: Duration::from_millis(1500),
            max_job_duration: Duration::from_millis(max_job_ms),
            sync_wait: false,
            http_timeout: Duration::from_secs(5),
        };
        JobClient::new(host, pools, retry, &config, Some(Metrics::new()))
    }

    fn model() -> ModelRef {
        "acme/restorer:v1".parse().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        use PredictionStatus::*;
        assert_eq!(JobState::Pending.transition(Starting), JobState::Pending);
        assert_eq!(JobState::Pending.transition(Processing), JobState::Running);
        assert_eq!(JobState::Running.transition(Starting), JobState::Running);
        assert_eq!(JobState::Pending.transition(Succeeded), JobState::Succeeded);
        assert_eq!(JobState::Running.transition(Failed), JobState::Failed);
        assert_eq!(JobState::Running.transition(Canceled), JobState::Canceled);

        // terminal states are sticky
        assert_eq!(JobState::Failed.transition(Succeeded), JobState::Failed);
        assert_eq!(JobState::TimedOut.transition(Processing), JobState::TimedOut);
        assert_eq!(JobState::Succeeded.expire(), JobState::Succeeded);
        assert_eq!(JobState::Running.expire(), JobState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_success() {
        let host = Arc::new(
            ScriptedHost::default()
                .on_poll(Ok(prediction(PredictionStatus::Processing)))
                .on_poll(Ok(succeeded(json!("https://files.example/out.png")))),
        );
        let client = client(host.clone(), 120_000);

        let started = Instant::now();
        let handle = client.submit(WorkloadClass::Light, &model(), json!({})).await.unwrap();
        assert_eq!(handle.job().state(), JobState::Pending);

        let output = client.await_result(handle).await.unwrap();
        assert_eq!(output, json!("https://files.example/out.png"));
        assert_eq!(host.get_calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_wait_result_needs_no_poll() {
        let host = Arc::new(ScriptedHost::default().on_create(Ok(succeeded(json!(["https://x/1.png"])))));
        let client = client(host.clone(), 120_000);

        let output = client.run(WorkloadClass::Light, &model(), json!({})).await.unwrap();
        assert_eq!(output, json!(["https://x/1.png"]));
        assert_eq!(host.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_carries_logs() {
        let host = Arc::new(ScriptedHost::default().on_poll(Ok(Prediction {
            error: Some(json!("CUDA out of memory")),
            logs: Some("loading weights".to_string()),
            ..prediction(PredictionStatus::Failed)
        })));
        let client = client(host, 120_000);

        match client.run(WorkloadClass::Heavy, &model(), json!({})).await {
            Err(JobError::UpstreamFailed { job_id, message, logs }) => {
                assert_eq!(job_id, "p-1");
                assert_eq!(message, "CUDA out of memory");
                assert_eq!(logs.as_deref(), Some("loading weights"));
            }
            other => panic!("expected UpstreamFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_cancel() {
        let host = Arc::new(ScriptedHost::default().on_poll(Ok(prediction(PredictionStatus::Canceled))));
        let client = client(host, 120_000);

        let err = client.run(WorkloadClass::Light, &model(), json!({})).await.unwrap_err();
        assert!(matches!(err, JobError::UpstreamCanceled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_further_polling() {
        let host = Arc::new(ScriptedHost::default());
        let client = client(host.clone(), 5000);

        let started = Instant::now();
        let err = client.run(WorkloadClass::Light, &model(), json!({})).await.unwrap_err();

        match err {
            JobError::TimedOut { elapsed, .. } => assert_eq!(elapsed, Duration::from_millis(5000)),
            other => panic!("expected TimedOut, got {:?}", other),
        }
        // polls at 1.5s, 3s and 4.5s; the deadline falls before a fourth
        assert_eq!(host.get_calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_create_failure_is_retried() {
        let host = Arc::new(
            ScriptedHost::default()
                .on_create(Err(HostError::Transient {
                    status: 502,
                    message: "bad gateway".to_string(),
                }))
                .on_create(Ok(succeeded(json!("https://x/ok.png")))),
        );
        let client = client(host.clone(), 120_000);

        let output = client.run(WorkloadClass::Light, &model(), json!({})).await.unwrap();
        assert_eq!(output, json!("https://x/ok.png"));
        assert_eq!(host.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_create_is_not_retried() {
        let host = Arc::new(ScriptedHost::default().on_create(Err(HostError::Rejected {
            status: 422,
            message: "input.image is required".to_string(),
        })));
        let client = client(host.clone(), 120_000);

        let err = client.run(WorkloadClass::Light, &model(), json!({})).await.unwrap_err();
        assert!(matches!(err, JobError::Host(HostError::Rejected { status: 422, .. })));
        assert_eq!(host.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_output_resolves_urls_and_blobs() {
        let client = client(Arc::new(ScriptedHost::default()), 120_000);
        let from_url = client
            .fetch_output(WorkloadClass::Light, &json!("https://x/out.png"))
            .await
            .unwrap();
        assert_eq!(from_url, vec![0xAB]);

        let inline = client
            .fetch_output(WorkloadClass::Light, &json!("data:image/png;base64,AQI="))
            .await
            .unwrap();
        assert_eq!(inline, vec![1, 2]);
    }
}
