// Studio: process-wide singletons and the feature entry points

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::core::config::Config;
use crate::core::errors::{ConfigError, PipelineResult};
use crate::core::types::{Delivery, WorkloadClass};
use crate::middleware::{ConcurrencyPools, PoolStats, RetryExecutor};
use crate::pipelines::{
    BeautifyPipeline, BeautifyRequest, ClarityPipeline, ClarityRequest, ComicGenerationPipeline,
    ComicGenerationRequest, ComicPagePipeline, ComicPageRequest, EnhancePipeline, EnhanceRequest, GeneratedComic,
    PipelineContext, RelightPipeline, RelightRequest, ReplaceBackgroundPipeline, ReplaceBackgroundRequest,
    RestylePipeline, RestyleRequest,
};
use crate::services::cache::{CacheStats, ResultCache};
use crate::services::model_host::{HttpModelHost, JobClient, ModelHost, ModelRef};
use crate::services::rendering::BubbleRenderer;
use crate::services::storage::{BlobStore, LocalBlobStore};
use crate::utils::metrics::MetricsSnapshot;
use crate::utils::Metrics;

/// Owns the pools, the job client, the result cache and the pipelines built on them.
///
/// Built once at startup and shared by every request handler.
pub struct Studio {
    config: Arc<Config>,
    metrics: Metrics,
    cache: ResultCache,
    jobs: Arc<JobClient>,
    local_store: Option<Arc<LocalBlobStore>>,
    replace_background: ReplaceBackgroundPipeline,
    comic_page: ComicPagePipeline,
    comic_generation: ComicGenerationPipeline,
    enhance: EnhancePipeline,
    beautify: BeautifyPipeline,
    clarity: ClarityPipeline,
    restyle: RestylePipeline,
    relight: RelightPipeline,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudioStats {
    pub pools: BTreeMap<String, PoolStats>,
    pub cache: CacheStats,
    pub metrics: MetricsSnapshot,
}

fn model_ref(setting: &'static str, value: &str) -> Result<ModelRef, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::InvalidModelHostConfig(format!("{}: {}", setting, e)))
}

impl Studio {
    /// Wire the HTTP model host and the local blob store from `config`
    #[instrument(skip(config))]
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let metrics = Metrics::new();
        let host = Arc::new(HttpModelHost::new(&config.model_host, Some(metrics.clone()))?);
        let store = Arc::new(LocalBlobStore::new(&config.storage)?);

        let mut studio = Self::with_parts(config, host, store.clone(), metrics)?;
        studio.local_store = Some(store);
        Ok(studio)
    }

    /// Build around any model host and blob store
    pub fn with_parts(
        config: Arc<Config>,
        host: Arc<dyn ModelHost>,
        store: Arc<dyn BlobStore>,
        metrics: Metrics,
    ) -> Result<Self, ConfigError> {
        let models = &config.models;
        let background_model = model_ref("BACKGROUND_REMOVAL_MODEL", &models.background_removal)?;
        let enhance_model = model_ref("ENHANCE_MODEL", &models.enhance)?;
        let upscale_model = model_ref("UPSCALE_MODEL", &models.upscale)?;
        let restyle_model = model_ref("RESTYLE_MODEL", &models.restyle)?;
        let relight_model = model_ref("RELIGHT_MODEL", &models.relight)?;
        let storyboard_model = model_ref("STORYBOARD_MODEL", &models.storyboard)?;
        let comic_model = model_ref("COMIC_IMAGE_MODEL", &models.comic_image)?;

        let pools = ConcurrencyPools::new(&config.concurrency, metrics.clone())?;
        let retry = RetryExecutor::new(config.retry_policy()?);
        let jobs = Arc::new(JobClient::new(host, pools, retry, &config.model_host, Some(metrics.clone())));
        let cache = ResultCache::new(&config.cache, Some(metrics.clone()))?;
        let renderer = Arc::new(BubbleRenderer::new(&config.rendering));

        let ctx = PipelineContext {
            jobs: jobs.clone(),
            cache: cache.clone(),
            store,
            metrics: metrics.clone(),
            image: config.image.clone(),
            presign_ttl: config.storage.presign_ttl,
        };

        info!(
            "Studio ready (pools light={} heavy={} batch={}, cache {} entries / {:?})",
            config.concurrency.light,
            config.concurrency.heavy,
            config.concurrency.batch,
            config.cache.max_entries,
            config.cache.ttl
        );

        Ok(Self {
            replace_background: ReplaceBackgroundPipeline::new(ctx.clone(), background_model),
            comic_page: ComicPagePipeline::new(ctx.clone(), renderer.clone()),
            comic_generation: ComicGenerationPipeline::new(ctx.clone(), renderer, storyboard_model, comic_model),
            enhance: EnhancePipeline::new(ctx.clone(), enhance_model.clone()),
            beautify: BeautifyPipeline::new(ctx.clone(), enhance_model, upscale_model.clone()),
            clarity: ClarityPipeline::new(ctx.clone(), upscale_model),
            restyle: RestylePipeline::new(ctx.clone(), restyle_model),
            relight: RelightPipeline::new(ctx, relight_model),
            config,
            metrics,
            cache,
            jobs,
            local_store: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The filesystem store, when blobs are served by this process
    pub fn local_store(&self) -> Option<&LocalBlobStore> {
        self.local_store.as_deref()
    }

    pub async fn replace_background(&self, request: ReplaceBackgroundRequest) -> PipelineResult<Delivery> {
        self.replace_background.run(request).await
    }

    pub async fn compose_comic_page(&self, request: ComicPageRequest) -> PipelineResult<Delivery> {
        self.comic_page.run(request).await
    }

    pub async fn generate_comic(&self, request: ComicGenerationRequest) -> PipelineResult<GeneratedComic> {
        self.comic_generation.run(request).await
    }

    pub async fn enhance(&self, request: EnhanceRequest) -> PipelineResult<Delivery> {
        self.enhance.run(request).await
    }

    pub async fn beautify(&self, request: BeautifyRequest) -> PipelineResult<Delivery> {
        self.beautify.run(request).await
    }

    pub async fn clarity(&self, request: ClarityRequest) -> PipelineResult<Delivery> {
        self.clarity.run(request).await
    }

    pub async fn restyle(&self, request: RestyleRequest) -> PipelineResult<Delivery> {
        self.restyle.run(request).await
    }

    pub async fn relight(&self, request: RelightRequest) -> PipelineResult<Delivery> {
        self.relight.run(request).await
    }

    pub fn stats(&self) -> StudioStats {
        let pools = self.jobs.pools();
        StudioStats {
            pools: WorkloadClass::ALL
                .iter()
                .map(|class| (class.as_str().to_string(), pools.stats(*class)))
                .collect(),
            cache: self.cache.stats(),
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ReplaceOptions;
    use crate::pipelines::{RelightOptions, Style};
    use crate::pipelines::testing::{FakeHost, MemoryStore};
    use crate::utils::image_ops::{encode_png, to_data_uri};
    use image::{Rgba, RgbaImage};
    use serde_json::json;

    fn studio(host: Arc<FakeHost>) -> Studio {
        let config = Arc::new(Config::for_tests("unused"));
        Studio::with_parts(config, host, Arc::new(MemoryStore::default()), Metrics::new()).unwrap()
    }

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(width, height, Rgba(color))).unwrap()
    }

    #[tokio::test]
    async fn test_identical_submissions_share_one_upstream_call() {
        let cutout = to_data_uri(&png(40, 40, [9, 9, 9, 255]), "image/png");
        let host = FakeHost::new(move |_, _| json!(cutout));
        let studio = studio(host.clone());

        let request = ReplaceBackgroundRequest {
            foreground: png(40, 40, [200, 0, 0, 255]),
            background: png(80, 80, [255, 255, 255, 255]),
            options: ReplaceOptions::default(),
            scope: Some("session-42".to_string()),
        };
        let first = studio.replace_background(request.clone()).await.unwrap();
        let second = studio.replace_background(request).await.unwrap();

        assert_eq!(host.creates(), 1);
        assert!(!first.cached && second.cached);

        let stats = studio.stats();
        assert_eq!(stats.cache.entries, 1);
        assert_eq!(stats.metrics.cache_hits, 1);
        assert_eq!(stats.pools["light"].capacity, 8);
    }

    #[tokio::test]
    async fn test_different_scopes_do_not_share_results() {
        let cutout = to_data_uri(&png(16, 16, [9, 9, 9, 255]), "image/png");
        let host = FakeHost::new(move |_, _| json!(cutout));
        let studio = studio(host.clone());

        let request = |scope: &str| EnhanceRequest {
            image: png(16, 16, [1, 2, 3, 255]),
            scale: 2,
            scope: Some(scope.to_string()),
        };
        studio.enhance(request("alice")).await.unwrap();
        let other = studio.enhance(request("bob")).await.unwrap();

        assert_eq!(host.creates(), 2);
        assert!(!other.cached);
    }

    #[tokio::test]
    async fn test_restyle_and_relight_admitted_to_heavy_pool() {
        let output = to_data_uri(&png(24, 24, [5, 5, 5, 255]), "image/png");
        let host = FakeHost::new(move |_, _| json!(output));
        let studio = studio(host.clone());

        studio
            .restyle(RestyleRequest {
                image: png(24, 24, [1, 1, 1, 255]),
                style: Style::Anime,
                extra: None,
                scope: Some("s".to_string()),
            })
            .await
            .unwrap();
        studio
            .relight(RelightRequest {
                image: png(24, 24, [1, 1, 1, 255]),
                options: RelightOptions::default(),
                scope: Some("s".to_string()),
            })
            .await
            .unwrap();

        let stats = studio.stats();
        assert!(stats.metrics.pool_admissions["heavy"] >= 2);
        assert!(!stats.metrics.pool_admissions.contains_key("light"));
        assert_eq!(stats.pools["heavy"].capacity, 4);
        let models: Vec<String> = host.inputs.lock().iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(models, ["acme/stylist", "acme/relighter:v3"]);
    }

    #[test]
    fn test_bad_model_reference_rejected() {
        let mut config = Config::for_tests("unused");
        config.models.enhance = "not-a-model".to_string();
        let result = Studio::with_parts(
            Arc::new(config),
            FakeHost::new(|_, _| json!(null)),
            Arc::new(MemoryStore::default()),
            Metrics::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidModelHostConfig(_))));
    }
}
