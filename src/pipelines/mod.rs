// Feature pipelines. Each one runs its upstream model calls through the job
// client and hands back a stored image.

pub mod beautify;
pub mod clarity;
pub mod comic_generation;
pub mod comic_page;
pub mod enhance;
pub mod relight;
pub mod replace_background;
pub mod restyle;

pub use beautify::{BeautifyPipeline, BeautifyRequest};
pub use clarity::{ClarityPipeline, ClarityRequest};
pub use comic_generation::{ComicGenerationPipeline, ComicGenerationRequest, GeneratedComic};
pub use comic_page::{ComicPagePipeline, ComicPageRequest};
pub use enhance::{EnhancePipeline, EnhanceRequest};
pub use relight::{LightSource, OutputFormat, RelightOptions, RelightPipeline, RelightRequest};
pub use replace_background::{ReplaceBackgroundPipeline, ReplaceBackgroundRequest};
pub use restyle::{RestylePipeline, RestyleRequest, Style};

use image::{DynamicImage, GenericImageView, ImageFormat};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::config::ImageConfig;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery};
use crate::services::cache::ResultCache;
use crate::services::model_host::JobClient;
use crate::services::storage::BlobStore;
use crate::utils::image_ops::mime_for;
use crate::utils::Metrics;

/// Collaborators shared by every pipeline
#[derive(Clone)]
pub struct PipelineContext {
    pub jobs: Arc<JobClient>,
    pub cache: ResultCache,
    pub store: Arc<dyn BlobStore>,
    pub metrics: Metrics,
    pub image: ImageConfig,
    pub presign_ttl: Duration,
}

impl PipelineContext {
    /// Store `bytes` and build the caller-facing URLs.
    ///
    /// The public URL wins when the store has one; otherwise the URL is presigned
    /// for `ttl`.
    pub async fn deliver(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        prefix: &str,
        (width, height): (u32, u32),
        ttl: Duration,
    ) -> PipelineResult<DeliveredImage> {
        let key = self.store.put(bytes, content_type, prefix).await?;
        let presigned = self.store.presign(&key, ttl)?;
        let url = self
            .store
            .public_url(&key)
            .unwrap_or_else(|| presigned.clone());

        Ok(DeliveredImage {
            key,
            url,
            presigned_url: Some(presigned),
            width,
            height,
            content_type: content_type.to_string(),
        })
    }

    /// Serve `key` from the cache or run `compute` and cache what it delivers.
    ///
    /// Cached presigned URLs are re-signed for `ttl` on every hit so a hit never
    /// hands out an expired link.
    pub async fn cached<F, Fut>(
        &self,
        pipeline: &'static str,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> PipelineResult<Delivery>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<DeliveredImage>>,
    {
        let started = Instant::now();

        if let Some(mut image) = self.cache.get::<DeliveredImage>(key) {
            debug!("{}: served from cache ({})", pipeline, image.key);
            if image.presigned_url.is_some() {
                let fresh = self.store.presign(&image.key, ttl)?;
                if self.store.public_url(&image.key).is_none() {
                    image.url = fresh.clone();
                }
                image.presigned_url = Some(fresh);
            }
            return Ok(Delivery { image, cached: true });
        }

        let image = compute().await?;
        if let Err(e) = self.cache.set(key, &image) {
            warn!("{}: result not cached: {}", pipeline, e);
        }
        self.metrics.record_pipeline_duration(pipeline, started.elapsed());

        Ok(Delivery { image, cached: false })
    }
}

/// Run CPU-bound image work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> PipelineResult<T>
where
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
}

/// Image a model handed back, decoded; `what` names it in the error
pub(crate) fn decode_model_image(bytes: &[u8], what: &str) -> PipelineResult<(ImageFormat, DynamicImage)> {
    let undecodable = |e: image::ImageError| {
        PipelineError::Image(anyhow::Error::new(e).context(format!("{} could not be decoded", what)))
    };
    let format = image::guess_format(bytes).map_err(undecodable)?;
    let img = image::load_from_memory_with_format(bytes, format).map_err(undecodable)?;
    Ok((format, img))
}

/// Content type and dimensions of a model's output, keeping its encoding
pub(crate) async fn inspect_output(
    bytes: Vec<u8>,
    what: &'static str,
) -> PipelineResult<(Vec<u8>, &'static str, (u32, u32))> {
    blocking(move || {
        let (format, img) = decode_model_image(&bytes, what)?;
        Ok((bytes, mime_for(format), img.dimensions()))
    })
    .await
}


#[cfg(test)]
mod tests {
    use super::testing::{context, FakeHost, MemoryStore};
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_deliver_prefers_public_url() {
        let host = FakeHost::new(|_, _| json!(null));
        let private = context(host.clone(), Arc::new(MemoryStore::default()));
        let delivered = private
            .deliver(vec![1], "image/png", "x", (2, 3), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(delivered.url, "mem://x/0.png?ttl=60");
        assert_eq!(delivered.presigned_url.as_deref(), Some("mem://x/0.png?ttl=60"));

        let public = context(
            host,
            Arc::new(MemoryStore {
                public_base: Some("https://cdn.test".to_string()),
                ..Default::default()
            }),
        );
        let delivered = public
            .deliver(vec![1], "image/png", "x", (2, 3), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(delivered.url, "https://cdn.test/x/0.png");
        assert_eq!((delivered.width, delivered.height), (2, 3));
    }

    #[tokio::test]
    async fn test_cached_computes_once_and_resigns() {
        let ctx = context(FakeHost::new(|_, _| json!(null)), Arc::new(MemoryStore::default()));
        let computed = AtomicUsize::new(0);

        let compute = || async {
            computed.fetch_add(1, Ordering::SeqCst);
            ctx.deliver(vec![9], "image/png", "c", (1, 1), Duration::from_secs(60)).await
        };
        let first = ctx.cached("test", "k", Duration::from_secs(60), compute).await.unwrap();
        let second = ctx
            .cached("test", "k", Duration::from_secs(120), || async {
                computed.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Validation("should not run".to_string()))
            })
            .await
            .unwrap();

        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.image.key, first.image.key);
        assert_eq!(second.image.url, "mem://c/0.png?ttl=120");
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let ctx = context(FakeHost::new(|_, _| json!(null)), Arc::new(MemoryStore::default()));
        let failed = ctx
            .cached("test", "k", Duration::from_secs(60), || async {
                Err(PipelineError::Validation("bad".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert!(!ctx.cache.contains("k"));
    }
}
