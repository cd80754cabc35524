use serde_json::json;
use std::time::Duration;
use tracing::{info, instrument};

use super::{blocking, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery, ReplaceOptions, WorkloadClass};
use crate::services::cache::{content_digest, ResultCache};
use crate::services::compositing::AlphaCompositor;
use crate::services::model_host::ModelRef;
use crate::utils::image_ops::{decode_input, encode_png, prescale_async, SizeLimit};

pub const MAX_FEATHER_PX: u32 = 20;
pub const MIN_SIGN_TTL_SECS: u64 = 60;
pub const MAX_SIGN_TTL_SECS: u64 = 86_400;
const STORAGE_PREFIX: &str = "replace-bg";

#[derive(Debug, Clone)]
pub struct ReplaceBackgroundRequest {
    pub foreground: Vec<u8>,
    pub background: Vec<u8>,
    pub options: ReplaceOptions,
    pub scope: Option<String>,
}

/// Cut the subject out of the foreground with the background-removal model,
/// then composite it over the caller's background
pub struct ReplaceBackgroundPipeline {
    ctx: PipelineContext,
    model: ModelRef,
    compositor: AlphaCompositor,
}

impl ReplaceBackgroundPipeline {
    pub fn new(ctx: PipelineContext, model: ModelRef) -> Self {
        Self {
            ctx,
            model,
            compositor: AlphaCompositor::default(),
        }
    }

    pub fn validate(request: &ReplaceBackgroundRequest) -> PipelineResult<()> {
        if request.foreground.is_empty() || request.background.is_empty() {
            return Err(PipelineError::Validation(
                "both foreground and background images are required".to_string(),
            ));
        }
        let options = &request.options;
        if options.feather_px > MAX_FEATHER_PX {
            return Err(PipelineError::Validation(format!(
                "featherPx must be between 0 and {}",
                MAX_FEATHER_PX
            )));
        }
        if !(MIN_SIGN_TTL_SECS..=MAX_SIGN_TTL_SECS).contains(&options.sign_ttl_secs) {
            return Err(PipelineError::Validation(format!(
                "signTtl must be between {} and {} seconds",
                MIN_SIGN_TTL_SECS, MAX_SIGN_TTL_SECS
            )));
        }
        Ok(())
    }

    /// Key over the foreground bytes; the background enters through its digest
    pub fn cache_key(request: &ReplaceBackgroundRequest) -> String {
        let params = json!({
            "options": request.options,
            "background": content_digest(&request.background),
        });
        ResultCache::make_key(&request.foreground, &params, request.scope.as_deref())
    }

    #[instrument(skip(self, request), fields(fit = ?request.options.fit, feather = request.options.feather_px))]
    pub async fn run(&self, request: ReplaceBackgroundRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let key = Self::cache_key(&request);
        let ttl = Duration::from_secs(request.options.sign_ttl_secs);

        self.ctx
            .cached("replace_background", &key, ttl, || self.compute(request, ttl))
            .await
    }

    async fn compute(&self, request: ReplaceBackgroundRequest, ttl: Duration) -> PipelineResult<DeliveredImage> {
        let ReplaceBackgroundRequest {
            foreground,
            background,
            options,
            ..
        } = request;
        let image = &self.ctx.image;

        let prepared = prescale_async(foreground, SizeLimit::LongSide(image.max_side_px), image.output_quality).await?;
        let (width, height) = (prepared.width, prepared.height);

        let input = json!({
            "image": prepared.data_uri(),
            "background_type": "rgba",
            "format": "png",
        });
        let output = self.ctx.jobs.run(WorkloadClass::Light, &self.model, input).await?;
        let cutout = self.ctx.jobs.fetch_output(WorkloadClass::Light, &output).await?;

        let compositor = self.compositor.clone();
        let png = blocking(move || {
            let cutout = image::load_from_memory(&cutout)
                .map_err(|e| PipelineError::Image(anyhow::Error::new(e).context("cutout could not be decoded")))?
                .to_rgba8();
            let background = decode_input(&background)?.1.to_rgba8();
            let composed = compositor.compose(&background, &cutout, width, height, &options)?;
            encode_png(&composed).map_err(PipelineError::Image)
        })
        .await?;

        info!("Background replaced ({}x{}, {} bytes)", width, height, png.len());
        self.ctx
            .deliver(png, "image/png", STORAGE_PREFIX, (width, height), ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FitMode;
    use crate::pipelines::testing::{context, FakeHost, MemoryStore};
    use crate::utils::image_ops::to_data_uri;
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn png(img: &RgbaImage) -> Vec<u8> {
        encode_png(img).unwrap()
    }

    /// 500x500 foreground photo and the cutout the model "returns" for it
    fn fixtures() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let foreground = png(&RgbaImage::from_pixel(500, 500, Rgba([200, 30, 30, 255])));
        let background = png(&RgbaImage::from_pixel(1000, 1000, Rgba([255, 255, 255, 255])));
        let cutout = png(&RgbaImage::from_fn(500, 500, |x, y| {
            if (150..350).contains(&x) && (150..350).contains(&y) {
                Rgba([200, 30, 30, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        }));
        (foreground, background, cutout)
    }

    fn request(foreground: &[u8], background: &[u8]) -> ReplaceBackgroundRequest {
        ReplaceBackgroundRequest {
            foreground: foreground.to_vec(),
            background: background.to_vec(),
            options: ReplaceOptions {
                fit: FitMode::Cover,
                feather_px: 2,
                add_shadow: true,
                ..Default::default()
            },
            scope: Some("user-1".to_string()),
        }
    }

    #[test]
    fn test_validation_bounds() {
        let mut req = request(b"fg", b"bg");
        assert!(ReplaceBackgroundPipeline::validate(&req).is_ok());

        req.options.feather_px = 21;
        assert!(matches!(
            ReplaceBackgroundPipeline::validate(&req),
            Err(PipelineError::Validation(_))
        ));

        req.options.feather_px = 0;
        req.options.sign_ttl_secs = 59;
        assert!(ReplaceBackgroundPipeline::validate(&req).is_err());
        req.options.sign_ttl_secs = 86_401;
        assert!(ReplaceBackgroundPipeline::validate(&req).is_err());

        let empty = request(b"", b"bg");
        assert!(ReplaceBackgroundPipeline::validate(&empty).is_err());
    }

    #[test]
    fn test_cache_key_covers_background_and_scope() {
        let base = ReplaceBackgroundPipeline::cache_key(&request(b"fg", b"bg"));
        assert_eq!(base, ReplaceBackgroundPipeline::cache_key(&request(b"fg", b"bg")));
        assert_ne!(base, ReplaceBackgroundPipeline::cache_key(&request(b"fg", b"other")));

        let mut other_scope = request(b"fg", b"bg");
        other_scope.scope = Some("user-2".to_string());
        assert_ne!(base, ReplaceBackgroundPipeline::cache_key(&other_scope));

        let mut no_shadow = request(b"fg", b"bg");
        no_shadow.options.add_shadow = false;
        assert_ne!(base, ReplaceBackgroundPipeline::cache_key(&no_shadow));

        // link lifetime is applied on delivery, the rendered image is the same
        let mut short_link = request(b"fg", b"bg");
        short_link.options.sign_ttl_secs = 120;
        assert_eq!(base, ReplaceBackgroundPipeline::cache_key(&short_link));
    }

    #[tokio::test]
    async fn test_unreadable_upload_is_rejected_before_the_model_runs() {
        let (foreground, background, _) = fixtures();
        let host = FakeHost::new(|_, _| json!(null));
        let pipeline = ReplaceBackgroundPipeline::new(
            context(host.clone(), Arc::new(MemoryStore::default())),
            "acme/bg-remover:v1".parse().unwrap(),
        );

        let err = pipeline.run(request(b"not an image", &background)).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableImage(_)));
        assert_eq!(err.kind(), crate::core::errors::ErrorKind::Validation);
        assert_eq!(host.creates(), 0);

        let mut bad_background = request(&foreground, b"junk");
        bad_background.scope = Some("user-3".to_string());
        let host = FakeHost::new({
            let (_, _, cutout) = fixtures();
            let uri = to_data_uri(&cutout, "image/png");
            move |_, _| json!(uri)
        });
        let pipeline = ReplaceBackgroundPipeline::new(
            context(host, Arc::new(MemoryStore::default())),
            "acme/bg-remover:v1".parse().unwrap(),
        );
        let err = pipeline.run(bad_background).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::errors::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_hit_with_other_link_lifetime_is_resigned() {
        let (foreground, background, cutout) = fixtures();
        let cutout_uri = to_data_uri(&cutout, "image/png");
        let host = FakeHost::new(move |_, _| json!(cutout_uri));
        let pipeline = ReplaceBackgroundPipeline::new(
            context(host.clone(), Arc::new(MemoryStore::default())),
            "acme/bg-remover:v1".parse().unwrap(),
        );

        pipeline.run(request(&foreground, &background)).await.unwrap();
        let mut short_link = request(&foreground, &background);
        short_link.options.sign_ttl_secs = 120;
        let second = pipeline.run(short_link).await.unwrap();

        assert_eq!(host.creates(), 1);
        assert!(second.cached);
        assert_eq!(
            second.image.presigned_url.as_deref(),
            Some(format!("mem://{}?ttl=120", second.image.key).as_str())
        );
    }

    #[tokio::test]
    async fn test_end_to_end_composite() {
        let (foreground, background, cutout) = fixtures();
        let cutout_uri = to_data_uri(&cutout, "image/png");
        let host = FakeHost::new(move |_, _| json!(cutout_uri));
        let store = Arc::new(MemoryStore::default());
        let pipeline = ReplaceBackgroundPipeline::new(
            context(host.clone(), store.clone()),
            "acme/bg-remover:v1".parse().unwrap(),
        );

        let delivery = pipeline.run(request(&foreground, &background)).await.unwrap();
        assert!(!delivery.cached);
        assert_eq!((delivery.image.width, delivery.image.height), (500, 500));

        // the model saw the foreground as a data URI
        let inputs = host.inputs.lock();
        assert_eq!(inputs[0].0, "acme/bg-remover:v1");
        assert!(inputs[0].1["image"].as_str().unwrap().starts_with("data:image/png;base64,"));
        assert_eq!(inputs[0].1["background_type"], "rgba");
        drop(inputs);

        let stored = store.get(&delivery.image.key).unwrap();
        let result = image::load_from_memory(&stored).unwrap().to_rgba8();
        assert_eq!(result.dimensions(), (500, 500));
        assert!(result.pixels().all(|p| p[3] == 255));
        // subject kept, soft gray shadow just outside its edge, plain background far away
        let centre = result.get_pixel(250, 250);
        assert!(centre.0.iter().zip([200u8, 30, 30, 255]).all(|(a, b)| a.abs_diff(b) <= 3), "{:?}", centre);
        let halo = result.get_pixel(142, 250);
        assert!(halo[0] == halo[1] && halo[1] == halo[2], "{:?}", halo);
        assert!((150..250).contains(&halo[0]), "{:?}", halo);
        assert_eq!(result.get_pixel(10, 10).0, [255, 255, 255, 255]);
    }

    #[tokio::test]
    async fn test_identical_requests_hit_cache() {
        let (foreground, background, cutout) = fixtures();
        let cutout_uri = to_data_uri(&cutout, "image/png");
        let host = FakeHost::new(move |_, _| json!(cutout_uri));
        let pipeline = ReplaceBackgroundPipeline::new(
            context(host.clone(), Arc::new(MemoryStore::default())),
            "acme/bg-remover:v1".parse().unwrap(),
        );

        let first = pipeline.run(request(&foreground, &background)).await.unwrap();
        let second = pipeline.run(request(&foreground, &background)).await.unwrap();

        assert_eq!(host.creates(), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.image.key, second.image.key);
    }
}
