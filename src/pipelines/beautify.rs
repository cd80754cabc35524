//! Portrait beautification: face restoration, a face-aware 2× upscale brought
//! back to the restored size, then a small brightness and saturation lift.

use image::imageops::FilterType;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{blocking, decode_model_image, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery, WorkloadClass};
use crate::services::cache::ResultCache;
use crate::services::compositing::modulate;
use crate::services::model_host::ModelRef;
use crate::utils::image_ops::{
    encode_jpeg, encode_png, mime_for, prescale_async, shrink_to, PreparedImage, SizeLimit,
};

/// Long edge the restoration model is given
pub const RESTORE_MAX_SIDE: u32 = 1440;
/// Largest input (in pixels) the upscaler's GPU accepts
pub const UPSCALER_MAX_PIXELS: u64 = 2_096_704;
const RESTORE_VERSION: &str = "v1.4";
const UPSCALE_FACTOR: u32 = 2;
const BRIGHTNESS: f32 = 1.03;
const SATURATION: f32 = 1.05;
const STORAGE_PREFIX: &str = "beautify";

/// Steps applied, in order; reported in logs and folded into the cache key
pub const STEPS: [&str; 4] = ["pre-scale", "restore", "upscale", "tone"];

#[derive(Debug, Clone)]
pub struct BeautifyRequest {
    pub image: Vec<u8>,
    pub scope: Option<String>,
}

pub struct BeautifyPipeline {
    ctx: PipelineContext,
    restorer: ModelRef,
    upscaler: ModelRef,
}

impl BeautifyPipeline {
    pub fn new(ctx: PipelineContext, restorer: ModelRef, upscaler: ModelRef) -> Self {
        Self {
            ctx,
            restorer,
            upscaler,
        }
    }

    pub fn validate(request: &BeautifyRequest) -> PipelineResult<()> {
        if request.image.is_empty() {
            return Err(PipelineError::Validation("image is required".to_string()));
        }
        Ok(())
    }

    pub fn cache_key(&self, request: &BeautifyRequest) -> String {
        let params = json!({
            "restorer": self.restorer.to_string(),
            "upscaler": self.upscaler.to_string(),
            "steps": STEPS,
        });
        ResultCache::make_key(&request.image, &params, request.scope.as_deref())
    }

    #[instrument(skip(self, request))]
    pub async fn run(&self, request: BeautifyRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let key = self.cache_key(&request);
        let ttl = self.ctx.presign_ttl;

        self.ctx
            .cached("beautify", &key, ttl, || self.compute(request))
            .await
    }

    async fn compute(&self, request: BeautifyRequest) -> PipelineResult<DeliveredImage> {
        let quality = self.ctx.image.output_quality;
        let jobs = &self.ctx.jobs;

        let prepared = prescale_async(request.image, SizeLimit::LongSide(RESTORE_MAX_SIDE), quality).await?;
        let input = json!({
            "img": prepared.data_uri(),
            // keep the size: the upscaler doubles it next
            "scale": 1,
            "version": RESTORE_VERSION,
        });
        let output = jobs.run(WorkloadClass::Light, &self.restorer, input).await?;
        let restored = jobs.fetch_output(WorkloadClass::Light, &output).await?;

        let budgeted = blocking(move || fit_upscaler_budget(restored, quality)).await?;
        let target = (budgeted.width, budgeted.height);
        if budgeted.scaled {
            debug!("Restored image shrunk to {}x{} for the upscaler", target.0, target.1);
        }

        let input = json!({
            "image": budgeted.data_uri(),
            "scale": UPSCALE_FACTOR,
            "face_enhance": true,
        });
        let output = jobs.run(WorkloadClass::Light, &self.upscaler, input).await?;
        let upscaled = jobs.fetch_output(WorkloadClass::Light, &output).await?;

        let png = blocking(move || {
            let (_, img) = decode_model_image(&upscaled, "upscaled image")?;
            let resized = img.resize_exact(target.0, target.1, FilterType::Lanczos3).to_rgba8();
            encode_png(&modulate(&resized, BRIGHTNESS, SATURATION)).map_err(PipelineError::Image)
        })
        .await?;

        info!(
            "Beautified {}x{} -> {}x{} ({})",
            prepared.width,
            prepared.height,
            target.0,
            target.1,
            STEPS.join(" > ")
        );
        self.ctx
            .deliver(png, "image/png", STORAGE_PREFIX, target, self.ctx.presign_ttl)
            .await
    }
}

/// Shrink the restored image below the upscaler's pixel budget, re-encoding
/// only when it had to shrink
fn fit_upscaler_budget(bytes: Vec<u8>, quality: u8) -> PipelineResult<PreparedImage> {
    let (format, img) = decode_model_image(&bytes, "restored image")?;
    let (width, height) = (img.width(), img.height());
    let limit = SizeLimit::Pixels(UPSCALER_MAX_PIXELS);

    if limit.target(width, height).is_none() {
        return Ok(PreparedImage {
            bytes,
            content_type: mime_for(format),
            width,
            height,
            scaled: false,
        });
    }

    let shrunk = shrink_to(img, limit);
    Ok(PreparedImage {
        bytes: encode_jpeg(&shrunk, quality).map_err(PipelineError::Image)?,
        content_type: "image/jpeg",
        width: shrunk.width(),
        height: shrunk.height(),
        scaled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;
    use crate::pipelines::testing::{context, FakeHost, MemoryStore};
    use crate::utils::image_ops::to_data_uri;
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(width, height, Rgba(color))).unwrap()
    }

    fn pipeline(host: Arc<FakeHost>, store: Arc<MemoryStore>) -> BeautifyPipeline {
        BeautifyPipeline::new(
            context(host, store),
            "acme/restorer:v2".parse().unwrap(),
            "acme/upscaler".parse().unwrap(),
        )
    }

    /// Restorer answers with a `restored`-sized image, upscaler doubles whatever it gets
    fn chain_host(restored: (u32, u32)) -> Arc<FakeHost> {
        FakeHost::new(move |model, input| {
            if model.to_string() == "acme/restorer:v2" {
                json!(to_data_uri(&png(restored.0, restored.1, [100, 100, 100, 255]), "image/png"))
            } else {
                let sent = input["image"].as_str().unwrap();
                let payload = sent.split_once(',').unwrap().1;
                let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, payload).unwrap();
                let img = image::load_from_memory(&bytes).unwrap();
                json!(to_data_uri(
                    &png(img.width() * 2, img.height() * 2, [100, 100, 100, 255]),
                    "image/png"
                ))
            }
        })
    }

    #[tokio::test]
    async fn test_chain_runs_restore_then_upscale() {
        let host = chain_host((300, 200));
        let store = Arc::new(MemoryStore::default());
        let delivery = pipeline(host.clone(), store.clone())
            .run(BeautifyRequest {
                image: png(300, 200, [90, 90, 90, 255]),
                scope: Some("s".to_string()),
            })
            .await
            .unwrap();

        let inputs = host.inputs.lock();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].0, "acme/restorer:v2");
        assert_eq!(inputs[0].1["scale"], 1);
        assert_eq!(inputs[0].1["version"], "v1.4");
        assert_eq!(inputs[1].0, "acme/upscaler");
        assert_eq!(inputs[1].1["scale"], 2);
        assert_eq!(inputs[1].1["face_enhance"], true);
        drop(inputs);

        // upscaled output is brought back to the restored size, then toned
        assert_eq!((delivery.image.width, delivery.image.height), (300, 200));
        let stored = image::load_from_memory(&store.get(&delivery.image.key).unwrap())
            .unwrap()
            .to_rgba8();
        assert_eq!(stored.dimensions(), (300, 200));
        let toned = stored.get_pixel(150, 100);
        assert!(toned.0[..3].iter().all(|c| (102..=104).contains(c)), "{:?}", toned);
        assert_eq!(toned[3], 255);
    }

    #[tokio::test]
    async fn test_oversized_restore_output_is_budgeted() {
        // restorer returns more pixels than the upscaler accepts
        let host = chain_host((1800, 1600));
        let delivery = pipeline(host.clone(), Arc::new(MemoryStore::default()))
            .run(BeautifyRequest {
                image: png(180, 160, [90, 90, 90, 255]),
                scope: Some("s".to_string()),
            })
            .await
            .unwrap();

        let inputs = host.inputs.lock();
        assert!(inputs[1].1["image"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
        let (w, h) = (delivery.image.width, delivery.image.height);
        assert!(w as u64 * h as u64 <= UPSCALER_MAX_PIXELS);
        assert_eq!((w, h), (1535, 1365));
    }

    #[tokio::test]
    async fn test_large_upload_prescaled_before_restore() {
        let host = chain_host((100, 50));
        pipeline(host.clone(), Arc::new(MemoryStore::default()))
            .run(BeautifyRequest {
                image: png(2880, 1440, [90, 90, 90, 255]),
                scope: Some("s".to_string()),
            })
            .await
            .unwrap();

        let inputs = host.inputs.lock();
        let sent = inputs[0].1["img"].as_str().unwrap();
        assert!(sent.starts_with("data:image/jpeg;base64,"));
        let payload = sent.split_once(',').unwrap().1;
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, payload).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (RESTORE_MAX_SIDE, 720));
    }

    #[tokio::test]
    async fn test_repeat_is_cached_and_bad_upload_rejected() {
        let host = chain_host((40, 40));
        let pipeline = pipeline(host.clone(), Arc::new(MemoryStore::default()));
        let request = BeautifyRequest {
            image: png(40, 40, [1, 2, 3, 255]),
            scope: Some("s".to_string()),
        };
        pipeline.run(request.clone()).await.unwrap();
        assert!(pipeline.run(request).await.unwrap().cached);
        assert_eq!(host.creates(), 2);

        let err = pipeline
            .run(BeautifyRequest {
                image: b"nope".to_vec(),
                scope: Some("s".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(host.creates(), 2);
    }
}
