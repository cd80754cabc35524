use serde_json::json;
use tracing::{info, instrument};

use super::{inspect_output, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery, WorkloadClass};
use crate::services::cache::ResultCache;
use crate::services::model_host::ModelRef;
use crate::utils::image_ops::{prescale_async, SizeLimit};

/// Upscale factors the super-resolution model supports
pub const SCALES: [u32; 2] = [2, 4];
pub const DEFAULT_SCALE: u32 = 2;
/// Inputs above this many pixels are shrunk before upload
pub const MAX_INPUT_PIXELS: u64 = 2_000_000;
const STORAGE_PREFIX: &str = "clarity";

#[derive(Debug, Clone)]
pub struct ClarityRequest {
    pub image: Vec<u8>,
    pub scale: u32,
    pub face_enhance: bool,
    pub scope: Option<String>,
}

/// Super-resolution upscale of a single image
pub struct ClarityPipeline {
    ctx: PipelineContext,
    model: ModelRef,
}

impl ClarityPipeline {
    pub fn new(ctx: PipelineContext, model: ModelRef) -> Self {
        Self { ctx, model }
    }

    pub fn validate(request: &ClarityRequest) -> PipelineResult<()> {
        if request.image.is_empty() {
            return Err(PipelineError::Validation("image is required".to_string()));
        }
        if !SCALES.contains(&request.scale) {
            return Err(PipelineError::Validation(format!(
                "scale must be one of {:?}",
                SCALES
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(scale = request.scale, face_enhance = request.face_enhance))]
    pub async fn run(&self, request: ClarityRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let params = json!({
            "scale": request.scale,
            "faceEnhance": request.face_enhance,
            "model": self.model.to_string(),
        });
        let key = ResultCache::make_key(&request.image, &params, request.scope.as_deref());
        let ttl = self.ctx.presign_ttl;

        self.ctx
            .cached("clarity", &key, ttl, || self.compute(request))
            .await
    }

    async fn compute(&self, request: ClarityRequest) -> PipelineResult<DeliveredImage> {
        let quality = self.ctx.image.output_quality;
        let prepared = prescale_async(request.image, SizeLimit::Pixels(MAX_INPUT_PIXELS), quality).await?;

        let input = json!({
            "image": prepared.data_uri(),
            "scale": request.scale,
            "face_enhance": request.face_enhance,
        });
        let output = self.ctx.jobs.run(WorkloadClass::Light, &self.model, input).await?;
        let bytes = self.ctx.jobs.fetch_output(WorkloadClass::Light, &output).await?;
        let (bytes, content_type, dimensions) = inspect_output(bytes, "upscaled image").await?;

        info!(
            "Upscaled {}x{}{} -> {}x{}",
            prepared.width,
            prepared.height,
            if prepared.scaled { " (pre-shrunk)" } else { "" },
            dimensions.0,
            dimensions.1
        );
        self.ctx
            .deliver(bytes, content_type, STORAGE_PREFIX, dimensions, self.ctx.presign_ttl)
            .await
    }
}
