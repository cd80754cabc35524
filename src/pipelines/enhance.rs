use serde_json::json;
use tracing::{info, instrument};

use super::{inspect_output, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery, WorkloadClass};
use crate::services::cache::ResultCache;
use crate::services::model_host::ModelRef;
use crate::utils::image_ops::{prescale_async, SizeLimit};

pub const DEFAULT_SCALE: u32 = 2;
pub const MAX_SCALE: u32 = 4;
const MODEL_VERSION: &str = "v1.4";
const STORAGE_PREFIX: &str = "enhance";

#[derive(Debug, Clone)]
pub struct EnhanceRequest {
    pub image: Vec<u8>,
    pub scale: u32,
    pub scope: Option<String>,
}

/// One pass of the restoration model over a single image
pub struct EnhancePipeline {
    ctx: PipelineContext,
    model: ModelRef,
}

impl EnhancePipeline {
    pub fn new(ctx: PipelineContext, model: ModelRef) -> Self {
        Self { ctx, model }
    }

    pub fn validate(request: &EnhanceRequest) -> PipelineResult<()> {
        if request.image.is_empty() {
            return Err(PipelineError::Validation("image is required".to_string()));
        }
        if !(1..=MAX_SCALE).contains(&request.scale) {
            return Err(PipelineError::Validation(format!(
                "scale must be between 1 and {}",
                MAX_SCALE
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(scale = request.scale))]
    pub async fn run(&self, request: EnhanceRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let params = json!({ "scale": request.scale, "model": self.model.to_string() });
        let key = ResultCache::make_key(&request.image, &params, request.scope.as_deref());
        let ttl = self.ctx.presign_ttl;

        self.ctx
            .cached("enhance", &key, ttl, || self.compute(request))
            .await
    }

    async fn compute(&self, request: EnhanceRequest) -> PipelineResult<DeliveredImage> {
        let config = &self.ctx.image;
        let prepared = prescale_async(request.image, SizeLimit::LongSide(config.max_side_px), config.output_quality).await?;

        let input = json!({
            "img": prepared.data_uri(),
            "scale": request.scale,
            "version": MODEL_VERSION,
        });
        let output = self.ctx.jobs.run(WorkloadClass::Light, &self.model, input).await?;
        let bytes = self.ctx.jobs.fetch_output(WorkloadClass::Light, &output).await?;

        // Keep the model's encoding; only the dimensions are needed here
        let (bytes, content_type, dimensions) = inspect_output(bytes, "enhanced image").await?;

        info!(
            "Enhanced {}x{} -> {}x{}",
            prepared.width, prepared.height, dimensions.0, dimensions.1
        );
        self.ctx
            .deliver(bytes, content_type, STORAGE_PREFIX, dimensions, self.ctx.presign_ttl)
            .await
    }
}
