//! Portrait relighting with a text-guided light model. Options mirror the
//! model's own inputs; the pipeline only validates ranges and delivers the
//! first image it returns.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument};

use super::{inspect_output, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery, WorkloadClass};
use crate::services::cache::ResultCache;
use crate::services::model_host::ModelRef;
use crate::utils::image_ops::{prescale_async, SizeLimit};

const STORAGE_PREFIX: &str = "portraits/relight";
const SIZE_RANGE: std::ops::RangeInclusive<u32> = 256..=1024;
const SIZE_STEP: u32 = 64;

/// Where the light falls from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum LightSource {
    #[default]
    None,
    Left,
    Right,
    Top,
    Bottom,
}

impl LightSource {
    pub const ALL: [LightSource; 5] = [
        LightSource::None,
        LightSource::Left,
        LightSource::Right,
        LightSource::Top,
        LightSource::Bottom,
    ];

    /// Name the model expects
    pub fn as_str(&self) -> &'static str {
        match self {
            LightSource::None => "None",
            LightSource::Left => "Left Light",
            LightSource::Right => "Right Light",
            LightSource::Top => "Top Light",
            LightSource::Bottom => "Bottom Light",
        }
    }
}

impl fmt::Display for LightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LightSource> for &'static str {
    fn from(source: LightSource) -> Self {
        source.as_str()
    }
}

/// Accepts the model's names ("Left Light") and the bare direction ("left")
impl FromStr for LightSource {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let bare = wanted.strip_suffix(" light").unwrap_or(&wanted);
        LightSource::ALL
            .into_iter()
            .find(|source| {
                let name = source.as_str().to_ascii_lowercase();
                name == wanted || name.strip_suffix(" light").unwrap_or(&name) == bare
            })
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "unknown light source '{}', expected none, left, right, top or bottom",
                    s
                ))
            })
    }
}

impl TryFrom<String> for LightSource {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Webp,
    Jpg,
    Png,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

/// Model inputs besides the subject image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelightOptions {
    pub prompt: String,
    pub appended_prompt: String,
    pub negative_prompt: String,
    pub light_source: LightSource,
    pub steps: u32,
    pub cfg: f32,
    pub output_format: OutputFormat,
    pub output_quality: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Default for RelightOptions {
    fn default() -> Self {
        Self {
            prompt: "studio soft light, flattering portrait lighting".to_string(),
            appended_prompt: "best quality".to_string(),
            negative_prompt: "lowres, bad anatomy, bad hands, cropped, worst quality".to_string(),
            light_source: LightSource::None,
            steps: 25,
            cfg: 2.0,
            output_format: OutputFormat::Webp,
            output_quality: 80,
            width: None,
            height: None,
        }
    }
}

impl RelightOptions {
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: String| Err(PipelineError::Validation(msg));
        if self.prompt.trim().is_empty() {
            return invalid("prompt is required".to_string());
        }
        if !(1..=100).contains(&self.steps) {
            return invalid(format!("steps must be between 1 and 100, got {}", self.steps));
        }
        if !(1.0..=32.0).contains(&self.cfg) {
            return invalid(format!("cfg must be between 1 and 32, got {}", self.cfg));
        }
        if !(1..=100).contains(&self.output_quality) {
            return invalid(format!(
                "output_quality must be between 1 and 100, got {}",
                self.output_quality
            ));
        }
        for (name, size) in [("width", self.width), ("height", self.height)] {
            if let Some(size) = size {
                if !SIZE_RANGE.contains(&size) || size % SIZE_STEP != 0 {
                    return invalid(format!(
                        "{} must be a multiple of {} between {} and {}, got {}",
                        name,
                        SIZE_STEP,
                        SIZE_RANGE.start(),
                        SIZE_RANGE.end(),
                        size
                    ));
                }
            }
        }
        Ok(())
    }

    /// Model input for `subject`; always asks for a single image
    fn model_input(&self, subject: String) -> Value {
        let mut input = json!({
            "subject_image": subject,
            "prompt": self.prompt,
            "appended_prompt": self.appended_prompt,
            "negative_prompt": self.negative_prompt,
            "light_source": self.light_source.as_str(),
            "steps": self.steps,
            "cfg": self.cfg,
            "number_of_images": 1,
            "output_format": self.output_format.as_str(),
            "output_quality": self.output_quality,
        });
        if let Some(width) = self.width {
            input["width"] = json!(width);
        }
        if let Some(height) = self.height {
            input["height"] = json!(height);
        }
        input
    }
}

#[derive(Debug, Clone)]
pub struct RelightRequest {
    pub image: Vec<u8>,
    pub options: RelightOptions,
    pub scope: Option<String>,
}

pub struct RelightPipeline {
    ctx: PipelineContext,
    model: ModelRef,
}

impl RelightPipeline {
    pub fn new(ctx: PipelineContext, model: ModelRef) -> Self {
        Self { ctx, model }
    }

    pub fn validate(request: &RelightRequest) -> PipelineResult<()> {
        if request.image.is_empty() {
            return Err(PipelineError::Validation("image is required".to_string()));
        }
        request.options.validate()
    }

    #[instrument(skip(self, request), fields(light = %request.options.light_source))]
    pub async fn run(&self, request: RelightRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let params = json!({
            "options": request.options,
            "model": self.model.to_string(),
        });
        let key = ResultCache::make_key(&request.image, &params, request.scope.as_deref());
        let ttl = self.ctx.presign_ttl;

        self.ctx
            .cached("relight", &key, ttl, || self.compute(request))
            .await
    }

    async fn compute(&self, request: RelightRequest) -> PipelineResult<DeliveredImage> {
        let config = &self.ctx.image;
        let prepared = prescale_async(
            request.image,
            SizeLimit::LongSide(config.max_side_px),
            config.output_quality,
        )
        .await?;

        let input = request.options.model_input(prepared.data_uri());
        let output = self.ctx.jobs.run(WorkloadClass::Heavy, &self.model, input).await?;
        let bytes = self.ctx.jobs.fetch_output(WorkloadClass::Heavy, &output).await?;
        let (bytes, content_type, dimensions) = inspect_output(bytes, "relit image").await?;

        info!(
            "Relit {}x{} ({}) -> {}x{} {}",
            prepared.width,
            prepared.height,
            request.options.light_source,
            dimensions.0,
            dimensions.1,
            content_type
        );
        self.ctx
            .deliver(bytes, content_type, STORAGE_PREFIX, dimensions, self.ctx.presign_ttl)
            .await
    }
}
