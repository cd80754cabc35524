use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument};

use super::{inspect_output, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DeliveredImage, Delivery, WorkloadClass};
use crate::services::cache::ResultCache;
use crate::services::model_host::ModelRef;
use crate::utils::image_ops::{prescale_async, SizeLimit};

pub const MAX_EXTRA_CHARS: usize = 500;

/// Art styles the image-to-image model is prompted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Anime,
    Ghibli,
    Watercolor,
    OilPainting,
    Sketches,
}

impl Style {
    pub const ALL: [Style; 5] = [
        Style::Anime,
        Style::Ghibli,
        Style::Watercolor,
        Style::OilPainting,
        Style::Sketches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Anime => "anime",
            Style::Ghibli => "ghibli",
            Style::Watercolor => "watercolor",
            Style::OilPainting => "oil-painting",
            Style::Sketches => "sketches",
        }
    }

    /// Preset prompt; each one keeps the subject's face, pose and palette
    pub fn preset(&self) -> &'static str {
        match self {
            Style::Anime => "Convert the whole image to anime cel-shaded style with clean ink outlines and flat 2-3 tone shading. Preserve the original color palette (skin, hair, clothing, background) with only minimal hue shift; keep natural skin tones. Keep the original face, pose and composition; eyes with specular highlights.",
            Style::Ghibli => "Transform to hand-drawn animation in the spirit of Studio Ghibli: soft lighting, gentle brush strokes, film-like texture. Retain the original color palette while applying the painterly look. Keep the original face, expression and composition.",
            Style::Watercolor => "Transform to watercolor painting: fluid washes, soft edges, paper texture, subtle granulation, light bloom. Preserve the original color palette and overall luminance; avoid strong hue shifts. Keep the original face, pose and composition.",
            Style::OilPainting => "Transform to classical oil painting on canvas: visible impasto brushwork, rich color depth, soft edges, realistic lighting. Preserve the original color palette (especially skin tones and key garments) with minimal deviation. Keep the original face, pose and composition.",
            Style::Sketches => "Transform to a colored pencil sketch: graphite-like hatching with clean linework and subtle shading on paper texture. Preserve the original color palette instead of converting to grayscale. Keep the original face, pose and composition.",
        }
    }

    pub fn prompt(&self, extra: Option<&str>) -> String {
        match extra.map(str::trim).filter(|e| !e.is_empty()) {
            Some(extra) => format!("{}\nAdditional details: {}", self.preset(), extra),
            None => self.preset().to_string(),
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Style {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Style::ALL
            .into_iter()
            .find(|style| style.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Style::ALL.iter().map(Style::as_str).collect();
                PipelineError::Validation(format!(
                    "unknown style '{}', expected one of: {}",
                    s,
                    names.join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone)]
pub struct RestyleRequest {
    pub image: Vec<u8>,
    pub style: Style,
    pub extra: Option<String>,
    pub scope: Option<String>,
}

/// Redraws a photo in one of the preset art styles on the heavy pool
pub struct RestylePipeline {
    ctx: PipelineContext,
    model: ModelRef,
}

impl RestylePipeline {
    pub fn new(ctx: PipelineContext, model: ModelRef) -> Self {
        Self { ctx, model }
    }

    pub fn validate(request: &RestyleRequest) -> PipelineResult<()> {
        if request.image.is_empty() {
            return Err(PipelineError::Validation("image is required".to_string()));
        }
        if let Some(extra) = &request.extra {
            if extra.chars().count() > MAX_EXTRA_CHARS {
                return Err(PipelineError::Validation(format!(
                    "extra details are limited to {} characters",
                    MAX_EXTRA_CHARS
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(style = %request.style))]
    pub async fn run(&self, request: RestyleRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let params = json!({
            "style": request.style.as_str(),
            "prompt": request.style.prompt(request.extra.as_deref()),
            "model": self.model.to_string(),
        });
        let key = ResultCache::make_key(&request.image, &params, request.scope.as_deref());
        let ttl = self.ctx.presign_ttl;

        self.ctx
            .cached("restyle", &key, ttl, || self.compute(request))
            .await
    }

    async fn compute(&self, request: RestyleRequest) -> PipelineResult<DeliveredImage> {
        let config = &self.ctx.image;
        let prepared = prescale_async(
            request.image,
            SizeLimit::LongSide(config.max_side_px),
            config.output_quality,
        )
        .await?;

        let input = json!({
            "input_image": prepared.data_uri(),
            "prompt": request.style.prompt(request.extra.as_deref()),
        });
        let output = self.ctx.jobs.run(WorkloadClass::Heavy, &self.model, input).await?;
        let bytes = self.ctx.jobs.fetch_output(WorkloadClass::Heavy, &output).await?;
        let (bytes, content_type, dimensions) = inspect_output(bytes, "restyled image").await?;

        info!("Restyled {}x{} as {}", prepared.width, prepared.height, request.style);
        let prefix = format!("styles/{}", request.style);
        self.ctx
            .deliver(bytes, content_type, &prefix, dimensions, self.ctx.presign_ttl)
            .await
    }
}
