use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{blocking, PipelineContext};
use crate::core::errors::{JobResult, PipelineError, PipelineResult, RenderingError};
use crate::core::types::{bubble_text, DeliveredImage, WorkloadClass};
use crate::services::model_host::{decode_text, ModelRef};
use crate::services::rendering::{strip_cells, BubbleRenderer, STRIP_BUBBLE_INSET};
use crate::services::storyboard::{self, StoryPanel, StoryboardSource};
use crate::utils::image_ops::encode_png;

pub const MIN_PROMPT_CHARS: usize = 10;
pub const MAX_PAGES: usize = 3;
pub const MIN_PANELS_PER_PAGE: usize = 3;
pub const MAX_PANELS_PER_PAGE: usize = 9;

const SCRIPT_MAX_TOKENS: u32 = 8000;
const SCRIPT_TEMPERATURE: f32 = 0.3;
const REPAIR_MAX_TOKENS: u32 = 3000;
const REPAIR_TEMPERATURE: f32 = 0.1;
const ASPECT_RATIO: &str = "2:3";

fn default_pages() -> usize {
    1
}

fn default_panels_per_page() -> usize {
    6
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComicGenerationRequest {
    pub prompt: String,
    #[serde(default = "default_pages")]
    pub pages: usize,
    #[serde(default = "default_panels_per_page", alias = "panels_per_page")]
    pub panels_per_page: usize,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsUsed {
    pub llm: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComicMeta {
    pub pages: usize,
    pub panels_per_page: usize,
    pub total_panels: usize,
    pub storyboard: StoryboardSource,
    pub model: ModelsUsed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedComic {
    pub comic_id: String,
    pub image: DeliveredImage,
    pub panels: Vec<StoryPanel>,
    pub meta: ComicMeta,
}

/// Prompt to storyboard to one generated page strip with bubbles drawn on it.
///
/// Every request gets a fresh comic id, so results are not cached.
pub struct ComicGenerationPipeline {
    ctx: PipelineContext,
    renderer: Arc<BubbleRenderer>,
    storyboard_model: ModelRef,
    image_model: ModelRef,
}

impl ComicGenerationPipeline {
    pub fn new(
        ctx: PipelineContext,
        renderer: Arc<BubbleRenderer>,
        storyboard_model: ModelRef,
        image_model: ModelRef,
    ) -> Self {
        Self {
            ctx,
            renderer,
            storyboard_model,
            image_model,
        }
    }

    pub fn validate(request: &ComicGenerationRequest) -> PipelineResult<()> {
        if request.prompt.trim().chars().count() < MIN_PROMPT_CHARS {
            return Err(PipelineError::Validation(format!(
                "prompt must be at least {} characters",
                MIN_PROMPT_CHARS
            )));
        }
        if !(1..=MAX_PAGES).contains(&request.pages) {
            return Err(PipelineError::Validation(format!(
                "pages must be between 1 and {}",
                MAX_PAGES
            )));
        }
        if !(MIN_PANELS_PER_PAGE..=MAX_PANELS_PER_PAGE).contains(&request.panels_per_page) {
            return Err(PipelineError::Validation(format!(
                "panelsPerPage must be between {} and {}",
                MIN_PANELS_PER_PAGE, MAX_PANELS_PER_PAGE
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(pages = request.pages, per_page = request.panels_per_page))]
    pub async fn run(&self, request: ComicGenerationRequest) -> PipelineResult<GeneratedComic> {
        Self::validate(&request)?;
        let started = Instant::now();
        let ComicGenerationRequest {
            prompt,
            pages,
            panels_per_page,
            style,
        } = request;
        let prompt = prompt.trim().to_string();
        let total = pages * panels_per_page;

        // 1. storyboard
        let raw = self
            .complete(storyboard::script_prompt(&prompt, pages, panels_per_page), SCRIPT_MAX_TOKENS, SCRIPT_TEMPERATURE)
            .await?;
        let board = storyboard::parse_with_repair(&raw, total, &prompt, |fix| {
            self.complete(fix, REPAIR_MAX_TOKENS, REPAIR_TEMPERATURE)
        })
        .await;
        if board.source == StoryboardSource::Fallback {
            warn!("Using the default storyboard for this comic");
        }

        // 2. artwork for every page in one image
        let input = json!({
            "prompt": storyboard::image_prompt(&board.panels, pages, panels_per_page, style.as_deref()),
            "aspect_ratio": ASPECT_RATIO,
        });
        let output = self.ctx.jobs.run(WorkloadClass::Batch, &self.image_model, input).await?;
        let artwork = self.ctx.jobs.fetch_output(WorkloadClass::Batch, &output).await?;

        // 3. bubbles
        let renderer = self.renderer.clone();
        let panels = board.panels.clone();
        let (png, dimensions) = blocking(move || {
            let mut canvas = image::load_from_memory(&artwork)
                .map_err(|e| PipelineError::Image(anyhow::Error::new(e).context("generated page could not be decoded")))?
                .to_rgba8();
            let (width, height) = canvas.dimensions();

            let cells = strip_cells(width, height, pages, panels_per_page);
            for (index, (panel, cell)) in panels.iter().zip(cells).enumerate() {
                let Some(text) = bubble_text(&panel.dialogue, Some(panel.speaker.as_str())) else {
                    continue;
                };
                let max_height = cell.height.saturating_sub(STRIP_BUBBLE_INSET * 2);
                match renderer.place_bubble(&mut canvas, cell, &text, STRIP_BUBBLE_INSET, max_height) {
                    Ok(_) => {}
                    Err(RenderingError::BubbleTooSmall { width, height }) => {
                        warn!("Panel {} cell too small for a bubble ({}x{})", index, width, height);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let png = encode_png(&canvas).map_err(PipelineError::Image)?;
            Ok((png, (width, height)))
        })
        .await?;

        // 4. store
        let comic_id = Uuid::new_v4().to_string();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let prefix = format!("comics/{}-{}", comic_id, stamp);
        let image = self
            .ctx
            .deliver(png, "image/png", &prefix, dimensions, self.ctx.presign_ttl)
            .await?;

        self.ctx.metrics.record_pipeline_duration("comic_generation", started.elapsed());
        info!(
            "Generated comic {} ({} panels, {:?} storyboard) in {:?}",
            comic_id,
            total,
            board.source,
            started.elapsed()
        );

        Ok(GeneratedComic {
            comic_id,
            image,
            panels: board.panels,
            meta: ComicMeta {
                pages,
                panels_per_page,
                total_panels: total,
                storyboard: board.source,
                model: ModelsUsed {
                    llm: self.storyboard_model.to_string(),
                    image: self.image_model.to_string(),
                },
            },
        })
    }

    /// One language model call, its output joined into a single string
    async fn complete(&self, prompt: String, max_tokens: u32, temperature: f32) -> JobResult<String> {
        let input = json!({
            "prompt": prompt,
            "max_output_tokens": max_tokens,
            "temperature": temperature,
        });
        let output = self
            .ctx
            .jobs
            .run(WorkloadClass::Batch, &self.storyboard_model, input)
            .await?;
        decode_text(&output)
    }
}
