use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};

use super::{blocking, PipelineContext};
use crate::core::errors::{PipelineError, PipelineResult, RenderingError};
use crate::core::types::{DeliveredImage, Delivery, Panel, PanelScript};
use crate::services::cache::{content_digest, ResultCache};
use crate::services::rendering::{layout, BubbleRenderer, PAGE_HEIGHT, PAGE_WIDTH};
use crate::utils::image_ops::encode_png;

pub const MAX_PANELS: usize = 12;
const STORAGE_PREFIX: &str = "comic-pages";

#[derive(Debug, Clone)]
pub struct ComicPageRequest {
    /// Panel artwork in reading order
    pub images: Vec<Vec<u8>>,
    /// Dialogue per panel; missing entries mean no bubble
    pub panels: Vec<PanelScript>,
    pub scope: Option<String>,
}

/// Lays the caller's images out on one page and draws their speech bubbles
pub struct ComicPagePipeline {
    ctx: PipelineContext,
    renderer: Arc<BubbleRenderer>,
}

impl ComicPagePipeline {
    pub fn new(ctx: PipelineContext, renderer: Arc<BubbleRenderer>) -> Self {
        Self { ctx, renderer }
    }

    pub fn validate(request: &ComicPageRequest) -> PipelineResult<()> {
        if request.images.is_empty() {
            return Err(PipelineError::Rendering(RenderingError::NoPanels));
        }
        if request.images.len() > MAX_PANELS {
            return Err(PipelineError::Validation(format!(
                "at most {} panels per page",
                MAX_PANELS
            )));
        }
        if request.panels.len() > request.images.len() {
            return Err(PipelineError::Validation(format!(
                "{} panel scripts for {} images",
                request.panels.len(),
                request.images.len()
            )));
        }
        Ok(())
    }

    pub fn cache_key(request: &ComicPageRequest) -> String {
        let digests: Vec<String> = request.images.iter().map(|img| content_digest(img)).collect();
        let params = json!({ "panels": request.panels });
        ResultCache::make_key(digests.join(",").as_bytes(), &params, request.scope.as_deref())
    }

    #[instrument(skip(self, request), fields(panels = request.images.len()))]
    pub async fn run(&self, request: ComicPageRequest) -> PipelineResult<Delivery> {
        Self::validate(&request)?;
        let key = Self::cache_key(&request);
        let ttl = self.ctx.presign_ttl;

        self.ctx
            .cached("comic_page", &key, ttl, || self.compute(request))
            .await
    }

    async fn compute(&self, request: ComicPageRequest) -> PipelineResult<DeliveredImage> {
        let renderer = self.renderer.clone();
        let ComicPageRequest { images, panels: scripts, .. } = request;

        let png = blocking(move || {
            let rects = layout(images.len())?;
            let panels = images
                .iter()
                .zip(rects)
                .enumerate()
                .map(|(index, (bytes, rect))| -> Result<Panel, RenderingError> {
                    let image = image::load_from_memory(bytes)
                        .map_err(|source| RenderingError::PanelDecode { index, source })?
                        .to_rgba8();
                    let script = scripts.get(index).cloned().unwrap_or_default();
                    Ok(Panel {
                        rect,
                        image,
                        dialogue: script.dialogue,
                        speaker: script.speaker,
                    })
                })
                .collect::<Result<Vec<_>, RenderingError>>()?;

            let page = renderer.render_page(&panels)?;
            encode_png(&page).map_err(PipelineError::Image)
        })
        .await?;

        info!("Composed comic page ({} bytes)", png.len());
        self.ctx
            .deliver(png, "image/png", STORAGE_PREFIX, (PAGE_WIDTH, PAGE_HEIGHT), self.ctx.presign_ttl)
            .await
    }
}
