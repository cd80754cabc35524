pub mod bubble;
pub mod layout;

pub use bubble::{measure, BubbleLayout};
pub use layout::{layout, strip_cells, wrap_text, GAP, PAGE_HEIGHT, PAGE_WIDTH};

use cosmic_text::{
    fontdb, Attrs, Buffer, Color as CosmicColor, Family, FontSystem, Metrics, Shaping, SwashCache,
    Weight, Wrap,
};
use image::{imageops, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::config::RenderingConfig;
use crate::core::errors::{RenderingError, RenderingResult};
use crate::core::types::{FitMode, Panel, Position, Rect};
use crate::services::compositing::{blend_over, fit_background};

const PAGE_BACKGROUND: Rgba<u8> = Rgba([0xf8, 0xf8, 0xf6, 0xff]);
const TEXT_COLOR: [u8; 3] = [0x1a, 0x1a, 0x1a];

/// Bubble offset from the panel's top-left corner on composed pages
pub const PAGE_BUBBLE_INSET: u32 = 10;
/// Bubble offset on generated strips
pub const STRIP_BUBBLE_INSET: u32 = 15;
/// Bubbles on composed pages may take at most this share of the panel height
const PAGE_BUBBLE_MAX_HEIGHT: f32 = 0.45;

/// Page composer and speech bubble renderer.
///
/// Shaping is done by cosmic-text with fonts loaded from the configured
/// directory only (system fonts are a fallback when the directory is empty).
/// All methods are synchronous and CPU-bound; call them from `spawn_blocking`.
pub struct BubbleRenderer {
    font_system: Mutex<FontSystem>,
    swash_cache: Mutex<SwashCache>,
    family: String,
    has_fonts: bool,
}

impl BubbleRenderer {
    pub fn new(config: &RenderingConfig) -> Self {
        let font_system = Self::create_font_system(&config.fonts_dir);
        let has_fonts = !font_system.db().is_empty();
        if has_fonts {
            info!(
                "Bubble renderer ready: {} font faces, family '{}'",
                font_system.db().len(),
                config.font_family
            );
        } else {
            warn!("No fonts available; bubbles will be drawn without text");
        }

        Self {
            font_system: Mutex::new(font_system),
            swash_cache: Mutex::new(SwashCache::new()),
            family: config.font_family.clone(),
            has_fonts,
        }
    }

    fn create_font_system(fonts_dir: &Path) -> FontSystem {
        let mut db = fontdb::Database::new();
        db.load_fonts_dir(fonts_dir);
        debug!("Loaded {} font faces from {}", db.len(), fonts_dir.display());

        if db.is_empty() {
            warn!("No fonts found in {}, scanning system fonts", fonts_dir.display());
            db.load_system_fonts();
        }

        FontSystem::new_with_locale_and_db("en-US".to_string(), db)
    }

    /// Render a bubble for `text` no larger than `max_width × max_height`.
    ///
    /// `Ok(None)` for blank text; overflowing text is truncated with an ellipsis.
    pub fn render_bubble(&self, text: &str, max_width: u32, max_height: u32) -> RenderingResult<Option<RgbaImage>> {
        let Some(layout) = measure(text, max_width, max_height)? else {
            return Ok(None);
        };
        if layout.truncated {
            debug!("Bubble text truncated to {} lines", layout.lines.len());
        }

        let mut image = bubble::draw_shape(&layout);
        if self.has_fonts {
            self.draw_lines(&mut image, &layout);
        }
        Ok(Some(image))
    }

    fn draw_lines(&self, image: &mut RgbaImage, layout: &BubbleLayout) {
        let text = layout.lines.join("\n");
        let metrics = Metrics::new(bubble::FONT_SIZE, bubble::LINE_HEIGHT as f32);
        let (origin_x, origin_y) = bubble::TEXT_ORIGIN;
        let (width, height) = (image.width() as i32, layout.body_height as i32);

        let mut font_system = self.font_system.lock();
        let mut buffer = Buffer::new(&mut font_system, metrics);
        buffer.set_wrap(&mut font_system, Wrap::None);
        let attrs = Attrs::new()
            .family(Family::Name(self.family.as_str()))
            .weight(Weight::SEMIBOLD);
        buffer.set_text(&mut font_system, &text, &attrs, Shaping::Advanced);
        buffer.shape_until_scroll(&mut font_system, false);

        let color = CosmicColor::rgb(TEXT_COLOR[0], TEXT_COLOR[1], TEXT_COLOR[2]);
        let mut swash_cache = self.swash_cache.lock();
        buffer.draw(&mut font_system, &mut swash_cache, color, |x, y, _w, _h, pixel| {
            let (px, py) = (origin_x + x, origin_y + y);
            // glyphs stay inside the body, clear of the outline
            if px < 2 || py < 2 || px >= width - 2 || py >= height - 2 || pixel.a() == 0 {
                return;
            }
            let dst = image.get_pixel_mut(px as u32, py as u32);
            let src = Rgba([pixel.r(), pixel.g(), pixel.b(), 255]);
            blend_over(dst, &src, pixel.a() as f32 / 255.0);
        });
    }

    /// Render a bubble for `text` into `cell` of `canvas`, `inset` pixels from
    /// the cell's top-left corner. Returns whether a bubble was drawn.
    pub fn place_bubble(
        &self,
        canvas: &mut RgbaImage,
        cell: Rect,
        text: &str,
        inset: u32,
        max_height: u32,
    ) -> RenderingResult<bool> {
        let max_width = cell.width.saturating_sub(inset * 2);
        match self.render_bubble(text, max_width, max_height)? {
            Some(bubble) => {
                imageops::overlay(canvas, &bubble, (cell.x + inset) as i64, (cell.y + inset) as i64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Compose a `PAGE_WIDTH × PAGE_HEIGHT` page: every panel image cover-fitted
    /// into its rectangle, then a bubble for each panel with dialogue
    pub fn render_page(&self, panels: &[Panel]) -> RenderingResult<RgbaImage> {
        if panels.is_empty() {
            return Err(RenderingError::NoPanels);
        }

        let mut page = RgbaImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, PAGE_BACKGROUND);

        for (index, panel) in panels.iter().enumerate() {
            let rect = panel.rect;
            let fitted = fit_background(&panel.image, rect.width, rect.height, FitMode::Cover, Position::Centre)
                .map_err(|source| RenderingError::PanelFit { index, source })?;
            imageops::replace(&mut page, &fitted, rect.x as i64, rect.y as i64);
        }

        for (index, panel) in panels.iter().enumerate() {
            let Some(text) = panel.bubble_text() else {
                continue;
            };
            let max_height = (panel.rect.height as f32 * PAGE_BUBBLE_MAX_HEIGHT) as u32;
            match self.place_bubble(&mut page, panel.rect, &text, PAGE_BUBBLE_INSET, max_height) {
                Ok(_) => {}
                Err(RenderingError::BubbleTooSmall { width, height }) => {
                    warn!("Panel {} too small for a bubble ({}x{}), skipped", index, width, height);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn renderer() -> BubbleRenderer {
        let dir = tempfile::tempdir().unwrap();
        BubbleRenderer::new(&RenderingConfig {
            fonts_dir: PathBuf::from(dir.path()),
            font_family: "Noto Sans".to_string(),
        })
    }

    fn panels(count: usize, dialogue: &str) -> Vec<Panel> {
        layout(count)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, rect)| Panel {
                rect,
                image: RgbaImage::from_pixel(200, 300, Rgba([(i * 40) as u8, 80, 160, 255])),
                dialogue: dialogue.to_string(),
                speaker: Some("Mai".to_string()),
            })
            .collect()
    }

    #[test]
    fn test_empty_page_rejected() {
        assert!(matches!(renderer().render_page(&[]), Err(RenderingError::NoPanels)));
    }

    #[test]
    fn test_page_without_dialogue() {
        let page = renderer().render_page(&panels(3, "")).unwrap();
        assert_eq!(page.dimensions(), (PAGE_WIDTH, PAGE_HEIGHT));
        // gutter keeps the page colour, cells carry the panel art
        assert_eq!(*page.get_pixel(GAP / 2, GAP / 2), PAGE_BACKGROUND);
        assert_eq!(*page.get_pixel(540, 400), Rgba([0, 80, 160, 255]));
        assert_eq!(*page.get_pixel(1000, 1500), Rgba([80, 80, 160, 255]));
    }

    #[test]
    fn test_bubbles_drawn_at_panel_corner() {
        let page = renderer().render_page(&panels(4, "Where did everyone go?")).unwrap();
        let first = layout(4).unwrap()[0];
        let inside = page.get_pixel(first.x + PAGE_BUBBLE_INSET + 60, first.y + PAGE_BUBBLE_INSET + 50);
        // bubble body is white (or dark glyph ink), never the panel colour
        assert_ne!(*inside, Rgba([0, 80, 160, 255]));
        // far corner of the panel is untouched
        assert_eq!(*page.get_pixel(first.right() - 5, first.bottom() - 5), Rgba([0, 80, 160, 255]));
    }

    #[test]
    fn test_blank_bubble_is_none() {
        assert!(renderer().render_bubble("  ", 300, 300).unwrap().is_none());
        let bubble = renderer().render_bubble("Hi!", 300, 300).unwrap().unwrap();
        assert_eq!(bubble.width(), 120);
    }
}
