//! Speech bubble geometry: sizing from wrapped text, truncation and the
//! rounded-rectangle-with-tail shape. Glyphs are drawn on top by the renderer.

use image::{Rgba, RgbaImage};

use super::layout::wrap_text;
use crate::core::errors::{RenderingError, RenderingResult};

pub const PADDING: u32 = 14;
pub const TAIL_HEIGHT: u32 = 16;
pub const FONT_SIZE: f32 = 20.0;
pub const LINE_HEIGHT: u32 = 28;
/// Average advance used to size bubbles before shaping
pub const CHAR_WIDTH: u32 = 10;
pub const ELLIPSIS: char = '…';

const MIN_WIDTH: u32 = 120;
const CORNER_RADIUS: f32 = 10.0;
const STROKE_WIDTH: f32 = 2.5;
/// Extra room below the last line for descenders
const BODY_SLACK: u32 = 4;
/// Horizontal position of the tail as a share of the bubble width
const TAIL_ANCHOR: f32 = 0.15;

const FILL: [u8; 3] = [0xff, 0xff, 0xff];
const STROKE: [u8; 3] = [0x2c, 0x2c, 0x2c];

/// Where the first line of text starts inside the bubble
pub const TEXT_ORIGIN: (i32, i32) = (PADDING as i32 + 2, PADDING as i32 + 4);

/// Size and content of one bubble
#[derive(Debug, Clone, PartialEq)]
pub struct BubbleLayout {
    pub lines: Vec<String>,
    pub width: u32,
    /// Height of the rounded body, without the tail
    pub body_height: u32,
    pub truncated: bool,
}

impl BubbleLayout {
    /// Full image height including the tail
    pub fn height(&self) -> u32 {
        self.body_height + TAIL_HEIGHT
    }
}

fn body_height(lines: usize) -> u32 {
    PADDING * 2 + lines as u32 * LINE_HEIGHT + BODY_SLACK
}

/// Characters per line that fit in `max_width`
pub fn max_chars_for(max_width: u32) -> usize {
    (max_width.saturating_sub(PADDING * 2) / CHAR_WIDTH).max(1) as usize
}

/// Wrap `text` and size a bubble for it within `max_width × max_height`.
///
/// Returns `None` for blank text. When the wrapped text is too tall, lines are
/// dropped from the end and the last kept line ends with an ellipsis.
pub fn measure(text: &str, max_width: u32, max_height: u32) -> RenderingResult<Option<BubbleLayout>> {
    let too_small = || RenderingError::BubbleTooSmall {
        width: max_width,
        height: max_height,
    };
    if max_width < PADDING * 2 + CHAR_WIDTH {
        return Err(too_small());
    }

    let max_chars = max_chars_for(max_width);
    let mut lines = wrap_text(text, max_chars);
    if lines.is_empty() {
        return Ok(None);
    }

    let fixed = PADDING * 2 + BODY_SLACK + TAIL_HEIGHT;
    let max_lines = (max_height.saturating_sub(fixed) / LINE_HEIGHT) as usize;
    if max_lines == 0 {
        return Err(too_small());
    }

    let truncated = lines.len() > max_lines;
    if truncated {
        lines.truncate(max_lines);
        if let Some(last) = lines.last_mut() {
            *last = with_ellipsis(last, max_chars);
        }
    }

    let longest = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as u32;
    let natural = PADDING * 2 + longest * CHAR_WIDTH + BODY_SLACK;
    let width = natural.max(MIN_WIDTH).min(max_width);

    Ok(Some(BubbleLayout {
        body_height: body_height(lines.len()),
        lines,
        width,
        truncated,
    }))
}

/// Append the ellipsis, shortening the line so it stays within `max_chars`
fn with_ellipsis(line: &str, max_chars: usize) -> String {
    let keep = max_chars.saturating_sub(1);
    let mut out: String = line.chars().take(keep).collect();
    out.truncate(out.trim_end().len());
    out.push(ELLIPSIS);
    out
}

/// Signed distance to a rounded rectangle given by its centre and half extents
fn rounded_rect_distance(px: f32, py: f32, centre: (f32, f32), half: (f32, f32), radius: f32) -> f32 {
    let qx = (px - centre.0).abs() - half.0 + radius;
    let qy = (py - centre.1).abs() - half.1 + radius;
    let outside = (qx.max(0.0).powi(2) + qy.max(0.0).powi(2)).sqrt();
    outside + qx.max(qy).min(0.0) - radius
}

fn segment_distance(px: f32, py: f32, a: (f32, f32), b: (f32, f32)) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (((px - a.0) * dx + (py - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Signed distance to a triangle (negative inside)
fn triangle_distance(px: f32, py: f32, tri: [(f32, f32); 3]) -> f32 {
    let edge = |a: (f32, f32), b: (f32, f32)| (b.0 - a.0) * (py - a.1) - (b.1 - a.1) * (px - a.0);
    let signs = [edge(tri[0], tri[1]), edge(tri[1], tri[2]), edge(tri[2], tri[0])];
    let inside = signs.iter().all(|s| *s >= 0.0) || signs.iter().all(|s| *s <= 0.0);

    let distance = segment_distance(px, py, tri[0], tri[1])
        .min(segment_distance(px, py, tri[1], tri[2]))
        .min(segment_distance(px, py, tri[2], tri[0]));
    if inside {
        -distance
    } else {
        distance
    }
}

/// Rasterise the empty bubble (white body, dark outline, tail bottom-left) with
/// anti-aliased edges on a transparent image
pub fn draw_shape(layout: &BubbleLayout) -> RgbaImage {
    let width = layout.width;
    let body = layout.body_height as f32;
    let inset = STROKE_WIDTH / 2.0;
    let centre = (width as f32 / 2.0, body / 2.0);
    let half = (width as f32 / 2.0 - inset, body / 2.0 - inset);
    let radius = CORNER_RADIUS.min(half.0).min(half.1).max(0.0);

    let tail_x = (width as f32 * TAIL_ANCHOR).round();
    let tail = [
        (tail_x, body - STROKE_WIDTH),
        (tail_x + 20.0, body + TAIL_HEIGHT as f32 - STROKE_WIDTH),
        (tail_x + 10.0, body - STROKE_WIDTH - 4.0),
    ];

    RgbaImage::from_fn(width, layout.height(), |x, y| {
        let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
        let distance = rounded_rect_distance(px, py, centre, half, radius).min(triangle_distance(px, py, tail));

        let coverage = (0.5 - (distance - inset)).clamp(0.0, 1.0);
        if coverage <= 0.0 {
            return Rgba([0, 0, 0, 0]);
        }
        // 0 on the outline, 1 once inside it
        let fill_share = (-distance - inset + 0.5).clamp(0.0, 1.0);
        let mix = |c: usize| (STROKE[c] as f32 + (FILL[c] as f32 - STROKE[c] as f32) * fill_share).round() as u8;
        Rgba([mix(0), mix(1), mix(2), (coverage * 255.0).round() as u8])
    })
}
