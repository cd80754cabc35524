use crate::core::errors::{RenderingError, RenderingResult};
use crate::core::types::Rect;

pub const PAGE_WIDTH: u32 = 1080;
pub const PAGE_HEIGHT: u32 = 1620;
/// Space between cells and around the page edge
pub const GAP: u32 = 24;
/// Share of the page height given to the hero row in the 2- and 3-panel layouts
const HERO_RATIO: f64 = 0.55;

/// Split `total` pixels into `parts` spans; the last span absorbs the remainder
fn split_span(total: u32, parts: u32) -> Vec<u32> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let mut spans = vec![base; parts as usize];
    if let Some(last) = spans.last_mut() {
        *last += total - base * parts;
    }
    spans
}

/// Offsets of consecutive spans separated by `GAP`, starting at `GAP`
fn offsets(spans: &[u32]) -> Vec<u32> {
    spans
        .iter()
        .scan(GAP, |pos, span| {
            let start = *pos;
            *pos += span + GAP;
            Some(start)
        })
        .collect()
}

fn hero_height() -> u32 {
    (PAGE_HEIGHT as f64 * HERO_RATIO).round() as u32 - GAP
}

/// Pixels left for `parts` cells once the gaps are taken, if every cell keeps at least one
fn inner_span(total: u32, parts: usize) -> Option<u32> {
    let parts = u32::try_from(parts).ok()?;
    let gaps = GAP.checked_mul(parts.checked_add(1)?)?;
    total.checked_sub(gaps).filter(|inner| *inner >= parts)
}

/// Row/column grid of `count` cells on the page, filled row by row
fn grid(count: usize, rows: usize, cols: usize) -> RenderingResult<Vec<Rect>> {
    let too_many = || RenderingError::TooManyPanels { count };
    let inner_width = inner_span(PAGE_WIDTH, cols).ok_or_else(too_many)?;
    let inner_height = inner_span(PAGE_HEIGHT, rows).ok_or_else(too_many)?;

    let widths = split_span(inner_width, cols as u32);
    let heights = split_span(inner_height, rows as u32);
    let xs = offsets(&widths);
    let ys = offsets(&heights);

    Ok((0..count)
        .map(|i| {
            let (row, col) = (i / cols, i % cols);
            Rect::new(xs[col], ys[row], widths[col], heights[row])
        })
        .collect())
}

/// Panel rectangles for `count` panels on a `PAGE_WIDTH × PAGE_HEIGHT` page.
///
/// 1 to 4 panels get fixed arrangements (2 and 3 lead with a wide hero panel);
/// larger counts use a grid with `rows = ceil(sqrt(n))` and `cols = ceil(n / rows)`.
/// Counts whose grid would leave a cell narrower or shorter than one pixel
/// (anything above 1806) are rejected with `TooManyPanels`.
pub fn layout(count: usize) -> RenderingResult<Vec<Rect>> {
    let full_width = PAGE_WIDTH - GAP * 2;

    let rects = match count {
        0 => Vec::new(),
        1 => vec![Rect::new(GAP, GAP, full_width, PAGE_HEIGHT - GAP * 2)],
        2 => {
            let top = hero_height();
            let bottom = PAGE_HEIGHT - GAP * 3 - top;
            vec![
                Rect::new(GAP, GAP, full_width, top),
                Rect::new(GAP, GAP * 2 + top, full_width, bottom),
            ]
        }
        3 => {
            let top = hero_height();
            let bottom = PAGE_HEIGHT - GAP * 3 - top;
            let widths = split_span(PAGE_WIDTH - GAP * 3, 2);
            let xs = offsets(&widths);
            vec![
                Rect::new(GAP, GAP, full_width, top),
                Rect::new(xs[0], GAP * 2 + top, widths[0], bottom),
                Rect::new(xs[1], GAP * 2 + top, widths[1], bottom),
            ]
        }
        4 => grid(4, 2, 2)?,
        n => {
            let rows = (n as f64).sqrt().ceil() as usize;
            let cols = n.div_ceil(rows);
            grid(n, rows, cols)?
        }
    };
    Ok(rects)
}

/// Cells of a generated strip: `pages` pages side by side, each an even grid
/// (two columns up to four panels per page, `ceil(sqrt(n))` beyond)
pub fn strip_cells(width: u32, height: u32, pages: usize, per_page: usize) -> Vec<Rect> {
    if pages == 0 || per_page == 0 {
        return Vec::new();
    }
    let cols = if per_page <= 4 {
        2
    } else {
        (per_page as f64).sqrt().ceil() as usize
    };
    let rows = per_page.div_ceil(cols);

    let page_width = width / pages as u32;
    let cell_width = page_width / cols as u32;
    let cell_height = height / rows as u32;

    (0..pages * per_page)
        .map(|i| {
            let (page, slot) = (i / per_page, i % per_page);
            let (row, col) = (slot / cols, slot % cols);
            Rect::new(
                page as u32 * page_width + col as u32 * cell_width,
                row as u32 * cell_height,
                cell_width,
                cell_height,
            )
        })
        .collect()
}

/// Greedy word wrap by character count.
///
/// Words are never split: a word longer than `max_chars` sits alone on its line.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if current_len == 0 {
            current.push_str(word);
            current_len = word_len;
        } else if current_len + 1 + word_len <= max_chars {
            current.push(' ');
            current.push_str(word);
            current_len += 1 + word_len;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
        }
    }

    if current_len > 0 {
        lines.push(current);
    }
    lines
}
