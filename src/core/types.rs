// Shared domain types for the studio service

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::errors::CompositingError;

/// Tag partitioning concurrency capacity by expected cost of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    /// Fast restoration models (upscalers, face restoration, background removal)
    Light,
    /// Diffusion-style models (relighting, restyling)
    Heavy,
    /// Multi-call generation flows (storyboard + page generation)
    Batch,
}

impl WorkloadClass {
    pub const ALL: [WorkloadClass; 3] = [WorkloadClass::Light, WorkloadClass::Heavy, WorkloadClass::Batch];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Light => "light",
            WorkloadClass::Heavy => "heavy",
            WorkloadClass::Batch => "batch",
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }
}

/// A panel placed on a page: its rectangle, artwork and optional dialogue
#[derive(Debug, Clone)]
pub struct Panel {
    pub rect: Rect,
    pub image: RgbaImage,
    pub dialogue: String,
    pub speaker: Option<String>,
}

impl Panel {
    /// Text shown in the panel's bubble, `None` when there is no dialogue
    pub fn bubble_text(&self) -> Option<String> {
        bubble_text(&self.dialogue, self.speaker.as_deref())
    }
}

/// Format `speaker: dialogue`, or the dialogue alone when the speaker is blank
pub fn bubble_text(dialogue: &str, speaker: Option<&str>) -> Option<String> {
    let dialogue = dialogue.trim();
    if dialogue.is_empty() {
        return None;
    }
    match speaker.map(str::trim).filter(|s| !s.is_empty()) {
        Some(speaker) => Some(format!("{}: {}", speaker, dialogue)),
        None => Some(dialogue.to_string()),
    }
}

/// How a background is resized to the foreground dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Scale to cover, crop the excess
    #[default]
    Cover,
    /// Scale to fit inside, letterbox with black
    Contain,
    /// Stretch to the exact size
    Fill,
    /// Same as contain; the output is always the full target size
    Inside,
    /// Same as cover; the output is always the full target size
    Outside,
}

impl FromStr for FitMode {
    type Err = CompositingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cover" => Ok(FitMode::Cover),
            "contain" => Ok(FitMode::Contain),
            "fill" => Ok(FitMode::Fill),
            "inside" => Ok(FitMode::Inside),
            "outside" => Ok(FitMode::Outside),
            other => Err(CompositingError::UnknownFit(other.to_string())),
        }
    }
}

/// Anchor used when cropping (cover) or letterboxing (contain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    #[default]
    Centre,
    Top,
    Bottom,
    Left,
    Right,
    LeftTop,
    RightTop,
    LeftBottom,
    RightBottom,
}

impl Position {
    /// Horizontal and vertical anchor as fractions of the slack (0.0, 0.5 or 1.0)
    fn anchors(&self) -> (f32, f32) {
        match self {
            Position::Centre => (0.5, 0.5),
            Position::Top => (0.5, 0.0),
            Position::Bottom => (0.5, 1.0),
            Position::Left => (0.0, 0.5),
            Position::Right => (1.0, 0.5),
            Position::LeftTop => (0.0, 0.0),
            Position::RightTop => (1.0, 0.0),
            Position::LeftBottom => (0.0, 1.0),
            Position::RightBottom => (1.0, 1.0),
        }
    }

    /// Offset of the anchored box inside a container with the given slack
    pub fn offset(&self, slack_x: u32, slack_y: u32) -> (u32, u32) {
        let (ax, ay) = self.anchors();
        (
            (slack_x as f32 * ax).round() as u32,
            (slack_y as f32 * ay).round() as u32,
        )
    }
}

impl FromStr for Position {
    type Err = CompositingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', '_'], " ");
        let mut words: Vec<&str> = normalized.split_whitespace().collect();
        words.sort_unstable();

        let position = match words.as_slice() {
            [] | ["centre"] | ["center"] => Position::Centre,
            ["top"] | ["north"] => Position::Top,
            ["bottom"] | ["south"] => Position::Bottom,
            ["left"] | ["west"] => Position::Left,
            ["right"] | ["east"] => Position::Right,
            ["left", "top"] | ["northwest"] => Position::LeftTop,
            ["right", "top"] | ["northeast"] => Position::RightTop,
            ["bottom", "left"] | ["southwest"] => Position::LeftBottom,
            ["bottom", "right"] | ["southeast"] => Position::RightBottom,
            _ => return Err(CompositingError::UnknownPosition(s.to_string())),
        };
        Ok(position)
    }
}

/// Options for a background replacement request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOptions {
    pub fit: FitMode,
    pub position: Position,
    pub feather_px: u32,
    pub add_shadow: bool,
    /// Lifetime of the presigned delivery URL, in seconds. Not part of the
    /// cache key: hits are re-signed with the caller's lifetime.
    #[serde(skip_serializing)]
    pub sign_ttl_secs: u64,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        Self {
            fit: FitMode::Cover,
            position: Position::Centre,
            feather_px: 1,
            add_shadow: true,
            sign_ttl_secs: 3600,
        }
    }
}

/// Panel dialogue supplied with a comic page request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelScript {
    #[serde(default)]
    pub dialogue: String,
    #[serde(default)]
    pub speaker: Option<String>,
}

/// A stored result handed back to the caller; this is the cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredImage {
    pub key: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presigned_url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
}

/// Response wrapper telling the caller whether the cache served the result
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    #[serde(flatten)]
    pub image: DeliveredImage,
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        let c = Rect::new(5, 5, 10, 10);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert_eq!(a.area(), 100);
    }

    #[test]
    fn test_position_parsing() {
        assert_eq!("centre".parse::<Position>().unwrap(), Position::Centre);
        assert_eq!("center".parse::<Position>().unwrap(), Position::Centre);
        assert_eq!("top right".parse::<Position>().unwrap(), Position::RightTop);
        assert_eq!("right-top".parse::<Position>().unwrap(), Position::RightTop);
        assert!("middle-earth".parse::<Position>().is_err());
    }

    #[test]
    fn test_position_offset() {
        assert_eq!(Position::Centre.offset(100, 50), (50, 25));
        assert_eq!(Position::RightBottom.offset(100, 50), (100, 50));
        assert_eq!(Position::LeftTop.offset(100, 50), (0, 0));
    }

    #[test]
    fn test_fit_parsing() {
        assert_eq!("COVER".parse::<FitMode>().unwrap(), FitMode::Cover);
        assert!("stretch".parse::<FitMode>().is_err());
    }

    #[test]
    fn test_bubble_text() {
        assert_eq!(bubble_text("Hi", Some("Mai")).as_deref(), Some("Mai: Hi"));
        assert_eq!(bubble_text("Hi", Some("  ")).as_deref(), Some("Hi"));
        assert_eq!(bubble_text("   ", Some("Mai")), None);
    }
}
