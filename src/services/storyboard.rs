//! Storyboard scripts for comic generation: prompts for the language model and
//! a two-stage parse of its reply (strict, then one repair call, then a fixed
//! fallback).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, warn};

use crate::core::errors::JobResult;

const DEFAULT_STYLE: &str = "comic book style art";
const QUALITY_SUFFIX: &str =
    "hand-drawn, color, clean line art, consistent characters, high resolution, best quality";
const DEFAULT_SPEAKER: &str = "Narrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Surprised,
    #[default]
    Neutral,
}

impl Emotion {
    /// Unknown labels become `Neutral`
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "happy" => Emotion::Happy,
            "sad" => Emotion::Sad,
            "angry" => Emotion::Angry,
            "surprised" => Emotion::Surprised,
            _ => Emotion::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPanel {
    pub id: u64,
    /// Scene description in the user's language
    pub description: String,
    /// Short English description handed to the image model
    pub description_en: String,
    pub dialogue: String,
    pub speaker: String,
    pub emotion: Emotion,
}

/// How the storyboard was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryboardSource {
    Strict,
    Repaired,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Storyboard {
    pub panels: Vec<StoryPanel>,
    pub source: StoryboardSource,
}

/// Prompt asking the language model for a storyboard of `pages × panels_per_page` panels
pub fn script_prompt(user_prompt: &str, pages: usize, panels_per_page: usize) -> String {
    let total = pages * panels_per_page;
    format!(
        r#"You are a professional comic writer. Turn the user's story into a detailed storyboard in JSON.

REQUIREMENTS:
- Create {total} panels ({pages} pages x {panels_per_page} panels per page)
- Every panel needs: id, description_vi (scene description in the user's language), description_en (short English description for the illustrator), dialogue (natural, at most 50 characters), speaker (character name), emotion (happy|sad|angry|surprised|neutral)
- description_en must state the characters, setting, action, lighting and camera angle

JSON FORMAT:
{{
  "story_id": "unique-story-id",
  "panels": [
    {{
      "id": 1,
      "description_vi": "Scene description (1-2 sentences)",
      "description_en": "English visual description for image generation",
      "dialogue": "Short line of dialogue",
      "speaker": "Character name",
      "emotion": "happy"
    }}
  ]
}}

USER STORY:
{user_prompt}

Return the complete storyboard JSON with {total} panels:"#
    )
}

/// Prompt asking the language model to turn `raw` into valid JSON
pub fn repair_prompt(raw: &str) -> String {
    format!(
        "Convert the following into valid JSON that keeps the same schema, without markdown:\n{}\n\n\
         Rules:\n- Return only JSON, no explanation.\n- Keep the meaning, fix only the JSON syntax.",
        raw
    )
}

/// Prompt for the image model: all pages side by side, panel by panel
pub fn image_prompt(panels: &[StoryPanel], pages: usize, panels_per_page: usize, style: Option<&str>) -> String {
    let style = style.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(DEFAULT_STYLE);

    let script = panels
        .chunks(panels_per_page.max(1))
        .take(pages)
        .enumerate()
        .map(|(page, chunk)| {
            let descriptions = chunk
                .iter()
                .enumerate()
                .map(|(i, panel)| format!("**Panel {}** *Description:* {}", i + 1, panel.description_en))
                .collect::<Vec<_>>()
                .join("  \n");
            format!("### Page {}\n{}", page + 1, descriptions)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let layout = match pages {
        1 => format!("single comic book page with {} panels arranged in a grid layout", panels_per_page),
        2 => format!(
            "two comic book pages displayed side by side horizontally, each page has {} panels in grid layout",
            panels_per_page
        ),
        n => format!(
            "{} comic book pages arranged horizontally in a row, each page contains {} panels in grid layout",
            n, panels_per_page
        ),
    };

    format!("{} of {}. {}. {}", style, layout, script, QUALITY_SUFFIX)
}

/// Find a JSON object in model text: the whole reply, else the outermost `{…}`
pub fn extract_json(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// The `panels` array of a storyboard object
fn panels_of(value: &Value) -> Option<&Vec<Value>> {
    value.get("panels").and_then(Value::as_array)
}

fn text_field(panel: &Value, name: &str) -> Option<String> {
    panel
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Exactly `total` panels: missing panels and fields get defaults, extra panels are dropped
pub fn normalize_panels(raw: &[Value], total: usize, fallback_prompt: &str) -> Vec<StoryPanel> {
    let topic = match fallback_prompt.trim() {
        "" => "Comic",
        prompt => prompt,
    };

    (0..total)
        .map(|i| {
            let panel = raw.get(i).unwrap_or(&Value::Null);
            StoryPanel {
                id: panel.get("id").and_then(Value::as_u64).unwrap_or(i as u64 + 1),
                description: text_field(panel, "description_vi")
                    .or_else(|| text_field(panel, "description"))
                    .unwrap_or_else(|| format!("Scene {}: {}", i + 1, topic)),
                description_en: text_field(panel, "description_en")
                    .unwrap_or_else(|| format!("Scene {} of the comic story", i + 1)),
                dialogue: text_field(panel, "dialogue").unwrap_or_default(),
                speaker: text_field(panel, "speaker").unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
                emotion: panel
                    .get("emotion")
                    .and_then(Value::as_str)
                    .map(Emotion::from_label)
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Parse a storyboard reply: strict parse, then at most one `repair` call on
/// the raw text, then the default storyboard. Never fails.
pub async fn parse_with_repair<F, Fut>(raw: &str, total: usize, fallback_prompt: &str, repair: F) -> Storyboard
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = JobResult<String>>,
{
    if let Some(parsed) = extract_json(raw) {
        if let Some(panels) = panels_of(&parsed) {
            return Storyboard {
                panels: normalize_panels(panels, total, fallback_prompt),
                source: StoryboardSource::Strict,
            };
        }
    }
    debug!("Storyboard reply is not valid JSON, attempting one repair");

    match repair(repair_prompt(raw)).await {
        Ok(fixed) => {
            if let Some(panels) = extract_json(&fixed).as_ref().and_then(panels_of) {
                return Storyboard {
                    panels: normalize_panels(panels, total, fallback_prompt),
                    source: StoryboardSource::Repaired,
                };
            }
            warn!("Repaired storyboard is still invalid, using fallback");
        }
        Err(e) => warn!("Storyboard repair failed ({}), using fallback", e),
    }

    Storyboard {
        panels: normalize_panels(&[], total, fallback_prompt),
        source: StoryboardSource::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::JobError;
    use serde_json::json;
    use std::cell::Cell;

    const GOOD: &str = r#"{"story_id":"s","panels":[{"id":1,"description_en":"A cat on a roof","dialogue":"Meow?","speaker":"Tom","emotion":"SURPRISED"}]}"#;

    #[test]
    fn test_extract_json_from_markdown() {
        assert!(extract_json(GOOD).is_some());
        let wrapped = format!("Sure! Here it is:\n```json\n{}\n```", GOOD);
        assert_eq!(extract_json(&wrapped), extract_json(GOOD));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("[1, 2]"), None);
        assert_eq!(extract_json(""), None);
    }

    #[test]
    fn test_normalize_pads_and_clamps() {
        let raw = vec![
            json!({"id": 7, "description_en": "Rain", "dialogue": "  ", "emotion": "furious"}),
            json!("not an object"),
        ];
        let panels = normalize_panels(&raw, 3, "A rainy day");
        assert_eq!(panels.len(), 3);

        assert_eq!(panels[0].id, 7);
        assert_eq!(panels[0].description_en, "Rain");
        assert_eq!(panels[0].dialogue, "");
        assert_eq!(panels[0].speaker, "Narrator");
        assert_eq!(panels[0].emotion, Emotion::Neutral);

        assert_eq!(panels[1].id, 2);
        assert_eq!(panels[2].description, "Scene 3: A rainy day");
        assert_eq!(panels[2].description_en, "Scene 3 of the comic story");

        // extra panels are dropped
        let raw = vec![json!({}); 5];
        assert_eq!(normalize_panels(&raw, 2, "").len(), 2);
    }

    #[tokio::test]
    async fn test_strict_parse_skips_repair() {
        let calls = Cell::new(0);
        let board = parse_with_repair(GOOD, 2, "cats", |_| {
            calls.set(calls.get() + 1);
            async { Ok(String::new()) }
        })
        .await;

        assert_eq!(calls.get(), 0);
        assert_eq!(board.source, StoryboardSource::Strict);
        assert_eq!(board.panels[0].speaker, "Tom");
        assert_eq!(board.panels[0].emotion, Emotion::Surprised);
        assert_eq!(board.panels.len(), 2);
    }

    #[tokio::test]
    async fn test_single_repair_then_fallback() {
        let repaired = parse_with_repair("{panels: oops", 1, "cats", |prompt| async move {
            assert!(prompt.contains("{panels: oops"));
            Ok(GOOD.to_string())
        })
        .await;
        assert_eq!(repaired.source, StoryboardSource::Repaired);
        assert_eq!(repaired.panels[0].description_en, "A cat on a roof");

        let still_bad = parse_with_repair("garbage", 2, "cats", |_| async { Ok("more garbage".to_string()) }).await;
        assert_eq!(still_bad.source, StoryboardSource::Fallback);
        assert_eq!(still_bad.panels.len(), 2);

        let failed = parse_with_repair("garbage", 1, "cats", |_| async {
            Err(JobError::Validation("model unavailable".to_string()))
        })
        .await;
        assert_eq!(failed.source, StoryboardSource::Fallback);
        assert_eq!(failed.panels[0].description, "Scene 1: cats");
    }

    #[test]
    fn test_image_prompt_lists_pages() {
        let panels = normalize_panels(&[], 4, "x");
        let prompt = image_prompt(&panels, 2, 2, None);
        assert!(prompt.starts_with("comic book style art of two comic book pages"));
        assert!(prompt.contains("### Page 1\n**Panel 1** *Description:* Scene 1 of the comic story"));
        assert!(prompt.contains("### Page 2\n**Panel 1** *Description:* Scene 3 of the comic story"));

        let styled = image_prompt(&panels[..1], 1, 1, Some("manga"));
        assert!(styled.starts_with("manga of single comic book page with 1 panels"));
    }
}
