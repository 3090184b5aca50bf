//! Splits novel prose into illustration-worthy scenes and names the story.

use anyhow::Result;
use folio_contracts::error::FolioError;
use folio_contracts::story::StructuredSceneDescription;
use serde_json::{json, Value};

use crate::model::{GenerativeModel, JsonRequest, Part, TextRequest};

pub const MIN_SCENES: usize = 3;
pub const MAX_SCENES: usize = 8;
pub const FALLBACK_TITLE: &str = "Untitled Story";
const TITLE_EXCERPT_CHARS: usize = 1000;

const SCENE_GUIDANCE: &str = "You are a storyboard director choosing which moments of a novel \
to illustrate. Read the text and pick between 3 and 8 scenes.\n\
Rules:\n\
1. Prefer visual action and emotional turning points over pure dialogue.\n\
2. Spread the scenes across the whole arc: introduction, development, climax and resolution.\n\
3. Keep the scenes in story order.\n\
4. Describe each scene as one vivid paragraph that names who is present and what they are doing, \
and includes the setting, the lighting and the mood.\n\
5. Use the characters' names exactly as the text spells them.";

fn validated_text(novel_text: &str) -> Result<&str, FolioError> {
    let trimmed = novel_text.trim();
    if trimmed.is_empty() {
        return Err(FolioError::validation("novel text is empty"));
    }
    Ok(trimmed)
}

/// Scene paragraphs in story order.
pub fn segment<M: GenerativeModel + ?Sized>(model: &M, novel_text: &str) -> Result<Vec<String>> {
    let text = validated_text(novel_text)?;
    let request = JsonRequest {
        parts: vec![
            Part::text(SCENE_GUIDANCE),
            Part::text(format!("Novel text:\n{text}")),
        ],
        schema: json!({
            "type": "OBJECT",
            "properties": {
                "scenes": {
                    "type": "ARRAY",
                    "items": { "type": "STRING" },
                    "minItems": MIN_SCENES,
                    "maxItems": MAX_SCENES,
                }
            },
            "required": ["scenes"],
        }),
    };
    let response = model
        .generate_json(&request)
        .map_err(|err| FolioError::Segmentation(format!("{err:#}")))?;
    let scenes = scene_entries(&response)?
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|scene| !scene.is_empty())
        .map(str::to_string)
        .collect::<Vec<String>>();
    Ok(enforce_count(scenes)?)
}

/// Scenes with a director-style breakdown for each.
pub fn segment_structured<M: GenerativeModel + ?Sized>(
    model: &M,
    novel_text: &str,
) -> Result<Vec<StructuredSceneDescription>> {
    let text = validated_text(novel_text)?;
    let request = JsonRequest {
        parts: vec![
            Part::text(format!(
                "{SCENE_GUIDANCE}\n6. For each scene also list the characters present, name the \
                 location in a few words (reuse the same wording when scenes share a place), give \
                 the mood, and quote the sentence of the novel the scene comes from."
            )),
            Part::text(format!("Novel text:\n{text}")),
        ],
        schema: json!({
            "type": "OBJECT",
            "properties": {
                "scenes": {
                    "type": "ARRAY",
                    "minItems": MIN_SCENES,
                    "maxItems": MAX_SCENES,
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "summary": { "type": "STRING" },
                            "characters": { "type": "ARRAY", "items": { "type": "STRING" } },
                            "location": { "type": "STRING" },
                            "mood": { "type": "STRING" },
                            "sourceExcerpt": { "type": "STRING" },
                        },
                        "required": ["summary", "characters", "location", "mood"],
                    },
                }
            },
            "required": ["scenes"],
        }),
    };
    let response = model
        .generate_json(&request)
        .map_err(|err| FolioError::Segmentation(format!("{err:#}")))?;

    let mut scenes = Vec::new();
    for (idx, entry) in scene_entries(&response)?.iter().enumerate() {
        let mut scene: StructuredSceneDescription = serde_json::from_value(entry.clone())
            .map_err(|err| FolioError::Segmentation(format!("scene {} is malformed: {err}", idx + 1)))?;
        scene.summary = scene.summary.trim().to_string();
        if scene.summary.is_empty() {
            tracing::warn!(scene = idx + 1, "dropping scene without a summary");
            continue;
        }
        scene.location = non_blank(scene.location);
        scene.mood = non_blank(scene.mood);
        scene.source_excerpt = non_blank(scene.source_excerpt);
        scenes.push(scene);
    }
    Ok(enforce_count(scenes)?)
}

fn scene_entries(response: &Value) -> Result<&Vec<Value>, FolioError> {
    response
        .get("scenes")
        .and_then(Value::as_array)
        .or_else(|| response.as_array())
        .ok_or_else(|| FolioError::Segmentation("response has no scenes array".to_string()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn enforce_count<T>(mut scenes: Vec<T>) -> Result<Vec<T>, FolioError> {
    if scenes.is_empty() {
        return Err(FolioError::Segmentation(
            "model returned no scenes".to_string(),
        ));
    }
    if scenes.len() > MAX_SCENES {
        tracing::warn!(returned = scenes.len(), kept = MAX_SCENES, "truncating scene list");
        scenes.truncate(MAX_SCENES);
    }
    if scenes.len() < MIN_SCENES {
        tracing::warn!(returned = scenes.len(), "fewer scenes than requested");
    }
    Ok(scenes)
}

/// A derived story title; `fallback_reason` is set when the placeholder was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title {
    pub text: String,
    pub fallback_reason: Option<String>,
}

/// Four-to-five word title from the opening of the novel. Never fails.
pub fn derive_title<M: GenerativeModel + ?Sized>(model: &M, novel_text: &str) -> Title {
    let excerpt = novel_text
        .trim()
        .chars()
        .take(TITLE_EXCERPT_CHARS)
        .collect::<String>();
    let fallback = |reason: String| {
        tracing::warn!(%reason, "using fallback title");
        Title {
            text: FALLBACK_TITLE.to_string(),
            fallback_reason: Some(reason),
        }
    };
    if excerpt.is_empty() {
        return fallback("novel text is empty".to_string());
    }

    let request = TextRequest {
        parts: vec![Part::text(format!(
            "Suggest a short, evocative title of 4 to 5 words for the story that begins with the \
             text below. Reply with the title only, without quotes or punctuation at the end.\n\n{excerpt}"
        ))],
    };
    match model.generate_text(&request) {
        Ok(raw) => match clean_title(&raw) {
            Some(text) => Title {
                text,
                fallback_reason: None,
            },
            None => fallback("model returned an empty title".to_string()),
        },
        Err(err) => fallback(format!("{err:#}")),
    }
}

fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line
        .trim_start_matches(['#', '*'])
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(['"', '\'', '*', '“', '”'])
        .trim_end_matches(['.', '!'])
        .trim();
    if line.is_empty() {
        return None;
    }
    Some(line.to_string())
}
