//! Vision analysis of reference images into fixed per-kind schemas.

use anyhow::Result;
use folio_contracts::analysis::{AnalysisKind, StructuredAnalysis};
use folio_contracts::data_url::DataUrl;
use folio_contracts::error::FolioError;
use serde_json::{json, Map, Value};

use crate::model::{GenerativeModel, JsonRequest, Part};
use crate::truncate_text;

/// A validated analysis plus its flattened text rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome<A> {
    pub description: String,
    pub analysis: A,
}

/// Analyses `image` as `A::KIND`.
///
/// Any transport failure, schema mismatch or blank required field is
/// reported as [`FolioError::Analysis`] for that kind.
pub fn analyze<A, M>(model: &M, image: &DataUrl) -> Result<AnalysisOutcome<A>>
where
    A: StructuredAnalysis,
    M: GenerativeModel + ?Sized,
{
    let kind = A::KIND;
    let failure = |message: String| FolioError::Analysis { kind, message };

    let request = JsonRequest {
        parts: vec![Part::text(instruction(kind)), Part::Image(image.clone())],
        schema: response_schema(kind),
    };
    let raw = model
        .generate_json(&request)
        .map_err(|err| failure(format!("{err:#}")))?;
    let analysis: A = serde_json::from_value(raw.clone()).map_err(|err| {
        failure(format!(
            "response does not match the {} schema ({err}): {}",
            kind.label(),
            truncate_text(&raw.to_string(), 200)
        ))
    })?;
    analysis.validate().map_err(failure)?;

    tracing::debug!(kind = kind.label(), "analysis validated");
    Ok(AnalysisOutcome {
        description: analysis.legacy_description(),
        analysis,
    })
}

pub fn instruction(kind: AnalysisKind) -> &'static str {
    match kind {
        AnalysisKind::Character => {
            "You are a character designer preparing a model sheet. Study the character in this \
             reference image and describe exactly what is visible so an illustrator can redraw \
             the same person in new scenes. Cover the face (shape, apparent age, skin tone, eye \
             colour, eye shape and size, nose, mouth, distinctive marks), the hair (colour, \
             length, style, parting, texture, accessories), the body (build, height, posture), \
             the outfit (upper body, lower body, accessories, colours, overall style) and the \
             overall vibe. Be concrete and specific: name exact colours and materials. Do not \
             invent details that are not visible; write \"not visible\" instead."
        }
        AnalysisKind::Background => {
            "You are a location scout documenting a setting for an illustrated book. Study this \
             background reference image and describe the location (type, setting, architecture), \
             the lighting (sources, quality, time of day, mood), the colours (dominant colours, \
             accent colours, overall palette), the notable objects (what each is, a short \
             description and how prominent it is) and the atmosphere. Describe only what is \
             visible so the place can be redrawn consistently from other angles."
        }
        AnalysisKind::ArtStyle => {
            "You are an art director. Study this image purely as an example of artistic \
             technique. Describe the medium, the technique (rendering, line work, edge quality), \
             the colour application (style, saturation, blending), the shading and lighting \
             (shading style, contrast, lighting type), the style genre, the mood and any \
             distinctive features. Describe HOW the image is made, never WHAT it depicts: do not \
             mention the subject, its hair, clothing or any character trait."
        }
    }
}

fn string() -> Value {
    json!({ "type": "STRING" })
}

fn strings() -> Value {
    json!({ "type": "ARRAY", "items": string() })
}

fn strings_at_least_one() -> Value {
    json!({ "type": "ARRAY", "items": string(), "minItems": 1 })
}

fn object(properties: Vec<(&str, Value)>, optional: &[&str]) -> Value {
    let required = properties
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !optional.contains(name))
        .map(|name| Value::String(name.to_string()))
        .collect::<Vec<Value>>();
    let properties = properties
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect::<Map<String, Value>>();
    json!({
        "type": "OBJECT",
        "properties": properties,
        "required": required,
    })
}

/// Gemini response schema for one analysis kind.
pub fn response_schema(kind: AnalysisKind) -> Value {
    match kind {
        AnalysisKind::Character => object(
            vec![
                (
                    "face",
                    object(
                        vec![
                            ("shape", string()),
                            ("age", string()),
                            ("skinTone", string()),
                            (
                                "eyes",
                                object(
                                    vec![("color", string()), ("shape", string()), ("size", string())],
                                    &[],
                                ),
                            ),
                            ("nose", string()),
                            ("mouth", string()),
                            ("distinctiveMarks", strings()),
                        ],
                        &["distinctiveMarks"],
                    ),
                ),
                (
                    "hair",
                    object(
                        vec![
                            ("color", string()),
                            ("length", string()),
                            ("style", string()),
                            ("parting", string()),
                            ("texture", string()),
                            ("accessories", strings()),
                        ],
                        &["accessories"],
                    ),
                ),
                (
                    "body",
                    object(
                        vec![("build", string()), ("height", string()), ("posture", string())],
                        &[],
                    ),
                ),
                (
                    "outfit",
                    object(
                        vec![
                            ("upperBody", string()),
                            ("lowerBody", string()),
                            ("accessories", strings()),
                            ("colors", strings()),
                            ("style", string()),
                        ],
                        &[],
                    ),
                ),
                ("overallVibe", string()),
            ],
            &[],
        ),
        AnalysisKind::Background => object(
            vec![
                (
                    "location",
                    object(
                        vec![
                            ("type", string()),
                            ("setting", string()),
                            ("architecture", string()),
                        ],
                        &[],
                    ),
                ),
                (
                    "lighting",
                    object(
                        vec![
                            ("source", strings_at_least_one()),
                            ("quality", string()),
                            ("timeOfDay", string()),
                            ("mood", string()),
                        ],
                        &[],
                    ),
                ),
                (
                    "colors",
                    object(
                        vec![
                            ("dominant", strings_at_least_one()),
                            ("accents", strings()),
                            ("palette", string()),
                        ],
                        &[],
                    ),
                ),
                (
                    "objects",
                    json!({
                        "type": "ARRAY",
                        "items": object(
                            vec![
                                ("item", string()),
                                ("description", string()),
                                ("prominence", string()),
                            ],
                            &[],
                        ),
                    }),
                ),
                ("atmosphere", string()),
            ],
            &[],
        ),
        AnalysisKind::ArtStyle => object(
            vec![
                ("medium", string()),
                (
                    "technique",
                    object(
                        vec![
                            ("rendering", string()),
                            ("lineWork", string()),
                            ("edgeQuality", string()),
                        ],
                        &[],
                    ),
                ),
                (
                    "colorApplication",
                    object(
                        vec![
                            ("style", string()),
                            ("saturation", string()),
                            ("blending", string()),
                        ],
                        &[],
                    ),
                ),
                (
                    "shadingAndLighting",
                    object(
                        vec![
                            ("shadingStyle", string()),
                            ("contrast", string()),
                            ("lightingType", string()),
                        ],
                        &[],
                    ),
                ),
                ("styleGenre", string()),
                ("mood", string()),
                ("distinctiveFeatures", strings()),
            ],
            &[],
        ),
    }
}
