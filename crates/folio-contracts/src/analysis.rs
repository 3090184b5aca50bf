//! Structured descriptions of reference images.
//!
//! Each reference kind has its own record shape. A record is only accepted
//! once [`StructuredAnalysis::validate`] passes, and every record renders a
//! flattened "legacy" description with a fixed section order so display and
//! prompt fallbacks stay stable between runs.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Character,
    Background,
    ArtStyle,
}

impl AnalysisKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Background => "background",
            Self::ArtStyle => "art style",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub trait StructuredAnalysis: Serialize + DeserializeOwned + Clone + PartialEq {
    const KIND: AnalysisKind;

    /// Paths of required fields that are blank.
    fn missing_fields(&self) -> Vec<&'static str>;

    /// Labeled sections in display order.
    fn sections(&self) -> Vec<(&'static str, String)>;

    fn validate(&self) -> Result<(), String> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            return Ok(());
        }
        Err(format!("missing required fields: {}", missing.join(", ")))
    }

    fn legacy_description(&self) -> String {
        self.sections()
            .into_iter()
            .map(|(label, body)| format!("{label}: {}", single_line(&body)))
            .collect::<Vec<String>>()
            .join("\n")
    }
}

/// Model values may contain newlines; each section must stay on one line.
fn single_line(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Splits a legacy description back into `(label, body)` pairs.
///
/// Lines without a `label:` prefix are appended to the previous section.
pub fn legacy_sections(description: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.split_once(": ") {
            Some((label, body)) if !label.contains(',') && !label.is_empty() => {
                sections.push((label.to_string(), body.trim().to_string()));
            }
            _ => {
                if let Some((_, body)) = sections.last_mut() {
                    body.push(' ');
                    body.push_str(trimmed);
                } else {
                    sections.push((String::new(), trimmed.to_string()));
                }
            }
        }
    }
    sections
}

/// Renders parsed sections as a compact single-block display string.
pub fn display_sections(sections: &[(String, String)]) -> String {
    sections
        .iter()
        .map(|(label, body)| {
            if label.is_empty() {
                body.clone()
            } else {
                format!("{label}: {body}")
            }
        })
        .collect::<Vec<String>>()
        .join(" | ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eyes {
    pub color: String,
    pub shape: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Face {
    pub shape: String,
    pub age: String,
    pub skin_tone: String,
    pub eyes: Eyes,
    pub nose: String,
    pub mouth: String,
    #[serde(default)]
    pub distinctive_marks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hair {
    pub color: String,
    pub length: String,
    pub style: String,
    pub parting: String,
    pub texture: String,
    #[serde(default)]
    pub accessories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    pub build: String,
    pub height: String,
    pub posture: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outfit {
    pub upper_body: String,
    pub lower_body: String,
    pub accessories: Vec<String>,
    pub colors: Vec<String>,
    pub style: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterAnalysis {
    pub face: Face,
    pub hair: Hair,
    pub body: Body,
    pub outfit: Outfit,
    pub overall_vibe: String,
}

impl StructuredAnalysis for CharacterAnalysis {
    const KIND: AnalysisKind = AnalysisKind::Character;

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        require(&mut missing, "face.shape", &self.face.shape);
        require(&mut missing, "face.age", &self.face.age);
        require(&mut missing, "face.skinTone", &self.face.skin_tone);
        require(&mut missing, "face.eyes.color", &self.face.eyes.color);
        require(&mut missing, "face.eyes.shape", &self.face.eyes.shape);
        require(&mut missing, "face.eyes.size", &self.face.eyes.size);
        require(&mut missing, "face.nose", &self.face.nose);
        require(&mut missing, "face.mouth", &self.face.mouth);
        require(&mut missing, "hair.color", &self.hair.color);
        require(&mut missing, "hair.length", &self.hair.length);
        require(&mut missing, "hair.style", &self.hair.style);
        require(&mut missing, "hair.parting", &self.hair.parting);
        require(&mut missing, "hair.texture", &self.hair.texture);
        require(&mut missing, "body.build", &self.body.build);
        require(&mut missing, "body.height", &self.body.height);
        require(&mut missing, "body.posture", &self.body.posture);
        require(&mut missing, "outfit.upperBody", &self.outfit.upper_body);
        require(&mut missing, "outfit.lowerBody", &self.outfit.lower_body);
        require(&mut missing, "outfit.style", &self.outfit.style);
        require(&mut missing, "overallVibe", &self.overall_vibe);
        missing
    }

    fn sections(&self) -> Vec<(&'static str, String)> {
        let face = &self.face;
        let mut face_text = format!(
            "{} face, {}, {} skin; eyes {}, {}, {}; nose {}; mouth {}",
            face.shape,
            face.age,
            face.skin_tone,
            face.eyes.color,
            face.eyes.shape,
            face.eyes.size,
            face.nose,
            face.mouth
        );
        if !face.distinctive_marks.is_empty() {
            face_text.push_str(&format!("; marks {}", join_list(&face.distinctive_marks)));
        }

        let hair = &self.hair;
        let mut hair_text = format!(
            "{}, {}, {}, {} parting, {} texture",
            hair.color, hair.length, hair.style, hair.parting, hair.texture
        );
        if !hair.accessories.is_empty() {
            hair_text.push_str(&format!("; accessories {}", join_list(&hair.accessories)));
        }

        let outfit = &self.outfit;
        vec![
            ("Face", face_text),
            ("Hair", hair_text),
            (
                "Body",
                format!(
                    "{} build, {}, {} posture",
                    self.body.build, self.body.height, self.body.posture
                ),
            ),
            (
                "Outfit",
                format!(
                    "upper {}; lower {}; accessories {}; colors {}; style {}",
                    outfit.upper_body,
                    outfit.lower_body,
                    join_list(&outfit.accessories),
                    join_list(&outfit.colors),
                    outfit.style
                ),
            ),
            ("Overall vibe", self.overall_vibe.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(rename = "type")]
    pub kind: String,
    pub setting: String,
    pub architecture: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lighting {
    pub source: Vec<String>,
    pub quality: String,
    pub time_of_day: String,
    pub mood: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Palette {
    pub dominant: Vec<String>,
    pub accents: Vec<String>,
    pub palette: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneObject {
    pub item: String,
    pub description: String,
    pub prominence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundAnalysis {
    pub location: Location,
    pub lighting: Lighting,
    pub colors: Palette,
    pub objects: Vec<SceneObject>,
    pub atmosphere: String,
}

impl StructuredAnalysis for BackgroundAnalysis {
    const KIND: AnalysisKind = AnalysisKind::Background;

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        require(&mut missing, "location.type", &self.location.kind);
        require(&mut missing, "location.setting", &self.location.setting);
        require(
            &mut missing,
            "location.architecture",
            &self.location.architecture,
        );
        if self.lighting.source.iter().all(|item| item.trim().is_empty()) {
            missing.push("lighting.source");
        }
        require(&mut missing, "lighting.quality", &self.lighting.quality);
        require(&mut missing, "lighting.timeOfDay", &self.lighting.time_of_day);
        require(&mut missing, "lighting.mood", &self.lighting.mood);
        if self.colors.dominant.iter().all(|item| item.trim().is_empty()) {
            missing.push("colors.dominant");
        }
        require(&mut missing, "colors.palette", &self.colors.palette);
        if self
            .objects
            .iter()
            .any(|object| object.item.trim().is_empty())
        {
            missing.push("objects.item");
        }
        require(&mut missing, "atmosphere", &self.atmosphere);
        missing
    }

    fn sections(&self) -> Vec<(&'static str, String)> {
        let objects = if self.objects.is_empty() {
            "none".to_string()
        } else {
            self.objects
                .iter()
                .map(|object| {
                    format!(
                        "{} ({}, {})",
                        object.item, object.description, object.prominence
                    )
                })
                .collect::<Vec<String>>()
                .join("; ")
        };
        vec![
            (
                "Location",
                format!(
                    "{}; {}; {}",
                    self.location.kind, self.location.setting, self.location.architecture
                ),
            ),
            (
                "Lighting",
                format!(
                    "{} light, {}, {}, {}",
                    join_list(&self.lighting.source),
                    self.lighting.quality,
                    self.lighting.time_of_day,
                    self.lighting.mood
                ),
            ),
            (
                "Colors",
                format!(
                    "dominant {}; accents {}; palette {}",
                    join_list(&self.colors.dominant),
                    join_list(&self.colors.accents),
                    self.colors.palette
                ),
            ),
            ("Objects", objects),
            ("Atmosphere", self.atmosphere.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Technique {
    pub rendering: String,
    pub line_work: String,
    pub edge_quality: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorApplication {
    pub style: String,
    pub saturation: String,
    pub blending: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadingAndLighting {
    pub shading_style: String,
    pub contrast: String,
    pub lighting_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtStyleAnalysis {
    pub medium: String,
    pub technique: Technique,
    pub color_application: ColorApplication,
    pub shading_and_lighting: ShadingAndLighting,
    pub style_genre: String,
    pub mood: String,
    pub distinctive_features: Vec<String>,
}

impl StructuredAnalysis for ArtStyleAnalysis {
    const KIND: AnalysisKind = AnalysisKind::ArtStyle;

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        require(&mut missing, "medium", &self.medium);
        require(&mut missing, "technique.rendering", &self.technique.rendering);
        require(&mut missing, "technique.lineWork", &self.technique.line_work);
        require(
            &mut missing,
            "technique.edgeQuality",
            &self.technique.edge_quality,
        );
        require(
            &mut missing,
            "colorApplication.style",
            &self.color_application.style,
        );
        require(
            &mut missing,
            "colorApplication.saturation",
            &self.color_application.saturation,
        );
        require(
            &mut missing,
            "colorApplication.blending",
            &self.color_application.blending,
        );
        require(
            &mut missing,
            "shadingAndLighting.shadingStyle",
            &self.shading_and_lighting.shading_style,
        );
        require(
            &mut missing,
            "shadingAndLighting.contrast",
            &self.shading_and_lighting.contrast,
        );
        require(
            &mut missing,
            "shadingAndLighting.lightingType",
            &self.shading_and_lighting.lighting_type,
        );
        require(&mut missing, "styleGenre", &self.style_genre);
        require(&mut missing, "mood", &self.mood);
        missing
    }

    fn sections(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Medium", self.medium.clone()),
            (
                "Technique",
                format!(
                    "{} rendering, {} line work, {} edges",
                    self.technique.rendering,
                    self.technique.line_work,
                    self.technique.edge_quality
                ),
            ),
            (
                "Color application",
                format!(
                    "{}, {} saturation, {} blending",
                    self.color_application.style,
                    self.color_application.saturation,
                    self.color_application.blending
                ),
            ),
            (
                "Shading and lighting",
                format!(
                    "{} shading, {} contrast, {} lighting",
                    self.shading_and_lighting.shading_style,
                    self.shading_and_lighting.contrast,
                    self.shading_and_lighting.lighting_type
                ),
            ),
            ("Genre", self.style_genre.clone()),
            ("Mood", self.mood.clone()),
            (
                "Distinctive features",
                join_list(&self.distinctive_features),
            ),
        ]
    }
}

fn require(missing: &mut Vec<&'static str>, path: &'static str, value: &str) {
    if value.trim().is_empty() {
        missing.push(path);
    }
}

fn join_list(items: &[String]) -> String {
    let kept = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect::<Vec<&str>>();
    if kept.is_empty() {
        return "none".to_string();
    }
    kept.join(", ")
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::fixtures;
    use super::*;

    #[test]
    fn multi_line_values_stay_inside_their_section() {
        let mut analysis = fixtures::character();
        analysis.overall_vibe = "restless\nNote: avoids crowds".to_string();
        let sections = legacy_sections(&analysis.legacy_description());
        assert_eq!(sections.len(), 5);
        assert_eq!(
            sections[4],
            (
                "Overall vibe".to_string(),
                "restless Note: avoids crowds".to_string()
            )
        );
    }

    #[test]
    fn character_legacy_round_trip_covers_required_fields_in_order() {
        let analysis = fixtures::character();
        let legacy = analysis.legacy_description();
        let sections = legacy_sections(&legacy);
        let labels = sections
            .iter()
            .map(|(label, _)| label.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(labels, vec!["Face", "Hair", "Body", "Outfit", "Overall vibe"]);

        let display = display_sections(&sections);
        for value in [
            "heart-shaped",
            "late teens",
            "olive",
            "amber",
            "almond",
            "large",
            "small upturned",
            "full lips",
            "jet black",
            "shoulder-length",
            "messy bob",
            "center",
            "straight",
            "wiry",
            "short",
            "alert",
            "navy travel coat",
            "grey trousers",
            "leather satchel",
            "navy, grey",
            "practical",
            "restless wanderer",
        ] {
            assert!(display.contains(value), "display lost '{value}': {display}");
        }
        assert_eq!(legacy, fixtures::character().legacy_description());
    }

    #[test]
    fn character_json_uses_camel_case_schema() -> anyhow::Result<()> {
        let value = serde_json::to_value(fixtures::character())?;
        assert_eq!(value["face"]["skinTone"], json!("olive"));
        assert_eq!(value["outfit"]["upperBody"], json!("navy travel coat"));
        assert_eq!(value["overallVibe"], json!("restless wanderer"));
        Ok(())
    }

    #[test]
    fn optional_character_lists_default_when_absent() -> anyhow::Result<()> {
        let mut value = serde_json::to_value(fixtures::character())?;
        value["face"]
            .as_object_mut()
            .map(|face| face.remove("distinctiveMarks"));
        value["hair"]
            .as_object_mut()
            .map(|hair| hair.remove("accessories"));
        let parsed: CharacterAnalysis = serde_json::from_value(value)?;
        assert!(parsed.face.distinctive_marks.is_empty());
        assert!(parsed.hair.accessories.is_empty());
        assert!(parsed.validate().is_ok());
        Ok(())
    }

    #[test]
    fn required_outfit_lists_must_be_present() -> anyhow::Result<()> {
        let mut value = serde_json::to_value(fixtures::character())?;
        value["outfit"]
            .as_object_mut()
            .map(|outfit| outfit.remove("colors"));
        assert!(serde_json::from_value::<CharacterAnalysis>(value).is_err());
        Ok(())
    }

    #[test]
    fn blank_required_fields_fail_validation() {
        let mut analysis = fixtures::character();
        analysis.hair.color = "  ".to_string();
        analysis.overall_vibe.clear();
        let err = analysis.validate().unwrap_err();
        assert_eq!(err, "missing required fields: hair.color, overallVibe");
    }

    #[test]
    fn background_type_field_is_renamed() -> anyhow::Result<()> {
        let value = serde_json::to_value(fixtures::background())?;
        assert_eq!(value["location"]["type"], json!("forest"));
        assert_eq!(value["lighting"]["timeOfDay"], json!("dusk"));
        Ok(())
    }

    #[test]
    fn background_requires_light_source_and_dominant_color() {
        let mut analysis = fixtures::background();
        analysis.lighting.source.clear();
        analysis.colors.dominant = vec![" ".to_string()];
        assert_eq!(
            analysis.missing_fields(),
            vec!["lighting.source", "colors.dominant"]
        );
    }

    #[test]
    fn art_style_sections_are_stable() {
        let sections = fixtures::art_style().sections();
        let labels = sections
            .iter()
            .map(|(label, _)| *label)
            .collect::<Vec<&str>>();
        assert_eq!(
            labels,
            vec![
                "Medium",
                "Technique",
                "Color application",
                "Shading and lighting",
                "Genre",
                "Mood",
                "Distinctive features",
            ]
        );
        assert!(fixtures::art_style().validate().is_ok());
    }

    #[test]
    fn legacy_sections_fold_continuation_lines() {
        let sections = legacy_sections("Face: round\nwith dimples\n\nHair: red");
        assert_eq!(
            sections,
            vec![
                ("Face".to_string(), "round with dimples".to_string()),
                ("Hair".to_string(), "red".to_string()),
            ]
        );
    }
}
