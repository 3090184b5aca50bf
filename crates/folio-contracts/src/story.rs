use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{ArtStyleAnalysis, BackgroundAnalysis, CharacterAnalysis, StructuredAnalysis};
use crate::data_url::DataUrl;
use crate::error::FolioError;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub novel_text: String,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub backgrounds: Vec<Background>,
    pub art_style: Option<ArtStyleReference>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, novel_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            title: title.into(),
            novel_text: novel_text.into(),
            characters: Vec::new(),
            backgrounds: Vec::new(),
            art_style: None,
            scenes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scene(&self, scene_id: &str) -> Result<&Scene, FolioError> {
        self.scenes
            .iter()
            .find(|scene| scene.id == scene_id)
            .ok_or_else(|| FolioError::not_found("scene", scene_id))
    }

    /// The scene and the one immediately before it.
    pub fn scene_with_previous(&self, scene_id: &str) -> Result<(&Scene, Option<&Scene>), FolioError> {
        let idx = self
            .scenes
            .iter()
            .position(|scene| scene.id == scene_id)
            .ok_or_else(|| FolioError::not_found("scene", scene_id))?;
        let previous = idx.checked_sub(1).map(|prev| &self.scenes[prev]);
        Ok((&self.scenes[idx], previous))
    }

    pub fn character(&self, character_id: &str) -> Result<&Character, FolioError> {
        self.characters
            .iter()
            .find(|character| character.id == character_id)
            .ok_or_else(|| FolioError::not_found("character", character_id))
    }

    pub fn background(&self, background_id: &str) -> Result<&Background, FolioError> {
        self.backgrounds
            .iter()
            .find(|background| background.id == background_id)
            .ok_or_else(|| FolioError::not_found("background", background_id))
    }

    pub fn art_style_description(&self) -> Option<String> {
        self.art_style
            .as_ref()
            .and_then(ArtStyleReference::effective_description)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub image: Option<DataUrl>,
    pub description: Option<String>,
    pub analysis: Option<CharacterAnalysis>,
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            image: None,
            description: None,
            analysis: None,
        }
    }

    /// Stored description, falling back to the rendered analysis.
    pub fn effective_description(&self) -> Option<String> {
        effective_description(self.description.as_deref(), self.analysis.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Background {
    pub id: String,
    pub name: String,
    pub image: DataUrl,
    pub description: Option<String>,
    pub analysis: Option<BackgroundAnalysis>,
}

impl Background {
    pub fn new(name: impl Into<String>, image: DataUrl) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            image,
            description: None,
            analysis: None,
        }
    }

    pub fn effective_description(&self) -> Option<String> {
        effective_description(self.description.as_deref(), self.analysis.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtStyleReference {
    pub image: DataUrl,
    pub description: Option<String>,
    pub analysis: Option<ArtStyleAnalysis>,
}

impl ArtStyleReference {
    pub fn effective_description(&self) -> Option<String> {
        effective_description(self.description.as_deref(), self.analysis.as_ref())
    }
}

fn effective_description<A: StructuredAnalysis>(
    description: Option<&str>,
    analysis: Option<&A>,
) -> Option<String> {
    description
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .or_else(|| analysis.map(StructuredAnalysis::legacy_description))
}

/// Director-style breakdown of a scene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredSceneDescription {
    pub summary: String,
    #[serde(default)]
    pub characters: Vec<String>,
    pub location: Option<String>,
    pub mood: Option<String>,
    /// Verbatim passage of the novel the scene was drawn from.
    pub source_excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub description: String,
    pub structured: Option<StructuredSceneDescription>,
    pub image: Option<DataUrl>,
    pub custom_prompt: Option<String>,
    pub stage: SceneStage,
    #[serde(default)]
    pub shot_type: ShotType,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
}

impl Scene {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            description: description.into(),
            structured: None,
            image: None,
            custom_prompt: None,
            stage: SceneStage::NoPrompt,
            shot_type: ShotType::default(),
            aspect_ratio: AspectRatio::default(),
        }
    }

    pub fn from_structured(structured: StructuredSceneDescription) -> Self {
        let mut scene = Self::new(structured.summary.clone());
        scene.structured = Some(structured);
        scene
    }

    pub fn is_generating(&self) -> bool {
        self.stage.is_generating()
    }

    pub fn prompt(&self) -> Option<&str> {
        self.custom_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
    }

    pub fn apply(&mut self, event: SceneEvent) -> Result<(), FolioError> {
        self.stage = self
            .stage
            .transition(event, self.image.is_some())
            .map_err(|stage| FolioError::InvalidTransition {
                scene_id: self.id.clone(),
                stage: stage.to_string(),
                action: event.action().to_string(),
            })?;
        Ok(())
    }

    /// Re-derives the stage from stored fields, dropping any in-flight stage.
    pub fn settle(&mut self) {
        self.stage = SceneStage::infer(self.prompt().is_some(), self.image.is_some());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStage {
    NoPrompt,
    PromptReady,
    Generating,
    EditGenerating,
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEvent {
    PromptComposed,
    PromptCleared,
    GenerationStarted,
    EditStarted,
    Succeeded,
    Failed,
}

impl SceneEvent {
    fn action(self) -> &'static str {
        match self {
            Self::PromptComposed => "store a prompt",
            Self::PromptCleared => "clear its prompt",
            Self::GenerationStarted => "start generating",
            Self::EditStarted => "start an edit",
            Self::Succeeded => "complete a generation",
            Self::Failed => "fail a generation",
        }
    }
}

impl SceneStage {
    pub fn infer(has_prompt: bool, has_image: bool) -> Self {
        match (has_prompt, has_image) {
            (_, true) => Self::Generated,
            (true, false) => Self::PromptReady,
            (false, false) => Self::NoPrompt,
        }
    }

    pub fn is_generating(self) -> bool {
        matches!(self, Self::Generating | Self::EditGenerating)
    }

    /// Next stage for `event`; the current stage is returned as the error.
    pub fn transition(self, event: SceneEvent, has_image: bool) -> Result<Self, Self> {
        use SceneEvent as E;
        use SceneStage as S;
        match (self, event) {
            (S::NoPrompt | S::PromptReady, E::PromptComposed) => Ok(S::PromptReady),
            (S::Generated, E::PromptComposed) => Ok(S::Generated),
            (S::NoPrompt | S::PromptReady, E::PromptCleared) => Ok(S::NoPrompt),
            (S::Generated, E::PromptCleared) => Ok(S::Generated),
            (S::PromptReady | S::Generated, E::GenerationStarted) => Ok(S::Generating),
            (S::Generated, E::EditStarted) => Ok(S::EditGenerating),
            (S::Generating | S::EditGenerating, E::Succeeded) => Ok(S::Generated),
            (S::Generating, E::Failed) if has_image => Ok(S::Generated),
            (S::Generating, E::Failed) => Ok(S::PromptReady),
            (S::EditGenerating, E::Failed) => Ok(S::Generated),
            (stage, _) => Err(stage),
        }
    }
}

impl fmt::Display for SceneStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NoPrompt => "no prompt",
            Self::PromptReady => "prompt ready",
            Self::Generating => "generating",
            Self::EditGenerating => "editing",
            Self::Generated => "generated",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotType {
    #[default]
    Automatic,
    Establishing,
    Wide,
    Medium,
    CloseUp,
    ExtremeCloseUp,
    OverTheShoulder,
    LowAngle,
    HighAngle,
    BirdsEye,
}

impl ShotType {
    pub const ALL: [ShotType; 10] = [
        Self::Automatic,
        Self::Establishing,
        Self::Wide,
        Self::Medium,
        Self::CloseUp,
        Self::ExtremeCloseUp,
        Self::OverTheShoulder,
        Self::LowAngle,
        Self::HighAngle,
        Self::BirdsEye,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Establishing => "establishing",
            Self::Wide => "wide",
            Self::Medium => "medium",
            Self::CloseUp => "close-up",
            Self::ExtremeCloseUp => "extreme-close-up",
            Self::OverTheShoulder => "over-the-shoulder",
            Self::LowAngle => "low-angle",
            Self::HighAngle => "high-angle",
            Self::BirdsEye => "birds-eye",
        }
    }

    /// Composition instruction for the image model; `None` lets the model choose.
    pub fn instruction(self) -> Option<&'static str> {
        match self {
            Self::Automatic => None,
            Self::Establishing => Some(
                "Compose this as an establishing shot: show the full environment with characters small in frame to set the location.",
            ),
            Self::Wide => Some(
                "Compose this as a wide shot: characters visible head to toe with generous surrounding space.",
            ),
            Self::Medium => Some(
                "Compose this as a medium shot: frame characters from the waist up.",
            ),
            Self::CloseUp => Some(
                "Compose this as a close-up: the face and shoulders fill the frame to emphasise expression.",
            ),
            Self::ExtremeCloseUp => Some(
                "Compose this as an extreme close-up: a single detail such as the eyes or hands fills the frame.",
            ),
            Self::OverTheShoulder => Some(
                "Compose this as an over-the-shoulder shot: frame the subject past the shoulder of another character in the foreground.",
            ),
            Self::LowAngle => Some(
                "Compose this from a low angle: the camera looks up at the subject to make it feel imposing.",
            ),
            Self::HighAngle => Some(
                "Compose this from a high angle: the camera looks down on the subject to make it feel small or vulnerable.",
            ),
            Self::BirdsEye => Some(
                "Compose this as a bird's-eye view: look straight down on the scene from above.",
            ),
        }
    }

    /// Prompt line stating the framing, e.g. `Shot (wide): Compose this ...`.
    pub fn directive(self) -> Option<String> {
        self.instruction()
            .map(|instruction| format!("{SHOT_DIRECTIVE_PREFIX}{}): {instruction}", self.key()))
    }

    /// Replaces every framing line in `prompt` with this shot's directive.
    ///
    /// The new line goes after a leading `Scene:` line; prompts without one
    /// only lose their stale directives.
    pub fn retarget_prompt(self, prompt: &str) -> String {
        let mut lines = prompt
            .lines()
            .filter(|line| !is_shot_directive(line))
            .map(str::to_string)
            .collect::<Vec<String>>();
        if let Some(directive) = self.directive() {
            if lines.first().is_some_and(|line| line.starts_with("Scene:")) {
                lines.insert(1, directive);
            }
        }
        lines.join("\n")
    }
}

const SHOT_DIRECTIVE_PREFIX: &str = "Shot (";

fn is_shot_directive(line: &str) -> bool {
    line.trim_start().starts_with(SHOT_DIRECTIVE_PREFIX)
}

/// True when `prompt` already states the framing.
pub fn has_shot_directive(prompt: &str) -> bool {
    prompt.lines().any(is_shot_directive)
}

impl fmt::Display for ShotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ShotType {
    type Err = FolioError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        Self::ALL
            .into_iter()
            .find(|shot| shot.key() == normalized)
            .ok_or_else(|| FolioError::validation(format!("unknown shot type '{raw}'")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "9:16")]
    Tall,
    #[default]
    #[serde(rename = "16:9")]
    Wide,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        Self::Square,
        Self::Portrait,
        Self::Landscape,
        Self::Tall,
        Self::Wide,
    ];

    pub fn ratio(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Portrait => "3:4",
            Self::Landscape => "4:3",
            Self::Tall => "9:16",
            Self::Wide => "16:9",
        }
    }

    pub fn orientation(self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::Portrait | Self::Tall => "portrait",
            Self::Landscape | Self::Wide => "landscape",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ratio())
    }
}

impl FromStr for AspectRatio {
    type Err = FolioError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|ratio| ratio.ratio() == trimmed)
            .ok_or_else(|| FolioError::validation(format!("unsupported aspect ratio '{raw}'")))
    }
}
