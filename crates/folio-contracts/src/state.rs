//! In-memory story state and its update reducer.
//!
//! Every mutation is expressed as a [`StoryUpdate`] applied to the current
//! snapshot of one story, producing the next snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use indexmap::IndexMap;

use crate::data_url::DataUrl;
use crate::error::FolioError;
use crate::story::{
    ArtStyleReference, AspectRatio, Background, Character, Scene, SceneEvent, ShotType, Story,
};

/// What happens to a stored prompt when its scene description changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromptPolicy {
    /// The prompt is left as is, even though it no longer matches.
    #[default]
    KeepStale,
    /// The prompt is dropped so the next generate composes a fresh one.
    Invalidate,
}

impl fmt::Display for PromptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeepStale => "keep",
            Self::Invalidate => "invalidate",
        })
    }
}

impl FromStr for PromptPolicy {
    type Err = FolioError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep" | "keep-stale" | "keep_stale" => Ok(Self::KeepStale),
            "invalidate" => Ok(Self::Invalidate),
            _ => Err(FolioError::validation(format!(
                "unknown prompt policy '{raw}' (expected keep or invalidate)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenePatch {
    Description { text: String, policy: PromptPolicy },
    /// `None` (or a blank prompt) clears the stored prompt.
    CustomPrompt(Option<String>),
    ShotType(ShotType),
    AspectRatio(AspectRatio),
    Event(SceneEvent),
    /// A finished generation or edit: stores the image and completes the stage.
    Image(DataUrl),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoryUpdate {
    Title(String),
    Characters(Vec<Character>),
    Backgrounds(Vec<Background>),
    ArtStyle(Option<ArtStyleReference>),
    Scenes(Vec<Scene>),
    Scene { scene_id: String, patch: ScenePatch },
}

impl StoryUpdate {
    pub fn scene(scene_id: impl Into<String>, patch: ScenePatch) -> Self {
        Self::Scene {
            scene_id: scene_id.into(),
            patch,
        }
    }
}

/// Next snapshot of `story` after `update`; `story` itself is untouched.
pub fn reduce(story: &Story, update: StoryUpdate) -> Result<Story, FolioError> {
    let mut next = story.clone();
    match update {
        StoryUpdate::Title(title) => next.title = title,
        StoryUpdate::Characters(characters) => next.characters = characters,
        StoryUpdate::Backgrounds(backgrounds) => next.backgrounds = backgrounds,
        StoryUpdate::ArtStyle(art_style) => next.art_style = art_style,
        StoryUpdate::Scenes(scenes) => next.scenes = scenes,
        StoryUpdate::Scene { scene_id, patch } => {
            let scene = next
                .scenes
                .iter_mut()
                .find(|scene| scene.id == scene_id)
                .ok_or_else(|| FolioError::not_found("scene", &scene_id))?;
            apply_scene_patch(scene, patch)?;
        }
    }
    next.updated_at = Utc::now();
    Ok(next)
}

fn apply_scene_patch(scene: &mut Scene, patch: ScenePatch) -> Result<(), FolioError> {
    match patch {
        ScenePatch::Description { text, policy } => {
            if policy == PromptPolicy::Invalidate && scene.custom_prompt.is_some() {
                scene.apply(SceneEvent::PromptCleared)?;
                scene.custom_prompt = None;
            }
            scene.description = text;
        }
        ScenePatch::CustomPrompt(prompt) => {
            let prompt = prompt.filter(|text| !text.trim().is_empty());
            let event = if prompt.is_some() {
                SceneEvent::PromptComposed
            } else {
                SceneEvent::PromptCleared
            };
            scene.apply(event)?;
            scene.custom_prompt = prompt;
        }
        ScenePatch::ShotType(shot_type) => {
            scene.shot_type = shot_type;
            if let Some(prompt) = scene.custom_prompt.as_mut() {
                *prompt = shot_type.retarget_prompt(prompt);
            }
        }
        ScenePatch::AspectRatio(aspect_ratio) => scene.aspect_ratio = aspect_ratio,
        ScenePatch::Event(event) => scene.apply(event)?,
        ScenePatch::Image(image) => {
            scene.apply(SceneEvent::Succeeded)?;
            scene.image = Some(image);
        }
    }
    Ok(())
}

/// All stories of the session, keyed by id in load order.
#[derive(Debug, Clone, Default)]
pub struct StoryBook {
    stories: IndexMap<String, Story>,
}

impl StoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, story: Story) {
        self.stories.insert(story.id.clone(), story);
    }

    pub fn get(&self, story_id: &str) -> Result<&Story, FolioError> {
        self.stories
            .get(story_id)
            .ok_or_else(|| FolioError::not_found("story", story_id))
    }

    pub fn remove(&mut self, story_id: &str) -> Option<Story> {
        self.stories.shift_remove(story_id)
    }

    pub fn stories(&self) -> impl Iterator<Item = &Story> {
        self.stories.values()
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    /// Applies one update and returns the new snapshot.
    pub fn apply(&mut self, story_id: &str, update: StoryUpdate) -> Result<Story, FolioError> {
        self.update(story_id, |story| reduce(story, update))
    }

    /// Replaces the story with `f(current)`; on error nothing changes.
    pub fn update<F>(&mut self, story_id: &str, f: F) -> Result<Story, FolioError>
    where
        F: FnOnce(&Story) -> Result<Story, FolioError>,
    {
        let slot = self
            .stories
            .get_mut(story_id)
            .ok_or_else(|| FolioError::not_found("story", story_id))?;
        let next = f(slot)?;
        *slot = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::SceneStage;

    fn book_with_scene() -> (StoryBook, String, String) {
        let mut story = Story::new("u1", "Title", "Kai walked into the forest.");
        story.scenes = vec![Scene::new("Kai enters the forest")];
        let story_id = story.id.clone();
        let scene_id = story.scenes[0].id.clone();
        let mut book = StoryBook::new();
        book.insert(story);
        (book, story_id, scene_id)
    }

    #[test]
    fn reduce_leaves_input_snapshot_untouched() -> anyhow::Result<()> {
        let story = Story::new("u1", "Before", "text");
        let next = reduce(&story, StoryUpdate::Title("After".to_string()))?;
        assert_eq!(story.title, "Before");
        assert_eq!(next.title, "After");
        assert!(next.updated_at >= story.updated_at);
        Ok(())
    }

    #[test]
    fn custom_prompt_moves_scene_between_stages() -> anyhow::Result<()> {
        let (mut book, story_id, scene_id) = book_with_scene();
        let story = book.apply(
            &story_id,
            StoryUpdate::scene(&scene_id, ScenePatch::CustomPrompt(Some("prompt".into()))),
        )?;
        assert_eq!(story.scenes[0].stage, SceneStage::PromptReady);

        let story = book.apply(
            &story_id,
            StoryUpdate::scene(&scene_id, ScenePatch::CustomPrompt(Some("  ".into()))),
        )?;
        assert_eq!(story.scenes[0].stage, SceneStage::NoPrompt);
        assert!(story.scenes[0].custom_prompt.is_none());
        Ok(())
    }

    #[test]
    fn description_edit_follows_prompt_policy() -> anyhow::Result<()> {
        let (mut book, story_id, scene_id) = book_with_scene();
        book.apply(
            &story_id,
            StoryUpdate::scene(&scene_id, ScenePatch::CustomPrompt(Some("old".into()))),
        )?;

        let kept = book.apply(
            &story_id,
            StoryUpdate::scene(
                &scene_id,
                ScenePatch::Description {
                    text: "Kai leaves the forest".into(),
                    policy: PromptPolicy::KeepStale,
                },
            ),
        )?;
        assert_eq!(kept.scenes[0].custom_prompt.as_deref(), Some("old"));
        assert_eq!(kept.scenes[0].stage, SceneStage::PromptReady);

        let invalidated = book.apply(
            &story_id,
            StoryUpdate::scene(
                &scene_id,
                ScenePatch::Description {
                    text: "Kai returns".into(),
                    policy: PromptPolicy::Invalidate,
                },
            ),
        )?;
        assert!(invalidated.scenes[0].custom_prompt.is_none());
        assert_eq!(invalidated.scenes[0].stage, SceneStage::NoPrompt);
        assert_eq!(invalidated.scenes[0].description, "Kai returns");
        Ok(())
    }

    #[test]
    fn image_patch_completes_generation() -> anyhow::Result<()> {
        let (mut book, story_id, scene_id) = book_with_scene();
        for patch in [
            ScenePatch::CustomPrompt(Some("p".into())),
            ScenePatch::Event(SceneEvent::GenerationStarted),
            ScenePatch::Image(DataUrl::from_bytes("image/png", b"img")),
        ] {
            book.apply(&story_id, StoryUpdate::scene(&scene_id, patch))?;
        }
        let story = book.get(&story_id)?;
        assert_eq!(story.scenes[0].stage, SceneStage::Generated);
        assert!(story.scenes[0].image.is_some());
        Ok(())
    }

    #[test]
    fn failed_update_keeps_previous_snapshot() -> anyhow::Result<()> {
        let (mut book, story_id, scene_id) = book_with_scene();
        let before = book.get(&story_id)?.clone();
        let err = book
            .apply(
                &story_id,
                StoryUpdate::scene(&scene_id, ScenePatch::Event(SceneEvent::EditStarted)),
            )
            .unwrap_err();
        assert!(matches!(err, FolioError::InvalidTransition { .. }));
        assert_eq!(book.get(&story_id)?, &before);
        Ok(())
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (mut book, story_id, _) = book_with_scene();
        assert!(matches!(
            book.apply("nope", StoryUpdate::Title("x".into())),
            Err(FolioError::NotFound { entity: "story", .. })
        ));
        assert!(matches!(
            book.apply(
                &story_id,
                StoryUpdate::scene("nope", ScenePatch::ShotType(ShotType::Wide))
            ),
            Err(FolioError::NotFound { entity: "scene", .. })
        ));
    }

    #[test]
    fn prompt_policy_parses_cli_spelling() {
        assert_eq!("keep".parse::<PromptPolicy>().unwrap(), PromptPolicy::KeepStale);
        assert_eq!(
            "Invalidate".parse::<PromptPolicy>().unwrap(),
            PromptPolicy::Invalidate
        );
        assert!("drop".parse::<PromptPolicy>().is_err());
    }
}
