//! The illustration studio: stories, reference rosters and scene generation.
//!
//! All mutations go through [`StoryBook`] updates. Every committed snapshot
//! is queued for the debounced remote sync; finished images are written to
//! the local cache before the in-memory scene changes.

use std::time::Instant;

use anyhow::Result;
use folio_contracts::analysis::{
    AnalysisKind, ArtStyleAnalysis, BackgroundAnalysis, CharacterAnalysis, StructuredAnalysis,
};
use folio_contracts::cache::LocalCache;
use folio_contracts::data_url::DataUrl;
use folio_contracts::error::{folio_error, FolioError};
use folio_contracts::events::{prompt_diff, EventLog, EventPayload};
use folio_contracts::repository::{SessionReport, StoryRepository};
use folio_contracts::state::{PromptPolicy, ScenePatch, StoryBook, StoryUpdate};
use folio_contracts::store::{RemoteStore, SyncReport};
use folio_contracts::story::{
    ArtStyleReference, AspectRatio, Background, Character, Scene, SceneEvent, ShotType, Story,
};
use serde_json::{json, Value};
use tracing::instrument;

use crate::analyzer::{self, AnalysisOutcome};
use crate::composer::compose_prompt;
use crate::filter::{select_relevant_backgrounds, select_relevant_characters};
use crate::model::GenerativeModel;
use crate::request::{build_edit_request, build_generation_request, References};
use crate::segmenter::{derive_title, segment_structured};

/// Result of one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateOutcome {
    /// No prompt was stored; one was composed and saved for review.
    PromptComposed(String),
    ImageGenerated(DataUrl),
}

/// Per-scene results of a `generate_all` sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub generated: Vec<String>,
    /// Scenes that only received a prompt and wait for review.
    pub composed: Vec<String>,
    /// `(scene_id, message)` for every scene that failed.
    pub failed: Vec<(String, String)>,
}

/// A roster entry written after an image analysis attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutcome {
    pub id: String,
    /// Set when the analysis failed; the entry keeps its previous analysis.
    pub analysis_error: Option<FolioError>,
}

/// Shared shape of characters and backgrounds.
trait RosterEntry: Clone {
    type Analysis: StructuredAnalysis;
    const ENTITY: &'static str;

    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn rename(&mut self, name: String);
    fn image(&self) -> Option<&DataUrl>;
    fn replace_image(&mut self, image: DataUrl);
    fn has_analysis(&self) -> bool;
    fn store_analysis(&mut self, outcome: AnalysisOutcome<Self::Analysis>);
    fn roster(story: &Story) -> &[Self];
    fn replace_roster(roster: Vec<Self>) -> StoryUpdate;
}

impl RosterEntry for Character {
    type Analysis = CharacterAnalysis;
    const ENTITY: &'static str = "character";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, name: String) {
        self.name = name;
    }

    fn image(&self) -> Option<&DataUrl> {
        self.image.as_ref()
    }

    fn replace_image(&mut self, image: DataUrl) {
        self.image = Some(image);
    }

    fn has_analysis(&self) -> bool {
        self.analysis.is_some()
    }

    fn store_analysis(&mut self, outcome: AnalysisOutcome<CharacterAnalysis>) {
        self.description = Some(outcome.description);
        self.analysis = Some(outcome.analysis);
    }

    fn roster(story: &Story) -> &[Self] {
        &story.characters
    }

    fn replace_roster(roster: Vec<Self>) -> StoryUpdate {
        StoryUpdate::Characters(roster)
    }
}

impl RosterEntry for Background {
    type Analysis = BackgroundAnalysis;
    const ENTITY: &'static str = "background";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, name: String) {
        self.name = name;
    }

    fn image(&self) -> Option<&DataUrl> {
        Some(&self.image)
    }

    fn replace_image(&mut self, image: DataUrl) {
        self.image = image;
    }

    fn has_analysis(&self) -> bool {
        self.analysis.is_some()
    }

    fn store_analysis(&mut self, outcome: AnalysisOutcome<BackgroundAnalysis>) {
        self.description = Some(outcome.description);
        self.analysis = Some(outcome.analysis);
    }

    fn roster(story: &Story) -> &[Self] {
        &story.backgrounds
    }

    fn replace_roster(roster: Vec<Self>) -> StoryUpdate {
        StoryUpdate::Backgrounds(roster)
    }
}

pub struct Studio<M, L, R> {
    model: M,
    book: StoryBook,
    repository: StoryRepository<L, R>,
    events: EventLog,
    policy: PromptPolicy,
    user_id: String,
}

impl<M, L, R> Studio<M, L, R>
where
    M: GenerativeModel,
    L: LocalCache,
    R: RemoteStore,
{
    /// Loads the user's stories and starts a session.
    pub fn open(
        model: M,
        mut repository: StoryRepository<L, R>,
        events: EventLog,
        user_id: impl Into<String>,
        policy: PromptPolicy,
    ) -> Result<(Self, SessionReport)> {
        let user_id = user_id.into();
        let (book, report) = repository.load_session(&user_id)?;
        events.record(
            "session_started",
            map_object(json!({
                "user_id": user_id,
                "model": model.name(),
                "stories": report.stories,
                "migrated_images": report.migrated_images,
                "prompt_policy": policy.to_string(),
            })),
        );
        Ok((
            Self {
                model,
                book,
                repository,
                events,
                policy,
                user_id,
            },
            report,
        ))
    }

    pub fn stories(&self) -> impl Iterator<Item = &Story> {
        self.book.stories()
    }

    pub fn story(&self, story_id: &str) -> Result<&Story> {
        Ok(self.book.get(story_id)?)
    }

    pub fn policy(&self) -> PromptPolicy {
        self.policy
    }

    pub fn repository(&self) -> &StoryRepository<L, R> {
        &self.repository
    }

    fn commit(&mut self, story_id: &str, update: StoryUpdate) -> Result<Story> {
        let story = self.book.apply(story_id, update)?;
        self.repository.schedule_sync(&story, Instant::now());
        Ok(story)
    }

    /// Segments the novel into scenes and creates a story from them.
    ///
    /// Without an explicit title one is derived from the opening text;
    /// title failures fall back to a placeholder, segmentation failures
    /// abort the whole operation.
    #[instrument(skip(self, novel_text), fields(chars = novel_text.len()))]
    pub fn create_story(&mut self, title: Option<&str>, novel_text: &str) -> Result<Story> {
        if novel_text.trim().is_empty() {
            return Err(FolioError::validation("novel text is empty").into());
        }
        let scenes = segment_structured(&self.model, novel_text)?;

        let title = match title.map(str::trim).filter(|title| !title.is_empty()) {
            Some(title) => title.to_string(),
            None => {
                let derived = derive_title(&self.model, novel_text);
                if let Some(reason) = derived.fallback_reason.as_ref() {
                    self.events.record(
                        "title_fallback",
                        map_object(json!({ "title": derived.text, "reason": reason })),
                    );
                }
                derived.text
            }
        };

        let mut story = Story::new(self.user_id.clone(), title, novel_text.trim());
        story.scenes = scenes.into_iter().map(Scene::from_structured).collect();
        self.book.insert(story.clone());
        self.repository.schedule_sync(&story, Instant::now());

        tracing::info!(story_id = %story.id, scenes = story.scenes.len(), "story created");
        self.events.record(
            "story_created",
            map_object(json!({
                "story_id": story.id,
                "title": story.title,
                "scenes": story.scenes.len(),
            })),
        );
        Ok(story)
    }

    #[instrument(skip(self))]
    pub fn delete_story(&mut self, story_id: &str) -> Result<()> {
        self.book.get(story_id)?;
        let rows = self.repository.delete_story(story_id)?;
        self.book.remove(story_id);
        self.events.record(
            "entity_deleted",
            map_object(json!({ "entity": "story", "story_id": story_id, "rows": rows })),
        );
        Ok(())
    }

    fn run_analysis<A: StructuredAnalysis>(
        &self,
        story_id: &str,
        entity_id: &str,
        image: &DataUrl,
    ) -> Result<AnalysisOutcome<A>, FolioError> {
        match analyzer::analyze::<A, M>(&self.model, image) {
            Ok(outcome) => {
                self.events.record(
                    "analysis_completed",
                    map_object(json!({
                        "story_id": story_id,
                        "entity_id": entity_id,
                        "kind": A::KIND.label(),
                    })),
                );
                Ok(outcome)
            }
            Err(err) => {
                let failure = analysis_failure(A::KIND, &err);
                tracing::warn!(entity_id, kind = A::KIND.label(), error = %failure, "analysis failed");
                self.events.record(
                    "analysis_failed",
                    map_object(json!({
                        "story_id": story_id,
                        "entity_id": entity_id,
                        "kind": A::KIND.label(),
                        "error": failure.to_string(),
                    })),
                );
                Err(failure)
            }
        }
    }

    fn find_entry<T: RosterEntry>(&self, story_id: &str, entry_id: &str) -> Result<T> {
        T::roster(self.book.get(story_id)?)
            .iter()
            .find(|entry| entry.id() == entry_id)
            .cloned()
            .ok_or_else(|| FolioError::not_found(T::ENTITY, entry_id).into())
    }

    fn write_entry<T: RosterEntry>(&mut self, story_id: &str, entry: T) -> Result<()> {
        let story = self.book.get(story_id)?;
        let mut roster = T::roster(story).to_vec();
        match roster.iter_mut().find(|existing| existing.id() == entry.id()) {
            Some(slot) => *slot = entry,
            None => roster.push(entry),
        }
        self.commit(story_id, T::replace_roster(roster))?;
        Ok(())
    }

    fn add_entry<T: RosterEntry>(&mut self, story_id: &str, mut entry: T) -> Result<ReferenceOutcome> {
        if entry.name().trim().is_empty() {
            return Err(FolioError::validation(format!("{} name is empty", T::ENTITY)).into());
        }
        self.book.get(story_id)?;
        let mut analysis_error = None;
        if let Some(image) = entry.image().cloned() {
            match self.run_analysis::<T::Analysis>(story_id, entry.id(), &image) {
                Ok(outcome) => entry.store_analysis(outcome),
                Err(err) => analysis_error = Some(err),
            }
        }
        let id = entry.id().to_string();
        self.write_entry(story_id, entry)?;
        Ok(ReferenceOutcome { id, analysis_error })
    }

    fn rename_entry<T: RosterEntry>(&mut self, story_id: &str, entry_id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FolioError::validation(format!("{} name is empty", T::ENTITY)).into());
        }
        let mut entry = self.find_entry::<T>(story_id, entry_id)?;
        entry.rename(name.to_string());
        self.write_entry(story_id, entry)
    }

    fn replace_entry_image<T: RosterEntry>(
        &mut self,
        story_id: &str,
        entry_id: &str,
        image: DataUrl,
    ) -> Result<ReferenceOutcome> {
        let mut entry = self.find_entry::<T>(story_id, entry_id)?;
        let analysis = self.run_analysis::<T::Analysis>(story_id, entry_id, &image);
        entry.replace_image(image);
        let analysis_error = match analysis {
            Ok(outcome) => {
                entry.store_analysis(outcome);
                None
            }
            Err(err) => Some(err),
        };
        self.write_entry(story_id, entry)?;
        Ok(ReferenceOutcome {
            id: entry_id.to_string(),
            analysis_error,
        })
    }

    fn reanalyze_entry<T: RosterEntry>(&mut self, story_id: &str, entry_id: &str) -> Result<()> {
        let mut entry = self.find_entry::<T>(story_id, entry_id)?;
        let image = entry.image().cloned().ok_or_else(|| {
            FolioError::validation(format!("{} '{}' has no image to analyze", T::ENTITY, entry.name()))
        })?;
        let outcome = self.run_analysis::<T::Analysis>(story_id, entry_id, &image)?;
        entry.store_analysis(outcome);
        self.write_entry(story_id, entry)
    }

    fn remove_entry<T: RosterEntry>(&mut self, story_id: &str, entry_id: &str, confirm: bool) -> Result<()> {
        let entry = self.find_entry::<T>(story_id, entry_id)?;
        if !confirm {
            return Err(FolioError::ConfirmationRequired {
                entity: T::ENTITY,
                name: entry.name().to_string(),
            }
            .into());
        }
        let roster = T::roster(self.book.get(story_id)?)
            .iter()
            .filter(|existing| existing.id() != entry_id)
            .cloned()
            .collect::<Vec<T>>();
        self.commit(story_id, T::replace_roster(roster))?;
        self.events.record(
            "entity_deleted",
            map_object(json!({
                "entity": T::ENTITY,
                "story_id": story_id,
                "entity_id": entry_id,
                "had_analysis": entry.has_analysis(),
            })),
        );
        Ok(())
    }

    #[instrument(skip(self, image))]
    pub fn add_character(
        &mut self,
        story_id: &str,
        name: &str,
        image: Option<DataUrl>,
    ) -> Result<ReferenceOutcome> {
        let mut character = Character::new(name.trim());
        character.image = image;
        self.add_entry(story_id, character)
    }

    pub fn rename_character(&mut self, story_id: &str, character_id: &str, name: &str) -> Result<()> {
        self.rename_entry::<Character>(story_id, character_id, name)
    }

    /// Replaces the reference image and re-analyses it.
    #[instrument(skip(self, image))]
    pub fn set_character_image(
        &mut self,
        story_id: &str,
        character_id: &str,
        image: DataUrl,
    ) -> Result<ReferenceOutcome> {
        self.replace_entry_image::<Character>(story_id, character_id, image)
    }

    #[instrument(skip(self))]
    pub fn reanalyze_character(&mut self, story_id: &str, character_id: &str) -> Result<()> {
        self.reanalyze_entry::<Character>(story_id, character_id)
    }

    pub fn remove_character(&mut self, story_id: &str, character_id: &str, confirm: bool) -> Result<()> {
        self.remove_entry::<Character>(story_id, character_id, confirm)
    }

    #[instrument(skip(self, image))]
    pub fn add_background(&mut self, story_id: &str, name: &str, image: DataUrl) -> Result<ReferenceOutcome> {
        self.add_entry(story_id, Background::new(name.trim(), image))
    }

    pub fn rename_background(&mut self, story_id: &str, background_id: &str, name: &str) -> Result<()> {
        self.rename_entry::<Background>(story_id, background_id, name)
    }

    #[instrument(skip(self, image))]
    pub fn set_background_image(
        &mut self,
        story_id: &str,
        background_id: &str,
        image: DataUrl,
    ) -> Result<ReferenceOutcome> {
        self.replace_entry_image::<Background>(story_id, background_id, image)
    }

    #[instrument(skip(self))]
    pub fn reanalyze_background(&mut self, story_id: &str, background_id: &str) -> Result<()> {
        self.reanalyze_entry::<Background>(story_id, background_id)
    }

    pub fn remove_background(&mut self, story_id: &str, background_id: &str, confirm: bool) -> Result<()> {
        self.remove_entry::<Background>(story_id, background_id, confirm)
    }

    /// Sets the art style reference; returns the analysis error, if any.
    #[instrument(skip(self, image))]
    pub fn set_art_style(&mut self, story_id: &str, image: DataUrl) -> Result<Option<FolioError>> {
        let previous = self.book.get(story_id)?.art_style.clone();
        let mut style = ArtStyleReference {
            image: image.clone(),
            description: previous.as_ref().and_then(|style| style.description.clone()),
            analysis: previous.and_then(|style| style.analysis),
        };
        let analysis_error =
            match self.run_analysis::<ArtStyleAnalysis>(story_id, "art_style", &image) {
                Ok(outcome) => {
                    style.description = Some(outcome.description);
                    style.analysis = Some(outcome.analysis);
                    None
                }
                Err(err) => Some(err),
            };
        self.commit(story_id, StoryUpdate::ArtStyle(Some(style)))?;
        Ok(analysis_error)
    }

    pub fn clear_art_style(&mut self, story_id: &str) -> Result<()> {
        self.commit(story_id, StoryUpdate::ArtStyle(None))?;
        Ok(())
    }

    /// The preview prompt for a scene, recomputed from the current roster.
    pub fn compose_scene_prompt(&self, story_id: &str, scene_id: &str) -> Result<String> {
        let story = self.book.get(story_id)?;
        let (scene, previous) = story.scene_with_previous(scene_id)?;
        let characters = select_relevant_characters(scene, previous, &story.characters);
        let backgrounds = select_relevant_backgrounds(scene, &story.backgrounds);
        let style = story.art_style_description();
        Ok(compose_prompt(
            scene,
            &characters,
            &backgrounds,
            style.as_deref(),
            scene.shot_type,
        ))
    }

    /// Two-phase generation.
    ///
    /// Without a stored prompt this composes one, stores it and stops so it
    /// can be reviewed. With a prompt it requests the image; on failure the
    /// scene returns to its previous settled stage with the prompt intact.
    #[instrument(skip(self))]
    pub fn generate(&mut self, story_id: &str, scene_id: &str) -> Result<GenerateOutcome> {
        let scene = self.book.get(story_id)?.scene(scene_id)?;
        if scene.is_generating() {
            return Err(FolioError::AlreadyGenerating(scene_id.to_string()).into());
        }
        match scene.prompt() {
            None => {
                let prompt = self.compose_scene_prompt(story_id, scene_id)?;
                self.commit(
                    story_id,
                    StoryUpdate::scene(scene_id, ScenePatch::CustomPrompt(Some(prompt.clone()))),
                )?;
                self.events.record(
                    "prompt_composed",
                    map_object(json!({
                        "story_id": story_id,
                        "scene_id": scene_id,
                        "prompt": prompt,
                    })),
                );
                Ok(GenerateOutcome::PromptComposed(prompt))
            }
            Some(prompt) => {
                let prompt = prompt.to_string();
                self.generate_image(story_id, scene_id, &prompt)
                    .map(GenerateOutcome::ImageGenerated)
            }
        }
    }

    fn generate_image(&mut self, story_id: &str, scene_id: &str, prompt: &str) -> Result<DataUrl> {
        let request = {
            let story = self.book.get(story_id)?;
            let (scene, previous) = story.scene_with_previous(scene_id)?;
            let characters = select_relevant_characters(scene, previous, &story.characters);
            let backgrounds = select_relevant_backgrounds(scene, &story.backgrounds);
            build_generation_request(
                scene,
                prompt,
                References {
                    characters: &characters,
                    backgrounds: &backgrounds,
                    art_style: story.art_style.as_ref(),
                },
            )
        };

        self.book.apply(
            story_id,
            StoryUpdate::scene(scene_id, ScenePatch::Event(SceneEvent::GenerationStarted)),
        )?;
        self.events.record(
            "generation_started",
            map_object(json!({
                "story_id": story_id,
                "scene_id": scene_id,
                "model": self.model.name(),
                "references": request.images().count(),
            })),
        );

        let image = self
            .model
            .generate_image(&request)
            .and_then(|image| self.store_result(story_id, scene_id, image));
        match image {
            Ok(image) => {
                self.commit(story_id, StoryUpdate::scene(scene_id, ScenePatch::Image(image.clone())))?;
                tracing::info!(story_id, scene_id, "scene generated");
                self.events.record(
                    "scene_generated",
                    map_object(json!({
                        "story_id": story_id,
                        "scene_id": scene_id,
                        "mime_type": image.mime_type(),
                        "prompt": prompt,
                    })),
                );
                Ok(image)
            }
            Err(err) => {
                self.commit(
                    story_id,
                    StoryUpdate::scene(scene_id, ScenePatch::Event(SceneEvent::Failed)),
                )?;
                let failure = operation_failure(&err, |message| FolioError::Generation {
                    scene_id: scene_id.to_string(),
                    message,
                });
                tracing::warn!(story_id, scene_id, error = %failure, "generation failed");
                self.events.record(
                    "generation_failed",
                    map_object(json!({
                        "story_id": story_id,
                        "scene_id": scene_id,
                        "error": failure.to_string(),
                    })),
                );
                Err(failure.into())
            }
        }
    }

    fn store_result(&mut self, story_id: &str, scene_id: &str, image: DataUrl) -> Result<DataUrl> {
        self.repository.persist_scene_image(story_id, scene_id, &image)?;
        Ok(image)
    }

    /// Generates every scene without an image, one at a time.
    ///
    /// Scenes without a prompt only get one composed, leaving them at
    /// `PromptReady` for review, unless `auto_compose` is set. A failing
    /// scene is recorded in the report and the sweep moves on.
    #[instrument(skip(self, progress))]
    pub fn generate_all(
        &mut self,
        story_id: &str,
        auto_compose: bool,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<BatchReport> {
        let pending = self
            .book
            .get(story_id)?
            .scenes
            .iter()
            .filter(|scene| scene.image.is_none() && !scene.is_generating())
            .map(|scene| scene.id.clone())
            .collect::<Vec<String>>();
        let mut report = BatchReport {
            total: pending.len(),
            ..BatchReport::default()
        };

        for (idx, scene_id) in pending.iter().enumerate() {
            progress(idx + 1, report.total);
            self.events.record(
                "batch_progress",
                map_object(json!({
                    "story_id": story_id,
                    "scene_id": scene_id,
                    "current": idx + 1,
                    "total": report.total,
                })),
            );
            match self.sweep_scene(story_id, scene_id, auto_compose) {
                Ok(GenerateOutcome::ImageGenerated(_)) => report.generated.push(scene_id.clone()),
                Ok(GenerateOutcome::PromptComposed(_)) => report.composed.push(scene_id.clone()),
                Err(err) => {
                    let message = format!("{err:#}");
                    tracing::warn!(story_id, scene_id = %scene_id, error = %message, "skipping failed scene");
                    report.failed.push((scene_id.clone(), message));
                }
            }
        }

        self.events.record(
            "batch_finished",
            map_object(json!({
                "story_id": story_id,
                "total": report.total,
                "generated": report.generated.len(),
                "composed": report.composed.len(),
                "failed": report.failed.len(),
            })),
        );
        Ok(report)
    }

    fn sweep_scene(
        &mut self,
        story_id: &str,
        scene_id: &str,
        auto_compose: bool,
    ) -> Result<GenerateOutcome> {
        match self.generate(story_id, scene_id)? {
            GenerateOutcome::PromptComposed(_) if auto_compose => self.generate(story_id, scene_id),
            outcome => Ok(outcome),
        }
    }

    /// Applies a free-text edit to an existing scene image.
    #[instrument(skip(self))]
    pub fn edit(&mut self, story_id: &str, scene_id: &str, instruction: &str) -> Result<DataUrl> {
        if instruction.trim().is_empty() {
            return Err(FolioError::validation("edit instruction is empty").into());
        }
        let scene = self.book.get(story_id)?.scene(scene_id)?;
        if scene.is_generating() {
            return Err(FolioError::AlreadyGenerating(scene_id.to_string()).into());
        }
        let original = scene.image.clone().ok_or_else(|| {
            FolioError::validation(format!("scene '{scene_id}' has no image to edit"))
        })?;
        original.decode()?;
        let request = build_edit_request(&original, instruction, scene.aspect_ratio);

        self.book.apply(
            story_id,
            StoryUpdate::scene(scene_id, ScenePatch::Event(SceneEvent::EditStarted)),
        )?;
        let image = self
            .model
            .generate_image(&request)
            .and_then(|image| self.store_result(story_id, scene_id, image));
        match image {
            Ok(image) => {
                self.commit(story_id, StoryUpdate::scene(scene_id, ScenePatch::Image(image.clone())))?;
                self.events.record(
                    "scene_edited",
                    map_object(json!({
                        "story_id": story_id,
                        "scene_id": scene_id,
                        "instruction": instruction.trim(),
                    })),
                );
                Ok(image)
            }
            Err(err) => {
                self.commit(
                    story_id,
                    StoryUpdate::scene(scene_id, ScenePatch::Event(SceneEvent::Failed)),
                )?;
                let failure = operation_failure(&err, |message| FolioError::Edit {
                    scene_id: scene_id.to_string(),
                    message,
                });
                self.events.record(
                    "edit_failed",
                    map_object(json!({
                        "story_id": story_id,
                        "scene_id": scene_id,
                        "error": failure.to_string(),
                    })),
                );
                Err(failure.into())
            }
        }
    }

    /// Rewrites a scene description; the stored prompt follows the studio's policy.
    pub fn edit_description(&mut self, story_id: &str, scene_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FolioError::validation("scene description is empty").into());
        }
        self.commit(
            story_id,
            StoryUpdate::scene(
                scene_id,
                ScenePatch::Description {
                    text: text.to_string(),
                    policy: self.policy,
                },
            ),
        )?;
        Ok(())
    }

    /// Stores a reviewed prompt; the change is logged as a diff.
    pub fn set_custom_prompt(&mut self, story_id: &str, scene_id: &str, prompt: &str) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(FolioError::validation("prompt is empty; clear it instead").into());
        }
        let previous = self
            .book
            .get(story_id)?
            .scene(scene_id)?
            .prompt()
            .unwrap_or_default()
            .to_string();
        self.commit(
            story_id,
            StoryUpdate::scene(scene_id, ScenePatch::CustomPrompt(Some(prompt.to_string()))),
        )?;
        self.events.record(
            "prompt_edited",
            map_object(json!({
                "story_id": story_id,
                "scene_id": scene_id,
                "diff": prompt_diff(&previous, prompt),
            })),
        );
        Ok(())
    }

    pub fn clear_custom_prompt(&mut self, story_id: &str, scene_id: &str) -> Result<()> {
        self.commit(story_id, StoryUpdate::scene(scene_id, ScenePatch::CustomPrompt(None)))?;
        Ok(())
    }

    pub fn set_shot_type(&mut self, story_id: &str, scene_id: &str, shot_type: ShotType) -> Result<()> {
        self.commit(story_id, StoryUpdate::scene(scene_id, ScenePatch::ShotType(shot_type)))?;
        Ok(())
    }

    pub fn set_aspect_ratio(&mut self, story_id: &str, scene_id: &str, ratio: AspectRatio) -> Result<()> {
        self.commit(story_id, StoryUpdate::scene(scene_id, ScenePatch::AspectRatio(ratio)))?;
        Ok(())
    }

    /// Writes queued snapshots once the quiet period has passed.
    pub fn flush_if_quiet(&mut self, now: Instant) -> Result<Option<SyncReport>> {
        let report = self.repository.flush_if_quiet(now)?;
        if let Some(report) = report.as_ref() {
            self.record_sync(report);
        }
        Ok(report)
    }

    pub fn flush(&mut self) -> Result<SyncReport> {
        let report = self.repository.flush()?;
        self.record_sync(&report);
        Ok(report)
    }

    fn record_sync(&self, report: &SyncReport) {
        if report.upserted == 0 && report.deleted == 0 {
            return;
        }
        self.events.record(
            "remote_synced",
            map_object(json!({ "upserted": report.upserted, "deleted": report.deleted })),
        );
    }
}

fn analysis_failure(kind: AnalysisKind, err: &anyhow::Error) -> FolioError {
    folio_error(err).cloned().unwrap_or_else(|| FolioError::Analysis {
        kind,
        message: format!("{err:#}"),
    })
}

/// Keeps data-integrity failures as they are; anything else is a call failure.
fn operation_failure(err: &anyhow::Error, call_failure: impl FnOnce(String) -> FolioError) -> FolioError {
    match folio_error(err) {
        Some(integrity @ FolioError::DataIntegrity(_)) => integrity.clone(),
        _ => call_failure(format!("{err:#}")),
    }
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use folio_contracts::cache::MemoryImageCache;
    use folio_contracts::story::SceneStage;
    use folio_contracts::store::{MemoryStore, Table};

    use super::*;
    use crate::testing::{art_style_json, background_json, character_json, png, ScriptedModel};

    type TestStudio = Studio<ScriptedModel, MemoryImageCache, MemoryStore>;

    fn studio_with(policy: PromptPolicy) -> anyhow::Result<TestStudio> {
        let repository = StoryRepository::new(
            MemoryImageCache::new(),
            MemoryStore::new(),
            Duration::from_millis(1500),
        );
        let (studio, _) = Studio::open(
            ScriptedModel::new(),
            repository,
            EventLog::disabled(),
            "reader-1",
            policy,
        )?;
        Ok(studio)
    }

    fn studio() -> anyhow::Result<TestStudio> {
        studio_with(PromptPolicy::KeepStale)
    }

    /// `(summary, comma-separated cast, location)` per scene.
    fn scenes(summaries: &[(&str, &str, &str)]) -> Value {
        json!({
            "scenes": summaries
                .iter()
                .map(|(summary, cast, location)| json!({
                    "summary": summary,
                    "characters": cast
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .collect::<Vec<&str>>(),
                    "location": location,
                    "mood": "tense",
                }))
                .collect::<Vec<Value>>()
        })
    }

    fn story_with_three_scenes<L: LocalCache, R: RemoteStore>(
        studio: &mut Studio<ScriptedModel, L, R>,
    ) -> anyhow::Result<Story> {
        studio.model.push_json(Ok(scenes(&[
            ("Kai wakes in the mill", "Kai", "old mill"),
            ("Kai meets Mira", "Kai, Mira", "harbour"),
            ("The storm breaks", "", "harbour"),
        ])));
        studio.create_story(Some("Harbour Lights"), "Kai woke in the mill. Mira waited at the harbour.")
    }

    #[test]
    fn create_story_segments_and_derives_title() -> anyhow::Result<()> {
        let mut studio = studio()?;
        studio.model.push_json(Ok(scenes(&[
            ("One", "", "a"),
            ("Two", "", "b"),
            ("Three", "", "c"),
        ])));
        studio.model.push_text(Ok("The Mill at Dawn".to_string()));
        let story = studio.create_story(None, "Kai woke.")?;

        assert_eq!(story.title, "The Mill at Dawn");
        assert_eq!(story.user_id, "reader-1");
        assert_eq!(story.scenes.len(), 3);
        assert!(story.scenes.iter().all(|scene| scene.stage == SceneStage::NoPrompt));
        assert_eq!(
            story.scenes[1].structured.as_ref().and_then(|s| s.location.as_deref()),
            Some("b")
        );
        assert!(studio.repository().has_pending_sync());
        Ok(())
    }

    #[test]
    fn create_story_fails_when_segmentation_fails() -> anyhow::Result<()> {
        let mut studio = studio()?;
        studio.model.push_json(Err("model offline".to_string()));
        let err = studio.create_story(None, "Kai woke.").unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::Segmentation(_))));
        assert_eq!(studio.stories().count(), 0);
        assert!(studio.model.text_requests().is_empty());

        let err = studio.create_story(None, "  ").unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::Validation(_))));
        Ok(())
    }

    #[test]
    fn first_generate_only_composes_prompt() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[0].id.clone();

        let outcome = studio.generate(&story.id, &scene_id)?;
        let GenerateOutcome::PromptComposed(prompt) = outcome else {
            panic!("expected a composed prompt");
        };
        assert!(prompt.starts_with("Scene: Kai wakes in the mill"));

        let scene = studio.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.custom_prompt.as_deref(), Some(prompt.as_str()));
        assert!(scene.image.is_none());
        assert!(!scene.is_generating());
        assert_eq!(scene.stage, SceneStage::PromptReady);
        assert!(studio.model.image_requests().is_empty());
        Ok(())
    }

    #[test]
    fn second_generate_produces_image_and_caches_it_first() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        studio.model.push_json(Ok(character_json()));
        let kai = studio.add_character(&story.id, "Kai", Some(png("kai")))?;
        assert!(kai.analysis_error.is_none());
        let scene_id = story.scenes[0].id.clone();

        studio.generate(&story.id, &scene_id)?;
        studio.set_custom_prompt(&story.id, &scene_id, "Kai wakes, dusty light through the slats.")?;
        studio.model.push_image(Ok(png("scene-1")));
        let outcome = studio.generate(&story.id, &scene_id)?;
        assert_eq!(outcome, GenerateOutcome::ImageGenerated(png("scene-1")));

        let scene = studio.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.image, Some(png("scene-1")));
        assert_eq!(scene.stage, SceneStage::Generated);
        assert_eq!(
            scene.custom_prompt.as_deref(),
            Some("Kai wakes, dusty light through the slats.")
        );

        let request = &studio.model.image_requests()[0];
        assert!(request.text().contains("Kai wakes, dusty light through the slats."));
        assert!(request.images().any(|image| *image == png("kai")));

        let cached = studio.repository.cache_mut().get(&story.id, &scene_id)?;
        assert_eq!(cached, Some(png("scene-1")));
        Ok(())
    }

    #[test]
    fn failed_generation_returns_to_prompt_ready() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[1].id.clone();
        studio.generate(&story.id, &scene_id)?;
        studio.model.push_image(Err("quota exceeded".to_string()));

        let err = studio.generate(&story.id, &scene_id).unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::Generation { .. })));
        let scene = studio.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.stage, SceneStage::PromptReady);
        assert!(scene.prompt().is_some());
        assert!(scene.image.is_none());
        Ok(())
    }

    #[test]
    fn generating_scene_rejects_a_second_request() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[0].id.clone();
        studio.generate(&story.id, &scene_id)?;
        studio.book.apply(
            &story.id,
            StoryUpdate::scene(&scene_id, ScenePatch::Event(SceneEvent::GenerationStarted)),
        )?;
        let err = studio.generate(&story.id, &scene_id).unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::AlreadyGenerating(_))));
        Ok(())
    }

    #[test]
    fn generate_all_skips_a_failing_scene() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        studio.model.push_image(Ok(png("one")));
        studio.model.push_image(Err("safety block".to_string()));
        studio.model.push_image(Ok(png("three")));

        let mut ticks = Vec::new();
        let report =
            studio.generate_all(&story.id, true, |current, total| ticks.push((current, total)))?;

        assert_eq!(ticks, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(report.total, 3);
        assert_eq!(report.generated, vec![story.scenes[0].id.clone(), story.scenes[2].id.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, story.scenes[1].id);

        let current = studio.story(&story.id)?;
        assert_eq!(current.scenes[0].image, Some(png("one")));
        assert_eq!(current.scenes[1].stage, SceneStage::PromptReady);
        assert_eq!(current.scenes[2].image, Some(png("three")));

        // Finished scenes are not regenerated.
        studio.model.push_image(Ok(png("two")));
        let retry = studio.generate_all(&story.id, true, |_, _| {})?;
        assert_eq!(retry.generated, vec![story.scenes[1].id.clone()]);
        assert_eq!(studio.model.image_requests().len(), 4);
        Ok(())
    }

    #[test]
    fn generate_all_stops_at_review_without_auto_compose() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        studio.set_custom_prompt(&story.id, &story.scenes[1].id, "Kai and Mira at the quay")?;
        studio.model.push_image(Ok(png("two")));

        let report = studio.generate_all(&story.id, false, |_, _| {})?;
        assert_eq!(report.total, 3);
        assert_eq!(report.generated, vec![story.scenes[1].id.clone()]);
        assert_eq!(
            report.composed,
            vec![story.scenes[0].id.clone(), story.scenes[2].id.clone()]
        );
        assert!(report.failed.is_empty());
        assert_eq!(studio.model.image_requests().len(), 1);

        let current = studio.story(&story.id)?;
        assert_eq!(current.scenes[0].stage, SceneStage::PromptReady);
        assert!(current.scenes[0].image.is_none());
        assert_eq!(current.scenes[2].stage, SceneStage::PromptReady);

        studio.model.push_image(Ok(png("one")));
        studio.model.push_image(Ok(png("three")));
        let approved = studio.generate_all(&story.id, false, |_, _| {})?;
        assert_eq!(approved.generated.len(), 2);
        assert!(approved.composed.is_empty());
        Ok(())
    }

    #[test]
    fn edit_replaces_image_and_keeps_it_on_failure() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[2].id.clone();

        let err = studio.edit(&story.id, &scene_id, "make it night").unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::Validation(_))));

        studio.generate(&story.id, &scene_id)?;
        studio.model.push_image(Ok(png("day")));
        studio.generate(&story.id, &scene_id)?;

        studio.model.push_image(Ok(png("night")));
        let edited = studio.edit(&story.id, &scene_id, "make it night")?;
        assert_eq!(edited, png("night"));
        let request = studio.model.image_requests()[1].clone();
        assert_eq!(request.parts[0], crate::model::Part::Image(png("day")));

        studio.model.push_image(Err("timeout".to_string()));
        let err = studio.edit(&story.id, &scene_id, "add rain").unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::Edit { .. })));
        let scene = studio.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.image, Some(png("night")));
        assert_eq!(scene.stage, SceneStage::Generated);
        Ok(())
    }

    #[test]
    fn data_integrity_failures_are_not_rewrapped() {
        let generation = |message| FolioError::Generation {
            scene_id: "s1".to_string(),
            message,
        };
        let missing = anyhow::Error::new(FolioError::data_integrity("no inline image (finish reason: SAFETY)"));
        assert!(matches!(
            operation_failure(&missing, generation),
            FolioError::DataIntegrity(_)
        ));
        let transport = anyhow::anyhow!("503 unavailable");
        assert_eq!(
            operation_failure(&transport, generation).to_string(),
            "image generation failed for scene 's1': 503 unavailable"
        );
    }

    #[test]
    fn description_edit_follows_prompt_policy() -> anyhow::Result<()> {
        for (policy, keeps_prompt) in [(PromptPolicy::KeepStale, true), (PromptPolicy::Invalidate, false)] {
            let mut studio = studio_with(policy)?;
            let story = story_with_three_scenes(&mut studio)?;
            let scene_id = story.scenes[0].id.clone();
            studio.generate(&story.id, &scene_id)?;
            studio.edit_description(&story.id, &scene_id, "Kai sleeps through the storm")?;

            let scene = studio.story(&story.id)?.scene(&scene_id)?;
            assert_eq!(scene.description, "Kai sleeps through the storm");
            assert_eq!(scene.prompt().is_some(), keeps_prompt, "{policy}");
        }
        Ok(())
    }

    #[test]
    fn analysis_failure_keeps_previous_analysis_and_new_image() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        studio.model.push_json(Ok(character_json()));
        let kai = studio.add_character(&story.id, "Kai", Some(png("kai-v1")))?;

        studio.model.push_json(Err("vision model unavailable".to_string()));
        let outcome = studio.set_character_image(&story.id, &kai.id, png("kai-v2"))?;
        assert!(matches!(
            outcome.analysis_error,
            Some(FolioError::Analysis { kind: AnalysisKind::Character, .. })
        ));

        let character = studio.story(&story.id)?.character(&kai.id)?;
        assert_eq!(character.image, Some(png("kai-v2")));
        assert_eq!(
            character.analysis.as_ref().map(|a| a.hair.color.as_str()),
            Some("jet black")
        );

        studio.model.push_json(Err("still down".to_string()));
        assert!(studio.reanalyze_character(&story.id, &kai.id).is_err());
        Ok(())
    }

    #[test]
    fn roster_edits_and_confirmed_removal() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;

        let mira = studio.add_character(&story.id, "Mira", None)?;
        studio.rename_character(&story.id, &mira.id, "Mira Vale")?;
        assert_eq!(studio.story(&story.id)?.character(&mira.id)?.name, "Mira Vale");
        assert_eq!(studio.model.json_requests().len(), 1);

        let err = studio.reanalyze_character(&story.id, &mira.id).unwrap_err();
        assert!(matches!(folio_error(&err), Some(FolioError::Validation(_))));

        let err = studio.remove_character(&story.id, &mira.id, false).unwrap_err();
        assert!(matches!(
            folio_error(&err),
            Some(FolioError::ConfirmationRequired { entity: "character", .. })
        ));
        studio.remove_character(&story.id, &mira.id, true)?;
        assert!(studio.story(&story.id)?.characters.is_empty());

        studio.model.push_json(Ok(background_json()));
        let harbour = studio.add_background(&story.id, "harbour", png("harbour"))?;
        let background = studio.story(&story.id)?.background(&harbour.id)?;
        assert!(background.analysis.is_some());
        studio.rename_background(&story.id, &harbour.id, "quay")?;
        studio.remove_background(&story.id, &harbour.id, true)?;
        assert!(studio.story(&story.id)?.backgrounds.is_empty());
        Ok(())
    }

    #[test]
    fn art_style_is_attached_as_technique_reference() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        studio.model.push_json(Ok(art_style_json()));
        assert!(studio.set_art_style(&story.id, png("style"))?.is_none());

        let scene_id = story.scenes[0].id.clone();
        let prompt = studio.compose_scene_prompt(&story.id, &scene_id)?;
        assert!(prompt.contains("ART STYLE (technique only)\nMedium: watercolour"));

        studio.generate(&story.id, &scene_id)?;
        studio.model.push_image(Ok(png("styled")));
        studio.generate(&story.id, &scene_id)?;
        let request = &studio.model.image_requests()[0];
        assert_eq!(request.images().next(), Some(&png("style")));

        studio.clear_art_style(&story.id)?;
        assert!(studio.story(&story.id)?.art_style.is_none());
        Ok(())
    }

    #[test]
    fn prompt_and_framing_edits() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[0].id.clone();

        studio.set_shot_type(&story.id, &scene_id, ShotType::CloseUp)?;
        studio.set_aspect_ratio(&story.id, &scene_id, AspectRatio::Square)?;
        studio.set_custom_prompt(&story.id, &scene_id, "Close on Kai's face")?;
        let scene = studio.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.shot_type, ShotType::CloseUp);
        assert_eq!(scene.aspect_ratio, AspectRatio::Square);
        assert_eq!(scene.stage, SceneStage::PromptReady);

        assert!(studio.set_custom_prompt(&story.id, &scene_id, "   ").is_err());
        studio.clear_custom_prompt(&story.id, &scene_id)?;
        let scene = studio.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.stage, SceneStage::NoPrompt);
        Ok(())
    }

    #[test]
    fn shot_change_after_compose_keeps_one_framing_directive() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[0].id.clone();

        studio.set_shot_type(&story.id, &scene_id, ShotType::CloseUp)?;
        studio.generate(&story.id, &scene_id)?;
        studio.set_shot_type(&story.id, &scene_id, ShotType::Wide)?;

        let prompt = studio
            .story(&story.id)?
            .scene(&scene_id)?
            .prompt()
            .unwrap_or_default()
            .to_string();
        assert!(prompt.contains("Shot (wide)"));
        assert!(!prompt.contains("close-up"));

        studio.model.push_image(Ok(png("wide")));
        studio.generate(&story.id, &scene_id)?;
        let text = studio.model.image_requests()[0].text();
        assert_eq!(text.matches("Compose this").count(), 1, "{text}");
        assert!(text.contains("Shot (wide)"));
        assert!(!text.contains("CAMERA"));
        Ok(())
    }

    #[test]
    fn cached_image_survives_a_missed_remote_sync() -> anyhow::Result<()> {
        use folio_contracts::cache::FileImageCache;
        use folio_contracts::store::JsonTableStore;

        let dir = tempfile::tempdir()?;
        let open = |model: ScriptedModel| -> anyhow::Result<_> {
            let repository = StoryRepository::new(
                FileImageCache::new(dir.path().join("images.json")),
                JsonTableStore::open(dir.path().join("tables.json"))?,
                Duration::from_millis(1500),
            );
            Studio::open(model, repository, EventLog::disabled(), "reader-1", PromptPolicy::KeepStale)
        };

        let (mut studio, _) = open(ScriptedModel::new())?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[0].id.clone();
        studio.generate(&story.id, &scene_id)?;
        studio.flush()?;
        studio.model.push_image(Ok(png("kept")));
        studio.generate(&story.id, &scene_id)?;
        drop(studio);

        let (reopened, report) = open(ScriptedModel::new())?;
        assert_eq!(report.stories, 1);
        assert_eq!(report.local_images, 1);
        let scene = reopened.story(&story.id)?.scene(&scene_id)?;
        assert_eq!(scene.image, Some(png("kept")));
        assert_eq!(scene.stage, SceneStage::Generated);
        Ok(())
    }

    #[test]
    fn flush_mirrors_story_and_delete_removes_everything() -> anyhow::Result<()> {
        let mut studio = studio()?;
        let story = story_with_three_scenes(&mut studio)?;
        let scene_id = story.scenes[0].id.clone();
        studio.generate(&story.id, &scene_id)?;
        studio.model.push_image(Ok(png("img")));
        studio.generate(&story.id, &scene_id)?;

        assert!(studio.flush_if_quiet(Instant::now())?.is_none());
        let report = studio.flush()?;
        assert!(report.upserted >= 4);
        assert_eq!(studio.repository().remote().row_count(Table::Scenes), 3);
        assert!(!studio.repository().has_pending_sync());

        studio.delete_story(&story.id)?;
        assert_eq!(studio.stories().count(), 0);
        assert_eq!(studio.repository().remote().row_count(Table::Stories), 0);
        assert!(studio.repository.cache_mut().is_empty());
        Ok(())
    }
}
