//! Two-tier persistence: local image cache plus a debounced remote mirror.

use std::time::{Duration, Instant};

use anyhow::Context;
use indexmap::IndexMap;

use crate::cache::LocalCache;
use crate::data_url::DataUrl;
use crate::state::StoryBook;
use crate::store::{self, RemoteStore, SyncReport};
use crate::story::Story;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1500);

/// Coalesces story snapshots until writes have been quiet for a while.
#[derive(Debug, Clone)]
pub struct SyncDebouncer {
    quiet: Duration,
    pending: IndexMap<String, Story>,
    last_change: Option<Instant>,
}

impl SyncDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: IndexMap::new(),
            last_change: None,
        }
    }

    /// Queues the latest snapshot of a story and restarts the quiet period.
    pub fn schedule(&mut self, story: &Story, now: Instant) {
        self.pending.insert(story.id.clone(), story.clone());
        self.last_change = Some(now);
    }

    pub fn cancel(&mut self, story_id: &str) {
        self.pending.shift_remove(story_id);
        if self.pending.is_empty() {
            self.last_change = None;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_quiet(&self, now: Instant) -> bool {
        match self.last_change {
            Some(last) if self.has_pending() => now.saturating_duration_since(last) >= self.quiet,
            _ => false,
        }
    }

    fn pending_ids(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }
}

/// What a session load found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub stories: usize,
    /// Remote-only images copied into the local cache.
    pub migrated_images: usize,
    /// Scenes whose image came from the local cache.
    pub local_images: usize,
}

pub struct StoryRepository<L, R> {
    cache: L,
    remote: R,
    debouncer: SyncDebouncer,
}

impl<L: LocalCache, R: RemoteStore> StoryRepository<L, R> {
    pub fn new(cache: L, remote: R, quiet: Duration) -> Self {
        Self {
            cache,
            remote,
            debouncer: SyncDebouncer::new(quiet),
        }
    }

    pub fn cache_mut(&mut self) -> &mut L {
        &mut self.cache
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn has_pending_sync(&self) -> bool {
        self.debouncer.has_pending()
    }

    /// Start-of-session sync for one user.
    ///
    /// Remote rows decide story metadata; the local cache decides image
    /// bytes. Remote-only images are migrated into the cache.
    pub fn load_session(&mut self, user_id: &str) -> anyhow::Result<(StoryBook, SessionReport)> {
        let mut book = StoryBook::new();
        let mut report = SessionReport::default();

        for story_id in self.remote.story_ids_for_user(user_id)? {
            let Some(mut story) = store::load_story(&self.remote, &story_id)
                .with_context(|| format!("failed loading story {story_id}"))?
            else {
                continue;
            };
            for scene in &mut story.scenes {
                match self.cache.get(&story.id, &scene.id)? {
                    Some(local) => {
                        scene.image = Some(local);
                        report.local_images += 1;
                    }
                    None => {
                        if let Some(remote) = scene.image.as_ref() {
                            self.cache.put(&story.id, &scene.id, remote)?;
                            report.migrated_images += 1;
                        }
                    }
                }
                scene.settle();
            }
            book.insert(story);
            report.stories += 1;
        }

        tracing::debug!(
            user_id,
            stories = report.stories,
            migrated = report.migrated_images,
            "session loaded"
        );
        Ok((book, report))
    }

    /// Writes a finished image to the local cache; nothing else is touched.
    pub fn persist_scene_image(
        &mut self,
        story_id: &str,
        scene_id: &str,
        image: &DataUrl,
    ) -> anyhow::Result<()> {
        self.cache
            .put(story_id, scene_id, image)
            .with_context(|| format!("failed caching image for scene {scene_id}"))
    }

    pub fn schedule_sync(&mut self, story: &Story, now: Instant) {
        self.debouncer.schedule(story, now);
    }

    /// Flushes pending snapshots when the quiet period has elapsed.
    pub fn flush_if_quiet(&mut self, now: Instant) -> anyhow::Result<Option<SyncReport>> {
        if !self.debouncer.is_quiet(now) {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    /// Writes every pending snapshot now. Snapshots that fail stay queued.
    pub fn flush(&mut self) -> anyhow::Result<SyncReport> {
        let mut total = SyncReport::default();
        for story_id in self.debouncer.pending_ids() {
            let Some(story) = self.debouncer.pending.get(&story_id) else {
                continue;
            };
            let report = store::save_story(&mut self.remote, story)
                .with_context(|| format!("failed syncing story {story_id}"))?;
            total.upserted += report.upserted;
            total.deleted += report.deleted;
            self.debouncer.cancel(&story_id);
        }
        if total.upserted > 0 {
            tracing::debug!(upserted = total.upserted, deleted = total.deleted, "remote sync");
        }
        Ok(total)
    }

    /// Removes the story rows and every cached image of the story.
    pub fn delete_story(&mut self, story_id: &str) -> anyhow::Result<usize> {
        self.debouncer.cancel(story_id);
        let rows = store::delete_story(&mut self.remote, story_id)?;
        let images = self.cache.delete_all_for_story(story_id)?;
        tracing::debug!(story_id, rows, images, "story deleted");
        Ok(rows)
    }
}
