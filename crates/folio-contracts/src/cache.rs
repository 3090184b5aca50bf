//! Device-local scene image cache.
//!
//! The cache is the source of truth for image bytes: a generated image is
//! written here before any in-memory or remote state changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::data_url::DataUrl;

pub fn scene_image_key(story_id: &str, scene_id: &str) -> String {
    format!("scene_image_{story_id}_{scene_id}")
}

fn story_prefix(story_id: &str) -> String {
    format!("scene_image_{story_id}_")
}

pub trait LocalCache {
    fn get(&mut self, story_id: &str, scene_id: &str) -> anyhow::Result<Option<DataUrl>>;
    fn put(&mut self, story_id: &str, scene_id: &str, image: &DataUrl) -> anyhow::Result<()>;
    fn delete(&mut self, story_id: &str, scene_id: &str) -> anyhow::Result<()>;
    /// Removes every image cached for the story; returns how many were dropped.
    fn delete_all_for_story(&mut self, story_id: &str) -> anyhow::Result<usize>;
}

/// JSON-file cache that merges with concurrent writers on every flush.
#[derive(Debug, Clone)]
pub struct FileImageCache {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
    removed_keys: Vec<String>,
}

impl FileImageCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
            removed_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || (self.dirty_keys.is_empty() && self.removed_keys.is_empty()) {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        for key in &self.removed_keys {
            on_disk.remove(key);
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        self.removed_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        self.payload
            .insert(read_json_object(&self.path).unwrap_or_default())
    }

    fn mark_dirty(&mut self, key: &str) {
        self.removed_keys.retain(|existing| existing != key);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
    }

    fn mark_removed(&mut self, key: &str) {
        self.dirty_keys.retain(|existing| existing != key);
        if !self.removed_keys.iter().any(|existing| existing == key) {
            self.removed_keys.push(key.to_string());
        }
    }
}

impl LocalCache for FileImageCache {
    fn get(&mut self, story_id: &str, scene_id: &str) -> anyhow::Result<Option<DataUrl>> {
        let key = scene_image_key(story_id, scene_id);
        let payload = self.ensure_loaded();
        let Some(raw) = payload.get(&key).and_then(Value::as_str) else {
            return Ok(None);
        };
        match DataUrl::parse(raw) {
            Ok(image) => Ok(Some(image)),
            Err(err) => {
                tracing::warn!(%key, error = %err, "ignoring corrupt cached image");
                Ok(None)
            }
        }
    }

    fn put(&mut self, story_id: &str, scene_id: &str, image: &DataUrl) -> anyhow::Result<()> {
        let key = scene_image_key(story_id, scene_id);
        let snapshot = Value::String(image.to_string());
        let payload = self.ensure_loaded();
        if payload.get(&key) == Some(&snapshot) {
            return Ok(());
        }
        payload.insert(key.clone(), snapshot);
        self.mark_dirty(&key);
        self.flush()
    }

    fn delete(&mut self, story_id: &str, scene_id: &str) -> anyhow::Result<()> {
        let key = scene_image_key(story_id, scene_id);
        let payload = self.ensure_loaded();
        if payload.remove(&key).is_none() {
            return Ok(());
        }
        self.mark_removed(&key);
        self.flush()
    }

    fn delete_all_for_story(&mut self, story_id: &str) -> anyhow::Result<usize> {
        let prefix = story_prefix(story_id);
        let payload = self.ensure_loaded();
        let keys = payload
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect::<Vec<String>>();
        for key in &keys {
            payload.remove(key);
        }
        for key in &keys {
            self.mark_removed(key);
        }
        self.flush()?;
        Ok(keys.len())
    }
}

/// In-process cache; nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryImageCache {
    images: BTreeMap<String, DataUrl>,
}

impl MemoryImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl LocalCache for MemoryImageCache {
    fn get(&mut self, story_id: &str, scene_id: &str) -> anyhow::Result<Option<DataUrl>> {
        Ok(self.images.get(&scene_image_key(story_id, scene_id)).cloned())
    }

    fn put(&mut self, story_id: &str, scene_id: &str, image: &DataUrl) -> anyhow::Result<()> {
        self.images
            .insert(scene_image_key(story_id, scene_id), image.clone());
        Ok(())
    }

    fn delete(&mut self, story_id: &str, scene_id: &str) -> anyhow::Result<()> {
        self.images.remove(&scene_image_key(story_id, scene_id));
        Ok(())
    }

    fn delete_all_for_story(&mut self, story_id: &str) -> anyhow::Result<usize> {
        let prefix = story_prefix(story_id);
        let before = self.images.len();
        self.images.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - self.images.len())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
