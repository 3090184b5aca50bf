//! Durable relational mirror of stories.
//!
//! Four tables (stories, scenes, characters, backgrounds) hold one row per
//! entity. A save upserts every row of a story and deletes rows that are no
//! longer present in memory. Images travel inline as data-URL columns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::analysis::{BackgroundAnalysis, CharacterAnalysis};
use crate::data_url::DataUrl;
use crate::error::FolioError;
use crate::story::{
    ArtStyleReference, AspectRatio, Background, Character, Scene, SceneStage, ShotType, Story,
    StructuredSceneDescription,
};

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Stories,
    Scenes,
    Characters,
    Backgrounds,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Self::Stories,
        Self::Scenes,
        Self::Characters,
        Self::Backgrounds,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Stories => "stories",
            Self::Scenes => "scenes",
            Self::Characters => "characters",
            Self::Backgrounds => "backgrounds",
        }
    }

    /// Column tying a row to its story; stories are keyed by their own id.
    fn story_column(self) -> &'static str {
        match self {
            Self::Stories => "id",
            _ => "story_id",
        }
    }
}

pub trait RemoteStore {
    fn upsert(&mut self, table: Table, rows: Vec<Record>) -> anyhow::Result<()>;
    fn delete(&mut self, table: Table, ids: &[String]) -> anyhow::Result<()>;
    fn rows_for_story(&self, table: Table, story_id: &str) -> anyhow::Result<Vec<Record>>;
    fn story_ids_for_user(&self, user_id: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub novel_text: String,
    pub art_style: Option<ArtStyleReference>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRow {
    pub id: String,
    pub story_id: String,
    pub description: String,
    pub shot_type: ShotType,
    pub aspect_ratio: AspectRatio,
    pub image_url: Option<String>,
    pub order_index: i64,
    pub custom_prompt: Option<String>,
    pub structured: Option<StructuredSceneDescription>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRow {
    pub id: String,
    pub story_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub order_index: i64,
    pub description: Option<String>,
    pub analysis: Option<CharacterAnalysis>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundRow {
    pub id: String,
    pub story_id: String,
    pub name: String,
    pub image_url: String,
    pub order_index: i64,
    pub description: Option<String>,
    pub analysis: Option<BackgroundAnalysis>,
    pub created_at: DateTime<Utc>,
}

/// Row-level outcome of one story save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub upserted: usize,
    pub deleted: usize,
}

/// Upserts every row of `story` and deletes rows missing from it.
pub fn save_story<R: RemoteStore + ?Sized>(store: &mut R, story: &Story) -> anyhow::Result<SyncReport> {
    let now = Utc::now();
    let mut report = SyncReport::default();

    let story_row = StoryRow {
        id: story.id.clone(),
        user_id: story.user_id.clone(),
        title: story.title.clone(),
        novel_text: story.novel_text.clone(),
        art_style: story.art_style.clone(),
        created_at: story.created_at,
        updated_at: story.updated_at,
    };
    store.upsert(Table::Stories, vec![to_record(&story_row)?])?;
    report.upserted += 1;

    let scenes = story
        .scenes
        .iter()
        .enumerate()
        .map(|(idx, scene)| {
            to_record(&SceneRow {
                id: scene.id.clone(),
                story_id: story.id.clone(),
                description: scene.description.clone(),
                shot_type: scene.shot_type,
                aspect_ratio: scene.aspect_ratio,
                image_url: scene.image.as_ref().map(DataUrl::to_string),
                order_index: idx as i64,
                custom_prompt: scene.custom_prompt.clone(),
                structured: scene.structured.clone(),
                created_at: story.created_at,
                updated_at: now,
            })
        })
        .collect::<anyhow::Result<Vec<Record>>>()?;
    report = sync_table(store, Table::Scenes, &story.id, scenes, report)?;

    let characters = story
        .characters
        .iter()
        .enumerate()
        .map(|(idx, character)| {
            to_record(&CharacterRow {
                id: character.id.clone(),
                story_id: story.id.clone(),
                name: character.name.clone(),
                image_url: character.image.as_ref().map(DataUrl::to_string),
                order_index: idx as i64,
                description: character.description.clone(),
                analysis: character.analysis.clone(),
                created_at: story.created_at,
            })
        })
        .collect::<anyhow::Result<Vec<Record>>>()?;
    report = sync_table(store, Table::Characters, &story.id, characters, report)?;

    let backgrounds = story
        .backgrounds
        .iter()
        .enumerate()
        .map(|(idx, background)| {
            to_record(&BackgroundRow {
                id: background.id.clone(),
                story_id: story.id.clone(),
                name: background.name.clone(),
                image_url: background.image.to_string(),
                order_index: idx as i64,
                description: background.description.clone(),
                analysis: background.analysis.clone(),
                created_at: story.created_at,
            })
        })
        .collect::<anyhow::Result<Vec<Record>>>()?;
    report = sync_table(store, Table::Backgrounds, &story.id, backgrounds, report)?;

    Ok(report)
}

fn sync_table<R: RemoteStore + ?Sized>(
    store: &mut R,
    table: Table,
    story_id: &str,
    rows: Vec<Record>,
    mut report: SyncReport,
) -> anyhow::Result<SyncReport> {
    let keep = rows
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect::<BTreeSet<String>>();
    let stale = store
        .rows_for_story(table, story_id)?
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str))
        .filter(|id| !keep.contains(*id))
        .map(str::to_string)
        .collect::<Vec<String>>();

    report.upserted += rows.len();
    if !rows.is_empty() {
        store.upsert(table, rows)?;
    }
    if !stale.is_empty() {
        report.deleted += stale.len();
        store.delete(table, &stale)?;
    }
    Ok(report)
}

/// Rebuilds a story from its rows; `None` when the story row is absent.
///
/// Scene stages are inferred from the stored prompt and image.
pub fn load_story<R: RemoteStore + ?Sized>(store: &R, story_id: &str) -> anyhow::Result<Option<Story>> {
    let Some(story_row) = store
        .rows_for_story(Table::Stories, story_id)?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    let story_row: StoryRow = from_record(story_row, Table::Stories)?;

    let mut scene_rows: Vec<SceneRow> = rows_of(store, Table::Scenes, story_id)?;
    scene_rows.sort_by_key(|row| row.order_index);
    let scenes = scene_rows
        .into_iter()
        .map(|row| {
            let image = parse_image_column(Table::Scenes, &row.id, row.image_url.as_deref())?;
            let mut scene = Scene {
                id: row.id,
                description: row.description,
                structured: row.structured,
                image,
                custom_prompt: row.custom_prompt,
                stage: SceneStage::NoPrompt,
                shot_type: row.shot_type,
                aspect_ratio: row.aspect_ratio,
            };
            scene.settle();
            Ok(scene)
        })
        .collect::<Result<Vec<Scene>, FolioError>>()?;

    let mut character_rows: Vec<CharacterRow> = rows_of(store, Table::Characters, story_id)?;
    character_rows.sort_by_key(|row| row.order_index);
    let characters = character_rows
        .into_iter()
        .map(|row| {
            let image = parse_image_column(Table::Characters, &row.id, row.image_url.as_deref())?;
            Ok(Character {
                id: row.id,
                name: row.name,
                image,
                description: row.description,
                analysis: row.analysis,
            })
        })
        .collect::<Result<Vec<Character>, FolioError>>()?;

    let mut background_rows: Vec<BackgroundRow> = rows_of(store, Table::Backgrounds, story_id)?;
    background_rows.sort_by_key(|row| row.order_index);
    let mut backgrounds = Vec::new();
    for row in background_rows {
        let Some(image) = parse_image_column(Table::Backgrounds, &row.id, Some(&row.image_url))?
        else {
            return Err(FolioError::data_integrity(format!(
                "background '{}' has no image",
                row.id
            ))
            .into());
        };
        backgrounds.push(Background {
            id: row.id,
            name: row.name,
            image,
            description: row.description,
            analysis: row.analysis,
        });
    }

    Ok(Some(Story {
        id: story_row.id,
        user_id: story_row.user_id,
        title: story_row.title,
        novel_text: story_row.novel_text,
        characters,
        backgrounds,
        art_style: story_row.art_style,
        scenes,
        created_at: story_row.created_at,
        updated_at: story_row.updated_at,
    }))
}

/// Deletes the story row and every child row.
pub fn delete_story<R: RemoteStore + ?Sized>(store: &mut R, story_id: &str) -> anyhow::Result<usize> {
    let mut deleted = 0;
    for table in [Table::Scenes, Table::Characters, Table::Backgrounds, Table::Stories] {
        let ids = store
            .rows_for_story(table, story_id)?
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect::<Vec<String>>();
        if ids.is_empty() {
            continue;
        }
        deleted += ids.len();
        store.delete(table, &ids)?;
    }
    Ok(deleted)
}

fn rows_of<R: RemoteStore + ?Sized, T: DeserializeOwned>(
    store: &R,
    table: Table,
    story_id: &str,
) -> anyhow::Result<Vec<T>> {
    store
        .rows_for_story(table, story_id)?
        .into_iter()
        .map(|row| from_record(row, table))
        .collect()
}

/// An unreadable column fails the load; saving a story rebuilt without it
/// would overwrite or delete the stored row.
fn parse_image_column(
    table: Table,
    row_id: &str,
    raw: Option<&str>,
) -> Result<Option<DataUrl>, FolioError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    DataUrl::parse(raw).map(Some).map_err(|err| {
        FolioError::data_integrity(format!(
            "unreadable image in '{}' row '{row_id}': {err}",
            table.name()
        ))
    })
}

fn to_record<T: Serialize>(row: &T) -> anyhow::Result<Record> {
    match serde_json::to_value(row)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("row serialized to non-object JSON: {other}"),
    }
}

fn from_record<T: DeserializeOwned>(row: Record, table: Table) -> anyhow::Result<T> {
    serde_json::from_value(Value::Object(row))
        .with_context(|| format!("malformed row in '{}' table", table.name()))
}

/// In-process table store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStore {
    tables: BTreeMap<Table, IndexMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.tables.get(&table).map(IndexMap::len).unwrap_or(0)
    }
}

impl RemoteStore for MemoryStore {
    fn upsert(&mut self, table: Table, rows: Vec<Record>) -> anyhow::Result<()> {
        let entries = self.tables.entry(table).or_default();
        for row in rows {
            let Some(id) = row.get("id").and_then(Value::as_str).map(str::to_string) else {
                anyhow::bail!("row for '{}' has no id", table.name());
            };
            entries.insert(id, row);
        }
        Ok(())
    }

    fn delete(&mut self, table: Table, ids: &[String]) -> anyhow::Result<()> {
        if let Some(entries) = self.tables.get_mut(&table) {
            for id in ids {
                entries.shift_remove(id);
            }
        }
        Ok(())
    }

    fn rows_for_story(&self, table: Table, story_id: &str) -> anyhow::Result<Vec<Record>> {
        let column = table.story_column();
        Ok(self
            .tables
            .get(&table)
            .map(|entries| {
                entries
                    .values()
                    .filter(|row| row.get(column).and_then(Value::as_str) == Some(story_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn story_ids_for_user(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .tables
            .get(&Table::Stories)
            .map(|entries| {
                entries
                    .values()
                    .filter(|row| row.get("user_id").and_then(Value::as_str) == Some(user_id))
                    .filter_map(|row| row.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Table store persisted as one JSON document, rewritten after every change.
#[derive(Debug, Clone)]
pub struct JsonTableStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonTableStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut inner = MemoryStore::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            let parsed: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            for table in Table::ALL {
                let rows = parsed
                    .get(table.name())
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|row| row.as_object().cloned())
                    .collect::<Vec<Record>>();
                inner.upsert(table, rows)?;
            }
        }
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        for table in Table::ALL {
            let rows = self
                .inner
                .tables
                .get(&table)
                .map(|entries| entries.values().cloned().map(Value::Object).collect())
                .unwrap_or_default();
            payload.insert(table.name().to_string(), Value::Array(rows));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(payload))?,
        )
        .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }
}

impl RemoteStore for JsonTableStore {
    fn upsert(&mut self, table: Table, rows: Vec<Record>) -> anyhow::Result<()> {
        self.inner.upsert(table, rows)?;
        self.save()
    }

    fn delete(&mut self, table: Table, ids: &[String]) -> anyhow::Result<()> {
        self.inner.delete(table, ids)?;
        self.save()
    }

    fn rows_for_story(&self, table: Table, story_id: &str) -> anyhow::Result<Vec<Record>> {
        self.inner.rows_for_story(table, story_id)
    }

    fn story_ids_for_user(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        self.inner.story_ids_for_user(user_id)
    }
}
