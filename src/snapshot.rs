//! Snapshot codec: serializes the whole catalog into one portable JSON
//! document and restores such documents idempotently.
//!
//! The document carries the three taxonomy tables as flat lists plus every
//! anime flattened with resolved taxonomy labels, keyed by local id in
//! ascending order. Episodes are deliberately omitted: they are
//! reconstructable by re-fetch, and the document favors catalog shape over
//! full fidelity.

use crate::batch::{self, BatchReport};
use crate::database::{Anime, AnimeRecord, Database, Taxonomy, TaxonomyTable};
use crate::error::AppError;
use crate::normalize;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub states: Vec<Taxonomy>,
    pub types: Vec<Taxonomy>,
    pub genres: Vec<Taxonomy>,
    /// Local id → flattened anime, ascending by id.
    pub animes: IndexMap<String, FlatAnime>,
}

/// Self-describing flattened anime: taxonomy references resolved to labels,
/// relations as external ids, no episodes.
#[derive(Debug, Serialize, Deserialize)]
pub struct FlatAnime {
    pub aid: i64,
    pub url: String,
    pub name: String,
    pub cover: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub genres: Vec<String>,
    pub relations: Vec<String>,
}

impl From<Anime> for FlatAnime {
    fn from(anime: Anime) -> Self {
        Self {
            aid: anime.aid,
            url: anime.url,
            name: anime.name,
            cover: anime.cover,
            state: anime.state,
            kind: anime.kind,
            genres: anime.genres,
            relations: anime.relations,
        }
    }
}

/// Serialize the whole catalog into one compact document. serde_json writes
/// literal UTF-8, so the output is readable text rather than an
/// escape-laden blob.
pub fn encode(db: &Database) -> Result<String, AppError> {
    let doc = SnapshotDocument {
        states: db.list_states()?,
        types: db.list_types()?,
        genres: db.list_genres()?,
        animes: db
            .list_animes()?
            .into_iter()
            .map(|a| (a.aid.to_string(), FlatAnime::from(a)))
            .collect(),
    };
    Ok(serde_json::to_string(&doc)?)
}

pub fn write_snapshot(db: &Database, path: &Path) -> Result<(), AppError> {
    let doc = encode(db)?;
    std::fs::write(path, doc)?;
    log::info!("Snapshot written to {}", path.display());
    Ok(())
}

/// Restore a snapshot document into the catalog: create-or-update every
/// anime entry by external id. Accepts both the full document shape and
/// the legacy bare `{aid: flattened}` mapping. Malformed entries are
/// skipped; persistence failures are recorded per item and the restore
/// always runs to completion. The taxonomy seeding and the anime upserts
/// share one unit of work, so an infrastructure fault leaves no partial
/// state behind.
///
/// Unlike recent-feed resolution this path never cascades into related
/// animes — the document is trusted to contain the whole catalog.
pub fn restore(db: &Database, text: &str) -> Result<BatchReport, AppError> {
    let value: Value = serde_json::from_str(text)?;
    let root = value
        .as_object()
        .ok_or_else(|| AppError::Json("snapshot root must be an object".to_string()))?;

    let (full_shape, entries): (bool, Vec<&Value>) =
        match root.get("animes").and_then(|v| v.as_object()) {
            Some(animes) => (true, animes.values().collect()),
            // Legacy shape: the whole document is the anime mapping
            None => (false, root.values().collect()),
        };

    let mut skipped = 0usize;
    let mut records: Vec<AnimeRecord> = Vec::with_capacity(entries.len());
    for entry in entries {
        match normalize::anime_from_value(entry) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                log::warn!("Skipping malformed snapshot entry: {}", e);
            }
        }
    }
    if skipped > 0 {
        log::warn!("Skipped {} malformed snapshot entries", skipped);
    }

    let uow = db.begin()?;
    if full_shape {
        restore_taxonomies(db, root)?;
    }
    let report = batch::apply_batch(db, &records, |r| &r.url, |r| {
        db.create_or_update_anime(r)?;
        Ok(())
    })?;
    uow.commit()?;
    Ok(report)
}

pub fn read_snapshot(db: &Database, path: &Path) -> Result<BatchReport, AppError> {
    let text = std::fs::read_to_string(path)?;
    restore(db, &text)
}

/// Pre-seed taxonomy labels from the document's flat lists. Ids are local
/// to each environment; only labels travel.
fn restore_taxonomies(
    db: &Database,
    root: &serde_json::Map<String, Value>,
) -> Result<(), AppError> {
    let tables = [
        ("states", TaxonomyTable::States),
        ("types", TaxonomyTable::Types),
        ("genres", TaxonomyTable::Genres),
    ];
    for (key, table) in tables {
        let Some(entries) = root.get(key).and_then(|v| v.as_array()) else {
            continue;
        };
        for entry in entries {
            if let Some(label) = entry.get("label").and_then(|v| v.as_str()) {
                db.get_or_create_label(table, label)?;
            }
        }
    }
    Ok(())
}
