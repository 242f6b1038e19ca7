pub mod models;


use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        // Initialize schema
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS genres (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS animes (
                aid INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                cover TEXT,
                state_id INTEGER REFERENCES states(id),
                type_id INTEGER REFERENCES types(id),
                added_date TEXT NOT NULL DEFAULT (datetime('now')),
                updated_date TEXT
            );

            CREATE TABLE IF NOT EXISTS anime_genres (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                aid INTEGER NOT NULL REFERENCES animes(aid) ON DELETE CASCADE,
                genre_id INTEGER NOT NULL REFERENCES genres(id),
                UNIQUE(aid, genre_id)
            );

            CREATE TABLE IF NOT EXISTS relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                aid INTEGER NOT NULL REFERENCES animes(aid) ON DELETE CASCADE,
                url TEXT NOT NULL,
                UNIQUE(aid, url)
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                aid INTEGER NOT NULL REFERENCES animes(aid) ON DELETE CASCADE,
                url TEXT NOT NULL UNIQUE,
                number REAL,
                cover TEXT,
                added_date TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_aid ON episodes(aid);
            CREATE INDEX IF NOT EXISTS idx_relations_aid ON relations(aid);
            CREATE INDEX IF NOT EXISTS idx_anime_genres_aid ON anime_genres(aid);
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Anime queries
    // =========================================================================

    pub fn find_anime_by_url(&self, url: &str) -> Result<Option<Anime>> {
        let conn = self.conn.lock().unwrap();
        let aid: Option<i64> = conn
            .query_row(
                "SELECT aid FROM animes WHERE url = ?",
                params![url],
                |row| row.get(0),
            )
            .optional()?;
        match aid {
            Some(aid) => Ok(Some(read_anime(&conn, aid)?)),
            None => Ok(None),
        }
    }

    pub fn get_anime(&self, aid: i64) -> Result<Option<Anime>> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT aid FROM animes WHERE aid = ?",
                params![aid],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(aid) => Ok(Some(read_anime(&conn, aid)?)),
            None => Ok(None),
        }
    }

    /// All animes in ascending local-id order (deterministic snapshot order).
    pub fn list_animes(&self) -> Result<Vec<Anime>> {
        let conn = self.conn.lock().unwrap();
        let aids: Vec<i64> = conn
            .prepare("SELECT aid FROM animes ORDER BY aid ASC")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut animes = Vec::with_capacity(aids.len());
        for aid in aids {
            animes.push(read_anime(&conn, aid)?);
        }
        Ok(animes)
    }

    pub fn list_anime_urls(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let urls = conn
            .prepare("SELECT url FROM animes ORDER BY aid ASC")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    /// Insert a new anime together with its taxonomy references, episodes,
    /// and relations. Fails if the url is already stored.
    pub fn create_anime(&self, record: &AnimeRecord) -> Result<Anime> {
        let aid = {
            let conn = self.conn.lock().unwrap();
            let state_id = resolve_taxonomy(&conn, "states", record.state.as_deref())?;
            let type_id = resolve_taxonomy(&conn, "types", record.kind.as_deref())?;
            let now = chrono::Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO animes (url, name, cover, state_id, type_id, added_date)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![record.url, record.name, record.cover, state_id, type_id, now],
            )?;
            let aid = conn.last_insert_rowid();

            write_genres(&conn, aid, &record.genres)?;
            write_relations(&conn, aid, &record.relations)?;
            write_episodes(&conn, aid, &record.episodes)?;
            aid
        };

        log::info!("Created anime {} ({})", aid, record.url);
        self.get_anime(aid)?
            .ok_or_else(|| anyhow::anyhow!("anime {} vanished after insert", aid))
    }

    /// Refresh a stored anime in place from a freshly fetched record. The
    /// local id is preserved and mutable fields are overwritten; episodes
    /// are upserted by url and never deleted (disappearance from the source
    /// is not modeled), relations are replaced wholesale.
    pub fn update_anime(&self, aid: i64, record: &AnimeRecord) -> Result<Anime> {
        {
            let conn = self.conn.lock().unwrap();
            let state_id = resolve_taxonomy(&conn, "states", record.state.as_deref())?;
            let type_id = resolve_taxonomy(&conn, "types", record.kind.as_deref())?;
            let now = chrono::Utc::now().to_rfc3339();

            let changed = conn.execute(
                "UPDATE animes SET name = ?, cover = ?, state_id = ?, type_id = ?, updated_date = ?
                 WHERE aid = ?",
                params![record.name, record.cover, state_id, type_id, now, aid],
            )?;
            if changed == 0 {
                anyhow::bail!("no anime with aid {}", aid);
            }

            conn.execute("DELETE FROM anime_genres WHERE aid = ?", params![aid])?;
            write_genres(&conn, aid, &record.genres)?;
            conn.execute("DELETE FROM relations WHERE aid = ?", params![aid])?;
            write_relations(&conn, aid, &record.relations)?;
            write_episodes(&conn, aid, &record.episodes)?;
        }

        log::info!("Updated anime {} ({})", aid, record.url);
        self.get_anime(aid)?
            .ok_or_else(|| anyhow::anyhow!("anime {} vanished after update", aid))
    }

    /// Create-or-update dispatch on the external id. Returns the stored
    /// anime and whether it was newly created.
    pub fn create_or_update_anime(&self, record: &AnimeRecord) -> Result<(Anime, bool)> {
        match self.find_anime_by_url(&record.url)? {
            Some(existing) => Ok((self.update_anime(existing.aid, record)?, false)),
            None => Ok((self.create_anime(record)?, true)),
        }
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    pub fn find_episode_by_url(&self, url: &str) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episode = conn
            .query_row(
                "SELECT id, aid, url, number, cover FROM episodes WHERE url = ?",
                params![url],
                |row| {
                    Ok(Episode {
                        id: row.get(0)?,
                        aid: row.get(1)?,
                        url: row.get(2)?,
                        number: row.get(3)?,
                        cover: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(episode)
    }

    pub fn episodes_of(&self, aid: i64) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episodes = conn
            .prepare(
                "SELECT id, aid, url, number, cover FROM episodes
                 WHERE aid = ? ORDER BY number ASC, id ASC",
            )?
            .query_map(params![aid], |row| {
                Ok(Episode {
                    id: row.get(0)?,
                    aid: row.get(1)?,
                    url: row.get(2)?,
                    number: row.get(3)?,
                    cover: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    // =========================================================================
    // Taxonomy queries
    // =========================================================================

    pub fn list_states(&self) -> Result<Vec<Taxonomy>> {
        self.list_taxonomy("states")
    }

    pub fn list_types(&self) -> Result<Vec<Taxonomy>> {
        self.list_taxonomy("types")
    }

    pub fn list_genres(&self) -> Result<Vec<Taxonomy>> {
        self.list_taxonomy("genres")
    }

    fn list_taxonomy(&self, table: &str) -> Result<Vec<Taxonomy>> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .prepare(&format!(
                "SELECT id, label FROM {} ORDER BY id ASC",
                table
            ))?
            .query_map([], |row| {
                Ok(Taxonomy {
                    id: row.get(0)?,
                    label: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Ensure a taxonomy label exists, returning its id.
    pub fn get_or_create_label(&self, table: TaxonomyTable, label: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        get_or_create_label(&conn, table.as_str(), label)
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        let conn = self.conn.lock().unwrap();
        let animes: i64 = conn.query_row("SELECT COUNT(*) FROM animes", [], |row| row.get(0))?;
        let episodes: i64 =
            conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        let relations: i64 =
            conn.query_row("SELECT COUNT(*) FROM relations", [], |row| row.get(0))?;
        Ok(CatalogStats {
            animes,
            episodes,
            relations,
        })
    }

    // =========================================================================
    // Unit of work
    // =========================================================================

    /// Open the transaction that scopes one top-level operation. All writes
    /// until `commit` land together; dropping the guard rolls them back.
    pub fn begin(&self) -> Result<UnitOfWork<'_>> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(UnitOfWork {
            db: self,
            committed: false,
        })
    }

    pub(crate) fn savepoint(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(())
    }

    pub(crate) fn release_savepoint(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("RELEASE {}", name))?;
        Ok(())
    }

    pub(crate) fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("ROLLBACK TO {}", name))?;
        Ok(())
    }
}

/// Scoped transaction guard. `commit` consumes it; dropping it uncommitted
/// issues a rollback so a propagated error leaves the store at its pre-call
/// state.
pub struct UnitOfWork<'a> {
    db: &'a Database,
    committed: bool,
}

impl UnitOfWork<'_> {
    pub fn commit(mut self) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute_batch("COMMIT")?;
        drop(conn);
        self.committed = true;
        Ok(())
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Ok(conn) = self.db.conn.lock() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    log::warn!("Rollback failed: {}", e);
                }
            }
        }
    }
}

/// The three flat reference tables an anime points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonomyTable {
    States,
    Types,
    Genres,
}

impl TaxonomyTable {
    fn as_str(self) -> &'static str {
        match self {
            Self::States => "states",
            Self::Types => "types",
            Self::Genres => "genres",
        }
    }
}

// =========================================================================
// Row helpers (called with the connection lock already held)
// =========================================================================

fn read_anime(conn: &Connection, aid: i64) -> Result<Anime> {
    let mut anime = conn.query_row(
        "SELECT a.aid, a.url, a.name, a.cover, s.label, t.label, a.added_date, a.updated_date
         FROM animes a
         LEFT JOIN states s ON a.state_id = s.id
         LEFT JOIN types t ON a.type_id = t.id
         WHERE a.aid = ?",
        params![aid],
        |row| {
            Ok(Anime {
                aid: row.get(0)?,
                url: row.get(1)?,
                name: row.get(2)?,
                cover: row.get(3)?,
                state: row.get(4)?,
                kind: row.get(5)?,
                genres: Vec::new(),
                relations: Vec::new(),
                added_date: row.get(6)?,
                updated_date: row.get(7)?,
            })
        },
    )?;

    anime.genres = conn
        .prepare(
            "SELECT g.label FROM anime_genres ag
             JOIN genres g ON ag.genre_id = g.id
             WHERE ag.aid = ? ORDER BY ag.id ASC",
        )?
        .query_map(params![aid], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    anime.relations = conn
        .prepare("SELECT url FROM relations WHERE aid = ? ORDER BY id ASC")?
        .query_map(params![aid], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(anime)
}

fn get_or_create_label(conn: &Connection, table: &str, label: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE label = ?", table),
            params![label],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        &format!("INSERT INTO {} (label) VALUES (?)", table),
        params![label],
    )?;
    Ok(conn.last_insert_rowid())
}

fn resolve_taxonomy(conn: &Connection, table: &str, label: Option<&str>) -> Result<Option<i64>> {
    match label {
        Some(label) => Ok(Some(get_or_create_label(conn, table, label)?)),
        None => Ok(None),
    }
}

fn write_genres(conn: &Connection, aid: i64, genres: &[String]) -> Result<()> {
    for label in genres {
        let genre_id = get_or_create_label(conn, "genres", label)?;
        conn.execute(
            "INSERT OR IGNORE INTO anime_genres (aid, genre_id) VALUES (?, ?)",
            params![aid, genre_id],
        )?;
    }
    Ok(())
}

fn write_relations(conn: &Connection, aid: i64, relations: &[String]) -> Result<()> {
    for url in relations {
        conn.execute(
            "INSERT OR IGNORE INTO relations (aid, url) VALUES (?, ?)",
            params![aid, url],
        )?;
    }
    Ok(())
}

/// Upsert episodes by url under the owning anime. Existing rows keep their
/// local id; rows for urls the record does not mention are left alone.
fn write_episodes(conn: &Connection, aid: i64, episodes: &[EpisodeRecord]) -> Result<()> {
    for ep in episodes {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM episodes WHERE url = ?",
                params![ep.url],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE episodes SET aid = ?, number = ?, cover = ? WHERE id = ?",
                    params![aid, ep.number, ep.cover, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO episodes (aid, url, number, cover) VALUES (?, ?, ?, ?)",
                    params![aid, ep.url, ep.number, ep.cover],
                )?;
            }
        }
    }
    Ok(())
}
