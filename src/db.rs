//! # Track Database
//!
//! SQLite catalog behind the [`FeatureStore`] and [`TrackCatalog`] traits.
//!
//! ## Schema
//!
//! - `tracks`: one row per file with title, artist, album and genre
//! - `track_features`: raw analysis output and the derived normalized vector,
//!   both stored as JSON arrays
//! - `track_similarity`: exhaustive pair scores written by bulk mode
//!
//! Normalized vectors are only ever produced by [`Database::precompute_features`],
//! which aggregates the catalog extremes in one pass before normalizing.

use crate::bulk::SimilarPair;
use crate::features::{FeatureRange, FeatureSchema, NormalizedFeatures, TrackId};
use crate::store::{FeatureStore, TrackCatalog, TrackInfo};
use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tracks (
        track_id INTEGER PRIMARY KEY,
        title    TEXT    NOT NULL,
        artist   TEXT    NOT NULL,
        album    TEXT    NOT NULL,
        genre    TEXT,
        path     TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS track_features (
        track_id            INTEGER PRIMARY KEY REFERENCES tracks(track_id),
        raw_features        TEXT    NOT NULL,
        normalized_features TEXT
    );
    CREATE TABLE IF NOT EXISTS track_similarity (
        track_id_1       INTEGER NOT NULL,
        track_id_2       INTEGER NOT NULL,
        similarity_score REAL    NOT NULL,
        PRIMARY KEY (track_id_1, track_id_2)
    );
";

/// Searchable fields and the column each one matches.
const SEARCH_FIELDS: &[(&str, &str)] = &[
    ("artist", "artist"),
    ("genre", "genre"),
    ("album", "album"),
    ("title", "title"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

impl Connective {
    fn sql(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

/// Parsed form of `field: value [and|or field: value]...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// `(column, value)` pairs matched with `LIKE %value%`.
    pub conditions: Vec<(&'static str, String)>,
    /// The last connective in the query joins every condition.
    pub connective: Connective,
}

/// Parse a search query. Parts with an unknown field or without a
/// `field:` prefix are ignored.
#[must_use]
pub fn parse_search_query(input: &str) -> SearchQuery {
    let mut connective = Connective::And;
    let mut parts = vec![Vec::new()];

    for word in input.split_whitespace() {
        if word.eq_ignore_ascii_case("and") || word.eq_ignore_ascii_case("or") {
            connective = if word.eq_ignore_ascii_case("and") {
                Connective::And
            } else {
                Connective::Or
            };
            parts.push(Vec::new());
        } else if let Some(part) = parts.last_mut() {
            part.push(word);
        }
    }

    let conditions = parts
        .iter()
        .filter(|words| !words.is_empty())
        .filter_map(|words| {
            let part = words.join(" ");
            let (field, value) = part.split_once(':')?;
            let value = value.trim();
            if value.is_empty() || !field.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return None;
            }
            let column = SEARCH_FIELDS
                .iter()
                .find(|(name, _)| field.eq_ignore_ascii_case(name))
                .map(|(_, column)| *column)?;
            Some((column, value.to_string()))
        })
        .collect();

    SearchQuery {
        conditions,
        connective,
    }
}

/// One track of an import file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub track_id: TrackId,
    pub title: String,
    pub artist: String,
    pub album: String,
    #[serde(default)]
    pub genre: Option<String>,
    pub path: String,
    /// Raw analysis output in schema order.
    pub features: Vec<f64>,
}

/// One row of [`SimilarityGroups`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEntry {
    pub track_title: String,
    pub similar_track_title: String,
    pub similar_artist: String,
    pub similar_album: String,
    pub similarity: f64,
}

/// Stored similarity pairs grouped by the first track's artist and album.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimilarityGroups {
    pub by_artist: BTreeMap<String, Vec<GroupEntry>>,
    pub by_album: BTreeMap<String, Vec<GroupEntry>>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `path` and make sure the schema exists.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// # Errors
    ///
    /// Fails if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to create database schema")
    }

    /// Normalize every stored raw vector against the catalog extremes.
    ///
    /// Vectors whose length does not match `schema` are skipped with a
    /// warning. Returns the number of tracks normalized.
    ///
    /// # Errors
    ///
    /// SQL failures or unparseable stored vectors.
    pub fn precompute_features(&mut self, schema: &FeatureSchema) -> Result<usize> {
        let mut raw: Vec<(TrackId, Vec<f64>)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT track_id, raw_features FROM track_features ORDER BY track_id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, TrackId>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (id, json) = row?;
                let vector: Vec<f64> = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt raw features for track {id}"))?;
                if vector.len() == schema.dimension() {
                    raw.push((id, vector));
                } else {
                    warn!(
                        "Track {id} has {} raw features, expected {}; skipping",
                        vector.len(),
                        schema.dimension()
                    );
                }
            }
        }

        let Some(range) = FeatureRange::from_catalog(raw.iter().map(|(_, v)| v.as_slice()))? else {
            info!("No raw features to normalize");
            return Ok(0);
        };

        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE track_features SET normalized_features = ?1 WHERE track_id = ?2")?;
            for (id, vector) in &raw {
                let normalized = range.normalize(vector)?;
                stmt.execute(params![serde_json::to_string(&normalized)?, id])?;
            }
        }
        tx.commit().context("Committing normalized features failed")?;

        info!("Normalized features of {} tracks", raw.len());
        Ok(raw.len())
    }

    /// Tracks matching a `field: value` search query.
    ///
    /// # Errors
    ///
    /// SQL failures.
    pub fn search_tracks(&self, query: &str) -> Result<Vec<TrackInfo>> {
        let parsed = parse_search_query(query);
        if parsed.conditions.is_empty() {
            warn!("Search query `{query}` has no usable conditions");
            return Ok(Vec::new());
        }

        let clause = parsed
            .conditions
            .iter()
            .map(|(column, _)| format!("{column} LIKE ?"))
            .collect::<Vec<_>>()
            .join(parsed.connective.sql());
        let values: Vec<String> = parsed
            .conditions
            .iter()
            .map(|(_, value)| format!("%{value}%"))
            .collect();
        let sql = format!(
            "SELECT track_id, title, artist, album, path FROM tracks WHERE {clause} ORDER BY track_id"
        );
        debug!("Search SQL: {sql} {values:?}");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), track_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read search results")
    }

    /// The whole catalog, ordered by id.
    ///
    /// # Errors
    ///
    /// SQL failures.
    pub fn all_tracks(&self) -> Result<Vec<TrackInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT track_id, title, artist, album, path FROM tracks ORDER BY track_id")?;
        let rows = stmt.query_map([], track_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read catalog")
    }

    /// Insert tracks and their raw features in one transaction.
    ///
    /// Records whose feature count differs from `schema` are rejected before
    /// anything is written.
    ///
    /// # Errors
    ///
    /// Fails on a malformed record or SQL failure.
    pub fn import(&mut self, records: &[ImportRecord], schema: &FeatureSchema) -> Result<usize> {
        for record in records {
            ensure!(
                record.features.len() == schema.dimension(),
                "Track {} has {} features, expected {}",
                record.track_id,
                record.features.len(),
                schema.dimension()
            );
        }

        let tx = self.conn.transaction()?;
        {
            let mut tracks = tx.prepare(
                "INSERT OR REPLACE INTO tracks (track_id, title, artist, album, genre, path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in records {
                tracks
                    .execute(params![r.track_id, r.title, r.artist, r.album, r.genre, r.path])
                    .with_context(|| format!("Failed to insert track {}", r.track_id))?;
                store_raw_features(&tx, r.track_id, &r.features)?;
            }
        }
        tx.commit().context("Committing import failed")?;

        info!("Imported {} tracks", records.len());
        Ok(records.len())
    }

    /// Every track with a normalized vector, ordered by id.
    ///
    /// # Errors
    ///
    /// SQL failures or unparseable stored vectors.
    pub fn all_normalized_features(&self) -> Result<Vec<(TrackId, NormalizedFeatures)>> {
        let mut stmt = self.conn.prepare(
            "SELECT track_id, normalized_features FROM track_features
             WHERE normalized_features IS NOT NULL ORDER BY track_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, TrackId>(0)?, row.get::<_, String>(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, json) = row?;
            let features: NormalizedFeatures = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt normalized features for track {id}"))?;
            out.push((id, features));
        }
        Ok(out)
    }

    /// Replace the whole similarity table with `pairs`.
    ///
    /// # Errors
    ///
    /// SQL failures.
    pub fn replace_similarities(&mut self, pairs: &[SimilarPair]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM track_similarity", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO track_similarity (track_id_1, track_id_2, similarity_score)
                 VALUES (?1, ?2, ?3)",
            )?;
            for pair in pairs {
                stmt.execute(params![pair.first, pair.second, pair.similarity])?;
            }
        }
        tx.commit().context("Committing similarity pairs failed")?;
        info!("Stored {} similarity pairs", pairs.len());
        Ok(())
    }

    /// Pairs scoring above `threshold`, best first, grouped by the artist and
    /// by the album of the first track.
    ///
    /// # Errors
    ///
    /// SQL failures.
    pub fn group_similar_tracks(&self, threshold: f64) -> Result<SimilarityGroups> {
        let mut stmt = self.conn.prepare(
            "SELECT t1.title, t1.artist, t1.album, t2.title, t2.artist, t2.album, s.similarity_score
             FROM track_similarity s
             JOIN tracks t1 ON s.track_id_1 = t1.track_id
             JOIN tracks t2 ON s.track_id_2 = t2.track_id
             WHERE s.similarity_score > ?1
             ORDER BY s.similarity_score DESC",
        )?;
        let rows = stmt.query_map([threshold], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                GroupEntry {
                    track_title: row.get(0)?,
                    similar_track_title: row.get(3)?,
                    similar_artist: row.get(4)?,
                    similar_album: row.get(5)?,
                    similarity: row.get(6)?,
                },
            ))
        })?;

        let mut groups = SimilarityGroups::default();
        for row in rows {
            let (artist, album, entry) = row?;
            groups.by_artist.entry(artist).or_default().push(entry.clone());
            groups.by_album.entry(album).or_default().push(entry);
        }
        Ok(groups)
    }
}

fn track_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackInfo> {
    Ok(TrackInfo {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        album: row.get(3)?,
        path: row.get(4)?,
    })
}

impl FeatureStore for Database {
    fn track_ids(&self) -> Result<Vec<TrackId>> {
        let mut stmt = self.conn.prepare(
            "SELECT track_id FROM track_features
             WHERE normalized_features IS NOT NULL ORDER BY track_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<TrackId>>>()?;
        Ok(ids)
    }

    fn normalized_features(&self, id: TrackId) -> Result<Option<NormalizedFeatures>> {
        let json: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT normalized_features FROM track_features WHERE track_id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        match json.flatten() {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .with_context(|| format!("Corrupt normalized features for track {id}")),
            None => Ok(None),
        }
    }
}

impl TrackCatalog for Database {
    fn track(&self, id: TrackId) -> Result<Option<TrackInfo>> {
        self.conn
            .query_row(
                "SELECT track_id, title, artist, album, path FROM tracks WHERE track_id = ?1",
                [id],
                track_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to look up track {id}"))
    }
}

/// Store one raw analysis vector. A previous normalized vector of the same
/// track is cleared until the next precompute.
fn store_raw_features(conn: &Connection, id: TrackId, raw: &[f64]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO track_features (track_id, raw_features, normalized_features)
         VALUES (?1, ?2, NULL)
         ON CONFLICT(track_id) DO UPDATE SET
             raw_features = excluded.raw_features,
             normalized_features = NULL",
    )?;
    stmt.execute(params![id, serde_json::to_string(raw)?])
        .with_context(|| format!("Failed to store features of track {id}"))?;
    Ok(())
}
