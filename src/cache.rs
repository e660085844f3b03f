//! Append-only memoization of per-dialogue geocoding distances.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geocoding::RevealedLocation;
use crate::model::GroundTruthLocation;
use crate::util::{ensure_directory, now_utc_string};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceCacheEntry {
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confidences: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<(f64, f64)>,
    /// `None` when nothing was revealed and no guess was made.
    pub distance: Option<f64>,
    pub ground_truth: GroundTruthLocation,
    pub revealed: RevealedLocation,
}

/// Get/put contract the distance evaluator relies on.
pub trait DistanceCache {
    fn get(&self, image_id: &str) -> Result<Option<DistanceCacheEntry>>;
    fn put(&mut self, entry: &DistanceCacheEntry) -> Result<()>;
    fn entry_count(&self) -> Result<usize>;
}

/// One JSON object per line; later lines for the same image win.
pub struct JsonlDistanceCache {
    path: PathBuf,
    entries: HashMap<String, DistanceCacheEntry>,
}

impl JsonlDistanceCache {
    pub fn open(path: &Path) -> Result<Self> {
        let mut entries = HashMap::new();

        if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("failed to open distance cache {}", path.display()))?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line
                    .with_context(|| format!("failed to read distance cache {}", path.display()))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<DistanceCacheEntry>(&line) {
                    Ok(entry) => {
                        entries.insert(entry.image_id.clone(), entry);
                    }
                    Err(err) => warn!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %err,
                        "skipping corrupt distance cache line"
                    ),
                }
            }
        }

        debug!(path = %path.display(), entries = entries.len(), "opened jsonl distance cache");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn cache_path(cache_dir: &Path, cache_name: &str) -> PathBuf {
        cache_dir.join(format!("api_distance_results_{cache_name}.jsonl"))
    }
}

impl DistanceCache for JsonlDistanceCache {
    fn get(&self, image_id: &str) -> Result<Option<DistanceCacheEntry>> {
        Ok(self.entries.get(image_id).cloned())
    }

    fn put(&mut self, entry: &DistanceCacheEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_directory(parent)?;
        }
        let line = serde_json::to_string(entry).context("failed to serialize distance cache entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {} for append", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        self.entries.insert(entry.image_id.clone(), entry.clone());
        Ok(())
    }

    fn entry_count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }
}

/// Embedded SQLite store shared by every model; rows are never updated.
pub struct SqliteDistanceCache {
    connection: Connection,
    cache_name: String,
}

impl SqliteDistanceCache {
    pub fn open(db_path: &Path, cache_name: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            ensure_directory(parent)?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        Self::with_connection(connection, cache_name)
    }

    pub fn with_connection(connection: Connection, cache_name: &str) -> Result<Self> {
        ensure_schema(&connection)?;
        Ok(Self {
            connection,
            cache_name: cache_name.to_string(),
        })
    }

    pub fn db_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join("distance_cache.sqlite")
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS distance_results (
              entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
              cache_name TEXT NOT NULL,
              image_id TEXT NOT NULL,
              payload TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_distance_results_key
              ON distance_results(cache_name, image_id);
            ",
        )
        .context("failed to create distance cache schema")?;
    Ok(())
}

impl DistanceCache for SqliteDistanceCache {
    fn get(&self, image_id: &str) -> Result<Option<DistanceCacheEntry>> {
        let payload: Option<String> = self
            .connection
            .query_row(
                "
                SELECT payload
                FROM distance_results
                WHERE cache_name = ?1 AND image_id = ?2
                ORDER BY entry_id DESC
                LIMIT 1
                ",
                params![self.cache_name, image_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query distance cache")?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(
                    cache = %self.cache_name,
                    image_id,
                    error = %err,
                    "ignoring corrupt distance cache row"
                );
                Ok(None)
            }
        }
    }

    fn put(&mut self, entry: &DistanceCacheEntry) -> Result<()> {
        let payload =
            serde_json::to_string(entry).context("failed to serialize distance cache entry")?;
        self.connection
            .execute(
                "
                INSERT INTO distance_results (cache_name, image_id, payload, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![self.cache_name, entry.image_id, payload, now_utc_string()],
            )
            .context("failed to insert distance cache row")?;
        Ok(())
    }

    fn entry_count(&self) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(DISTINCT image_id) FROM distance_results WHERE cache_name = ?1",
                params![self.cache_name],
                |row| row.get(0),
            )
            .context("failed to count distance cache rows")?;
        Ok(count as usize)
    }
}

/// Lists the per-model jsonl caches present in `cache_dir`.
pub fn list_jsonl_caches(cache_dir: &Path) -> Result<Vec<PathBuf>> {
    if !cache_dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(cache_dir)
        .with_context(|| format!("failed to read {}", cache_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", cache_dir.display()))?
            .path();
        let is_cache = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("api_distance_results_") && name.ends_with(".jsonl"))
            .unwrap_or(false);
        if is_cache {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(image_id: &str, distance: Option<f64>) -> DistanceCacheEntry {
        DistanceCacheEntry {
            image_id: image_id.to_string(),
            points: vec![(1.0, 2.0)],
            confidences: vec![0.5],
            centroid: Some((1.0, 2.0)),
            distance,
            ground_truth: GroundTruthLocation::default(),
            revealed: RevealedLocation::default(),
        }
    }

    #[test]
    fn jsonl_cache_round_trips_and_latest_entry_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = JsonlDistanceCache::cache_path(dir.path(), "agent_city");

        let mut cache = JsonlDistanceCache::open(&path).unwrap();
        assert!(cache.get("a").unwrap().is_none());
        cache.put(&entry("a", Some(10.0))).unwrap();
        cache.put(&entry("a", Some(20.0))).unwrap();
        cache.put(&entry("b", None)).unwrap();

        let reopened = JsonlDistanceCache::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap().unwrap().distance, Some(20.0));
        assert_eq!(reopened.get("b").unwrap().unwrap().distance, None);
        assert_eq!(reopened.entry_count().unwrap(), 2);

        let lines = fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[test]
    fn jsonl_cache_skips_corrupt_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.jsonl");
        let good = serde_json::to_string(&entry("ok", Some(1.5))).unwrap();
        fs::write(&path, format!("{{not json\n{good}\n\n{{\"image_id\": 3}}\n")).unwrap();

        let cache = JsonlDistanceCache::open(&path).unwrap();
        assert_eq!(cache.entry_count().unwrap(), 1);
        assert_eq!(cache.get("ok").unwrap().unwrap().distance, Some(1.5));
    }

    #[test]
    fn sqlite_cache_is_scoped_by_name_and_latest_row_wins() {
        let connection = Connection::open_in_memory().unwrap();
        let mut cache = SqliteDistanceCache::with_connection(connection, "agent_city").unwrap();

        cache.put(&entry("a", Some(1.0))).unwrap();
        cache.put(&entry("a", Some(2.0))).unwrap();
        assert_eq!(cache.get("a").unwrap().unwrap().distance, Some(2.0));
        assert_eq!(cache.entry_count().unwrap(), 1);

        cache.cache_name = "other_model".to_string();
        assert!(cache.get("a").unwrap().is_none());
    }

    #[test]
    fn lists_only_distance_cache_files() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("api_distance_results_m_city.jsonl"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let caches = list_jsonl_caches(dir.path()).unwrap();
        assert_eq!(caches.len(), 1);
        assert!(list_jsonl_caches(&dir.path().join("missing")).unwrap().is_empty());
    }
}
