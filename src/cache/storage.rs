//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::Resource;

/// A single cached resource.
#[derive(Debug, Clone)]
pub struct CachedResource {
  pub resource: Resource,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Summary of one named cache generation.
#[derive(Debug, Clone)]
pub struct GenerationInfo {
  pub name: String,
  pub created_at: DateTime<Utc>,
  pub entries: usize,
}

/// Trait for cache storage backends.
///
/// Entries are keyed by (generation, resource key); writing an existing key replaces it.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store every entry in one generation atomically. Creates the generation.
  fn put_all(&self, generation: &str, entries: &[(String, Resource)]) -> Result<()>;

  /// Store a single entry, creating the generation if needed.
  fn put(&self, generation: &str, key: &str, resource: &Resource) -> Result<()>;

  /// Look up an entry in one generation.
  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedResource>>;

  /// Whether a generation has been created.
  fn has_generation(&self, generation: &str) -> Result<bool>;

  /// All generations, oldest first.
  fn generations(&self) -> Result<Vec<GenerationInfo>>;

  /// Delete a generation and its entries. Returns false if it did not exist.
  fn delete_generation(&self, generation: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    resource_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, resource_key)
);
"#;

fn insert_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", generation, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, generation: &str, key: &str, resource: &Resource) -> Result<()> {
  let headers = serde_json::to_string(&resource.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (generation, resource_key, status, headers, body, digest, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key,
        resource.status,
        headers,
        resource.body,
        resource.digest()
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn put_all(&self, generation: &str, entries: &[(String, Resource)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_generation(&tx, generation)?;
    for (key, resource) in entries {
      insert_entry(&tx, generation, key, resource)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put(&self, generation: &str, key: &str, resource: &Resource) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_generation(&conn, generation)?;
    insert_entry(&conn, generation, key, resource)
  }

  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedResource>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND resource_key = ?",
        params![generation, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedResource {
          resource: Resource {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn has_generation(&self, generation: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache generation: {}", e))?;

    Ok(found.is_some())
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT g.name, g.created_at, COUNT(e.resource_key)
         FROM cache_generations g
         LEFT JOIN cache_entries e ON e.generation = g.name
         GROUP BY g.name
         ORDER BY g.created_at, g.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query generations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read generations: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at, entries)| {
        Ok(GenerationInfo {
          name,
          created_at: parse_datetime(&created_at)?,
          entries: entries as usize,
        })
      })
      .collect()
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
