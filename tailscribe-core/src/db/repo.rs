//! Offset cache repository

use crate::error::Result;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A remembered resume point.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOffset {
    pub session_id: SessionId,
    pub offset: u64,
    /// Source length when the offset was stored
    pub file_size: u64,
    pub source_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CachedOffset {
    /// Whether the offset can still be resumed against a source of
    /// `current_len` bytes. A source that shrank has been rewritten.
    pub fn is_valid_for(&self, current_len: u64) -> bool {
        self.offset <= current_len && self.file_size <= current_len
    }
}

/// SQLite-backed offset cache.
pub struct OffsetCache {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for OffsetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCache").finish_non_exhaustive()
    }
}

impl OffsetCache {
    /// Open or create the cache at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.migrate()?;
        Ok(cache)
    }

    /// Open an in-memory cache (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        cache.migrate()?;
        Ok(cache)
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        super::schema::run_migrations(&self.connection())
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the stored offset for a session.
    pub fn load(&self, session_id: &SessionId) -> Result<Option<CachedOffset>> {
        let conn = self.connection();
        let row = conn
            .query_row(
                r#"
                SELECT session_id, byte_offset, file_size, source_path, updated_at
                FROM session_offsets
                WHERE session_id = ?1
                "#,
                params![session_id.as_str()],
                row_to_cached,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or update a session's resume point.
    pub fn store(
        &self,
        session_id: &SessionId,
        offset: u64,
        file_size: u64,
        source_path: Option<&Path>,
    ) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO session_offsets (session_id, byte_offset, file_size, source_path, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
                byte_offset = excluded.byte_offset,
                file_size = excluded.file_size,
                source_path = COALESCE(excluded.source_path, session_offsets.source_path),
                updated_at = excluded.updated_at
            "#,
            params![
                session_id.as_str(),
                offset as i64,
                file_size as i64,
                source_path.map(|p| p.to_string_lossy().into_owned()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Forget a session's resume point. Returns whether one existed.
    pub fn remove(&self, session_id: &SessionId) -> Result<bool> {
        let conn = self.connection();
        let n = conn.execute(
            "DELETE FROM session_offsets WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Every stored resume point, most recently updated first.
    pub fn list(&self) -> Result<Vec<CachedOffset>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, byte_offset, file_size, source_path, updated_at
            FROM session_offsets
            ORDER BY updated_at DESC
            "#,
        )?;
        let rows = stmt.query_map([], row_to_cached)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_cached(row: &Row<'_>) -> rusqlite::Result<CachedOffset> {
    let updated_at: String = row.get(4)?;
    Ok(CachedOffset {
        session_id: SessionId::new(row.get::<_, String>(0)?),
        offset: row.get::<_, i64>(1)?.max(0) as u64,
        file_size: row.get::<_, i64>(2)?.max(0) as u64,
        source_path: row.get(3)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_load() {
        let cache = OffsetCache::open_in_memory().unwrap();
        let id = SessionId::new("abc");
        assert!(cache.load(&id).unwrap().is_none());

        cache.store(&id, 1024, 2048, Some(Path::new("/tmp/abc.jsonl"))).unwrap();
        let cached = cache.load(&id).unwrap().unwrap();
        assert_eq!(cached.offset, 1024);
        assert_eq!(cached.file_size, 2048);
        assert_eq!(cached.source_path.as_deref(), Some("/tmp/abc.jsonl"));

        // Update keeps the known path when none is given
        cache.store(&id, 4096, 4096, None).unwrap();
        let cached = cache.load(&id).unwrap().unwrap();
        assert_eq!(cached.offset, 4096);
        assert_eq!(cached.source_path.as_deref(), Some("/tmp/abc.jsonl"));
        assert_eq!(cache.list().unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = OffsetCache::open_in_memory().unwrap();
        let id = SessionId::new("gone");
        cache.store(&id, 1, 1, None).unwrap();
        assert!(cache.remove(&id).unwrap());
        assert!(!cache.remove(&id).unwrap());
        assert!(cache.load(&id).unwrap().is_none());
    }

    #[test]
    fn test_validity_against_current_length() {
        let cached = CachedOffset {
            session_id: SessionId::new("s"),
            offset: 100,
            file_size: 120,
            source_path: None,
            updated_at: Utc::now(),
        };
        assert!(cached.is_valid_for(120));
        assert!(cached.is_valid_for(500));
        assert!(!cached.is_valid_for(110));
    }

    #[test]
    fn test_open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offsets.db");
        let cache = OffsetCache::open(&path).unwrap();
        cache.store(&SessionId::new("s"), 7, 7, None).unwrap();
        drop(cache);

        let reopened = OffsetCache::open(&path).unwrap();
        assert_eq!(reopened.load(&SessionId::new("s")).unwrap().unwrap().offset, 7);
    }
}
