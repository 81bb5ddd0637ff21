//! SQLite datastore backend.
//!
//! One table of content rows, WAL mode, busy timeout. The eviction contract
//! is the same as the memory backend's; capacity is counted in rows.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use umbra_crypto::HashCode;

use crate::{
    Datastore, Entry, EntryVisitor, IterControl, PutOutcome, Result, StoreError, MAX_VALUE_SIZE,
};

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

/// A SQLite-backed datastore.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    max_entries: usize,
}

impl SqliteStore {
    /// Open or create a store at `path`.
    pub fn open(path: &Path, max_entries: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: max_entries.max(1),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory(max_entries: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: max_entries.max(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn row_count(conn: &Connection) -> Result<usize> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM content", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Make room for a newcomer with the given priority.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Full`] if the lowest retained priority is not
    /// strictly below the newcomer's.
    fn make_room(conn: &Connection, max_entries: usize, priority: u32) -> Result<()> {
        let now = now_secs() as i64;
        conn.execute(
            "DELETE FROM content WHERE expiration != 0 AND expiration <= ?1",
            params![now],
        )?;
        if Self::row_count(conn)? < max_entries {
            return Ok(());
        }
        let victim: Option<(i64, i64)> = conn
            .query_row(
                "SELECT rowid, priority FROM content
                 ORDER BY priority ASC,
                          CASE expiration WHEN 0 THEN 9223372036854775807 ELSE expiration END ASC
                 LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match victim {
            Some((_, lowest)) if i64::from(priority) <= lowest => Err(StoreError::Full),
            Some((rowid, _)) => {
                conn.execute("DELETE FROM content WHERE rowid = ?1", params![rowid])?;
                Ok(())
            }
            None => Err(StoreError::Full),
        }
    }

    fn find_identical(conn: &Connection, entry: &Entry) -> Result<Option<i64>> {
        let rowid: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM content WHERE key = ?1 AND kind = ?2 AND payload = ?3",
                params![entry.key.as_bytes().as_slice(), entry.kind, entry.payload],
                |r| r.get(0),
            )
            .optional()?;
        Ok(rowid)
    }

    fn insert(conn: &Connection, entry: &Entry) -> Result<()> {
        conn.execute(
            "INSERT INTO content (key, kind, priority, anonymity, expiration, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.key.as_bytes().as_slice(),
                entry.kind,
                entry.priority,
                entry.anonymity,
                entry.expiration as i64,
                entry.payload,
            ],
        )?;
        Ok(())
    }
}

impl Datastore for SqliteStore {
    fn put(&self, entry: Entry) -> Result<PutOutcome> {
        if entry.payload.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: entry.payload.len(),
            });
        }
        let conn = self.lock();
        if Self::find_identical(&conn, &entry)?.is_some() {
            return Ok(PutOutcome::Duplicate);
        }
        if Self::row_count(&conn)? >= self.max_entries {
            Self::make_room(&conn, self.max_entries, entry.priority)?;
        }
        Self::insert(&conn, &entry)?;
        Ok(PutOutcome::Inserted)
    }

    fn put_update(&self, entry: Entry) -> Result<PutOutcome> {
        if entry.payload.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: entry.payload.len(),
            });
        }
        let conn = self.lock();
        if let Some(rowid) = Self::find_identical(&conn, &entry)? {
            conn.execute(
                "UPDATE content
                 SET priority = MIN(priority + ?1, 4294967295),
                     expiration = MAX(expiration, ?2)
                 WHERE rowid = ?3",
                params![entry.priority, entry.expiration as i64, rowid],
            )?;
            return Ok(PutOutcome::Updated);
        }
        if Self::row_count(&conn)? >= self.max_entries {
            Self::make_room(&conn, self.max_entries, entry.priority)?;
        }
        Self::insert(&conn, &entry)?;
        Ok(PutOutcome::Inserted)
    }

    fn get(
        &self,
        key: &HashCode,
        kind: Option<u16>,
        visitor: EntryVisitor<'_>,
    ) -> Result<usize> {
        let conn = self.lock();
        let entries = select_entries(
            &conn,
            "SELECT key, kind, priority, anonymity, expiration, payload
             FROM content WHERE key = ?1
             AND (expiration = 0 OR expiration > ?2)",
            params![key.as_bytes().as_slice(), now_secs() as i64],
        )?;
        let mut visited = 0;
        for e in entries {
            if kind.is_some_and(|k| k != e.kind) {
                continue;
            }
            visited += 1;
            if visitor(&e) == IterControl::Abort {
                break;
            }
        }
        Ok(visited)
    }

    fn get_random(
        &self,
        near: &HashCode,
        size_limit: usize,
        kind: Option<u16>,
    ) -> Result<Option<Entry>> {
        let conn = self.lock();
        let entries = select_entries(
            &conn,
            "SELECT key, kind, priority, anonymity, expiration, payload
             FROM content
             WHERE LENGTH(payload) <= ?1 AND (expiration = 0 OR expiration > ?2)
             ORDER BY RANDOM() LIMIT 4",
            params![size_limit as i64, now_secs() as i64],
        )?;
        Ok(entries
            .into_iter()
            .filter(|e| kind.map_or(true, |k| k == e.kind))
            .min_by(|a, b| HashCode::distance_cmp(&a.key, &b.key, near)))
    }

    fn del(&self, key: &HashCode, value: Option<&[u8]>) -> Result<usize> {
        let conn = self.lock();
        let removed = match value {
            Some(v) => conn.execute(
                "DELETE FROM content WHERE key = ?1 AND payload = ?2",
                params![key.as_bytes().as_slice(), v],
            )?,
            None => conn.execute(
                "DELETE FROM content WHERE key = ?1",
                params![key.as_bytes().as_slice()],
            )?,
        };
        Ok(removed)
    }

    fn iterate(&self, visitor: EntryVisitor<'_>) -> Result<usize> {
        let conn = self.lock();
        let entries = select_entries(
            &conn,
            "SELECT key, kind, priority, anonymity, expiration, payload
             FROM content ORDER BY priority DESC",
            params![],
        )?;
        drop(conn);
        let mut visited = 0;
        for e in entries {
            visited += 1;
            if visitor(&e) == IterControl::Abort {
                break;
            }
        }
        Ok(visited)
    }

    fn len(&self) -> usize {
        let conn = self.lock();
        Self::row_count(&conn).unwrap_or(0)
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         CREATE TABLE IF NOT EXISTS content (
             key        BLOB NOT NULL,
             kind       INTEGER NOT NULL,
             priority   INTEGER NOT NULL,
             anonymity  INTEGER NOT NULL,
             expiration INTEGER NOT NULL,
             payload    BLOB NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_content_key ON content (key);
         CREATE INDEX IF NOT EXISTS idx_content_priority ON content (priority);",
    )?;
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version == 0 {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

fn select_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |r| {
        let key_bytes: Vec<u8> = r.get(0)?;
        let expiration: i64 = r.get(4)?;
        Ok((
            key_bytes,
            r.get::<_, u16>(1)?,
            r.get::<_, u32>(2)?,
            r.get::<_, u32>(3)?,
            expiration,
            r.get::<_, Vec<u8>>(5)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key_bytes, kind, priority, anonymity, expiration, payload) = row?;
        let key = HashCode::from_slice(&key_bytes)
            .map_err(|e| StoreError::Database(format!("corrupt key column: {e}")))?;
        out.push(Entry {
            key,
            kind,
            priority,
            anonymity,
            expiration: expiration as u64,
            payload,
        });
    }
    Ok(out)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
