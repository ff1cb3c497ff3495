use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::cache::{SharedCache, SharedEntry};

const SHARED_CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cache_locks (
    lock_key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
"#;

/// Shared tier stored in a SQLite file, so every process on the host that
/// opens the same file sees the same entries and locks.
pub struct SqliteSharedCache {
    path: PathBuf,
    connection: Mutex<Connection>,
    stale_grace: Duration,
}

impl SqliteSharedCache {
    pub fn open(path: &Path, stale_grace: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        connection
            .execute_batch(SHARED_CACHE_SCHEMA_SQL)
            .context("failed to initialize shared cache schema")?;
        info!(path = %path.display(), "shared cache opened");
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(connection),
            stale_grace,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop entries past their grace period and locks past their TTL.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = now_unix_ms()?;
        let grace = duration_ms(self.stale_grace)?;
        let connection = self.connection.lock();
        let entries = connection
            .execute(
                "DELETE FROM cache_entries WHERE expires_at_ms + ?1 <= ?2",
                params![grace, now],
            )
            .context("failed to purge expired cache entries")?;
        let locks = connection
            .execute("DELETE FROM cache_locks WHERE expires_at_ms <= ?1", [now])
            .context("failed to purge expired cache locks")?;
        Ok(entries + locks)
    }
}

impl SharedCache for SqliteSharedCache {
    fn get(&self, key: &str) -> Result<Option<SharedEntry>> {
        let now = now_unix_ms()?;
        let grace = duration_ms(self.stale_grace)?;
        let connection = self.connection.lock();
        let row = connection
            .query_row(
                "SELECT payload, expires_at_ms FROM cache_entries WHERE cache_key = ?1",
                [key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read cache entry {key}"))?;
        Ok(row.and_then(|(payload, expires_at_ms)| {
            if expires_at_ms + grace <= now {
                None
            } else {
                Some(SharedEntry {
                    payload,
                    expired: expires_at_ms <= now,
                })
            }
        }))
    }

    fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<()> {
        let expires_at_ms = now_unix_ms()? + duration_ms(ttl)?;
        let connection = self.connection.lock();
        connection
            .execute(
                "INSERT OR REPLACE INTO cache_entries (cache_key, payload, expires_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![key, payload, expires_at_ms],
            )
            .with_context(|| format!("failed to write cache entry {key}"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let connection = self.connection.lock();
        connection
            .execute("DELETE FROM cache_entries WHERE cache_key = ?1", [key])
            .with_context(|| format!("failed to delete cache entry {key}"))?;
        Ok(())
    }

    fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = now_unix_ms()?;
        let expires_at_ms = now + duration_ms(ttl)?;
        let connection = self.connection.lock();
        // Takes a free or expired lock in one statement; a live lock is left alone.
        let changed = connection
            .execute(
                "INSERT INTO cache_locks (lock_key, owner, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(lock_key) DO UPDATE
                 SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
                 WHERE cache_locks.expires_at_ms <= ?4",
                params![key, owner, expires_at_ms, now],
            )
            .with_context(|| format!("failed to acquire cache lock {key}"))?;
        Ok(changed == 1)
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        let connection = self.connection.lock();
        connection
            .execute(
                "DELETE FROM cache_locks WHERE lock_key = ?1 AND owner = ?2",
                params![key, owner],
            )
            .with_context(|| format!("failed to release cache lock {key}"))?;
        Ok(())
    }
}

fn now_unix_ms() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?;
    duration_ms(elapsed)
}

fn duration_ms(value: Duration) -> Result<i64> {
    i64::try_from(value.as_millis()).context("duration does not fit into i64 milliseconds")
}
