use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;

use crate::snapshot::CacheSnapshot;

pub const MESSAGES_TABLE: &str = "global_messages_cache";

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS global_messages_cache (
    page_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    language TEXT NOT NULL,
    text TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_global_messages_cache_key ON global_messages_cache(name, language);
"#;

/// One stored override, one per global-message page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRow {
    pub page_id: i64,
    pub name: String,
    pub language: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub rows: usize,
    pub by_language: BTreeMap<String, usize>,
}

/// The durable table of overrides. Connections are opened per operation.
#[derive(Debug, Clone)]
pub struct MessageStore {
    db_path: PathBuf,
}

impl MessageStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn exists(&self) -> bool {
        self.db_path.exists()
    }

    /// Open a connection, creating the database and schema when missing.
    pub fn open_connection(&self) -> Result<Connection> {
        ensure_db_parent(&self.db_path)?;
        let connection = open_connection(&self.db_path)?;
        initialize_schema(&connection)?;
        Ok(connection)
    }

    pub fn initialize(&self) -> Result<()> {
        self.open_connection().map(|_| ())
    }

    /// Full-table scan ordered by page id. A missing database reads as empty.
    pub fn load_rows(&self) -> Result<Vec<MessageRow>> {
        if !self.db_path.exists() {
            return Ok(Vec::new());
        }
        // WAL is persistent once the writer enabled it; readers leave the mode alone.
        let connection = open_read_connection(&self.db_path)?;
        if !table_exists(&connection, MESSAGES_TABLE)? {
            return Ok(Vec::new());
        }
        let mut statement = connection
            .prepare(
                "SELECT page_id, name, language, text
                 FROM global_messages_cache
                 ORDER BY page_id ASC",
            )
            .context("failed to prepare global_messages_cache scan")?;
        let rows = statement
            .query_map([], |row| {
                Ok(MessageRow {
                    page_id: row.get(0)?,
                    name: row.get(1)?,
                    language: row.get(2)?,
                    text: row.get(3)?,
                })
            })
            .context("failed to scan global_messages_cache")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode global_messages_cache row")?);
        }
        Ok(out)
    }

    /// Rows with the same name and language collapse to the highest page id.
    pub fn load_snapshot(&self) -> Result<CacheSnapshot> {
        Ok(CacheSnapshot::from_rows(self.load_rows()?))
    }

    pub fn page_id_for(&self, name: &str, language: &str) -> Result<Option<i64>> {
        if !self.db_path.exists() {
            return Ok(None);
        }
        let connection = self.open_connection()?;
        connection
            .query_row(
                "SELECT MAX(page_id) FROM global_messages_cache WHERE name = ?1 AND language = ?2",
                params![name, language],
                |row| row.get::<_, Option<i64>>(0),
            )
            .with_context(|| format!("failed to look up page id for {name} ({language})"))
    }

    pub fn next_page_id(&self) -> Result<i64> {
        if !self.db_path.exists() {
            return Ok(1);
        }
        let connection = self.open_connection()?;
        let current: i64 = connection
            .query_row(
                "SELECT COALESCE(MAX(page_id), 0) FROM global_messages_cache",
                [],
                |row| row.get(0),
            )
            .context("failed to read highest page id")?;
        Ok(current + 1)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let rows = self.load_rows()?;
        let mut by_language = BTreeMap::new();
        for row in &rows {
            *by_language.entry(row.language.clone()).or_insert(0usize) += 1;
        }
        Ok(StoreStats {
            rows: rows.len(),
            by_language,
        })
    }
}

pub fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(STORE_SCHEMA_SQL)
        .context("failed to initialize global_messages_cache schema")
}

/// Replace the row of `row.page_id` inside the caller's transaction,
/// returning the row it displaced.
pub fn replace_page_row(
    transaction: &Transaction<'_>,
    row: &MessageRow,
) -> Result<Option<MessageRow>> {
    let previous = delete_page_row(transaction, row.page_id)?;
    transaction
        .execute(
            "INSERT INTO global_messages_cache (page_id, name, language, text)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.page_id, row.name, row.language, row.text],
        )
        .with_context(|| format!("failed to insert row for page {}", row.page_id))?;
    Ok(previous)
}

/// Remove the row of `page_id`, returning what was there.
pub fn delete_page_row(transaction: &Transaction<'_>, page_id: i64) -> Result<Option<MessageRow>> {
    let existing = transaction
        .query_row(
            "SELECT page_id, name, language, text FROM global_messages_cache WHERE page_id = ?1",
            [page_id],
            |row| {
                Ok(MessageRow {
                    page_id: row.get(0)?,
                    name: row.get(1)?,
                    language: row.get(2)?,
                    text: row.get(3)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to read row for page {page_id}"))?;
    if existing.is_some() {
        transaction
            .execute(
                "DELETE FROM global_messages_cache WHERE page_id = ?1",
                [page_id],
            )
            .with_context(|| format!("failed to delete row for page {page_id}"))?;
    }
    Ok(existing)
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn open_read_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    Ok(connection)
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn row(page_id: i64, name: &str, language: &str, text: &str) -> MessageRow {
        MessageRow {
            page_id,
            name: name.to_string(),
            language: language.to_string(),
            text: text.to_string(),
        }
    }

    fn write_rows(store: &MessageStore, rows: &[MessageRow]) {
        let mut connection = store.open_connection().expect("open");
        let transaction = connection.transaction().expect("transaction");
        for item in rows {
            replace_page_row(&transaction, item).expect("replace");
        }
        transaction.commit().expect("commit");
    }

    #[test]
    fn missing_database_reads_as_empty() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("data").join("globalmsg.db"));
        assert!(store.load_rows().expect("load").is_empty());
        assert!(!store.exists());
        assert_eq!(store.next_page_id().expect("next id"), 1);
    }

    #[test]
    fn replace_keeps_one_row_per_page() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        write_rows(
            &store,
            &[row(7, "Mainpage", "*", "old"), row(7, "Mainpage", "de", "neu")],
        );

        let rows = store.load_rows().expect("load");
        assert_eq!(rows, vec![row(7, "Mainpage", "de", "neu")]);
        assert_eq!(store.next_page_id().expect("next id"), 8);
    }

    #[test]
    fn snapshot_prefers_highest_page_id_for_duplicate_keys() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        write_rows(
            &store,
            &[row(2, "Mainpage", "*", "second"), row(1, "Mainpage", "*", "first")],
        );
        let snapshot = store.load_snapshot().expect("snapshot");
        assert_eq!(snapshot.lookup("*", "Mainpage"), Some("second"));
        assert_eq!(store.page_id_for("Mainpage", "*").expect("page id"), Some(2));
    }

    #[test]
    fn delete_returns_previous_row_and_ignores_missing() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        write_rows(&store, &[row(3, "Sidebar", "*", "nav")]);

        let mut connection = store.open_connection().expect("open");
        let transaction = connection.transaction().expect("transaction");
        let removed = delete_page_row(&transaction, 3).expect("delete");
        let missing = delete_page_row(&transaction, 99).expect("delete missing");
        transaction.commit().expect("commit");

        assert_eq!(removed, Some(row(3, "Sidebar", "*", "nav")));
        assert_eq!(missing, None);
        assert!(store.load_rows().expect("load").is_empty());
    }

    #[test]
    fn concurrent_reader_sees_old_row_until_commit() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        write_rows(&store, &[row(5, "Mainpage", "*", "old")]);

        let mut writer = store.open_connection().expect("open writer");
        let transaction = writer.transaction().expect("transaction");
        replace_page_row(&transaction, &row(5, "Mainpage", "*", "new")).expect("replace");

        let during = store.load_rows().expect("load during");
        assert_eq!(during, vec![row(5, "Mainpage", "*", "old")]);

        transaction.commit().expect("commit");
        let after = store.load_rows().expect("load after");
        assert_eq!(after, vec![row(5, "Mainpage", "*", "new")]);
    }

    #[test]
    fn uncommitted_transaction_leaves_store_untouched() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        write_rows(&store, &[row(5, "Mainpage", "*", "old")]);
        {
            let mut connection = store.open_connection().expect("open");
            let transaction = connection.transaction().expect("transaction");
            replace_page_row(&transaction, &row(5, "Mainpage", "*", "new")).expect("replace");
        }
        assert_eq!(
            store.load_rows().expect("load"),
            vec![row(5, "Mainpage", "*", "old")]
        );
    }

    #[test]
    fn stats_count_rows_per_language() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        write_rows(
            &store,
            &[
                row(1, "A", "*", "a"),
                row(2, "A", "de", "a"),
                row(3, "B", "de", "b"),
            ],
        );
        let stats = store.stats().expect("stats");
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.by_language["de"], 2);
        assert_eq!(stats.by_language["*"], 1);
    }
}
