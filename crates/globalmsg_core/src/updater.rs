use std::collections::BTreeMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::registry::GlobalMessageRegistry;
use crate::store::{MessageRow, delete_page_row, replace_page_row};
use crate::title::message_key_for_title;

/// A page revision as handed over by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: i64,
    pub content: Option<String>,
}

/// Host view of pages in the global-message namespace.
pub trait PageSource {
    /// Title text without the namespace prefix, e.g. `Mainpage/de`.
    fn title_of(&self, page_id: i64) -> Result<Option<String>>;
    fn latest_revision(&self, page_id: i64) -> Result<Option<Revision>>;
}

#[derive(Debug, Clone)]
struct MemoryPage {
    title: String,
    revision: Revision,
}

/// In-memory [`PageSource`], used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryPageSource {
    pages: Mutex<BTreeMap<i64, MemoryPage>>,
}

impl MemoryPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new revision of `page_id`, returning the revision id.
    pub fn put_page(&self, page_id: i64, title: &str, content: &str) -> i64 {
        let mut pages = self.pages.lock();
        let next_revision = pages
            .get(&page_id)
            .map(|page| page.revision.id + 1)
            .unwrap_or(1);
        pages.insert(
            page_id,
            MemoryPage {
                title: title.to_string(),
                revision: Revision {
                    id: next_revision,
                    content: Some(content.to_string()),
                },
            },
        );
        next_revision
    }

    pub fn rename_page(&self, page_id: i64, title: &str) -> bool {
        match self.pages.lock().get_mut(&page_id) {
            Some(page) => {
                page.title = title.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove_page(&self, page_id: i64) -> bool {
        self.pages.lock().remove(&page_id).is_some()
    }
}

impl PageSource for MemoryPageSource {
    fn title_of(&self, page_id: i64) -> Result<Option<String>> {
        Ok(self
            .pages
            .lock()
            .get(&page_id)
            .map(|page| page.title.clone()))
    }

    fn latest_revision(&self, page_id: i64) -> Result<Option<Revision>> {
        Ok(self
            .pages
            .lock()
            .get(&page_id)
            .map(|page| page.revision.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingChange {
    Upsert(MessageRow),
    Delete(i64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinaliseReport {
    pub upserted: usize,
    pub deleted: usize,
}

/// Batch of store writes for one page event.
///
/// `insert`/`delete` only queue work. `finalise` applies the whole batch in a
/// single SQLite transaction, so a reader sees either the old row or the new
/// one, then purges both cache tiers. Dropping the updater without calling
/// `finalise` writes nothing.
pub struct GlobalMessageUpdater<'a> {
    registry: &'a GlobalMessageRegistry,
    pages: &'a dyn PageSource,
    pending: Vec<PendingChange>,
}

impl<'a> GlobalMessageUpdater<'a> {
    pub(crate) fn new(registry: &'a GlobalMessageRegistry, pages: &'a dyn PageSource) -> Self {
        Self {
            registry,
            pages,
            pending: Vec::new(),
        }
    }

    /// Queue the current text of `page_id`. Passing the revision that was just
    /// saved avoids fetching it again. Returns `false` when the page has no
    /// title or no current content.
    pub fn insert(&mut self, page_id: i64, revision: Option<&Revision>) -> Result<bool> {
        if page_id <= 0 {
            return Ok(false);
        }
        let Some(title) = self
            .pages
            .title_of(page_id)
            .with_context(|| format!("failed to look up title of page {page_id}"))?
        else {
            debug!(page_id, "skipping global message insert: no title");
            return Ok(false);
        };
        let fetched;
        let revision = match revision {
            Some(revision) => revision,
            None => {
                fetched = self
                    .pages
                    .latest_revision(page_id)
                    .with_context(|| format!("failed to load revision of page {page_id}"))?;
                match &fetched {
                    Some(revision) => revision,
                    None => {
                        debug!(page_id, "skipping global message insert: no revision");
                        return Ok(false);
                    }
                }
            }
        };
        let Some(text) = revision.content.clone() else {
            debug!(page_id, "skipping global message insert: no content");
            return Ok(false);
        };

        let key = message_key_for_title(&title, self.registry.languages());
        self.pending.push(PendingChange::Upsert(MessageRow {
            page_id,
            name: key.name,
            language: key.language,
            text,
        }));
        Ok(true)
    }

    /// Queue removal of the row of `page_id`.
    pub fn delete(&mut self, page_id: i64) -> bool {
        if page_id <= 0 {
            return false;
        }
        self.pending.push(PendingChange::Delete(page_id));
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn finalise(self) -> Result<FinaliseReport> {
        let mut report = FinaliseReport::default();
        let mut changed: Vec<(String, String, Option<String>)> = Vec::new();

        if !self.pending.is_empty() {
            let mut connection = self.registry.store().open_connection()?;
            let transaction = connection
                .transaction()
                .context("failed to start global message transaction")?;
            for change in &self.pending {
                match change {
                    PendingChange::Upsert(row) => {
                        if let Some(previous) = replace_page_row(&transaction, row)?
                            && (previous.name != row.name || previous.language != row.language)
                        {
                            changed.push((previous.name, previous.language, None));
                        }
                        changed.push((row.name.clone(), row.language.clone(), Some(row.text.clone())));
                        report.upserted += 1;
                    }
                    PendingChange::Delete(page_id) => {
                        if let Some(previous) = delete_page_row(&transaction, *page_id)? {
                            changed.push((previous.name, previous.language, None));
                            report.deleted += 1;
                        }
                    }
                }
            }
            transaction
                .commit()
                .context("failed to commit global message transaction")?;
        }

        self.registry.purge_cache()?;
        for (name, language, text) in &changed {
            self.registry
                .notify_message_caches(name, language, text.as_deref());
        }
        info!(
            upserted = report.upserted,
            deleted = report.deleted,
            "finalised global message update"
        );
        Ok(report)
    }
}
