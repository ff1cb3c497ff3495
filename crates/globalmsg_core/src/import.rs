use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::registry::GlobalMessageRegistry;
use crate::title::{MessageKey, message_key_for_title};
use crate::updater::{FinaliseReport, MemoryPageSource};

const MESSAGE_EXTENSION: &str = "wiki";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub scanned_files: usize,
    pub skipped_files: Vec<String>,
    pub finalised: FinaliseReport,
}

/// Write one page into the store, allocating a page id when the title is new.
/// Returns the page id that now holds the text.
pub fn set_page(
    registry: &GlobalMessageRegistry,
    page_id: Option<i64>,
    title: &str,
    text: &str,
) -> Result<(i64, FinaliseReport)> {
    require_central(registry)?;
    let page_id = match page_id {
        Some(value) if value > 0 => value,
        Some(value) => bail!("page id must be positive (got {value})"),
        None => PageIdAllocator::default().allocate(registry, title)?,
    };
    let pages = MemoryPageSource::new();
    pages.put_page(page_id, title, text);
    let mut updater = registry.create_updater(&pages);
    updater.insert(page_id, None)?;
    Ok((page_id, updater.finalise()?))
}

pub fn delete_page(registry: &GlobalMessageRegistry, page_id: i64) -> Result<FinaliseReport> {
    require_central(registry)?;
    let pages = MemoryPageSource::new();
    let mut updater = registry.create_updater(&pages);
    if !updater.delete(page_id) {
        bail!("page id must be positive (got {page_id})");
    }
    updater.finalise()
}

/// Import every `*.wiki` file below `dir`. The path relative to `dir`, minus
/// the extension, is the page title: `Mainpage.wiki` holds the text for all
/// languages and `Mainpage/de.wiki` the German one. All files land in one
/// transaction.
pub fn import_directory(registry: &GlobalMessageRegistry, dir: &Path) -> Result<ImportReport> {
    require_central(registry)?;
    if !dir.is_dir() {
        bail!("import source is not a directory: {}", dir.display());
    }

    let pages = MemoryPageSource::new();
    let mut report = ImportReport::default();
    let mut page_ids = Vec::new();
    let mut allocator = PageIdAllocator::default();

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        entries.push(entry.into_path());
    }

    for path in entries {
        report.scanned_files += 1;
        let relative = path
            .strip_prefix(dir)
            .with_context(|| format!("failed to strip {} from {}", dir.display(), path.display()))?;
        let Some(title) = title_from_relative(relative) else {
            report.skipped_files.push(relative.to_string_lossy().replace('\\', "/"));
            continue;
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let page_id = allocator.allocate(registry, &title)?;
        if page_ids.contains(&page_id) {
            warn!(
                file = %relative.display(),
                page_id,
                "message already imported from another file in this batch; last file wins"
            );
        } else {
            page_ids.push(page_id);
        }
        pages.put_page(page_id, &title, &text);
    }

    let mut updater = registry.create_updater(&pages);
    for page_id in page_ids {
        updater.insert(page_id, None)?;
    }
    report.finalised = updater.finalise()?;
    info!(
        source = %dir.display(),
        scanned = report.scanned_files,
        upserted = report.finalised.upserted,
        skipped = report.skipped_files.len(),
        "imported global messages"
    );
    Ok(report)
}

fn require_central(registry: &GlobalMessageRegistry) -> Result<()> {
    let settings = registry.settings();
    if !settings.is_central_wiki() {
        bail!(
            "global messages are edited on {} only (this is {})",
            settings.central_wiki,
            settings.wiki_id
        );
    }
    Ok(())
}

/// Hands out page ids for a batch that has not been committed yet. A key
/// keeps the id already holding it in the store or earlier in the batch;
/// anything else takes the next free id.
#[derive(Default)]
struct PageIdAllocator {
    next_free: Option<i64>,
    assigned: HashMap<MessageKey, i64>,
}

impl PageIdAllocator {
    fn allocate(&mut self, registry: &GlobalMessageRegistry, title: &str) -> Result<i64> {
        let key = message_key_for_title(title, registry.languages());
        if let Some(page_id) = self.assigned.get(&key) {
            return Ok(*page_id);
        }
        let page_id = match registry.store().page_id_for(&key.name, &key.language)? {
            Some(existing) => existing,
            None => {
                let candidate = match self.next_free {
                    Some(value) => value,
                    None => registry.store().next_page_id()?,
                };
                self.next_free = Some(candidate + 1);
                candidate
            }
        };
        self.assigned.insert(key, page_id);
        Ok(page_id)
    }
}

fn title_from_relative(relative: &Path) -> Option<String> {
    if relative.extension().and_then(|ext| ext.to_str()) != Some(MESSAGE_EXTENSION) {
        return None;
    }
    let without_extension = relative.with_extension("");
    let title = without_extension
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if title.trim().is_empty() {
        None
    } else {
        Some(title)
    }
}
