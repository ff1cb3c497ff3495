use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::cache::{Clock, LocalCache, SharedCache, SharedTier, StampedePolicy, SystemClock};
use crate::config::RegistrySettings;
use crate::language::{ALL_LANGUAGES, DEBUG_LANGUAGE_CODE, LanguageCatalog};
use crate::snapshot::CacheSnapshot;
use crate::store::MessageStore;
use crate::title::{normalize_message_name, strip_language_suffix};
use crate::updater::{GlobalMessageUpdater, PageSource};

/// Bump whenever the cached snapshot changes shape.
pub const CACHE_GENERATION: u32 = 1;

/// Control message listing locked messages, one `*Name|reason` per line.
pub const PROTECTED_MESSAGES_LIST: &str = "globalmsg-protected-messages";

/// Live message-formatting cache that takes overrides right after a write.
pub trait MessageCacheSink: Send + Sync {
    /// `text` is `None` when the override was removed.
    fn replace(&self, name: &str, language: &str, text: Option<&str>);
}

pub struct GlobalMessageRegistry {
    settings: RegistrySettings,
    store: MessageStore,
    languages: LanguageCatalog,
    local: LocalCache<CacheSnapshot>,
    shared: SharedTier,
    sinks: Vec<Arc<dyn MessageCacheSink>>,
}

impl GlobalMessageRegistry {
    pub fn new(
        settings: RegistrySettings,
        store: MessageStore,
        languages: LanguageCatalog,
        shared: Arc<dyn SharedCache>,
    ) -> Self {
        let policy = StampedePolicy {
            lock_ttl: settings.lock_ttl,
            lock_wait: settings.lock_wait,
        };
        Self {
            settings,
            store,
            languages,
            local: LocalCache::new(Arc::new(SystemClock)),
            shared: SharedTier::new(shared, policy),
            sinks: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.local = LocalCache::new(clock);
        self
    }

    pub fn with_message_cache(mut self, sink: Arc<dyn MessageCacheSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn languages(&self) -> &LanguageCatalog {
        &self.languages
    }

    pub fn cache_key(&self) -> String {
        format!(
            "global:globalmessages:{CACHE_GENERATION}:{}",
            self.settings.central_wiki
        )
    }

    /// Current snapshot, loaded through both cache tiers when needed.
    pub fn snapshot(&self) -> Result<Arc<CacheSnapshot>> {
        let key = self.cache_key();
        let local_ttl = self.settings.local_ttl.min(self.settings.shared_ttl);
        self.local.get_or_load(&key, local_ttl, || {
            self.shared
                .get_or_load(&key, self.settings.shared_ttl, || self.load_from_store())
        })
    }

    /// Override text for `name` in `code`, if any.
    pub fn resolve(&self, name: &str, code: &str) -> Result<Option<String>> {
        if code == DEBUG_LANGUAGE_CODE || !self.settings.enabled {
            return Ok(None);
        }
        let snapshot = self.snapshot()?;

        let normalized = normalize_message_name(name);
        let name = strip_language_suffix(&normalized, code);
        for candidate in self.candidate_languages(code) {
            if let Some(text) = snapshot.lookup(&candidate, name) {
                debug!(name, language = %candidate, requested = code, "resolved global message");
                return Ok(Some(text.to_string()));
            }
        }
        Ok(None)
    }

    /// `code`, its strict fallbacks, then `*`.
    pub fn candidate_languages(&self, code: &str) -> Vec<String> {
        let mut out = vec![code.to_string()];
        for fallback in self.languages.fallbacks_for(code) {
            if !out.contains(&fallback) {
                out.push(fallback);
            }
        }
        if !out.iter().any(|item| item == ALL_LANGUAGES) {
            out.push(ALL_LANGUAGES.to_string());
        }
        out
    }

    /// Drop the snapshot from both tiers. The next lookup refills.
    pub fn purge_cache(&self) -> Result<()> {
        let key = self.cache_key();
        self.local.delete(&key);
        self.shared.purge(&key, self.settings.shared_ttl)?;
        info!(key = %key, "purged global message cache");
        Ok(())
    }

    /// Reason `name` is locked against edits: `Some("")` when listed without
    /// a reason, `None` when not listed.
    pub fn get_edit_restriction_info(&self, name: &str) -> Result<Option<String>> {
        let Some(list) = self.resolve(PROTECTED_MESSAGES_LIST, ALL_LANGUAGES)? else {
            return Ok(None);
        };
        Ok(parse_restriction_list(&list, name))
    }

    pub fn create_updater<'a>(&'a self, pages: &'a dyn PageSource) -> GlobalMessageUpdater<'a> {
        GlobalMessageUpdater::new(self, pages)
    }

    pub(crate) fn notify_message_caches(&self, name: &str, language: &str, text: Option<&str>) {
        for sink in &self.sinks {
            sink.replace(name, language, text);
        }
    }

    fn load_from_store(&self) -> Result<CacheSnapshot> {
        let snapshot = self.store.load_snapshot()?;
        info!(
            central_wiki = %self.settings.central_wiki,
            messages = snapshot.message_count(),
            fingerprint = %snapshot.fingerprint(),
            "loaded global messages from store"
        );
        Ok(snapshot)
    }
}

fn parse_restriction_list(list: &str, name: &str) -> Option<String> {
    let wanted = normalize_message_name(name);
    for line in list.lines() {
        let Some(entry) = line.trim().strip_prefix('*') else {
            continue;
        };
        let (listed, reason) = match entry.split_once('|') {
            Some((listed, reason)) => (listed, reason.trim()),
            None => (entry, ""),
        };
        if normalize_message_name(listed) == wanted {
            return Some(reason.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;
    use rusqlite::params;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::cache::{ManualClock, MemorySharedCache};

    fn seed(store: &MessageStore, rows: &[(i64, &str, &str, &str)]) {
        let connection = store.open_connection().expect("open");
        for (page_id, name, language, text) in rows {
            connection
                .execute(
                    "INSERT OR REPLACE INTO global_messages_cache (page_id, name, language, text)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![page_id, name, language, text],
                )
                .expect("insert");
        }
    }

    fn registry_with(
        settings: RegistrySettings,
        rows: &[(i64, &str, &str, &str)],
    ) -> (TempDir, GlobalMessageRegistry) {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        seed(&store, rows);
        let shared = Arc::new(MemorySharedCache::new(
            settings.stale_grace,
            Arc::new(SystemClock),
        ));
        let registry = GlobalMessageRegistry::new(settings, store, LanguageCatalog::builtin(), shared);
        (temp, registry)
    }

    fn registry(rows: &[(i64, &str, &str, &str)]) -> (TempDir, GlobalMessageRegistry) {
        registry_with(RegistrySettings::default(), rows)
    }

    #[test]
    fn resolve_walks_requested_fallbacks_then_default() {
        let (_temp, registry) = registry(&[
            (1, "Mainpage", "*", "Welcome"),
            (2, "Mainpage", "de", "Willkommen"),
            (3, "Sidebar", "*", "* nav"),
        ]);
        assert_eq!(
            registry.resolve("Mainpage", "de-at").expect("resolve"),
            Some("Willkommen".to_string())
        );
        assert_eq!(
            registry.resolve("Mainpage", "fr").expect("resolve"),
            Some("Welcome".to_string())
        );
        assert_eq!(
            registry.resolve("Sidebar", "de").expect("resolve"),
            Some("* nav".to_string())
        );
        assert_eq!(registry.resolve("Missing", "de").expect("resolve"), None);
    }

    #[test]
    fn resolve_prefers_requested_language_over_fallback() {
        let (_temp, registry) = registry(&[
            (1, "Mainpage", "de", "Willkommen"),
            (2, "Mainpage", "de-at", "Servus"),
        ]);
        assert_eq!(
            registry.resolve("Mainpage", "de-at").expect("resolve"),
            Some("Servus".to_string())
        );
    }

    #[test]
    fn empty_override_falls_through_to_next_candidate() {
        let (_temp, registry) = registry(&[
            (1, "Mainpage", "de", ""),
            (2, "Mainpage", "*", "Welcome"),
        ]);
        assert_eq!(
            registry.resolve("Mainpage", "de").expect("resolve"),
            Some("Welcome".to_string())
        );
    }

    #[test]
    fn resolve_strips_requested_language_suffix() {
        let (_temp, registry) = registry(&[(1, "Foo", "de", "Foo auf Deutsch")]);
        assert_eq!(
            registry.resolve("Foo/de", "de").expect("resolve"),
            registry.resolve("Foo", "de").expect("resolve")
        );
        assert_eq!(
            registry.resolve("foo/de", "de").expect("resolve"),
            Some("Foo auf Deutsch".to_string())
        );
    }

    #[test]
    fn debug_language_and_disabled_feature_skip_the_cache() {
        let (_temp, registry) = registry(&[(1, "Mainpage", "*", "Welcome")]);
        assert_eq!(registry.resolve("Mainpage", "qqx").expect("resolve"), None);

        let (temp, disabled) = registry_with(
            RegistrySettings {
                enabled: false,
                ..RegistrySettings::default()
            },
            &[(1, "Mainpage", "*", "Welcome")],
        );
        // Store is unreadable from here on.
        std::fs::remove_file(temp.path().join("globalmsg.db")).expect("remove db");
        std::fs::create_dir(temp.path().join("globalmsg.db")).expect("shadow db");
        assert_eq!(disabled.resolve("Mainpage", "en").expect("resolve"), None);
    }

    #[test]
    fn cache_key_carries_generation_and_central_wiki() {
        let (_temp, registry) = registry_with(
            RegistrySettings {
                central_wiki: "metawiki".to_string(),
                ..RegistrySettings::default()
            },
            &[],
        );
        assert_eq!(registry.cache_key(), "global:globalmessages:1:metawiki");
    }

    #[test]
    fn candidate_languages_end_with_default() {
        let (_temp, registry) = registry(&[]);
        assert_eq!(
            registry.candidate_languages("zh-tw"),
            vec!["zh-tw", "zh-hant", "zh-hans", "*"]
        );
        assert_eq!(registry.candidate_languages("*"), vec!["*"]);
    }

    #[test]
    fn snapshot_is_served_from_cache_until_purged() {
        let (temp, registry) = registry(&[(1, "Mainpage", "*", "Welcome")]);
        assert_eq!(
            registry.resolve("Mainpage", "en").expect("resolve"),
            Some("Welcome".to_string())
        );

        seed(
            &MessageStore::new(temp.path().join("globalmsg.db")),
            &[(1, "Mainpage", "*", "Hello")],
        );
        assert_eq!(
            registry.resolve("Mainpage", "en").expect("resolve"),
            Some("Welcome".to_string())
        );

        registry.purge_cache().expect("purge");
        registry.purge_cache().expect("purge again");
        assert_eq!(
            registry.resolve("Mainpage", "en").expect("resolve"),
            Some("Hello".to_string())
        );
    }

    #[test]
    fn local_tier_expiry_refetches_from_shared_tier() {
        let temp = tempdir().expect("tempdir");
        let store = MessageStore::new(temp.path().join("globalmsg.db"));
        seed(&store, &[(1, "Mainpage", "*", "Welcome")]);
        let clock = Arc::new(ManualClock::default());
        let shared = Arc::new(MemorySharedCache::new(Duration::ZERO, Arc::new(SystemClock)));
        let settings = RegistrySettings::default();
        let local_ttl = settings.local_ttl;
        let registry = GlobalMessageRegistry::new(
            settings,
            store.clone(),
            LanguageCatalog::builtin(),
            shared.clone(),
        )
        .with_clock(clock.clone());

        registry.resolve("Mainpage", "en").expect("resolve");
        seed(&store, &[(1, "Mainpage", "*", "Hello")]);
        // Another process purges only the shared tier.
        shared.delete(&registry.cache_key()).expect("delete");
        assert_eq!(
            registry.resolve("Mainpage", "en").expect("resolve"),
            Some("Welcome".to_string())
        );

        clock.advance(local_ttl + Duration::from_secs(1));
        assert_eq!(
            registry.resolve("Mainpage", "en").expect("resolve"),
            Some("Hello".to_string())
        );
    }

    #[test]
    fn edit_restriction_list_is_parsed() {
        let (_temp, registry) = registry(&[(
            1,
            "Globalmsg-protected-messages",
            "*",
            "*Foo|reason text\nignored line\n*Bar",
        )]);
        assert_eq!(
            registry.get_edit_restriction_info("Foo").expect("info"),
            Some("reason text".to_string())
        );
        assert_eq!(
            registry.get_edit_restriction_info("Bar").expect("info"),
            Some(String::new())
        );
        assert_eq!(registry.get_edit_restriction_info("Baz").expect("info"), None);
    }

    #[test]
    fn edit_restriction_is_absent_without_control_message() {
        let (_temp, registry) = registry(&[(1, "Mainpage", "*", "Welcome")]);
        assert_eq!(registry.get_edit_restriction_info("Mainpage").expect("info"), None);
    }

    #[test]
    fn restriction_reason_splits_on_first_pipe_only() {
        assert_eq!(
            parse_restriction_list("* Main page | see [[A|B]]", "Main_page"),
            Some("see [[A|B]]".to_string())
        );
    }

    struct RecordingSink {
        calls: AtomicUsize,
    }

    impl MessageCacheSink for RecordingSink {
        fn replace(&self, _name: &str, _language: &str, _text: Option<&str>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn message_cache_sinks_receive_notifications() {
        let sink = Arc::new(RecordingSink {
            calls: AtomicUsize::new(0),
        });
        let (_temp, registry) = registry(&[]);
        let registry = registry.with_message_cache(sink.clone());
        registry.notify_message_caches("Mainpage", "*", Some("Welcome"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn suffixed_and_bare_names_probe_the_same_key(
            name in "[A-Z][a-z]{1,8}",
            code in prop::sample::select(vec!["de", "fr", "de-at", "pt-br"]),
        ) {
            let (_temp, registry) = registry(&[(1, name.as_str(), code, "text")]);
            let suffixed = format!("{name}/{code}");
            prop_assert_eq!(
                registry.resolve(&suffixed, code).expect("resolve"),
                registry.resolve(&name, code).expect("resolve")
            );
            prop_assert_eq!(
                registry.resolve(&name, code).expect("resolve"),
                Some("text".to_string())
            );
        }
    }
}
