use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WIKI_ID: &str = "wiki";
pub const DEFAULT_NAMESPACE: i32 = 2900;
pub const DEFAULT_LOCAL_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_SHARED_TTL_SECS: u64 = 72 * 60 * 60;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
pub const DEFAULT_LOCK_WAIT_MS: u64 = 2_000;
pub const DEFAULT_STALE_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct GlobalMessagesConfig {
    #[serde(default)]
    pub global_messages: GlobalMessagesSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub languages: LanguagesSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct GlobalMessagesSection {
    pub wiki_id: Option<String>,
    pub central_wiki: Option<String>,
    pub enabled: Option<bool>,
    pub namespace: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub local_ttl_secs: Option<u64>,
    pub shared_ttl_secs: Option<u64>,
    pub lock_ttl_secs: Option<u64>,
    pub lock_wait_ms: Option<u64>,
    pub stale_grace_secs: Option<u64>,
    pub backend: Option<CacheBackend>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Sqlite,
    Memory,
}

impl CacheBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LanguagesSection {
    #[serde(default)]
    pub known: Vec<String>,
    #[serde(default)]
    pub fallbacks: BTreeMap<String, Vec<String>>,
}

/// Validated registry settings. Built once at startup from the config file
/// and the environment; nothing reads global state after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub wiki_id: String,
    pub central_wiki: String,
    pub enabled: bool,
    pub namespace: i32,
    pub local_ttl: Duration,
    pub shared_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub stale_grace: Duration,
    pub backend: CacheBackend,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            wiki_id: DEFAULT_WIKI_ID.to_string(),
            central_wiki: DEFAULT_WIKI_ID.to_string(),
            enabled: true,
            namespace: DEFAULT_NAMESPACE,
            local_ttl: Duration::from_secs(DEFAULT_LOCAL_TTL_SECS),
            shared_ttl: Duration::from_secs(DEFAULT_SHARED_TTL_SECS),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            stale_grace: Duration::from_secs(DEFAULT_STALE_GRACE_SECS),
            backend: CacheBackend::Sqlite,
        }
    }
}

impl RegistrySettings {
    pub fn is_central_wiki(&self) -> bool {
        self.wiki_id == self.central_wiki
    }
}

impl GlobalMessagesConfig {
    /// Resolve validated settings: env > config > default.
    pub fn settings(&self) -> Result<RegistrySettings> {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn settings_with_lookup<F>(&self, lookup_env: F) -> Result<RegistrySettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = &self.global_messages;
        let wiki_id = non_empty(lookup_env("GLOBALMSG_WIKI_ID"))
            .or_else(|| non_empty(section.wiki_id.clone()))
            .unwrap_or_else(|| DEFAULT_WIKI_ID.to_string());
        // An unset central wiki means this wiki is the central one.
        let central_wiki = non_empty(lookup_env("GLOBALMSG_CENTRAL_WIKI"))
            .or_else(|| non_empty(section.central_wiki.clone()))
            .unwrap_or_else(|| wiki_id.clone());
        let enabled = match non_empty(lookup_env("GLOBALMSG_ENABLED")) {
            Some(value) => parse_flag(&value).context("failed to parse GLOBALMSG_ENABLED")?,
            None => section.enabled.unwrap_or(true),
        };

        let cache = &self.cache;
        let settings = RegistrySettings {
            wiki_id,
            central_wiki,
            enabled,
            namespace: section.namespace.unwrap_or(DEFAULT_NAMESPACE),
            local_ttl: Duration::from_secs(cache.local_ttl_secs.unwrap_or(DEFAULT_LOCAL_TTL_SECS)),
            shared_ttl: Duration::from_secs(
                cache.shared_ttl_secs.unwrap_or(DEFAULT_SHARED_TTL_SECS),
            ),
            lock_ttl: Duration::from_secs(cache.lock_ttl_secs.unwrap_or(DEFAULT_LOCK_TTL_SECS)),
            lock_wait: Duration::from_millis(cache.lock_wait_ms.unwrap_or(DEFAULT_LOCK_WAIT_MS)),
            stale_grace: Duration::from_secs(
                cache.stale_grace_secs.unwrap_or(DEFAULT_STALE_GRACE_SECS),
            ),
            backend: cache.backend.unwrap_or_default(),
        };
        validate_settings(&settings)?;
        Ok(settings)
    }
}

/// Load and parse the config from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<GlobalMessagesConfig> {
    if !config_path.exists() {
        return Ok(GlobalMessagesConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: GlobalMessagesConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn validate_settings(settings: &RegistrySettings) -> Result<()> {
    for (label, value) in [
        ("wiki_id", &settings.wiki_id),
        ("central_wiki", &settings.central_wiki),
    ] {
        if value.chars().any(|ch| ch.is_whitespace() || ch == ':') {
            bail!("{label} must not contain whitespace or `:` (got `{value}`)");
        }
    }
    for (label, value) in [
        ("cache.local_ttl_secs", settings.local_ttl),
        ("cache.shared_ttl_secs", settings.shared_ttl),
        ("cache.lock_ttl_secs", settings.lock_ttl),
    ] {
        if value.is_zero() {
            bail!("{label} must be greater than zero");
        }
    }
    if settings.local_ttl > settings.shared_ttl {
        bail!(
            "cache.local_ttl_secs ({}) must not exceed cache.shared_ttl_secs ({})",
            settings.local_ttl.as_secs(),
            settings.shared_ttl.as_secs()
        );
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean flag, got `{other}`"),
    }
}
