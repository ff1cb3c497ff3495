use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{MemorySharedCache, SharedCache, SystemClock};
use crate::config::{CacheBackend, GlobalMessagesConfig, RegistrySettings, load_config};
use crate::language::LanguageCatalog;
use crate::registry::GlobalMessageRegistry;
use crate::shared_sqlite::SqliteSharedCache;
use crate::store::MessageStore;

pub const STATE_DIR_NAME: &str = ".globalmsg";
pub const STORE_FILENAME: &str = "globalmsg.db";
pub const SHARED_CACHE_FILENAME: &str = "shared-cache.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub shared_cache_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub shared_cache_exists: bool,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nshared_cache_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.shared_cache_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();
    let shared_cache_exists = paths.shared_cache_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(".globalmsg/ is missing; run `globalmsg init` first".to_string());
    }
    if !db_exists {
        warnings.push("message store is missing; lookups will find no overrides".to_string());
    }

    Ok(RuntimeStatus {
        state_dir_exists,
        db_exists,
        db_size_bytes,
        shared_cache_exists,
        config_exists,
        warnings,
    })
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub wiki_id: Option<String>,
    pub central_wiki: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub initialized_store: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("GLOBALMSG_DATA_DIR") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("GLOBALMSG_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(STORE_FILENAME),
        shared_cache_path: data_dir.join(SHARED_CACHE_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_materialized_config(options),
        options.force,
    )?;

    let initialized_store = !paths.db_path.exists();
    MessageStore::new(&paths.db_path).initialize()?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
        initialized_store,
    })
}

pub fn render_materialized_config(options: &InitOptions) -> String {
    let wiki_id = options.wiki_id.as_deref().unwrap_or(crate::config::DEFAULT_WIKI_ID);
    let central_wiki = match options.central_wiki.as_deref() {
        Some(value) => format!("central_wiki = \"{value}\""),
        None => "# central_wiki = \"metawiki\"   # defaults to wiki_id".to_string(),
    };
    format!(
        "# globalmsg runtime configuration (materialized by `globalmsg init`)\n\n[global_messages]\nwiki_id = \"{wiki_id}\"\n{central_wiki}\nenabled = true\nnamespace = {namespace}\n\n[cache]\nlocal_ttl_secs = {local}\nshared_ttl_secs = {shared}\nlock_ttl_secs = {lock}\nlock_wait_ms = {wait}\nstale_grace_secs = {grace}\nbackend = \"sqlite\"\n\n[languages]\n# known = [\"sco\"]\n\n# [languages.fallbacks]\n# sco = [\"en\"]\n",
        namespace = crate::config::DEFAULT_NAMESPACE,
        local = crate::config::DEFAULT_LOCAL_TTL_SECS,
        shared = crate::config::DEFAULT_SHARED_TTL_SECS,
        lock = crate::config::DEFAULT_LOCK_TTL_SECS,
        wait = crate::config::DEFAULT_LOCK_WAIT_MS,
        grace = crate::config::DEFAULT_STALE_GRACE_SECS,
    )
}

/// Everything needed to serve lookups from one project root.
pub struct OpenedRuntime {
    pub config: GlobalMessagesConfig,
    pub settings: RegistrySettings,
    pub registry: GlobalMessageRegistry,
}

pub fn open_registry(paths: &ResolvedPaths) -> Result<OpenedRuntime> {
    let config = load_config(&paths.config_path)?;
    let settings = config.settings()?;
    let languages = LanguageCatalog::from_config(&config.languages)
        .with_context(|| format!("invalid [languages] in {}", paths.config_path.display()))?;
    let shared: Arc<dyn SharedCache> = match settings.backend {
        CacheBackend::Sqlite => Arc::new(SqliteSharedCache::open(
            &paths.shared_cache_path,
            settings.stale_grace,
        )?),
        CacheBackend::Memory => Arc::new(MemorySharedCache::new(
            settings.stale_grace,
            Arc::new(SystemClock),
        )),
    };
    let registry = GlobalMessageRegistry::new(
        settings.clone(),
        MessageStore::new(&paths.db_path),
        languages,
        shared,
    );
    Ok(OpenedRuntime {
        config,
        settings,
        registry,
    })
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = lookup_env("GLOBALMSG_PROJECT_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    (root, ValueSource::Heuristic)
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).exists() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = cwd.ancestors().map(Path::to_path_buf).collect();
    if let Some(exe_dir) = executable_dir {
        out.extend(exe_dir.ancestors().map(Path::to_path_buf));
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
