use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use globalmsg_core::import::{delete_page, import_directory, set_page};
use globalmsg_core::runtime::{
    InitOptions, OpenedRuntime, PathOverrides, ResolutionContext, ResolvedPaths, init_layout,
    inspect_runtime, open_registry, resolve_paths,
};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "globalmsg",
    version,
    about = "Manage interface message overrides shared from a central wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Raise log verbosity")]
    verbose: u8,
    #[arg(long, global = true, help = "Machine-readable output and JSON logs")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    #[command(about = "Store the text of one global message page")]
    Set(SetArgs),
    #[command(about = "Remove the stored row of a page")]
    Delete(DeleteArgs),
    #[command(about = "Import a directory of .wiki files")]
    Import(ImportArgs),
    #[command(about = "Look up the override for a message in a language")]
    Resolve(ResolveArgs),
    List(ListArgs),
    #[command(about = "Show whether a message is protected from local edits")]
    Restriction(RestrictionArgs),
    #[command(about = "Drop both cache tiers")]
    Purge,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, value_name = "ID", help = "Wiki id written to config.toml")]
    wiki_id: Option<String>,
    #[arg(long, value_name = "ID", help = "Central wiki id written to config.toml")]
    central_wiki: Option<String>,
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct SetArgs {
    title: String,
    #[arg(long, value_name = "ID")]
    page_id: Option<i64>,
    #[arg(long, conflicts_with = "file")]
    text: Option<String>,
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long, value_name = "ID")]
    page_id: i64,
}

#[derive(Debug, Args)]
struct ImportArgs {
    dir: PathBuf,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    name: String,
    language: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_name = "CODE")]
    language: Option<String>,
}

#[derive(Debug, Args)]
struct RestrictionArgs {
    name: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Set(args)) => run_set(&runtime, args),
        Some(Commands::Delete(DeleteArgs { page_id })) => run_delete(&runtime, page_id),
        Some(Commands::Import(ImportArgs { dir })) => run_import(&runtime, &dir),
        Some(Commands::Resolve(ResolveArgs { name, language })) => {
            run_resolve(&runtime, &name, &language)
        }
        Some(Commands::List(ListArgs { language })) => run_list(&runtime, language.as_deref()),
        Some(Commands::Restriction(RestrictionArgs { name })) => run_restriction(&runtime, &name),
        Some(Commands::Purge) => run_purge(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = match cli.verbose {
        0 => "warn,globalmsg=info,globalmsg_core=info",
        1 => "info,globalmsg=debug,globalmsg_core=debug",
        2 => "debug,globalmsg=trace,globalmsg_core=trace",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            wiki_id: args.wiki_id,
            central_wiki: args.central_wiki,
            force: args.force,
        },
    )?;

    if runtime.json {
        return print_json(&json!({
            "project_root": normalize_path(&paths.project_root),
            "db_path": normalize_path(&paths.db_path),
            "config_path": normalize_path(&paths.config_path),
            "created_dirs": report.created_dirs.len(),
            "wrote_config": report.wrote_config,
            "initialized_store": report.initialized_store,
        }));
    }
    println!("Initialized globalmsg runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("shared_cache_path: {}", normalize_path(&paths.shared_cache_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("initialized_store: {}", report.initialized_store);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let opened = open_registry(&paths)?;
    let settings = &opened.settings;
    let stats = opened.registry.store().stats()?;

    if runtime.json {
        return print_json(&json!({
            "project_root": normalize_path(&paths.project_root),
            "wiki_id": settings.wiki_id,
            "central_wiki": settings.central_wiki,
            "is_central_wiki": settings.is_central_wiki(),
            "enabled": settings.enabled,
            "namespace": settings.namespace,
            "backend": settings.backend.as_str(),
            "cache_key": opened.registry.cache_key(),
            "db_exists": status.db_exists,
            "db_size_bytes": status.db_size_bytes,
            "rows": stats.rows,
            "by_language": stats.by_language,
            "warnings": status.warnings,
        }));
    }
    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("wiki_id: {}", settings.wiki_id);
    println!("central_wiki: {}", settings.central_wiki);
    println!("is_central_wiki: {}", format_flag(settings.is_central_wiki()));
    println!("enabled: {}", format_flag(settings.enabled));
    println!("namespace: {}", settings.namespace);
    println!("cache_backend: {}", settings.backend.as_str());
    println!("cache_key: {}", opened.registry.cache_key());
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|value| value.to_string())
            .unwrap_or_else(|| "<missing>".to_string())
    );
    println!("shared_cache_exists: {}", format_flag(status.shared_cache_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("rows: {}", stats.rows);
    for (language, count) in &stats.by_language {
        println!("rows.{language}: {count}");
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_set(runtime: &RuntimeOptions, args: SetArgs) -> Result<()> {
    let text = match (args.text, args.file.as_deref()) {
        (Some(text), None) => text,
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        _ => bail!("pass exactly one of --text or --file"),
    };
    let (paths, opened) = open_runtime(runtime)?;
    let (page_id, report) = set_page(&opened.registry, args.page_id, &args.title, &text)?;

    if runtime.json {
        return print_json(&json!({
            "title": args.title,
            "page_id": page_id,
            "report": report,
        }));
    }
    println!("set global message");
    println!("title: {}", args.title);
    println!("page_id: {page_id}");
    println!("upserted: {}", report.upserted);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_delete(runtime: &RuntimeOptions, page_id: i64) -> Result<()> {
    let (paths, opened) = open_runtime(runtime)?;
    let report = delete_page(&opened.registry, page_id)?;

    if runtime.json {
        return print_json(&json!({ "page_id": page_id, "report": report }));
    }
    println!("delete global message");
    println!("page_id: {page_id}");
    println!("deleted: {}", report.deleted);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import(runtime: &RuntimeOptions, dir: &Path) -> Result<()> {
    let (paths, opened) = open_runtime(runtime)?;
    let source = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .context("failed to read current directory")?
            .join(dir)
    };
    let report = import_directory(&opened.registry, &source)?;

    if runtime.json {
        return print_json(&report);
    }
    println!("import global messages");
    println!("source: {}", normalize_path(&source));
    println!("scanned_files: {}", report.scanned_files);
    println!("upserted: {}", report.finalised.upserted);
    if !report.skipped_files.is_empty() {
        println!("skipped:");
        for file in &report.skipped_files {
            println!("  - {file}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_resolve(runtime: &RuntimeOptions, name: &str, language: &str) -> Result<()> {
    let (paths, opened) = open_runtime(runtime)?;
    let text = opened.registry.resolve(name, language)?;
    let candidates = opened.registry.candidate_languages(language);
    debug!(name, language, ?candidates, "resolved global message");

    if runtime.json {
        return print_json(&json!({
            "name": name,
            "language": language,
            "candidates": candidates,
            "text": text,
        }));
    }
    match text {
        Some(text) => println!("{text}"),
        None => println!("<no override>"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, language: Option<&str>) -> Result<()> {
    let (paths, opened) = open_runtime(runtime)?;
    let snapshot = opened.registry.snapshot()?;
    let languages: Vec<String> = match language {
        Some(code) => vec![code.to_string()],
        None => snapshot.languages().map(str::to_string).collect(),
    };

    if runtime.json {
        let mut out = serde_json::Map::new();
        for code in &languages {
            let messages: serde_json::Map<String, serde_json::Value> = snapshot
                .messages(code)
                .map(|(name, text)| (name.to_string(), json!(text)))
                .collect();
            out.insert(code.clone(), serde_json::Value::Object(messages));
        }
        return print_json(&out);
    }
    println!("global messages");
    println!("fingerprint: {}", snapshot.fingerprint());
    println!("messages: {}", snapshot.message_count());
    for code in &languages {
        for (name, text) in snapshot.messages(code) {
            println!("{code}\t{name}\t{}", first_line(text));
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_restriction(runtime: &RuntimeOptions, name: &str) -> Result<()> {
    let (paths, opened) = open_runtime(runtime)?;
    let reason = opened.registry.get_edit_restriction_info(name)?;

    if runtime.json {
        return print_json(&json!({
            "name": name,
            "protected": reason.is_some(),
            "reason": reason,
        }));
    }
    println!("edit restriction");
    println!("name: {name}");
    println!("protected: {}", format_flag(reason.is_some()));
    if let Some(reason) = reason {
        println!(
            "reason: {}",
            if reason.is_empty() { "<none>" } else { reason.as_str() }
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_purge(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, opened) = open_runtime(runtime)?;
    opened.registry.purge_cache()?;

    if runtime.json {
        return print_json(&json!({ "purged": opened.registry.cache_key() }));
    }
    println!("purged: {}", opened.registry.cache_key());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn open_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, OpenedRuntime)> {
    let paths = resolve_runtime_paths(runtime)?;
    let opened = open_registry(&paths)?;
    Ok((paths, opened))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
