//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use content_mirror::content::algebra::remove;
use content_mirror::content::content_data::ContentData;
use content_mirror::content::format::{FileCompression, IndexFormat, WriteOptions};
use content_mirror::content::validation::{CheckLevel, ValidationOptions};
use content_mirror::core::config::{Config, default_server_name};
use content_mirror::core::errors::MirrorError;
use content_mirror::core::paths::resolve_absolute_path;
use content_mirror::daemon::state::{STATE_STALE_THRESHOLD_SECS, read_state};
use content_mirror::daemon::{backup_server, content_server};
use content_mirror::indexer::{IndexerConfig, index_tree};

/// Content mirror: keeps a backup server in sync with a content server.
#[derive(Debug, Parser)]
#[command(
    name = "cmir",
    author,
    version,
    about = "Content-addressed backup mirror",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the content server daemon.
    ContentServer,
    /// Run the backup server daemon.
    BackupServer,
    /// Index directory trees into an index file.
    Index(IndexArgs),
    /// Summarize or print an index file.
    Show(ShowArgs),
    /// Print the contents of B whose checksum is missing from A.
    Diff(DiffArgs),
    /// Check an index file against the files on disk.
    Validate(ValidateArgs),
    /// Show the running daemon's state file.
    Status,
}

#[derive(Debug, Clone, Args)]
struct IndexArgs {
    /// Roots to index.
    #[arg(value_name = "PATH", required = true)]
    roots: Vec<PathBuf>,
    /// Index file to write.
    #[arg(long, short, value_name = "FILE")]
    output: PathBuf,
    /// Gzip the output regardless of its extension.
    #[arg(long)]
    gzip: bool,
    /// Server name recorded on instances (defaults to the host name).
    #[arg(long, value_name = "NAME")]
    server: Option<String>,
    /// Regular expression of paths to skip; repeatable.
    #[arg(long = "exclude", value_name = "REGEX")]
    excludes: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct ShowArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Read the legacy text layout.
    #[arg(long)]
    legacy: bool,
    /// Print every record instead of counts.
    #[arg(long)]
    full: bool,
}

#[derive(Debug, Clone, Args)]
struct DiffArgs {
    #[arg(value_name = "A")]
    a: PathBuf,
    #[arg(value_name = "B")]
    b: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct ValidateArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Also recompute content checksums.
    #[arg(long)]
    deep: bool,
    /// Only check instances of this server.
    #[arg(long, value_name = "NAME")]
    server: Option<String>,
    /// Write failed instances to this index file.
    #[arg(long, value_name = "FILE")]
    failed_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Operation completed but found problems.
    #[error("{0}")]
    Partial(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<MirrorError> for CliError {
    fn from(err: MirrorError) -> Self {
        let message = err.to_string();
        match err {
            MirrorError::InvalidConfig { .. }
            | MirrorError::MissingConfig { .. }
            | MirrorError::ConfigParse { .. } => Self::User(message),
            _ => Self::Runtime(message),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    init_tracing(cli);
    match &cli.command {
        Command::ContentServer => {
            let config = Config::load(cli.config.as_deref())?;
            content_server::run(&config)?;
            Ok(())
        }
        Command::BackupServer => {
            let config = Config::load(cli.config.as_deref())?;
            backup_server::run(&config)?;
            Ok(())
        }
        Command::Index(args) => run_index(cli, args),
        Command::Show(args) => run_show(cli, args),
        Command::Diff(args) => run_diff(cli, args),
        Command::Validate(args) => run_validate(cli, args),
        Command::Status => run_status(cli),
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter = if cli.verbose || cli.quiet {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_env("CMIR_LOG").unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_index(cli: &Cli, args: &IndexArgs) -> Result<(), CliError> {
    let roots: Vec<PathBuf> = args.roots.iter().map(|p| resolve_absolute_path(p)).collect();
    let server = args.server.clone().unwrap_or_else(default_server_name);
    let config = IndexerConfig::new(roots, server, &args.excludes)?;
    let (index, report) = index_tree(&config, None);

    let options = WriteOptions {
        format: IndexFormat::Canonical,
        compression: if args.gzip {
            FileCompression::Gzip
        } else {
            FileCompression::ByExtension
        },
    };
    index.to_file_with(&args.output, options)?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "Indexed {} contents, {} instances, {} symlinks into {}",
                index.contents_size(),
                index.instances_size(),
                index.symlinks_size(),
                args.output.display()
            );
            for path in &report.failed {
                println!("  skipped: {}", path.display());
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "index",
            "output": args.output.display().to_string(),
            "counts": counts(&index),
            "hashed": report.hashed,
            "failed": report.failed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        }))?,
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(CliError::Partial(format!(
            "{} paths could not be indexed",
            report.failed.len()
        )))
    }
}

fn run_show(cli: &Cli, args: &ShowArgs) -> Result<(), CliError> {
    let format = if args.legacy {
        IndexFormat::Legacy
    } else {
        IndexFormat::Canonical
    };
    let index = ContentData::from_file_with(&args.file, format)?;
    match output_mode(cli) {
        OutputMode::Human if args.full => print!("{}", index.to_text(format)?),
        OutputMode::Human => {
            println!("{}", args.file.display());
            println!("  contents:  {}", index.contents_size());
            println!("  instances: {}", index.instances_size());
            println!("  symlinks:  {}", index.symlinks_size());
        }
        OutputMode::Json => {
            let mut payload = json!({
                "command": "show",
                "file": args.file.display().to_string(),
                "counts": counts(&index),
            });
            if args.full {
                payload["instances"] = Value::Array(
                    index
                        .instances()
                        .map(|i| {
                            json!({
                                "checksum": i.checksum,
                                "size": i.size,
                                "server": i.server,
                                "device": i.device,
                                "path": i.path,
                                "mod_time": i.mod_time,
                            })
                        })
                        .collect(),
                );
            }
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_diff(cli: &Cli, args: &DiffArgs) -> Result<(), CliError> {
    let a = load_index(&args.a)?;
    let b = load_index(&args.b)?;
    let diff = remove(Some(&a), Some(&b)).unwrap_or_default();
    match output_mode(cli) {
        OutputMode::Human => print!("{diff}"),
        OutputMode::Json => write_json_line(&json!({
            "command": "diff",
            "counts": counts(&diff),
            "checksums": diff.contents().map(|c| c.checksum).collect::<Vec<_>>(),
        }))?,
    }
    Ok(())
}

fn run_validate(cli: &Cli, args: &ValidateArgs) -> Result<(), CliError> {
    let index = load_index(&args.file)?;
    let options = ValidationOptions {
        level: if args.deep {
            CheckLevel::Deep
        } else {
            CheckLevel::Shallow
        },
        local_server: args.server.clone(),
    };
    let mut failed = ContentData::new();
    let ok = index.validate(&options, Some(&mut failed));
    if let Some(path) = &args.failed_output {
        failed.to_file(path)?;
    }

    match output_mode(cli) {
        OutputMode::Human => {
            if ok {
                println!("{}: all instances valid", args.file.display());
            } else {
                println!("{}: {} instances failed", args.file.display(), failed.instances_size());
                for instance in failed.instances() {
                    println!("  {} {}", instance.checksum, instance.path);
                }
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "validate",
            "file": args.file.display().to_string(),
            "deep": args.deep,
            "ok": ok,
            "failed": failed.instances().map(|i| i.path).collect::<Vec<_>>(),
        }))?,
    }
    if ok {
        Ok(())
    } else {
        Err(CliError::Partial("validation failed".to_string()))
    }
}

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let path = &config.paths.state_file;
    let state = if path.exists() { Some(read_state(path)?) } else { None };

    match output_mode(cli) {
        OutputMode::Human => match &state {
            None => println!("cmir: no daemon state at {}", path.display()),
            Some(state) => {
                let freshness = if state.is_stale() {
                    format!("stale (no update for over {STATE_STALE_THRESHOLD_SECS}s)")
                } else {
                    "running".to_string()
                };
                println!("{} {} v{}: {freshness}", state.role, state.server_name, state.version);
                println!("  pid:     {}", state.pid);
                println!("  started: {}", state.started_at);
                println!("  uptime:  {}s", state.uptime_seconds);
                for (name, value) in &state.vars {
                    println!("  {name:<24} {value}");
                }
                if state.dropped_log_events > 0 {
                    println!("  dropped activity events: {}", state.dropped_log_events);
                }
            }
        },
        OutputMode::Json => write_json_line(&json!({
            "command": "status",
            "state_file": path.display().to_string(),
            "running": state.as_ref().is_some_and(|s| !s.is_stale()),
            "state": state,
        }))?,
    }
    Ok(())
}

fn load_index(path: &Path) -> Result<ContentData, CliError> {
    Ok(ContentData::from_file(path)?)
}

fn counts(index: &ContentData) -> Value {
    json!({
        "contents": index.contents_size(),
        "instances": index.instances_size(),
        "symlinks": index.symlinks_size(),
    })
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CMIR_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }
    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };
    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
