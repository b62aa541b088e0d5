//! # Dvojník CLI
//!
//! Command-line interface for the Dvojník duplicate finder.
//!
//! Subcommands map onto the engine API:
//! - **scan**: enumerate roots, extract signatures, detect duplicate groups
//! - **groups**: list detected groups with confidence and rationale
//! - **merge**: plan and execute the consolidation of one group
//! - **undo**: revert the most recent (or a specific) committed merge
//! - **tx**: list transaction history
//! - **ignore**: manage never-group-together pairs
//!
//! All commands output JSON to stdout for machine readability (or a
//! human-readable summary when attached to a terminal). Errors are
//! printed to stderr with exit codes 1-4.

use clap::{Args, Parser, Subcommand, ValueEnum};
use dvojnik_core::engine::GroupFilter;
use dvojnik_core::meta::MetaField;
use dvojnik_core::{
    DvojnikError, Engine, FileId, GroupId, MediaKind, Result, ScanEvent, ScanOptions, TxId,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use time::OffsetDateTime;

// ============================================================================
// Output Format
// ============================================================================

/// Output format mode for CLI commands
#[derive(Clone, Copy, Debug)]
enum OutputFormat {
    /// Human-readable summary with real-time progress
    Human,
    /// JSON output (silent until completion)
    Json,
}

/// Determines output format based on --json flag and TTY detection
///
/// If --json is explicitly set, use JSON mode.
/// Otherwise, auto-detect: Human if stdout is a TTY, JSON if piped.
fn determine_output_format(json_flag: bool) -> OutputFormat {
    if json_flag {
        OutputFormat::Json
    } else if atty::is(atty::Stream::Stdout) {
        OutputFormat::Human
    } else {
        OutputFormat::Json
    }
}

// ============================================================================
// Timing Envelope
// ============================================================================

/// Wraps an operation result with timing metadata, so every command
/// reports `started_at`, `finished_at` and `duration_ms` consistently.
#[derive(Debug, Serialize)]
struct OperationResponse<T> {
    started_at: String,
    finished_at: String,
    duration_ms: u64,
    data: T,
}

impl<T> OperationResponse<T> {
    fn new(data: T, started_at: OffsetDateTime, finished_at: OffsetDateTime) -> Result<Self> {
        let format = &time::format_description::well_known::Rfc3339;
        let duration_ms = (finished_at - started_at).whole_milliseconds().max(0) as u64;
        Ok(Self {
            started_at: started_at.format(format).map_err(internal)?,
            finished_at: finished_at.format(format).map_err(internal)?,
            duration_ms,
            data,
        })
    }
}

fn internal(err: impl std::fmt::Display) -> DvojnikError {
    DvojnikError::Internal {
        message: err.to_string(),
    }
}

// ============================================================================
// Value Enums
// ============================================================================

/// Media kind filter for the groups listing
#[derive(Clone, Copy, Debug, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum KindFilter {
    Photo,
    Video,
}

impl From<KindFilter> for MediaKind {
    fn from(value: KindFilter) -> MediaKind {
        match value {
            KindFilter::Photo => MediaKind::Photo,
            KindFilter::Video => MediaKind::Video,
        }
    }
}

// ============================================================================
// Top-Level CLI Structure
// ============================================================================

/// Dvojník - local duplicate photo and video finder
#[derive(Parser)]
#[command(
    name = "dvojnik",
    version,
    about = "Local duplicate photo and video finder",
    long_about = "Dvojník detects near-duplicate photos and videos across local folders.\n\n\
                  It combines exact checksums, perceptual image hashes, video fingerprints\n\
                  and metadata signals into duplicate groups with a confidence score, then\n\
                  consolidates each group down to one keeper through a transactional,\n\
                  undoable merge. Originals are never rewritten; merged metadata lands in\n\
                  sidecar files. All processing happens locally.",
    after_help = "EXAMPLES:\n  \
                  dvojnik scan ~/Photos ~/Downloads\n  \
                  dvojnik groups --min-confidence 0.7\n  \
                  dvojnik merge <GROUP_ID> --dry-run\n  \
                  dvojnik undo\n\n\
                  For detailed help on a subcommand, run: dvojnik <SUBCOMMAND> --help"
)]
struct CliArgs {
    /// Application data directory (store, transaction log, recycle)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

/// Available subcommands
#[derive(Subcommand)]
enum Cmd {
    /// Scan roots and detect duplicate groups
    Scan(ScanArgs),
    /// List detected duplicate groups
    Groups(GroupsArgs),
    /// Merge one duplicate group down to its keeper
    Merge(MergeArgs),
    /// Undo the most recent (or a specific) committed merge
    Undo(UndoArgs),
    /// List transaction history
    Tx(TxArgs),
    /// Manage never-group-together pairs
    Ignore(IgnoreArgs),
}

// ============================================================================
// Subcommand Arguments
// ============================================================================

/// Scan roots and detect duplicate groups
#[derive(Args)]
#[command(after_help = "EXAMPLES:\n  \
                        # Scan one folder\n  \
                        dvojnik scan ~/Photos\n\n  \
                        # Scan several roots, including hidden files\n  \
                        dvojnik scan ~/Photos /mnt/backup --include-hidden\n\n  \
                        # Exclude a cache directory\n  \
                        dvojnik scan ~/Photos --exclude \"**/.cache/**\"")]
struct ScanArgs {
    /// Directories to scan
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Traverse hidden files and directories
    #[arg(long)]
    include_hidden: bool,

    /// Comma-separated glob patterns to exclude (e.g., "**/.cache/**")
    #[arg(long, value_name = "PATTERNS")]
    exclude: Option<String>,

    /// Output JSON format (default: auto-detect based on TTY)
    #[arg(long)]
    json: bool,
}

/// List detected duplicate groups
#[derive(Args)]
struct GroupsArgs {
    /// Only groups of this media kind
    #[arg(long)]
    kind: Option<KindFilter>,

    /// Only groups at or above this confidence
    #[arg(long, value_name = "0..1")]
    min_confidence: Option<f64>,

    /// Hide groups flagged incomplete (partial extraction or truncation)
    #[arg(long)]
    hide_incomplete: bool,

    /// Output JSON format (default: auto-detect based on TTY)
    #[arg(long)]
    json: bool,
}

/// Merge one duplicate group down to its keeper
#[derive(Args)]
#[command(after_help = "EXAMPLES:\n  \
                        # Preview what a merge would do\n  \
                        dvojnik merge <GROUP_ID> --dry-run\n\n  \
                        # Merge with an explicit keeper\n  \
                        dvojnik merge <GROUP_ID> --keeper <FILE_ID>\n\n  \
                        # Allow overwriting the keeper's capture time\n  \
                        dvojnik merge <GROUP_ID> --force-overwrite capture_time")]
struct MergeArgs {
    /// Group to merge (32-character hex id from `groups`)
    group_id: String,

    /// Keeper file id (default: the suggested keeper)
    #[arg(long, value_name = "FILE_ID")]
    keeper: Option<String>,

    /// Comma-separated keeper fields that may be overwritten even when
    /// populated (capture_time, gps, keywords, orientation,
    /// camera_model, title, description)
    #[arg(long, value_name = "FIELDS")]
    force_overwrite: Option<String>,

    /// Plan and report without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Output JSON format (default: auto-detect based on TTY)
    #[arg(long)]
    json: bool,
}

/// Undo the most recent (or a specific) committed merge
#[derive(Args)]
struct UndoArgs {
    /// Transaction to undo (default: most recent committed)
    tx_id: Option<String>,

    /// Output JSON format (default: auto-detect based on TTY)
    #[arg(long)]
    json: bool,
}

/// List transaction history
#[derive(Args)]
struct TxArgs {
    /// Maximum number of transactions to list
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Output JSON format (default: auto-detect based on TTY)
    #[arg(long)]
    json: bool,
}

/// Manage never-group-together pairs
#[derive(Args)]
struct IgnoreArgs {
    #[command(subcommand)]
    cmd: IgnoreCmd,
}

#[derive(Subcommand)]
enum IgnoreCmd {
    /// Never group these two files together
    Add {
        /// First file id
        a: String,
        /// Second file id
        b: String,
    },
    /// Allow these two files to group again
    Remove {
        /// First file id
        a: String,
        /// Second file id
        b: String,
    },
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    env_logger::init();
    let args = CliArgs::parse();
    if let Err(err) = run(args) {
        eprintln!("{}", err);
        if let Ok(json) = serde_json::to_string(&err) {
            eprintln!("{}", json);
        }
        exit(err.exit_code());
    }
}

fn run(args: CliArgs) -> Result<()> {
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    log::debug!("data directory: {}", data_dir.display());
    let engine = Engine::open(&data_dir)?;

    match args.cmd {
        Cmd::Scan(scan) => cmd_scan(&engine, scan),
        Cmd::Groups(groups) => cmd_groups(&engine, groups),
        Cmd::Merge(merge) => cmd_merge(&engine, merge),
        Cmd::Undo(undo) => cmd_undo(&engine, undo),
        Cmd::Tx(tx) => cmd_tx(&engine, tx),
        Cmd::Ignore(ignore) => cmd_ignore(&engine, ignore),
    }
}

/// Platform data directory: `$XDG_DATA_HOME/dvojnik` or
/// `~/.local/share/dvojnik`, with a working-directory fallback.
fn default_data_dir() -> Result<PathBuf> {
    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME") {
        return Ok(PathBuf::from(data_home).join("dvojnik"));
    }
    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home).join(".local/share/dvojnik"));
    }
    Ok(PathBuf::from(".dvojnik"))
}

fn parse_file_id(s: &str) -> Result<FileId> {
    FileId::parse(s)
}

// ============================================================================
// Command Implementations
// ============================================================================

fn cmd_scan(engine: &Arc<Engine>, args: ScanArgs) -> Result<()> {
    let format = determine_output_format(args.json);
    let started = OffsetDateTime::now_utc();

    let options = ScanOptions {
        include_hidden: args.include_hidden.then_some(true),
        ignore_globs: args
            .exclude
            .map(|patterns| patterns.split(',').map(|p| p.trim().to_string()).collect()),
    };
    let handle = engine.start_scan(args.roots, options);

    for event in handle.events() {
        match (&event, format) {
            (ScanEvent::Progress { discovered, .. }, OutputFormat::Human) => {
                if discovered % 100 == 0 {
                    eprintln!("  scanned {} files...", discovered);
                }
            }
            (ScanEvent::ScanError(error), OutputFormat::Human) => {
                eprintln!("  warning: {}: {}", error.path, error.message);
            }
            (ScanEvent::GroupReady(group), OutputFormat::Human) => {
                println!(
                    "group {}  {} members  confidence {:.2}",
                    group.group_id,
                    group.members.len(),
                    group.confidence
                );
            }
            _ => {}
        }
    }
    let summary = handle.wait()?;
    let finished = OffsetDateTime::now_utc();

    match format {
        OutputFormat::Human => {
            println!(
                "{} files scanned, {} groups found ({} failed) in {} ms",
                summary.discovered, summary.groups, summary.failed, summary.duration_ms
            );
        }
        OutputFormat::Json => {
            let response = OperationResponse::new(summary, started, finished)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn cmd_groups(engine: &Arc<Engine>, args: GroupsArgs) -> Result<()> {
    let format = determine_output_format(args.json);
    let started = OffsetDateTime::now_utc();

    let filter = GroupFilter {
        kind: args.kind.map(MediaKind::from),
        min_confidence: args.min_confidence,
        incomplete: args.hide_incomplete.then_some(false),
    };
    let groups = engine.list_groups(&filter);

    match format {
        OutputFormat::Human => {
            if groups.is_empty() {
                println!("no duplicate groups");
            }
            for group in &groups {
                println!(
                    "{}  {:?}  {} members  confidence {:.2}{}",
                    group.group_id,
                    group.kind,
                    group.members.len(),
                    group.confidence,
                    if group.incomplete { "  (incomplete)" } else { "" }
                );
                for line in &group.rationale_lines {
                    println!("    {}", line);
                }
                for member in &group.members {
                    let marker = if Some(*member) == group.suggested_keeper {
                        "keep"
                    } else {
                        "    "
                    };
                    let path = engine
                        .lookup_record(*member)
                        .map(|r| r.path.display().to_string())
                        .unwrap_or_else(|| member.to_string());
                    println!("  {} {}", marker, path);
                }
            }
        }
        OutputFormat::Json => {
            let response =
                OperationResponse::new(groups, started, OffsetDateTime::now_utc())?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn cmd_merge(engine: &Arc<Engine>, args: MergeArgs) -> Result<()> {
    let format = determine_output_format(args.json);
    let started = OffsetDateTime::now_utc();

    let group_id = GroupId::parse(&args.group_id)?;
    let keeper = args.keeper.as_deref().map(parse_file_id).transpose()?;
    let overwrite: Option<BTreeSet<MetaField>> = match args.force_overwrite {
        Some(fields) => Some(
            fields
                .split(',')
                .map(|f| {
                    serde_json::from_value(serde_json::Value::String(f.trim().to_string()))
                        .map_err(|_| DvojnikError::User {
                            message: format!("unknown metadata field: {}", f.trim()),
                        })
                })
                .collect::<Result<_>>()?,
        ),
        None => None,
    };

    let plan = engine.plan_merge(group_id, keeper, overwrite, args.dry_run)?;
    let tx = engine.execute_merge(&plan)?;
    let finished = OffsetDateTime::now_utc();

    match format {
        OutputFormat::Human => {
            let verb = if args.dry_run { "would merge" } else { "merged" };
            println!(
                "{} group {}: keeper {}, {} losers recycled, {} metadata writes (tx {})",
                verb,
                plan.group_id,
                plan.keeper_id,
                tx.losers.len(),
                tx.writes.len(),
                tx.tx_id
            );
        }
        OutputFormat::Json => {
            let response = OperationResponse::new(tx, started, finished)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn cmd_undo(engine: &Arc<Engine>, args: UndoArgs) -> Result<()> {
    let format = determine_output_format(args.json);
    let started = OffsetDateTime::now_utc();

    let tx_id = args.tx_id.as_deref().map(TxId::parse).transpose()?;
    let result = engine.undo(tx_id)?;
    let finished = OffsetDateTime::now_utc();

    match format {
        OutputFormat::Human => {
            println!(
                "undid transaction {}: {} files restored",
                result.target,
                result.restored_paths.len()
            );
            for path in &result.restored_paths {
                println!("  restored {}", path.display());
            }
        }
        OutputFormat::Json => {
            let response = OperationResponse::new(result, started, finished)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn cmd_tx(engine: &Arc<Engine>, args: TxArgs) -> Result<()> {
    let format = determine_output_format(args.json);
    let started = OffsetDateTime::now_utc();
    let transactions = engine.list_transactions(args.limit)?;

    match format {
        OutputFormat::Human => {
            if transactions.is_empty() {
                println!("no transactions");
            }
            for tx in &transactions {
                println!(
                    "{}  {:?}  group {}  {} losers",
                    tx.tx_id,
                    tx.status,
                    tx.group_id,
                    tx.losers.len()
                );
            }
        }
        OutputFormat::Json => {
            let response =
                OperationResponse::new(transactions, started, OffsetDateTime::now_utc())?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn cmd_ignore(engine: &Arc<Engine>, args: IgnoreArgs) -> Result<()> {
    match args.cmd {
        IgnoreCmd::Add { a, b } => {
            engine.add_ignore_pair(parse_file_id(&a)?, parse_file_id(&b)?)?;
            println!("ignore pair added");
        }
        IgnoreCmd::Remove { a, b } => {
            engine.remove_ignore_pair(parse_file_id(&a)?, parse_file_id(&b)?)?;
            println!("ignore pair removed");
        }
    }
    Ok(())
}
