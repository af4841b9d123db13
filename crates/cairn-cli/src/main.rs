use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};
use tracing::debug;

use cairn_core::catalog::Catalog;
use cairn_core::commands::{self, backup, compact, delete, list, purge, verify};
use cairn_core::config::CairnConfig;
use cairn_core::crypto::CryptoEngine;
use cairn_core::error::{CairnError, Result};
use cairn_core::progress::ProgressEvent;
use cairn_core::remote::RemoteQueue;
use cairn_core::storage;

#[derive(Parser)]
#[command(
    name = "cairn",
    version,
    about = "Deduplicating, encrypted backups to any bucket-like store",
    after_help = "\
Configuration file lookup order:
  1. --config <path>     (explicit flag)
  2. $CAIRN_CONFIG       (environment variable)
  3. ./cairn.yaml        (working directory)

Environment variables:
  CAIRN_CONFIG       Path to configuration file
  CAIRN_PASSPHRASE   Repository passphrase (overrides the config file)"
)]
struct Cli {
    /// Path to configuration file (overrides CAIRN_CONFIG and the default)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the configured or given paths into a new fileset
    Backup {
        /// Paths to back up
        paths: Vec<String>,
    },

    /// List filesets
    List,

    /// Rewrite filesets so files matching the filters are no longer part
    /// of them, then reclaim unreferenced space
    Purge {
        /// Glob filters selecting the files to remove
        filters: Vec<String>,

        /// Catalog-side SQL predicate instead of globs (advanced)
        #[arg(long, conflicts_with = "filters")]
        selector: Option<String>,

        /// Fileset version index to operate on (0 = newest, repeatable)
        #[arg(long = "version")]
        versions: Vec<usize>,

        /// Operate on filesets at or before this RFC 3339 instant
        #[arg(long)]
        time: Option<String>,

        /// Only show what would happen, change nothing
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Skip the compact pass that normally follows a rewrite
        #[arg(long)]
        no_auto_compact: bool,

        /// Skip the remote list verification precondition
        #[arg(long)]
        no_backend_verification: bool,

        /// Print every purged path instead of a summary
        #[arg(long)]
        full_result: bool,
    },

    /// Rewrite sparse dblock volumes and delete obsolete ones
    Compact {
        /// Only show what would happen, change nothing
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Rewrite volumes whose referenced share is below this percentage
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Check local-vs-remote consistency
    Verify {
        /// Treat any discrepancy as fatal
        #[arg(long)]
        strict: bool,

        /// Reconcile: finish pending deletes, restore missing manifests
        #[arg(long)]
        repair: bool,
    },

    /// Remove whole filesets by version or time
    Delete {
        /// Fileset version index to remove (0 = newest, repeatable)
        #[arg(long = "version")]
        versions: Vec<usize>,

        /// Remove filesets at or before this RFC 3339 instant
        #[arg(long)]
        time: Option<String>,

        /// Only show what would happen, change nothing
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(error_code(&err))
        }
    }
}

/// Exit code category: 2 = user input, 3 = catalog state, 4 = integrity,
/// 1 = everything else.
fn error_code(err: &CairnError) -> u8 {
    match err {
        CairnError::EmptyFilter
        | CairnError::NoMatchingVersions
        | CairnError::CatalogNotFound(_)
        | CairnError::Config(_) => 2,
        CairnError::CatalogState(_) | CairnError::OrphanFiles(_) => 3,
        CairnError::ExtraRemoteFile(_)
        | CairnError::MissingRemoteFile(_)
        | CairnError::RemoteSizeMismatch { .. } => 4,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Backup { paths } => cmd_backup(&config, paths),
        Commands::List => cmd_list(&config),
        Commands::Purge {
            filters,
            selector,
            versions,
            time,
            dry_run,
            no_auto_compact,
            no_backend_verification,
            full_result,
        } => {
            let filter = match selector {
                Some(predicate) => purge::PurgeFilter::selector(&predicate)?,
                None => purge::PurgeFilter::paths(&filters)?,
            };
            cmd_purge(
                &config,
                purge::PurgeOptions {
                    filter,
                    time: parse_time(time.as_deref())?,
                    versions,
                    dry_run,
                    no_auto_compact,
                    no_backend_verification,
                },
                full_result,
            )
        }
        Commands::Compact { dry_run, threshold } => cmd_compact(&config, dry_run, threshold),
        Commands::Verify { strict, repair } => cmd_verify(&config, strict, repair),
        Commands::Delete {
            versions,
            time,
            dry_run,
        } => cmd_delete(&config, versions, parse_time(time.as_deref())?, dry_run),
    }
}

fn load_config(explicit: Option<&str>) -> Result<CairnConfig> {
    let path = explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var("CAIRN_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("cairn.yaml"));
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        CairnError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let mut config: CairnConfig = serde_yaml::from_str(&raw)
        .map_err(|e| CairnError::Config(format!("invalid config '{}': {e}", path.display())))?;
    if let Ok(passphrase) = std::env::var("CAIRN_PASSPHRASE") {
        config.encryption.passphrase = Some(passphrase);
    }
    Ok(config)
}

fn parse_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| CairnError::Config(format!("invalid time '{s}': {e}"))),
    }
}

struct Session {
    catalog: Catalog,
    queue: RemoteQueue,
    crypto: Arc<dyn CryptoEngine>,
}

fn open_session(config: &CairnConfig, create_catalog: bool) -> Result<Session> {
    let backend: Arc<dyn storage::StorageBackend> =
        Arc::from(storage::backend_from_url(&config.repository.url)?);
    let catalog = if create_catalog {
        Catalog::open_or_create(Path::new(&config.catalog), config.blocksize, &config.prefix)?
    } else {
        Catalog::open(Path::new(&config.catalog))?
    };
    Ok(Session {
        catalog,
        queue: RemoteQueue::new(backend, config.retry.clone()),
        crypto: commands::engine_from_config(config)?,
    })
}

fn progress_printer() -> impl FnMut(ProgressEvent) {
    |event: ProgressEvent| {
        debug!(phase = event.phase, "{:5.1}%", event.fraction * 100.0);
    }
}

fn cmd_backup(config: &CairnConfig, paths: Vec<String>) -> Result<()> {
    if paths.is_empty() {
        return Err(CairnError::Config("no paths given to back up".into()));
    }
    let mut session = open_session(config, true)?;
    let mut printer = progress_printer();
    let stats = backup::run(
        config,
        &mut session.catalog,
        &mut session.queue,
        session.crypto.as_ref(),
        backup::BackupOptions {
            paths: paths.into_iter().map(PathBuf::from).collect(),
            timestamp: None,
        },
        Some(&mut printer),
    )?;
    println!(
        "Fileset {} created: {} files, {} new blocks, {} bytes stored, {} volumes uploaded",
        stats.fileset_id,
        stats.files_added,
        stats.blocks_added,
        stats.bytes_stored,
        stats.volumes_uploaded
    );
    Ok(())
}

fn cmd_list(config: &CairnConfig) -> Result<()> {
    let session = open_session(config, false)?;
    let infos = list::run(&session.catalog)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(["Version", "Time", "Files", "Full", "Volume"]);
    for info in infos {
        table.add_row([
            info.version.to_string(),
            info.timestamp.to_rfc3339(),
            info.file_count.to_string(),
            if info.is_full_backup { "yes" } else { "no" }.to_string(),
            info.volume_name,
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_purge(config: &CairnConfig, opts: purge::PurgeOptions, full_result: bool) -> Result<()> {
    let mut session = open_session(config, false)?;
    let mut printer = progress_printer();
    let stats = purge::run(
        config,
        &mut session.catalog,
        &mut session.queue,
        session.crypto.as_ref(),
        opts,
        Some(&mut printer),
    )?;

    if stats.dry_run {
        for path in &stats.would_purge {
            println!("Would purge: {path}");
        }
        for (upload, del) in &stats.would_upload_and_delete {
            println!("Would upload {upload} and delete {del}");
        }
    } else if full_result {
        println!(
            "Rewrote {} of {} fileset(s), removed {} file(s), uploaded {} and deleted {} volume(s)",
            stats.filesets_rewritten,
            stats.filesets_examined,
            stats.files_removed,
            stats.volumes_uploaded,
            stats.volumes_deleted
        );
        if let Some(compact_stats) = &stats.compact {
            println!(
                "Compact: {} volume(s) rewritten, {} deleted, {} bytes reclaimed",
                compact_stats.volumes_rewritten,
                compact_stats.volumes_deleted,
                compact_stats.bytes_reclaimed
            );
        }
    } else {
        println!(
            "Removed {} file(s) across {} fileset(s)",
            stats.files_removed, stats.filesets_rewritten
        );
    }
    Ok(())
}

fn cmd_compact(config: &CairnConfig, dry_run: bool, threshold: Option<f64>) -> Result<()> {
    let mut session = open_session(config, false)?;
    let mut opts = compact::CompactOptions::from_config(config);
    opts.dry_run = dry_run;
    if let Some(threshold) = threshold {
        opts.threshold_percent = threshold;
    }
    let mut printer = progress_printer();
    let stats = compact::run(
        config,
        &mut session.catalog,
        &mut session.queue,
        session.crypto.as_ref(),
        opts,
        Some(&mut printer),
    )?;
    println!(
        "{}Examined {} volume(s): {} rewritten, {} deleted, {} block(s) moved, {} bytes reclaimed",
        if stats.dry_run { "(dry run) " } else { "" },
        stats.volumes_examined,
        stats.volumes_rewritten,
        stats.volumes_deleted,
        stats.blocks_moved,
        stats.bytes_reclaimed
    );
    Ok(())
}

fn cmd_verify(config: &CairnConfig, strict: bool, repair: bool) -> Result<()> {
    let mut session = open_session(config, false)?;
    let mut printer = progress_printer();
    let report = verify::run(
        &mut session.catalog,
        &mut session.queue,
        session.crypto.as_ref(),
        verify::VerifyOptions { strict, repair },
        Some(&mut printer),
    )?;

    for issue in &report.catalog_issues {
        println!("catalog: {issue}");
    }
    for issue in &report.remote_issues {
        println!("remote: {issue:?}");
    }
    if report.is_clean() {
        println!("No inconsistencies found");
    } else {
        println!(
            "{} issue(s) found{}",
            report.catalog_issues.len() + report.remote_issues.len(),
            if repair { "" } else { " (rerun with --repair)" }
        );
    }
    if repair {
        println!(
            "Repaired {} and cleaned {} volume(s)",
            report.repaired, report.cleaned
        );
    }
    Ok(())
}

fn cmd_delete(
    config: &CairnConfig,
    versions: Vec<usize>,
    time: Option<DateTime<Utc>>,
    dry_run: bool,
) -> Result<()> {
    let mut session = open_session(config, false)?;
    let mut printer = progress_printer();
    let stats = delete::run(
        &mut session.catalog,
        &mut session.queue,
        delete::DeleteOptions {
            time,
            versions,
            dry_run,
        },
        Some(&mut printer),
    )?;
    println!(
        "{}Removed {} fileset(s), pruned {} file record(s), deleted {} volume(s)",
        if stats.dry_run { "(dry run) " } else { "" },
        stats.filesets_removed,
        stats.files_pruned,
        stats.volumes_deleted
    );
    Ok(())
}
