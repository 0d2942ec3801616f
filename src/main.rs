//! # Repo Merger CLI (`repo-merger`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repo-merger run` | Mirror a golden, ingest and classify fragments, optionally merge |
//! | `repo-merger scan` | Discover goldens and fragments under a directory |
//! | `repo-merger merge` | Merge analysed fragments into per-fragment worktrees |
//! | `repo-merger report` | Regenerate `report.md` and print the summary |
//! | `repo-merger handlers` | List scenario handlers and whether they are implemented |
//! | `repo-merger publish-name` | Print the name a publish step should use |
//!
//! ## Examples
//!
//! ```bash
//! # Analyse two fragments against a golden checkout
//! repo-merger run --golden ~/src/app --fragment ~/old/app --fragment ~/drop/app-files
//!
//! # Same, then merge, recovering history for plain directories first
//! repo-merger run --golden ~/src/app --fragment ~/drop/app-files --recover-missing --mode merge
//!
//! # After resolving a conflict inside its worktree
//! repo-merger merge --identifier acme-app --resume-from app-files-1a2b3c4d5e6f
//!
//! # Discover and ingest everything under an archive directory
//! repo-merger scan --source ~/archive --ingest
//! ```
//!
//! Exit codes: 0 success, 2 error, 130 cancelled.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use repo_merger::config::{self, Config};
use repo_merger::engine::{Cancelled, Engine};
use repo_merger::merge::{run_merges, MergeOptions};
use repo_merger::pipeline::{self, RunMode, RunOptions};
use repo_merger::progress::ProgressMode;
use repo_merger::report::{print_summary, write_report};
use repo_merger::scan::{self, ScanOptions};
use repo_merger::workspace::publish_name;
use repo_merger_core::handlers::HandlerRegistry;

/// Repo Merger: consolidate a golden checkout and its scattered fragments
/// into one workspace.
#[derive(Parser)]
#[command(
    name = "repo-merger",
    about = "Consolidate a golden checkout and scattered fragments of a project into one workspace",
    version,
    long_about = "Repo Merger mirrors an authoritative golden repository into a workspace, \
    ingests partial copies (fragments), classifies each against golden history, recovers \
    synthetic history for plain directories, and stages every fragment's changes in its own \
    git worktree for review."
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "./repo-merger.toml")]
    config: PathBuf,

    /// Workspace root; overrides `[workspace] root`.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Debug-level logging on stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror the golden, ingest and classify fragments, optionally merge.
    ///
    /// Writes `fragments.json`, `analysis.json`, and `report.md` under
    /// `<workspace>/<identifier>/`. Rerunning with the same inputs is safe.
    Run {
        /// Golden repository (working copy or bare).
        #[arg(long)]
        golden: PathBuf,

        /// Fragment path (directory, repository, or single file). Repeatable.
        #[arg(long = "fragment")]
        fragments: Vec<PathBuf>,

        /// Workspace identifier; derived from the golden's origin when omitted.
        #[arg(long)]
        identifier: Option<String>,

        /// Stop after analysis, or continue into merge.
        #[arg(long, value_enum, default_value_t = RunMode::Analyze)]
        mode: RunMode,

        /// Recreate golden/ and worktrees/, replacing a differing golden.
        #[arg(long)]
        force: bool,

        /// Build synthetic history for fragments without git metadata.
        #[arg(long)]
        recover_missing: bool,

        /// Clustering window for recovered commits, in minutes.
        #[arg(long)]
        threshold_minutes: Option<u32>,

        /// Resume the merge at this fragment id.
        #[arg(long)]
        resume_from: Option<String>,

        /// Keep merging after a conflict instead of halting.
        #[arg(long)]
        continue_through_conflicts: bool,
    },

    /// Discover goldens and fragments under a directory.
    ///
    /// Results are upserted into `scan_report.json` under the scan id;
    /// other scan ids in the report are left untouched.
    Scan {
        /// Directory to walk.
        #[arg(long)]
        source: PathBuf,

        /// Report key; defaults to the source directory name.
        #[arg(long)]
        scan_id: Option<String>,

        /// Use this golden instead of discovered candidates.
        #[arg(long)]
        golden: Option<PathBuf>,

        /// Glob matched against directory names for golden candidates.
        #[arg(long)]
        golden_pattern: Option<String>,

        /// Glob matched against directory names for fragments.
        #[arg(long)]
        fragment_pattern: Option<String>,

        /// Accept low-confidence candidates.
        #[arg(long)]
        approve_low_confidence: bool,

        /// Ingest and analyse approved fragments.
        #[arg(long)]
        ingest: bool,
    },

    /// Merge analysed fragments into per-fragment worktrees.
    ///
    /// Several `--identifier` flags merge those workspaces concurrently.
    Merge {
        /// Workspace identifier. Repeatable.
        #[arg(long = "identifier", required = true)]
        identifiers: Vec<String>,

        /// Resume at this fragment id.
        #[arg(long)]
        resume_from: Option<String>,

        /// Keep merging after a conflict instead of halting.
        #[arg(long)]
        continue_through_conflicts: bool,
    },

    /// Regenerate `report.md` and print the summary.
    Report {
        #[arg(long)]
        identifier: String,
    },

    /// List scenario handlers.
    Handlers,

    /// Print the name a publish step should use for a golden repository.
    PublishName {
        #[arg(long)]
        golden: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(code) => code,
        Err(e) if e.downcast_ref::<Cancelled>().is_some() => {
            eprintln!("Cancelled: {}", e);
            ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    // Commands that don't need a workspace
    match &cli.command {
        Commands::Handlers => {
            list_handlers(&HandlerRegistry::with_defaults());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::PublishName { golden } => {
            println!("{}", publish_name(golden)?);
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let mut cfg = config::load_or_minimal(&cli.config)?;
    if let Some(root) = &cli.workspace {
        cfg.workspace.root = root.clone();
    }
    apply_overrides(&mut cfg, &cli.command);
    config::validate(&cfg)?;

    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let engine = Engine::new(&cfg.workspace.root, cfg.clone()).with_progress(progress.reporter());
    let cancel = engine.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; stopping at the next checkpoint...");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Run {
            golden,
            fragments,
            identifier,
            mode,
            force,
            recover_missing,
            resume_from,
            continue_through_conflicts,
            ..
        } => {
            let options = RunOptions {
                golden,
                fragments,
                identifier,
                mode,
                force,
                recover_missing,
                merge: MergeOptions {
                    resume_from,
                    continue_through_conflicts: continue_through_conflicts
                        || cfg.merge.continue_through_conflicts,
                },
            };
            let outcome = pipeline::run(&engine, &options).await?;
            print_summary(&outcome.paths)?;
            for failure in &outcome.ingest_failures {
                println!("  ! {}: {}", failure.source, failure.reason);
            }
            for failure in &outcome.recovery_failures {
                println!("  ! {}: {}", failure.fragment_id, failure.reason);
            }
            if outcome.merge.as_ref().is_some_and(|m| m.cancelled) {
                return Ok(ExitCode::from(130));
            }
        }
        Commands::Scan {
            source,
            scan_id,
            golden,
            approve_low_confidence,
            ingest,
            ..
        } => {
            let options = ScanOptions {
                source,
                scan_id,
                golden,
                golden_pattern: cfg.scan.golden_pattern.clone(),
                fragment_pattern: cfg.scan.fragment_pattern.clone(),
                approve_low_confidence: approve_low_confidence || cfg.scan.approve_low_confidence,
                ingest,
            };
            let summary = scan::scan(&engine, &options).await?;
            println!("Scan '{}'", summary.scan_id);
            for scanned in &summary.identifiers {
                println!(
                    "  {:<32} {} fragment(s), {} newly ingested, report {}",
                    scanned.identifier,
                    scanned.section.fragments.len(),
                    scanned.newly_ingested,
                    if scanned.report_changed { "updated" } else { "unchanged" }
                );
            }
        }
        Commands::Merge {
            identifiers,
            resume_from,
            continue_through_conflicts,
        } => {
            let options = MergeOptions {
                resume_from,
                continue_through_conflicts: continue_through_conflicts
                    || cfg.merge.continue_through_conflicts,
            };
            let mut cancelled = false;
            let mut failed: Vec<String> = Vec::new();
            for (identifier, result) in run_merges(&engine, &identifiers, &options).await {
                match result {
                    Ok(report) => {
                        cancelled |= report.cancelled;
                        let paths = engine.paths(&identifier);
                        write_report(&paths)?;
                        print_summary(&paths)?;
                    }
                    Err(e) if e.downcast_ref::<Cancelled>().is_some() => cancelled = true,
                    Err(e) => {
                        eprintln!("Error: {}: {:#}", identifier, e);
                        failed.push(identifier);
                    }
                }
            }
            if !failed.is_empty() {
                anyhow::bail!("merge failed for: {}", failed.join(", "));
            }
            if cancelled {
                return Ok(ExitCode::from(130));
            }
        }
        Commands::Report { identifier } => {
            let paths = engine.paths(&identifier);
            if !paths.root.is_dir() {
                anyhow::bail!(
                    "No workspace for '{}' under {}",
                    identifier,
                    cfg.workspace.root.display()
                );
            }
            write_report(&paths)?;
            print_summary(&paths)?;
        }
        Commands::Handlers | Commands::PublishName { .. } => {
            // Handled above (before config loading)
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(cfg: &mut Config, command: &Commands) {
    match command {
        Commands::Run {
            threshold_minutes: Some(minutes),
            ..
        } => cfg.recovery.threshold_minutes = *minutes,
        Commands::Scan {
            golden_pattern,
            fragment_pattern,
            ..
        } => {
            if let Some(pattern) = golden_pattern {
                cfg.scan.golden_pattern = pattern.clone();
            }
            if let Some(pattern) = fragment_pattern {
                cfg.scan.fragment_pattern = pattern.clone();
            }
        }
        _ => {}
    }
}

fn list_handlers(registry: &HandlerRegistry) {
    println!("{:<24} {:<12} DESCRIPTION", "SCENARIO", "STATUS");
    for handler in registry.handlers() {
        println!(
            "{:<24} {:<12} {}",
            handler.kind().as_str(),
            if handler.is_implemented() { "implemented" } else { "stub" },
            handler.description()
        );
    }
}
