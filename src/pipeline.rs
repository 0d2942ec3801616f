//! The `run` pipeline: workspace, golden mirror, ingestion, optional
//! recovery, classification, optional merge, reports.

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing::info;

use repo_merger_core::models::{FragmentAnalysis, MergeReport};

use crate::classify::analyze_fragments;
use crate::engine::Engine;
use crate::ingest::{ingest_fragments, IngestFailure};
use crate::merge::{run_merge, MergeOptions};
use crate::recovery::{recover_fragments, RecoveryFailure};
use crate::report::write_report;
use crate::workspace::{
    derive_identifier, materialize_workspace, mirror_golden, MirrorStatus, WorkspacePaths,
};

/// Whether `run` stops after analysis or goes on to merge.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum RunMode {
    #[default]
    Analyze,
    Merge,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub golden: PathBuf,
    pub fragments: Vec<PathBuf>,
    pub identifier: Option<String>,
    pub mode: RunMode,
    pub force: bool,
    /// Build synthetic history for fragments without git metadata.
    pub recover_missing: bool,
    pub merge: MergeOptions,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub paths: WorkspacePaths,
    pub mirror: MirrorStatus,
    pub analyses: Vec<FragmentAnalysis>,
    pub ingest_failures: Vec<IngestFailure>,
    pub recovery_failures: Vec<RecoveryFailure>,
    pub merge: Option<MergeReport>,
}

pub async fn run(engine: &Engine, options: &RunOptions) -> Result<RunOutcome> {
    if !options.golden.exists() {
        bail!(
            "Golden repository path does not exist: {}",
            options.golden.display()
        );
    }
    let identifier = derive_identifier(&options.golden, options.identifier.as_deref())?;
    info!("Workspace identifier: {}", identifier);

    let (paths, mirror) = {
        let _guard = engine.locks.lock(&identifier).await;
        let paths = materialize_workspace(&engine.workspace_root, &identifier, options.force)?;
        let golden = options.golden.clone();
        let mirror_paths = paths.clone();
        let force = options.force;
        let mirror = engine
            .blocking(move || mirror_golden(&golden, &mirror_paths, force))
            .await?;
        (paths, mirror)
    };
    info!("Golden mirror: {}", mirror);
    engine.checkpoint()?;

    let ingested = ingest_fragments(engine, &paths, &options.fragments).await?;
    let mut records = ingested.records;

    let recovery_failures = if options.recover_missing {
        recover_fragments(engine, &paths, &mut records).await?
    } else {
        Vec::new()
    };

    let analyses = analyze_fragments(engine, &paths, &records).await?;

    let merge = match options.mode {
        RunMode::Analyze => None,
        RunMode::Merge => Some(run_merge(engine, &paths, &options.merge).await?),
    };
    write_report(&paths)?;

    Ok(RunOutcome {
        paths,
        mirror,
        analyses,
        ingest_failures: ingested.failures,
        recovery_failures,
        merge,
    })
}
