//! Materializes synthetic history for fragments that have none.
//!
//! The commit plan comes from [`repo_merger_core::recovery::plan_commits`];
//! this module turns it into a real repository under
//! `recovered/<fragmentId>/`, seeded from golden's HEAD when golden has
//! commits. Author and committer dates are pinned to each group's
//! timestamp, so the same plan and seed always produce the same commit ids.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use repo_merger_core::models::{ContentManifest, FragmentRecord, RecoveredRepository, SyntheticCommit};
use repo_merger_core::recovery::{commit_message, plan_commits};
use repo_merger_core::EngineError;

use crate::config::RecoveryConfig;
use crate::engine::Engine;
use crate::git::{self, Signature};
use crate::ingest::{load_manifest, load_records, save_records};
use crate::manifest;
use crate::progress::{Phase, ProgressEvent};
use crate::workspace::{read_json, write_json, WorkspacePaths};

const SEED_REF: &str = "refs/repo-merger/seed";

/// A fragment that could not be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryFailure {
    pub fragment_id: String,
    pub reason: String,
}

/// Build (or reuse) the synthetic repository for one fragment.
pub fn recover_fragment(
    paths: &WorkspacePaths,
    fragment_id: &str,
    manifest: &ContentManifest,
    settings: &RecoveryConfig,
) -> Result<RecoveredRepository> {
    let threshold = settings.threshold_minutes;
    let mut commits = plan_commits(fragment_id, manifest, threshold, &settings.author())?;
    let seed = git::head(&paths.golden).ok().flatten();
    let dir = paths.recovered_dir(fragment_id);

    if let Some(previous) = read_json::<RecoveredRepository>(&paths.recovery_file(fragment_id))? {
        if is_current(&previous, &dir, threshold, seed.as_deref(), &commits)? {
            info!("Recovered history for {} is up to date", fragment_id);
            return Ok(previous);
        }
    }

    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    git::init(&dir)?;

    if let Some(seed) = seed.as_deref() {
        git::fetch_head_into(&dir, &paths.golden, SEED_REF)?;
        git::run(&dir, &["checkout", "-q", "-B", "main", seed])?;
    }

    let source = paths.fragment_dir(fragment_id);
    let total = commits.len();
    for (index, commit) in commits.iter_mut().enumerate() {
        let mut group = ContentManifest::new();
        for path in &commit.files {
            if let Some(entry) = manifest.files.get(path) {
                group.insert(path, entry.clone());
            }
        }
        manifest::copy_delta(&source, &group, &dir)?;
        git::add_paths(&dir, &commit.files)?;
        let signature = Signature {
            name: settings.author_name.clone(),
            email: settings.author_email.clone(),
            timestamp: Some(commit.timestamp),
        };
        let message = commit_message(index, total, commit);
        commit.sha = Some(git::commit(&dir, &message, &signature, true)?);
    }

    let recovered = RecoveredRepository {
        fragment_id: fragment_id.to_string(),
        path: format!("recovered/{}", fragment_id),
        threshold_minutes: threshold,
        seed,
        commits,
    };
    write_json(&paths.recovery_file(fragment_id), &recovered)?;
    info!(
        "Recovered {} synthetic commit(s) for {}",
        recovered.commits.len(),
        fragment_id
    );
    Ok(recovered)
}

/// The stored repository matches the plan and its HEAD is the last
/// recorded commit.
fn is_current(
    previous: &RecoveredRepository,
    dir: &Path,
    threshold: u32,
    seed: Option<&str>,
    planned: &[SyntheticCommit],
) -> Result<bool> {
    if previous.threshold_minutes != threshold || previous.seed.as_deref() != seed {
        return Ok(false);
    }
    let same_plan = previous.commits.len() == planned.len()
        && previous.commits.iter().zip(planned).all(|(a, b)| {
            a.timestamp == b.timestamp && a.author == b.author && a.files == b.files
        });
    if !same_plan || !dir.join(".git").exists() {
        return Ok(false);
    }
    let last = previous.commits.last().and_then(|c| c.sha.as_deref());
    Ok(last.is_some() && git::head(dir).ok().flatten().as_deref() == last)
}

/// Recover every fragment in `records` that has no git history and record
/// `recoveredRef` in `fragments.json`. Per-fragment failures (for example an
/// empty manifest) are returned, not raised.
pub async fn recover_fragments(
    engine: &Engine,
    paths: &WorkspacePaths,
    records: &mut [FragmentRecord],
) -> Result<Vec<RecoveryFailure>> {
    let _guard = engine.locks.lock(&paths.identifier).await;
    let mut failures = Vec::new();
    let candidates: Vec<usize> = (0..records.len())
        .filter(|&i| !git::has_git_metadata(&paths.fragment_dir(&records[i].fragment_id)))
        .collect();
    let total = candidates.len() as u64;

    for (n, index) in candidates.into_iter().enumerate() {
        engine.checkpoint()?;
        let fid = records[index].fragment_id.clone();
        let task_paths = paths.clone();
        let task_fid = fid.clone();
        let settings = engine.config.recovery.clone();
        let result = engine
            .blocking(move || {
                let manifest = load_manifest(&task_paths, &task_fid)?;
                recover_fragment(&task_paths, &task_fid, &manifest, &settings)
            })
            .await;
        match result {
            Ok(recovered) => records[index].recovered_ref = Some(recovered.path),
            Err(e) => {
                let reason = match e.downcast_ref::<EngineError>() {
                    Some(engine_err) => engine_err.to_string(),
                    None => format!("{:#}", e),
                };
                warn!("Recovery skipped for {}: {}", fid, reason);
                failures.push(RecoveryFailure {
                    fragment_id: fid.clone(),
                    reason,
                });
            }
        }
        engine.report(ProgressEvent::Advanced {
            identifier: paths.identifier.clone(),
            phase: Phase::Recovering,
            item: fid,
            n: n as u64 + 1,
            total,
        });
    }

    let mut stored = load_records(paths)?;
    for record in stored.iter_mut() {
        if let Some(updated) = records.iter().find(|r| r.fragment_id == record.fragment_id) {
            record.recovered_ref = updated.recovered_ref.clone();
        }
    }
    save_records(paths, &stored)?;
    Ok(failures)
}
