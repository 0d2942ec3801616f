//! Worktree-based merge orchestration.
//!
//! Every fragment gets its own worktree of the golden repository under
//! `worktrees/<fragmentId>/` on branch `repo-merger/<fragmentId>`. Fragments
//! with real or recovered history are replayed commit by commit; fragments
//! without history are applied as one file-level patch against golden's
//! HEAD. Conflicts are left in the worktree for the operator, and the run
//! records enough state (`appliedCommits`, `remainingCommits`) for
//! `--resume-from` to pick up inside the same worktree.
//!
//! Fragments of one workspace are processed strictly one at a time under
//! the identifier's lock; different workspaces may merge concurrently via
//! [`run_merges`].

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use repo_merger_core::models::{
    ApplyMode, ClassificationStatus, ConflictDetails, FragmentAnalysis, FragmentRecord,
    MergeOutcome, MergeReport, MergeSession, SessionState,
};
use repo_merger_core::EngineError;

use crate::engine::Engine;
use crate::git::{self, Applied, OverlayFile, Signature};
use crate::ingest::{load_manifest, load_records};
use crate::manifest::entry_source;
use crate::progress::{Phase, ProgressEvent};
use crate::workspace::{read_json, write_json, WorkspacePaths};

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Fragment to restart from; earlier fragments keep their prior session.
    pub resume_from: Option<String>,
    /// Keep going after a conflict instead of halting.
    pub continue_through_conflicts: bool,
}

/// Branch a fragment's worktree is checked out on.
pub fn branch_name(fragment_id: &str) -> String {
    format!("repo-merger/{}", fragment_id)
}

/// Read `analysis.json`; merging needs a prior analysis run.
pub fn load_analysis(paths: &WorkspacePaths) -> Result<Vec<FragmentAnalysis>> {
    read_json(&paths.analysis_json())?.with_context(|| {
        format!(
            "No analysis found for '{}'. Run `repo-merger run --golden <path> --fragment <path>` first",
            paths.identifier
        )
    })
}

pub fn load_report(paths: &WorkspacePaths) -> Result<Option<MergeReport>> {
    read_json(&paths.merge_report_json())
}

/// Merge every analysed fragment of one workspace and write
/// `merge_report.json`.
pub async fn run_merge(
    engine: &Engine,
    paths: &WorkspacePaths,
    options: &MergeOptions,
) -> Result<MergeReport> {
    let _guard = engine.locks.lock(&paths.identifier).await;
    let analyses = load_analysis(paths)?;
    let records = load_records(paths)?;
    let prior = load_report(paths)?.unwrap_or_default();

    let resume_index = match options.resume_from.as_deref() {
        None => 0,
        Some(fid) => analyses
            .iter()
            .position(|a| a.fragment_id == fid)
            .ok_or_else(|| EngineError::UnknownFragment {
                identifier: paths.identifier.clone(),
                fragment_id: fid.to_string(),
            })?,
    };

    let signature = Signature {
        name: engine.config.recovery.author_name.clone(),
        email: engine.config.recovery.author_email.clone(),
        timestamp: None,
    };
    let total = analyses.len() as u64;
    let mut report = MergeReport::default();
    let mut stop: Option<String> = None;

    for (index, analysis) in analyses.iter().enumerate() {
        let fid = &analysis.fragment_id;
        let previous = prior.session(fid).cloned();

        if let Some(reason) = &stop {
            report.sessions.push(
                previous.unwrap_or_else(|| MergeSession::skipped(fid, reason.clone())),
            );
            continue;
        }
        if engine.cancel.is_cancelled() {
            report.cancelled = true;
            stop = Some("not reached: run was cancelled".to_string());
            report.sessions.push(
                previous.unwrap_or_else(|| MergeSession::skipped(fid, "not reached: run was cancelled")),
            );
            continue;
        }
        if index < resume_index {
            report.sessions.push(
                previous.unwrap_or_else(|| MergeSession::skipped(fid, "before the resume point")),
            );
            continue;
        }
        if let Some(done) = previous.as_ref().filter(|s| is_settled(paths, s)) {
            info!("{} already merged; keeping its worktree", fid);
            report.sessions.push(done.clone());
            continue;
        }
        if analysis.status == ClassificationStatus::Orphaned {
            report.sessions.push(MergeSession::skipped(
                fid,
                "orphaned: history is unrelated to golden; review it manually",
            ));
            continue;
        }
        let Some(record) = records.iter().find(|r| &r.fragment_id == fid).cloned() else {
            report
                .sessions
                .push(MergeSession::skipped(fid, "fragment is not recorded in fragments.json"));
            continue;
        };

        let job = FragmentJob {
            paths: paths.clone(),
            record,
            previous,
            signature: signature.clone(),
            cancel: engine.cancel.clone(),
        };
        let task_fid = fid.clone();
        let session = engine
            .blocking(move || Ok(job.run()))
            .await
            .unwrap_or_else(|e| MergeSession::skipped(&task_fid, format!("{:#}", e)));

        info!("{} -> {}", fid, session.outcome);
        engine.report(ProgressEvent::Advanced {
            identifier: paths.identifier.clone(),
            phase: Phase::Merging,
            item: fid.clone(),
            n: index as u64 + 1,
            total,
        });

        if session.outcome == MergeOutcome::Conflicted && !options.continue_through_conflicts {
            if let Some(details) = &session.conflict_details {
                let err = EngineError::MergeConflict {
                    fragment_id: fid.clone(),
                    worktree: paths.worktree_dir(fid),
                    paths: details.paths.join(", "),
                };
                warn!("{}", err);
            }
            stop = Some(format!("not reached: halted after conflict in {}", fid));
        }
        if session.reason.as_deref() == Some(CANCELLED) {
            report.cancelled = true;
            stop = Some("not reached: run was cancelled".to_string());
        }
        report.sessions.push(session);
    }

    report.resume_cursor = report
        .sessions
        .iter()
        .find(|s| s.outcome != MergeOutcome::Merged)
        .map(|s| s.fragment_id.clone());
    write_json(&paths.merge_report_json(), &report)?;
    Ok(report)
}

/// Merge several workspaces concurrently. Results come back in input order.
pub async fn run_merges(
    engine: &Engine,
    identifiers: &[String],
    options: &MergeOptions,
) -> Vec<(String, Result<MergeReport>)> {
    let mut set = JoinSet::new();
    for (index, identifier) in identifiers.iter().enumerate() {
        let engine = engine.clone();
        let options = options.clone();
        let identifier = identifier.clone();
        set.spawn(async move {
            let paths = engine.paths(&identifier);
            let result = run_merge(&engine, &paths, &options).await;
            (index, identifier, result)
        });
    }
    let mut results: Vec<Option<(String, Result<MergeReport>)>> =
        identifiers.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, identifier, result)) => results[index] = Some((identifier, result)),
            Err(e) => warn!("merge task failed: {}", e),
        }
    }
    results
        .into_iter()
        .zip(identifiers)
        .map(|(slot, identifier)| {
            slot.unwrap_or_else(|| {
                (
                    identifier.clone(),
                    Err(anyhow::anyhow!("merge task for '{}' did not finish", identifier)),
                )
            })
        })
        .collect()
}

const CANCELLED: &str = "cancelled";

/// A merged session whose worktree is still on disk is never redone.
fn is_settled(paths: &WorkspacePaths, session: &MergeSession) -> bool {
    session.outcome == MergeOutcome::Merged
        && paths.worktree_dir(&session.fragment_id).join(".git").exists()
}

/// Work still owed by a prior session inside an existing worktree.
fn is_resumable(worktree: &Path, session: &MergeSession) -> bool {
    let unfinished = session.outcome == MergeOutcome::Conflicted
        || (session.reason.as_deref() == Some(CANCELLED) && !session.remaining_commits.is_empty());
    unfinished && worktree.join(".git").exists()
}

// ═══════════════════════════════════════════════════════════════════════
// Per-fragment work
// ═══════════════════════════════════════════════════════════════════════

/// Session being built, with its state machine position.
struct Tracker {
    state: SessionState,
    session: MergeSession,
}

impl Tracker {
    fn new(fragment_id: &str) -> Self {
        Self {
            state: SessionState::Pending,
            session: MergeSession::skipped(fragment_id, ""),
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        if let Some(outcome) = next.outcome() {
            self.session.outcome = outcome;
        }
    }

    fn staged(&mut self, worktree: &Path, branch: String, mode: ApplyMode) {
        self.session.worktree = Some(worktree.to_string_lossy().to_string());
        self.session.branch = Some(branch);
        self.session.mode = Some(mode);
        self.advance(SessionState::Staged);
    }

    fn merged(mut self) -> MergeSession {
        self.session.reason = None;
        self.session.conflict_details = None;
        self.session.remaining_commits.clear();
        self.advance(SessionState::Merged);
        self.session
    }

    fn conflicted(mut self, details: ConflictDetails, remaining: Vec<String>) -> MergeSession {
        self.session.reason = None;
        self.session.conflict_details = Some(details);
        self.session.remaining_commits = remaining;
        self.advance(SessionState::Conflicted);
        self.session
    }

    fn skipped(mut self, reason: impl Into<String>) -> MergeSession {
        self.session.reason = Some(reason.into());
        self.advance(SessionState::Skipped);
        self.session
    }
}

struct FragmentJob {
    paths: WorkspacePaths,
    record: FragmentRecord,
    previous: Option<MergeSession>,
    signature: Signature,
    cancel: CancellationToken,
}

impl FragmentJob {
    fn fid(&self) -> &str {
        &self.record.fragment_id
    }

    fn run(&self) -> MergeSession {
        let mut tracker = Tracker::new(self.fid());
        match self.stage_and_apply(&mut tracker) {
            Ok(Some(session)) => session,
            Ok(None) => tracker.skipped("nothing was staged"),
            Err(e) => {
                let reason = format!("{:#}", e);
                if tracker.state == SessionState::Pending {
                    tracker.skipped(reason)
                } else {
                    tracker.skipped(format!("failed after staging: {}", reason))
                }
            }
        }
    }

    /// History to replay: the fragment's own repository, else its
    /// recovered repository.
    fn history_source(&self) -> Option<PathBuf> {
        let own = self.paths.fragment_dir(self.fid());
        if git::has_git_metadata(&own) && git::is_repository(&own) {
            return Some(own);
        }
        let recovered = self.paths.recovered_dir(self.fid());
        (self.record.recovered_ref.is_some() && recovered.join(".git").exists())
            .then_some(recovered)
    }

    fn stage_and_apply(&self, tracker: &mut Tracker) -> Result<Option<MergeSession>> {
        let golden = &self.paths.golden;
        let fid = self.fid().to_string();
        let worktree = self.paths.worktree_dir(&fid);
        let branch = branch_name(&fid);

        let Some(golden_head) = git::head(golden)? else {
            return Ok(Some(
                take(tracker).skipped("golden repository has no commits to branch from"),
            ));
        };

        if let Some(previous) = self.previous.as_ref().filter(|s| is_resumable(&worktree, s)) {
            let mode = previous.mode.unwrap_or(ApplyMode::Replay);
            tracker.staged(&worktree, branch, mode);
            tracker.session.applied_commits = previous.applied_commits.clone();
            info!("Resuming {} in existing worktree {}", fid, worktree.display());
            return self.resume(tracker, previous, &worktree, &golden_head).map(Some);
        }

        if worktree.exists() {
            git::worktree_remove(golden, &worktree)?;
        }
        let source = self.history_source();
        let mode = if source.is_some() {
            ApplyMode::Replay
        } else {
            ApplyMode::Patch
        };
        if let Some(parent) = worktree.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        if let Err(e) = git::worktree_add(golden, &worktree, &branch, &golden_head) {
            let err = EngineError::WorktreeCreationFailed {
                fragment_id: fid.clone(),
                path: worktree.clone(),
                reason: format!("{:#}", e),
            };
            return Ok(Some(take(tracker).skipped(err.to_string())));
        }
        tracker.staged(&worktree, branch, mode);

        let session = match source {
            Some(source) => {
                let commits = self.plan_replay(&source, &golden_head)?;
                self.replay(tracker, &worktree, &commits)?
            }
            None => self.apply_patch(tracker, &worktree, &golden_head)?,
        };
        Ok(Some(session))
    }

    /// Commits of `source` that golden's HEAD does not already contain.
    fn plan_replay(&self, source: &Path, golden_head: &str) -> Result<Vec<String>> {
        let golden = &self.paths.golden;
        let refname = format!("{}{}", git::FRAGMENT_REF_PREFIX, self.fid());
        let Some(tip) = git::fetch_head_into(golden, source, &refname)? else {
            return Ok(Vec::new());
        };
        let base = git::merge_base(golden, golden_head, &tip)?;
        git::replay_list(golden, base.as_deref(), &tip)
    }

    /// Cherry-pick `commits` in order, stopping at the first conflict or
    /// cancellation.
    fn replay(&self, tracker: &mut Tracker, worktree: &Path, commits: &[String]) -> Result<MergeSession> {
        for (index, sha) in commits.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracker.session.remaining_commits = commits[index..].to_vec();
                return Ok(take(tracker).skipped(CANCELLED));
            }
            match git::cherry_pick(worktree, sha)? {
                Applied::Clean => tracker.session.applied_commits.push(sha.clone()),
                Applied::Conflict { paths, message } => {
                    let details = ConflictDetails {
                        commit: Some(sha.clone()),
                        paths,
                        message,
                    };
                    return Ok(take(tracker).conflicted(details, commits[index + 1..].to_vec()));
                }
            }
        }
        Ok(take(tracker).merged())
    }

    /// Overlay the fragment's files on golden's tree and apply the
    /// difference as one patch.
    fn apply_patch(&self, tracker: &mut Tracker, worktree: &Path, golden_head: &str) -> Result<MergeSession> {
        let golden = &self.paths.golden;
        let manifest = load_manifest(&self.paths, self.fid())?;
        let source = self.paths.fragment_dir(self.fid());
        let files: Vec<OverlayFile> = manifest
            .files
            .iter()
            .map(|(path, entry)| OverlayFile {
                path: path.clone(),
                source: entry_source(&source, path),
                symlink: entry.symlink.clone(),
                executable: entry.executable,
            })
            .collect();

        let scratch = self.paths.scratch();
        fs::create_dir_all(&scratch)
            .with_context(|| format!("Failed to create directory: {}", scratch.display()))?;
        let tree = git::overlay_tree(golden, golden_head, &files, &scratch)?;
        let patch = git::diff_binary(golden, golden_head, &tree)?;

        match git::apply_patch(worktree, &patch)? {
            Applied::Clean => {
                self.commit_patch(tracker, worktree)?;
                Ok(take(tracker).merged())
            }
            Applied::Conflict { paths, message } => {
                let details = ConflictDetails {
                    commit: None,
                    paths,
                    message,
                };
                Ok(take(tracker).conflicted(details, Vec::new()))
            }
        }
    }

    fn commit_patch(&self, tracker: &mut Tracker, worktree: &Path) -> Result<()> {
        if git::has_staged_changes(worktree)? {
            let message = format!("Apply fragment {}", self.fid());
            let sha = git::commit(worktree, &message, &self.signature, false)?;
            tracker.session.applied_commits.push(sha);
        }
        Ok(())
    }

    /// Continue a conflicted or cancelled session inside its worktree.
    ///
    /// The conflicted commit only counts as applied when the worktree's
    /// history carries it; an aborted or dropped pick is replayed again.
    fn resume(
        &self,
        tracker: &mut Tracker,
        previous: &MergeSession,
        worktree: &Path,
        golden_head: &str,
    ) -> Result<MergeSession> {
        let mut remaining = previous.remaining_commits.clone();
        if previous.outcome == MergeOutcome::Conflicted {
            let unresolved = git::unmerged_paths(worktree)?;
            if !unresolved.is_empty() {
                let details = ConflictDetails {
                    commit: previous.conflict_details.as_ref().and_then(|d| d.commit.clone()),
                    paths: unresolved,
                    message: "conflicts are still unresolved in the worktree".to_string(),
                };
                return Ok(take(tracker).conflicted(details, remaining));
            }
            match previous.mode {
                Some(ApplyMode::Patch) => self.commit_patch(tracker, worktree)?,
                _ => {
                    if git::cherry_pick_in_progress(worktree)? {
                        git::cherry_pick_continue(worktree)?;
                    }
                    if let Some(sha) = previous.conflict_details.as_ref().and_then(|d| d.commit.clone()) {
                        if git::has_picked(worktree, golden_head, &sha)? {
                            tracker.session.applied_commits.push(sha);
                        } else {
                            warn!("{} is not in {}'s worktree history; replaying it", sha, self.fid());
                            remaining.insert(0, sha);
                        }
                    }
                }
            }
        }
        self.replay(tracker, worktree, &remaining)
    }
}

fn take(tracker: &mut Tracker) -> Tracker {
    let fid = tracker.session.fragment_id.clone();
    std::mem::replace(tracker, Tracker::new(&fid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_walks_the_state_machine() {
        let mut tracker = Tracker::new("frag-1");
        tracker.staged(Path::new("/ws/demo/worktrees/frag-1"), branch_name("frag-1"), ApplyMode::Replay);
        assert_eq!(tracker.state, SessionState::Staged);
        let session = tracker.conflicted(
            ConflictDetails {
                commit: Some("abc".into()),
                paths: vec!["app.txt".into()],
                message: "CONFLICT".into(),
            },
            vec!["def".into()],
        );
        assert_eq!(session.outcome, MergeOutcome::Conflicted);
        assert_eq!(session.branch.as_deref(), Some("repo-merger/frag-1"));
        assert_eq!(session.remaining_commits, vec!["def"]);
    }

    #[test]
    fn skipped_from_pending_keeps_reason() {
        let session = Tracker::new("frag-2").skipped("worktree failed");
        assert_eq!(session.outcome, MergeOutcome::Skipped);
        assert_eq!(session.reason.as_deref(), Some("worktree failed"));
        assert!(session.worktree.is_none());
    }

    #[test]
    fn cancelled_session_with_work_left_is_resumable() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        let mut session = MergeSession::skipped("f", CANCELLED);
        assert!(!is_resumable(dir.path(), &session));
        session.remaining_commits = vec!["abc".into()];
        assert!(is_resumable(dir.path(), &session));
        assert!(!is_resumable(&dir.path().join("missing"), &session));
    }
}
