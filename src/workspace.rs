//! Workspace layout, golden mirroring, and per-identifier locking.
//!
//! ```text
//! <workspace>/<identifier>/
//!   golden/                  working copy of the golden repository
//!   fragments/<fragmentId>/  ingested fragment copies
//!   recovered/<fragmentId>/  synthetic repositories
//!   worktrees/<fragmentId>/  merge worktrees
//!   manifests/<fragmentId>.json
//!   fragments.json analysis.json merge_report.json report.md
//!   scan_report.json scan_manifest.json scan_failed.txt
//! ```

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use repo_merger_core::identity;
use repo_merger_core::EngineError;

use crate::git;
use crate::manifest::{self, build_manifest, build_manifest_with, ManifestOptions};

/// Paths of one identifier's workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub identifier: String,
    pub root: PathBuf,
    pub golden: PathBuf,
    pub fragments: PathBuf,
    pub recovered: PathBuf,
    pub worktrees: PathBuf,
    pub manifests: PathBuf,
}

impl WorkspacePaths {
    pub fn new(workspace_root: &Path, identifier: &str) -> Self {
        let root = workspace_root.join(identifier);
        Self {
            identifier: identifier.to_string(),
            golden: root.join("golden"),
            fragments: root.join("fragments"),
            recovered: root.join("recovered"),
            worktrees: root.join("worktrees"),
            manifests: root.join("manifests"),
            root,
        }
    }

    pub fn fragment_dir(&self, fragment_id: &str) -> PathBuf {
        self.fragments.join(fragment_id)
    }

    pub fn recovered_dir(&self, fragment_id: &str) -> PathBuf {
        self.recovered.join(fragment_id)
    }

    pub fn worktree_dir(&self, fragment_id: &str) -> PathBuf {
        self.worktrees.join(fragment_id)
    }

    pub fn manifest_file(&self, fragment_id: &str) -> PathBuf {
        self.manifests.join(format!("{}.json", fragment_id))
    }

    /// Metadata of a recovered repository, kept beside the manifests.
    pub fn recovery_file(&self, fragment_id: &str) -> PathBuf {
        self.manifests.join(format!("{}.recovery.json", fragment_id))
    }

    pub fn fragments_json(&self) -> PathBuf {
        self.root.join("fragments.json")
    }

    pub fn analysis_json(&self) -> PathBuf {
        self.root.join("analysis.json")
    }

    pub fn merge_report_json(&self) -> PathBuf {
        self.root.join("merge_report.json")
    }

    pub fn scan_report_json(&self) -> PathBuf {
        self.root.join("scan_report.json")
    }

    pub fn scan_manifest_json(&self) -> PathBuf {
        self.root.join("scan_manifest.json")
    }

    pub fn scan_failed_txt(&self) -> PathBuf {
        self.root.join("scan_failed.txt")
    }

    pub fn report_md(&self) -> PathBuf {
        self.root.join("report.md")
    }

    /// Scratch space for throwaway git indexes.
    pub fn scratch(&self) -> PathBuf {
        self.root.join(".scratch")
    }
}

/// Workspace identifier for a golden path: explicit override, then the
/// origin remote (working copy, gitfile pointer, or bare config), then the
/// directory name.
pub fn derive_identifier(repo: &Path, explicit: Option<&str>) -> Result<String> {
    let origin = git::origin_url(repo)?;
    let dir_name = dir_name(repo);
    Ok(identity::derive_identifier(
        explicit,
        origin.as_deref(),
        &dir_name,
    ))
}

/// Name the publish step should use for the golden repository.
pub fn publish_name(golden: &Path) -> Result<String> {
    let canonical = golden
        .canonicalize()
        .with_context(|| format!("Golden repository not found: {}", golden.display()))?;
    let origin = git::origin_url(&canonical)?;
    Ok(identity::publish_name(
        origin.as_deref(),
        &dir_name(&canonical),
        &canonical.to_string_lossy(),
    ))
}

fn dir_name(path: &Path) -> String {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(".git").to_string())
        .unwrap_or_default()
}

/// Create the directory contract for `identifier`.
///
/// Existing directories are reused untouched. A contract path occupied by
/// something other than a directory is a [`EngineError::WorkspaceConflict`]
/// unless `force` is set, in which case it is replaced. `force` also
/// recreates `golden/` and `worktrees/` from scratch; worktrees hang off the
/// golden repository and are invalid once it is replaced.
pub fn materialize_workspace(
    workspace_root: &Path,
    identifier: &str,
    force: bool,
) -> Result<WorkspacePaths> {
    let paths = WorkspacePaths::new(workspace_root, identifier);

    ensure_dir(&paths.root, identifier, force, false)?;
    for (dir, recreate) in [
        (&paths.golden, force),
        (&paths.fragments, false),
        (&paths.recovered, false),
        (&paths.worktrees, force),
        (&paths.manifests, false),
    ] {
        ensure_dir(dir, identifier, force, recreate)?;
    }
    if force {
        info!("Recreated golden/ and worktrees/ for '{}'", identifier);
    }
    Ok(paths)
}

fn ensure_dir(path: &Path, identifier: &str, force: bool, recreate: bool) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            if recreate {
                fs::remove_dir_all(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            } else {
                debug!("Reusing {}", path.display());
                return Ok(());
            }
        }
        Ok(_) => {
            if !force {
                return Err(EngineError::WorkspaceConflict {
                    identifier: identifier.to_string(),
                    path: path.to_path_buf(),
                    detail: "expected a directory".to_string(),
                }
                .into());
            }
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Err(_) => {}
    }
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

// ═══════════════════════════════════════════════════════════════════════
// Golden mirroring
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of [`mirror_golden`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStatus {
    /// Destination was empty; the golden was copied or cloned.
    Installed,
    /// Destination already matched the source.
    Unchanged,
    /// Destination was an incomplete copy; the missing files were copied.
    Resumed,
    /// Destination differed and `force` replaced it.
    Replaced,
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MirrorStatus::Installed => "installed",
            MirrorStatus::Unchanged => "unchanged",
            MirrorStatus::Resumed => "resumed",
            MirrorStatus::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

/// Mirror the golden repository at `source` into `paths.golden`.
///
/// Bare sources and linked checkouts are cloned into a working tree; plain
/// working copies are copied including `.git`. An existing populated destination is never
/// overwritten without `force`.
pub fn mirror_golden(source: &Path, paths: &WorkspacePaths, force: bool) -> Result<MirrorStatus> {
    let dest = &paths.golden;
    if !source.exists() {
        anyhow::bail!("Golden repository path does not exist: {}", source.display());
    }
    if !is_populated(dest)? {
        install(source, dest)?;
        info!("Installed golden {} -> {}", source.display(), dest.display());
        return Ok(MirrorStatus::Installed);
    }

    if git::is_bare_repo(source) {
        let verdict = evaluate_golden_candidate(dest, source)?;
        return match verdict.action {
            GoldenAction::Identical => Ok(MirrorStatus::Unchanged),
            _ if force => replace(source, dest),
            _ => Err(conflict(paths, &verdict.reason)),
        };
    }

    let source_head = git::head(source).ok().flatten();
    let dest_head = git::head(dest).ok().flatten();
    let wanted = build_manifest_with(source, ManifestOptions { include_vcs: true })?;
    let present = build_manifest_with(dest, ManifestOptions { include_vcs: true })?;
    let diff = present.diff(&wanted);

    if source_head == dest_head {
        if diff.is_clean() {
            return Ok(MirrorStatus::Unchanged);
        }
        // Only additions: an interrupted copy of the same golden.
        if diff.modified.is_empty() && diff.removed.is_empty() {
            let copied = manifest::copy_delta(source, &wanted, dest)?;
            info!("Resumed golden mirror: copied {} missing file(s)", copied);
            return Ok(MirrorStatus::Resumed);
        }
        // Same commit, different working files: only the checkout differs.
        let working = build_manifest(source)?.diff(&build_manifest(dest)?);
        if working.is_clean() {
            return Ok(MirrorStatus::Unchanged);
        }
    }

    if force {
        return replace(source, dest);
    }
    let verdict = evaluate_golden_candidate(dest, source)?;
    let detail = match verdict.action {
        GoldenAction::Identical => "working files differ from the source checkout".to_string(),
        _ => verdict.reason,
    };
    Err(conflict(paths, &detail))
}

fn conflict(paths: &WorkspacePaths, detail: &str) -> anyhow::Error {
    EngineError::WorkspaceConflict {
        identifier: paths.identifier.clone(),
        path: paths.golden.clone(),
        detail: detail.to_string(),
    }
    .into()
}

fn is_populated(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let mut entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    Ok(entries.next().is_some())
}

fn install(source: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("Failed to clear {}", dest.display()))?;
    }
    if git::is_bare_repo(source) {
        info!("Cloning bare repository from {}", source.display());
        git::clone(source, dest)
    } else if source.join(".git").is_file() {
        install_linked(source, dest)
    } else {
        manifest::copy_tree(source, dest).map(|_| ())
    }
}

/// Linked worktrees and submodules keep their metadata in another
/// repository's git directory. They are cloned into a standalone
/// repository on the same HEAD, with the working files laid on top, so no
/// later write reaches the source repository.
fn install_linked(source: &Path, dest: &Path) -> Result<()> {
    info!("Re-homing linked checkout {}", source.display());
    git::clone(source, dest)?;
    if let Some(head) = git::head(source)? {
        match git::current_branch(source)? {
            Some(branch) => git::run(dest, &["checkout", "-q", "-B", &branch, &head])?,
            None => git::run(dest, &["checkout", "-q", "--detach", &head])?,
        };
    }
    match git::origin_url(source)? {
        Some(url) => git::run(dest, &["remote", "set-url", "origin", &url])?,
        None => git::run(dest, &["remote", "remove", "origin"])?,
    };
    let working = build_manifest(source)?;
    manifest::copy_delta(source, &working, dest)?;
    Ok(())
}

fn replace(source: &Path, dest: &Path) -> Result<MirrorStatus> {
    info!("Replacing golden at {} (forced)", dest.display());
    install(source, dest)?;
    Ok(MirrorStatus::Replaced)
}

/// How an existing golden relates to a candidate replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoldenAction {
    /// No existing golden.
    Install,
    Identical,
    /// Candidate contains the existing HEAD plus newer commits.
    Replace,
    /// Existing golden is ahead of the candidate.
    Keep,
    Diverged,
}

impl fmt::Display for GoldenAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GoldenAction::Install => "install",
            GoldenAction::Identical => "identical",
            GoldenAction::Replace => "replace",
            GoldenAction::Keep => "keep",
            GoldenAction::Diverged => "diverged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenVerdict {
    pub action: GoldenAction,
    pub reason: String,
}

impl GoldenVerdict {
    fn new(action: GoldenAction, reason: &str) -> Self {
        Self {
            action,
            reason: reason.to_string(),
        }
    }
}

/// Compare an existing golden checkout against a candidate by history.
pub fn evaluate_golden_candidate(existing: &Path, candidate: &Path) -> Result<GoldenVerdict> {
    if !is_populated(existing)? {
        return Ok(GoldenVerdict::new(GoldenAction::Install, "no existing golden"));
    }
    let (existing_head, candidate_head) = match (git::head(existing), git::head(candidate)) {
        (Ok(Some(e)), Ok(Some(c))) => (e, c),
        _ => {
            return Ok(GoldenVerdict::new(
                GoldenAction::Diverged,
                "unable to read git metadata",
            ))
        }
    };
    if existing_head == candidate_head {
        return Ok(GoldenVerdict::new(GoldenAction::Identical, "same HEAD commit"));
    }
    if git::has_commit(candidate, &existing_head)?
        && git::is_ancestor(candidate, &existing_head, &candidate_head)?
    {
        return Ok(GoldenVerdict::new(
            GoldenAction::Replace,
            "candidate includes newer commits",
        ));
    }
    if git::has_commit(existing, &candidate_head)?
        && git::is_ancestor(existing, &candidate_head, &existing_head)?
    {
        return Ok(GoldenVerdict::new(
            GoldenAction::Keep,
            "workspace golden is ahead of the candidate",
        ));
    }
    Ok(GoldenVerdict::new(GoldenAction::Diverged, "histories diverged"))
}

// ═══════════════════════════════════════════════════════════════════════
// Locks and JSON persistence
// ═══════════════════════════════════════════════════════════════════════

/// Per-identifier mutual exclusion for writes into one workspace.
#[derive(Clone, Default)]
pub struct WorkspaceLocks {
    inner: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `identifier`.
    pub async fn lock(&self, identifier: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(identifier.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

/// Write pretty JSON with a trailing newline via a temp file and rename.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    text.push('\n');
    write_atomic(path, text.as_bytes())
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
}

/// Read JSON from `path`; `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn materialize_is_idempotent() {
        let ws = TempDir::new().unwrap();
        let paths = materialize_workspace(ws.path(), "demo", false).unwrap();
        fs::write(paths.golden.join("keep.txt"), "golden data").unwrap();

        let again = materialize_workspace(ws.path(), "demo", false).unwrap();
        assert_eq!(
            fs::read_to_string(again.golden.join("keep.txt")).unwrap(),
            "golden data"
        );
        for dir in [&again.fragments, &again.recovered, &again.worktrees, &again.manifests] {
            assert!(dir.is_dir());
        }
    }

    #[test]
    fn file_in_place_of_directory_conflicts_without_force() {
        let ws = TempDir::new().unwrap();
        fs::create_dir_all(ws.path().join("demo")).unwrap();
        fs::write(ws.path().join("demo/golden"), "not a dir").unwrap();

        let err = materialize_workspace(ws.path(), "demo", false).unwrap_err();
        let engine = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine, EngineError::WorkspaceConflict { .. }));
        assert!(err.to_string().contains("--force"));

        let paths = materialize_workspace(ws.path(), "demo", true).unwrap();
        assert!(paths.golden.is_dir());
    }

    #[test]
    fn force_recreates_golden_but_keeps_fragments() {
        let ws = TempDir::new().unwrap();
        let paths = materialize_workspace(ws.path(), "demo", false).unwrap();
        fs::write(paths.golden.join("old.txt"), "x").unwrap();
        fs::create_dir_all(paths.fragment_dir("f1")).unwrap();

        let paths = materialize_workspace(ws.path(), "demo", true).unwrap();
        assert!(!paths.golden.join("old.txt").exists());
        assert!(paths.fragment_dir("f1").is_dir());
    }

    #[test]
    fn json_round_trip_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.json");
        write_json(&path, &vec!["a", "b"]).unwrap();
        assert!(fs::read_to_string(&path).unwrap().ends_with("]\n"));
        let back: Option<Vec<String>> = read_json(&path).unwrap();
        assert_eq!(back.unwrap(), vec!["a", "b"]);
        let missing: Option<Vec<String>> = read_json(&dir.path().join("none.json")).unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn locks_serialize_same_identifier() {
        let locks = WorkspaceLocks::new();
        let guard = locks.lock("a").await;
        let other = locks.clone();
        let pending = tokio::spawn(async move {
            let _g = other.lock("a").await;
        });
        // A different identifier is not blocked.
        let _b = locks.lock("b").await;
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        drop(guard);
        pending.await.unwrap();
    }
}
