//! Core data models shared by the engine and its reports.
//!
//! These types are what gets written into the workspace as JSON
//! (`analysis.json`, `merge_report.json`, `fragments.json`,
//! `manifests/<fragmentId>.json`), so their serde shapes are part of the
//! on-disk contract. JSON field names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
// Content manifests
// ═══════════════════════════════════════════════════════════════════════

/// One regular file (or symlink) in a [`ContentManifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Size in bytes. For symlinks, the length of the target path.
    pub size: u64,
    /// Hex SHA-256 of the file bytes, or of the link target for symlinks.
    pub sha256: String,
    /// Modification time as Unix seconds.
    pub modified: i64,
    /// Link target when the entry is a symlink; symlinks are never followed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<String>,
    /// Whether the owner-executable bit is set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,
}

/// A file that could not be read while building a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableEntry {
    pub path: String,
    pub reason: String,
}

/// Hash-addressed inventory of a directory tree.
///
/// Paths are relative, `/`-separated, and unique; the map is ordered, so
/// serialization never depends on the order in which the tree was walked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreadable: Vec<UnreadableEntry>,
}

impl ContentManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under a normalized relative path.
    ///
    /// Returns `false` (and inserts nothing) when the path is absolute or
    /// escapes the root.
    pub fn insert(&mut self, path: &str, entry: FileEntry) -> bool {
        match normalize_relative(path) {
            Some(normalized) => {
                self.files.insert(normalized, entry);
                true
            }
            None => false,
        }
    }

    pub fn record_unreadable(&mut self, path: &str, reason: impl Into<String>) {
        self.unreadable.push(UnreadableEntry {
            path: path.to_string(),
            reason: reason.into(),
        });
        self.unreadable.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// `unreadable:N (a, b, c)` when any file could not be read.
    pub fn unreadable_summary(&self) -> Option<String> {
        if self.unreadable.is_empty() {
            return None;
        }
        let preview: Vec<&str> = self
            .unreadable
            .iter()
            .take(3)
            .map(|u| u.path.as_str())
            .collect();
        Some(format!(
            "unreadable:{} ({})",
            self.unreadable.len(),
            preview.join(", ")
        ))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Content digest of the whole manifest.
    ///
    /// Covers paths, sizes, and content hashes but not modification times,
    /// so touching a file without changing it keeps the digest stable.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, entry) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.size.to_le_bytes());
            hasher.update(entry.sha256.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }

    /// Compare `self` (the base, usually golden) against `other`.
    pub fn diff(&self, other: &ContentManifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, entry) in &other.files {
            match self.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(base) if base.sha256 != entry.sha256 || base.symlink != entry.symlink => {
                    diff.modified.push(path.clone())
                }
                Some(_) => {}
            }
        }
        for path in self.files.keys() {
            if !other.files.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }
        diff
    }
}

/// File-level difference between two manifests. Paths are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ManifestDiff {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Paths a partial copy contributes: additions and modifications.
    ///
    /// Removals are excluded; a fragment missing a file says nothing about
    /// whether the file should exist.
    pub fn contributed(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Human-readable summary, e.g. `added:2 (a.txt, b.txt); modified:1 (c.txt)`.
    pub fn summary(&self) -> Option<String> {
        if self.is_clean() {
            return None;
        }
        let mut parts = Vec::new();
        for (label, paths) in [
            ("added", &self.added),
            ("removed", &self.removed),
            ("modified", &self.modified),
        ] {
            if !paths.is_empty() {
                let preview: Vec<&str> = paths.iter().take(3).map(String::as_str).collect();
                parts.push(format!("{}:{} ({})", label, paths.len(), preview.join(", ")));
            }
        }
        Some(parts.join("; "))
    }
}

/// Normalize a relative path: `/` separators, no `.` segments, no
/// traversal outside the root. Returns `None` for absolute or escaping
/// paths and for the empty path.
pub fn normalize_relative(path: &str) -> Option<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Golden repository and fragments
// ═══════════════════════════════════════════════════════════════════════

/// The authoritative checkout mirrored into `<identifier>/golden/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoldenRepository {
    pub identifier: String,
    pub path: String,
    pub default_branch: Option<String>,
    pub head: Option<String>,
}

/// What a fragment source looked like when it was ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Git,
    Directory,
    File,
}

/// A fragment as recorded in `fragments.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentRecord {
    pub fragment_id: String,
    pub source_path: String,
    pub destination: String,
    pub source_kind: SourceKind,
    pub ingested_at: DateTime<Utc>,
    pub content_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_ref: Option<String>,
}

impl FragmentRecord {
    pub fn has_git(&self) -> bool {
        self.source_kind == SourceKind::Git
    }
}

/// Relationship between a fragment and the golden history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationStatus {
    InSync,
    Ahead,
    Diverged,
    Orphaned,
    NonGit,
}

impl fmt::Display for ClassificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassificationStatus::InSync => "in-sync",
            ClassificationStatus::Ahead => "ahead",
            ClassificationStatus::Diverged => "diverged",
            ClassificationStatus::Orphaned => "orphaned",
            ClassificationStatus::NonGit => "non-git",
        };
        f.write_str(s)
    }
}

/// Low-confidence markers attached to a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationFlag {
    /// History could not determine a relationship; surfaced as diverged.
    Ambiguous,
    /// Orphaned was decided from origin URLs alone.
    IdentityHeuristic,
    /// Histories are related but the origin identity differs from golden's.
    IdentityMismatch,
}

impl fmt::Display for ClassificationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassificationFlag::Ambiguous => "ambiguous",
            ClassificationFlag::IdentityHeuristic => "identity-heuristic",
            ClassificationFlag::IdentityMismatch => "identity-mismatch",
        };
        f.write_str(s)
    }
}

/// Git state observed on a fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub head: Option<String>,
    pub branch: Option<String>,
    pub dirty: bool,
}

/// One element of `analysis.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentAnalysis {
    pub fragment_id: String,
    pub source_path: String,
    pub status: ClassificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<ClassificationFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
    /// Scenario kinds flagged while analysing this fragment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Recovery
// ═══════════════════════════════════════════════════════════════════════

/// A synthetic commit reconstructed from file modification times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticCommit {
    /// Unix seconds of the earliest file in the group.
    pub timestamp: i64,
    pub author: String,
    pub files: Vec<String>,
    /// Commit id once materialized in the recovered repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

/// Synthetic repository built under `recovered/<fragmentId>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredRepository {
    pub fragment_id: String,
    pub path: String,
    pub threshold_minutes: u32,
    /// Commit id of the seed commit when a base tree was supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    pub commits: Vec<SyntheticCommit>,
}

// ═══════════════════════════════════════════════════════════════════════
// Merge sessions
// ═══════════════════════════════════════════════════════════════════════

/// Per-fragment merge state: `pending -> staged -> {merged | conflicted | skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Pending,
    Staged,
    Merged,
    Conflicted,
    Skipped,
}

impl SessionState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Pending, SessionState::Staged)
                | (SessionState::Pending, SessionState::Skipped)
                | (SessionState::Staged, SessionState::Merged)
                | (SessionState::Staged, SessionState::Conflicted)
                | (SessionState::Staged, SessionState::Skipped)
        )
    }

    pub fn outcome(self) -> Option<MergeOutcome> {
        match self {
            SessionState::Merged => Some(MergeOutcome::Merged),
            SessionState::Conflicted => Some(MergeOutcome::Conflicted),
            SessionState::Skipped => Some(MergeOutcome::Skipped),
            SessionState::Pending | SessionState::Staged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeOutcome {
    Merged,
    Conflicted,
    Skipped,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeOutcome::Merged => "merged",
            MergeOutcome::Conflicted => "conflicted",
            MergeOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// How a fragment's changes are carried onto its worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMode {
    /// Cherry-pick real or recovered commits.
    Replay,
    /// Apply a file-level patch computed against the golden tree.
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub paths: Vec<String>,
    pub message: String,
}

/// One element of `merge_report.json`'s `sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSession {
    pub fragment_id: String,
    pub outcome: MergeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ApplyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_details: Option<ConflictDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_commits: Vec<String>,
    /// Commits still to replay after the conflicting one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining_commits: Vec<String>,
}

impl MergeSession {
    pub fn skipped(fragment_id: &str, reason: impl Into<String>) -> Self {
        Self {
            fragment_id: fragment_id.to_string(),
            outcome: MergeOutcome::Skipped,
            worktree: None,
            branch: None,
            mode: None,
            conflict_details: None,
            reason: Some(reason.into()),
            applied_commits: Vec::new(),
            remaining_commits: Vec::new(),
        }
    }
}

/// Contents of `merge_report.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub sessions: Vec<MergeSession>,
    /// First fragment, in processing order, that is not yet merged.
    pub resume_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl MergeReport {
    pub fn session(&self, fragment_id: &str) -> Option<&MergeSession> {
        self.sessions.iter().find(|s| s.fragment_id == fragment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sha: &str, modified: i64) -> FileEntry {
        FileEntry {
            size: 3,
            sha256: sha.to_string(),
            modified,
            symlink: None,
            executable: false,
        }
    }

    #[test]
    fn normalize_rejects_traversal() {
        assert_eq!(normalize_relative("a/./b"), Some("a/b".to_string()));
        assert_eq!(normalize_relative("a\\b"), Some("a/b".to_string()));
        assert_eq!(normalize_relative("../etc/passwd"), None);
        assert_eq!(normalize_relative("/abs"), None);
        assert_eq!(normalize_relative(""), None);
    }

    #[test]
    fn unreadable_files_summarised_but_not_digested() {
        let mut clean = ContentManifest::new();
        clean.insert("a.txt", entry("aa", 1));
        assert_eq!(clean.unreadable_summary(), None);

        let mut partial = clean.clone();
        partial.record_unreadable("z.txt", "permission denied");
        partial.record_unreadable("b.txt", "permission denied");
        assert_eq!(
            partial.unreadable_summary().as_deref(),
            Some("unreadable:2 (b.txt, z.txt)")
        );
        assert_eq!(partial.digest(), clean.digest());
    }

    #[test]
    fn digest_ignores_insertion_order_and_mtime() {
        let mut a = ContentManifest::new();
        a.insert("b.txt", entry("bb", 10));
        a.insert("a.txt", entry("aa", 20));

        let mut b = ContentManifest::new();
        b.insert("a.txt", entry("aa", 99));
        b.insert("b.txt", entry("bb", 1));

        assert_eq!(a.digest(), b.digest());
        assert_eq!(
            serde_json::to_string(&a.files.keys().collect::<Vec<_>>()).unwrap(),
            serde_json::to_string(&b.files.keys().collect::<Vec<_>>()).unwrap()
        );
    }

    #[test]
    fn diff_and_summary() {
        let mut golden = ContentManifest::new();
        golden.insert("app.txt", entry("one", 0));
        golden.insert("gone.txt", entry("x", 0));
        let mut fragment = ContentManifest::new();
        fragment.insert("app.txt", entry("two", 0));
        fragment.insert("new.txt", entry("n", 0));

        let diff = golden.diff(&fragment);
        assert_eq!(diff.added, vec!["new.txt"]);
        assert_eq!(diff.removed, vec!["gone.txt"]);
        assert_eq!(diff.modified, vec!["app.txt"]);
        assert_eq!(diff.contributed(), vec!["app.txt", "new.txt"]);
        assert_eq!(
            diff.summary().unwrap(),
            "added:1 (new.txt); removed:1 (gone.txt); modified:1 (app.txt)"
        );
        assert!(golden.diff(&golden).summary().is_none());
    }

    #[test]
    fn session_state_transitions() {
        assert!(SessionState::Pending.can_advance_to(SessionState::Staged));
        assert!(SessionState::Staged.can_advance_to(SessionState::Conflicted));
        assert!(!SessionState::Merged.can_advance_to(SessionState::Staged));
        assert!(!SessionState::Pending.can_advance_to(SessionState::Merged));
        assert_eq!(SessionState::Staged.outcome(), None);
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&ClassificationStatus::NonGit).unwrap();
        assert_eq!(json, "\"non-git\"");
        assert_eq!(ClassificationStatus::InSync.to_string(), "in-sync");
    }
}
