//! Synthetic history planning for fragments without version metadata.
//!
//! Files are clustered on the time axis by modification time (single
//! linkage): walking files in ascending `(modified, path)` order, a new
//! group starts whenever the gap to the previously added file exceeds the
//! threshold. Each group becomes one [`SyntheticCommit`] stamped with its
//! earliest file's time.
//!
//! # Guarantees
//!
//! - Every manifest file appears in exactly one commit.
//! - Commits are ordered by their earliest timestamp.
//! - The plan is a pure function of the manifest, threshold, and author.
//!
//! ```rust
//! use repo_merger_core::models::{ContentManifest, FileEntry};
//! use repo_merger_core::recovery::plan_commits;
//!
//! let mut manifest = ContentManifest::new();
//! for (path, t) in [("f1", 1_000), ("f2", 1_120)] {
//!     manifest.insert(path, FileEntry {
//!         size: 1, sha256: path.into(), modified: t, symlink: None, executable: false,
//!     });
//! }
//! let commits = plan_commits("frag", &manifest, 30, "repo-merger").unwrap();
//! assert_eq!(commits.len(), 1);
//! assert_eq!(commits[0].timestamp, 1_000);
//! ```

use crate::error::{EngineError, EngineResult};
use crate::models::{ContentManifest, SyntheticCommit};

/// Default clustering window, in minutes.
pub const DEFAULT_THRESHOLD_MINUTES: u32 = 30;

/// Group a manifest into synthetic commits.
///
/// Fails with [`EngineError::EmptyManifest`] when the manifest has no files.
pub fn plan_commits(
    fragment_id: &str,
    manifest: &ContentManifest,
    threshold_minutes: u32,
    author: &str,
) -> EngineResult<Vec<SyntheticCommit>> {
    if manifest.is_empty() {
        return Err(EngineError::EmptyManifest {
            fragment_id: fragment_id.to_string(),
        });
    }

    let window = i64::from(threshold_minutes) * 60;
    let mut timeline: Vec<(i64, &str)> = manifest
        .files
        .iter()
        .map(|(path, entry)| (entry.modified, path.as_str()))
        .collect();
    timeline.sort();

    let mut commits: Vec<SyntheticCommit> = Vec::new();
    let mut last_added: Option<i64> = None;
    for (modified, path) in timeline {
        let starts_group = match last_added {
            Some(prev) => modified - prev > window,
            None => true,
        };
        if starts_group {
            commits.push(SyntheticCommit {
                timestamp: modified,
                author: author.to_string(),
                files: Vec::new(),
                sha: None,
            });
        }
        if let Some(current) = commits.last_mut() {
            current.files.push(path.to_string());
        }
        last_added = Some(modified);
    }

    for commit in &mut commits {
        commit.files.sort();
    }
    Ok(commits)
}

/// Commit message for a synthetic commit.
pub fn commit_message(index: usize, total: usize, commit: &SyntheticCommit) -> String {
    format!(
        "Recovered snapshot {}/{} ({} file{})",
        index + 1,
        total,
        commit.files.len(),
        if commit.files.len() == 1 { "" } else { "s" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileEntry;

    fn manifest(files: &[(&str, i64)]) -> ContentManifest {
        let mut m = ContentManifest::new();
        for (path, modified) in files {
            m.insert(
                path,
                FileEntry {
                    size: 1,
                    sha256: format!("sha-{}", path),
                    modified: *modified,
                    symlink: None,
                    executable: false,
                },
            );
        }
        m
    }

    #[test]
    fn close_files_share_one_commit_at_earliest_time() {
        let m = manifest(&[("f2", 1_000 + 120), ("f1", 1_000)]);
        let commits = plan_commits("a", &m, 30, "bot").unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].timestamp, 1_000);
        assert_eq!(commits[0].files, vec!["f1", "f2"]);
        assert_eq!(commits[0].author, "bot");
    }

    #[test]
    fn gap_beyond_threshold_starts_new_group() {
        let m = manifest(&[("a", 0), ("b", 31 * 60), ("c", 31 * 60 + 10)]);
        let commits = plan_commits("a", &m, 30, "bot").unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].files, vec!["a"]);
        assert_eq!(commits[1].files, vec!["b", "c"]);
        assert_eq!(commits[1].timestamp, 31 * 60);
    }

    #[test]
    fn gap_equal_to_threshold_stays_in_group() {
        let m = manifest(&[("a", 0), ("b", 30 * 60)]);
        assert_eq!(plan_commits("a", &m, 30, "bot").unwrap().len(), 1);
    }

    #[test]
    fn single_linkage_chains_through_neighbours() {
        // Each step is 20 minutes; first and last are 60 minutes apart.
        let m = manifest(&[("a", 0), ("b", 1_200), ("c", 2_400), ("d", 3_600)]);
        let commits = plan_commits("a", &m, 30, "bot").unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].files.len(), 4);
    }

    #[test]
    fn every_file_attributed_exactly_once() {
        let m = manifest(&[
            ("x/1", 0),
            ("x/2", 5_000),
            ("y/1", 5_001),
            ("z", 20_000),
            ("same-time-b", 20_000),
        ]);
        let commits = plan_commits("a", &m, 10, "bot").unwrap();
        let mut seen: Vec<String> = commits.iter().flat_map(|c| c.files.clone()).collect();
        seen.sort();
        let mut expected: Vec<String> = m.files.keys().cloned().collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(commits.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn deterministic_across_invocations() {
        let m = manifest(&[("b", 100), ("a", 100), ("c", 9_999)]);
        let first = plan_commits("a", &m, 30, "bot").unwrap();
        for _ in 0..5 {
            assert_eq!(plan_commits("a", &m, 30, "bot").unwrap(), first);
        }
    }

    #[test]
    fn empty_manifest_is_rejected() {
        let err = plan_commits("frag-empty", &ContentManifest::new(), 30, "bot").unwrap_err();
        assert!(matches!(err, EngineError::EmptyManifest { ref fragment_id } if fragment_id == "frag-empty"));
    }

    #[test]
    fn message_pluralizes() {
        let m = manifest(&[("a", 0)]);
        let commits = plan_commits("a", &m, 30, "bot").unwrap();
        assert_eq!(commit_message(0, 1, &commits[0]), "Recovered snapshot 1/1 (1 file)");
    }
}
