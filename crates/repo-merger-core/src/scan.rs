//! Scan scoring and the structural `scan_report.json` upsert.
//!
//! Directory inspection itself (walking, reading git config, hashing)
//! happens in the application crate; this module turns the observed
//! [`RepoSignals`] into a classification with a confidence score, and
//! merges one scan's section into an existing report without touching
//! any other section.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Version-control layout observed in a candidate directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitLayout {
    /// A working copy with a `.git` directory or gitfile.
    Working { has_remote: bool },
    /// A bare repository (`HEAD`, `objects/`, `refs/` at the top level).
    Bare { has_remote: bool },
    None,
}

/// Everything the scorer needs to know about one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoSignals {
    pub matches_golden_pattern: bool,
    pub matches_fragment_pattern: bool,
    pub layout: GitLayout,
}

impl RepoSignals {
    /// Worth scoring at all: a name match or any git structure.
    pub fn is_candidate(&self) -> bool {
        self.matches_golden_pattern
            || self.matches_fragment_pattern
            || !matches!(self.layout, GitLayout::None)
    }

    pub fn is_bare(&self) -> bool {
        matches!(self.layout, GitLayout::Bare { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanClass {
    Golden,
    Fragment,
    Ignored,
}

/// High confidence means a pattern match backed by consistent git
/// structure; anything else needs operator approval before ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub class: ScanClass,
    pub score: f64,
    pub confidence: Confidence,
    pub reasons: Vec<String>,
}

/// Score a directory as golden, fragment, or ignored.
///
/// Name matches and git structure each add points to the golden or
/// fragment side; the winning side must lead by at least one point for
/// golden, while ties go to fragment. The score is the lead divided by
/// four, capped at 1.0.
pub fn classify_signals(signals: &RepoSignals) -> Classification {
    let mut golden = 0i32;
    let mut fragment = 0i32;
    let mut reasons = Vec::new();

    if signals.matches_golden_pattern {
        golden += 2;
        reasons.push("name-matches-golden-pattern".to_string());
    }
    if signals.matches_fragment_pattern {
        fragment += 1;
        reasons.push("name-matches-fragment-pattern".to_string());
    }
    match signals.layout {
        GitLayout::Working { has_remote } => {
            golden += 2;
            if has_remote {
                golden += 1;
                reasons.push("git-remote-found".to_string());
            } else {
                fragment += 1;
                reasons.push("git-metadata-no-remote".to_string());
            }
        }
        GitLayout::Bare { has_remote } => {
            golden += 3;
            if has_remote {
                golden += 1;
                reasons.push("bare-repo-with-remote".to_string());
            } else {
                reasons.push("bare-repo".to_string());
            }
        }
        GitLayout::None => {
            fragment += 1;
            reasons.push("missing-git-directory".to_string());
        }
    }

    let class = if !signals.is_candidate() {
        ScanClass::Ignored
    } else if golden - fragment >= 1 {
        ScanClass::Golden
    } else if fragment - golden >= 0 {
        ScanClass::Fragment
    } else {
        ScanClass::Ignored
    };

    let score = (f64::from((golden - fragment).abs()) / 4.0).min(1.0);
    let has_git = !matches!(signals.layout, GitLayout::None);
    let confidence = match class {
        ScanClass::Golden if signals.matches_golden_pattern && has_git => Confidence::High,
        ScanClass::Fragment if signals.matches_fragment_pattern && !signals.is_bare() => {
            Confidence::High
        }
        _ => Confidence::Low,
    };

    Classification {
        class,
        score,
        confidence,
        reasons,
    }
}

/// Pick the golden a fragment belongs to.
///
/// Paths are relative to the scan root. With a single golden every
/// fragment belongs to it; otherwise the golden sharing the most leading
/// path components wins, the first one on ties. `None` means no golden
/// shares any component with the fragment.
pub fn assign_by_common_prefix(goldens: &[&Path], fragment: &Path) -> Option<usize> {
    match goldens.len() {
        0 => return None,
        1 => return Some(0),
        _ => {}
    }
    let mut best: Option<(usize, usize)> = None;
    for (index, golden) in goldens.iter().enumerate() {
        let shared = golden
            .components()
            .zip(fragment.components())
            .take_while(|(a, b)| a == b)
            .count();
        if shared > 0 && best.map_or(true, |(_, score)| shared > score) {
            best = Some((index, shared));
        }
    }
    best.map(|(index, _)| index)
}

// ═══════════════════════════════════════════════════════════════════════
// Report sections
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle of a discovered entry, recorded as state rather than as the
/// action a particular run took, so unchanged rescans serialize the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    /// Golden candidate selected as the workspace golden.
    Selected,
    /// Golden candidate not used (another golden was selected).
    Candidate,
    /// Fragment eligible for ingestion that has not been ingested yet.
    Discovered,
    Ingested,
    PendingApproval,
    Unassigned,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub source: String,
    pub score: f64,
    pub confidence: Confidence,
    pub reasons: Vec<String>,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bare: bool,
}

/// One scan identifier's section of `scan_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSection {
    pub goldens: Vec<ScanEntry>,
    pub fragments: Vec<ScanEntry>,
    /// Lowest score among the section's entries (1.0 when empty).
    pub confidence: f64,
    pub timestamp: String,
}

impl ScanSection {
    pub fn new(goldens: Vec<ScanEntry>, fragments: Vec<ScanEntry>, timestamp: String) -> Self {
        let confidence = goldens
            .iter()
            .chain(fragments.iter())
            .map(|e| e.score)
            .fold(1.0f64, f64::min);
        Self {
            goldens,
            fragments,
            confidence,
            timestamp,
        }
    }
}

/// Result of [`upsert_section`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// Full report text to write (pretty JSON, trailing newline).
    pub rendered: String,
    /// False when the section was already present with identical content.
    pub changed: bool,
}

/// Merge `section` into the report text `existing` under `scan_id`.
///
/// Only the `scan_id` key is replaced; every other key is carried over
/// verbatim. When the stored section differs from `section` only by its
/// timestamp, the stored one is kept so the file stays byte-identical.
/// A report that is not a JSON object, or a merge that would alter any
/// other key, fails with [`EngineError::IdempotencyViolation`].
pub fn upsert_section(
    report_path: &Path,
    existing: Option<&str>,
    scan_id: &str,
    section: &ScanSection,
) -> EngineResult<UpsertOutcome> {
    let before: Map<String, Value> = match existing.map(str::trim).filter(|s| !s.is_empty()) {
        None => Map::new(),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(EngineError::IdempotencyViolation {
                    path: report_path.to_path_buf(),
                    section: scan_id.to_string(),
                    clobbered: "<unparseable report>".to_string(),
                })
            }
        },
    };

    let fresh = serde_json::to_value(section).map_err(|e| EngineError::IdempotencyViolation {
        path: report_path.to_path_buf(),
        section: scan_id.to_string(),
        clobbered: format!("<unserializable section: {}>", e),
    })?;

    let mut after = before.clone();
    let changed = match before.get(scan_id) {
        Some(stored) if same_ignoring_timestamp(stored, &fresh) => false,
        _ => {
            after.insert(scan_id.to_string(), fresh);
            true
        }
    };

    verify_untouched(report_path, &before, &after, scan_id)?;

    let mut rendered = serde_json::to_string_pretty(&Value::Object(after)).map_err(|e| {
        EngineError::IdempotencyViolation {
            path: report_path.to_path_buf(),
            section: scan_id.to_string(),
            clobbered: format!("<render failed: {}>", e),
        }
    })?;
    rendered.push('\n');
    Ok(UpsertOutcome { rendered, changed })
}

/// Check that every key of `before` other than `section` survives
/// unchanged in `after`, and that `after` gained nothing but `section`.
pub fn verify_untouched(
    report_path: &Path,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    section: &str,
) -> EngineResult<()> {
    let violation = |key: &str| EngineError::IdempotencyViolation {
        path: report_path.to_path_buf(),
        section: section.to_string(),
        clobbered: key.to_string(),
    };
    for (key, value) in before {
        if key == section {
            continue;
        }
        if after.get(key) != Some(value) {
            return Err(violation(key));
        }
    }
    for key in after.keys() {
        if key != section && !before.contains_key(key) {
            return Err(violation(key));
        }
    }
    Ok(())
}

fn same_ignoring_timestamp(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            let strip = |m: &Map<String, Value>| {
                let mut m = m.clone();
                m.remove("timestamp");
                m
            };
            strip(a) == strip(b)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn signals(golden: bool, fragment: bool, layout: GitLayout) -> RepoSignals {
        RepoSignals {
            matches_golden_pattern: golden,
            matches_fragment_pattern: fragment,
            layout,
        }
    }

    fn entry(source: &str) -> ScanEntry {
        ScanEntry {
            source: source.to_string(),
            score: 0.75,
            confidence: Confidence::High,
            reasons: vec!["name-matches-fragment-pattern".to_string()],
            status: EntryStatus::Ingested,
            digest: Some("abc".to_string()),
            fragment_id: Some("frag-1".to_string()),
            bare: false,
        }
    }

    fn path() -> PathBuf {
        PathBuf::from("/ws/demo/scan_report.json")
    }

    #[test]
    fn golden_pattern_with_remote_is_high_confidence_golden() {
        let c = classify_signals(&signals(true, false, GitLayout::Working { has_remote: true }));
        assert_eq!(c.class, ScanClass::Golden);
        assert_eq!(c.confidence, Confidence::High);
        assert_eq!(c.score, 1.0);
    }

    #[test]
    fn plain_fragment_directory() {
        let c = classify_signals(&signals(false, true, GitLayout::None));
        assert_eq!(c.class, ScanClass::Fragment);
        assert_eq!(c.confidence, Confidence::High);
        assert!(c.reasons.contains(&"missing-git-directory".to_string()));
    }

    #[test]
    fn heuristic_only_golden_is_low_confidence() {
        let c = classify_signals(&signals(false, false, GitLayout::Working { has_remote: true }));
        assert_eq!(c.class, ScanClass::Golden);
        assert_eq!(c.confidence, Confidence::Low);
    }

    #[test]
    fn bare_fragment_is_always_low_confidence() {
        let c = classify_signals(&signals(false, true, GitLayout::Bare { has_remote: false }));
        assert_eq!(c.confidence, Confidence::Low);
    }

    #[test]
    fn unmatched_plain_directory_is_ignored() {
        let c = classify_signals(&signals(false, false, GitLayout::None));
        assert_eq!(c.class, ScanClass::Ignored);
    }

    #[test]
    fn fragments_follow_longest_shared_prefix() {
        let a = Path::new("team-a/app-golden");
        let b = Path::new("team-b/app-golden");
        let goldens = [a, b];
        assert_eq!(
            assign_by_common_prefix(&goldens, Path::new("team-b/old/fragment-1")),
            Some(1)
        );
        assert_eq!(
            assign_by_common_prefix(&goldens, Path::new("elsewhere/fragment-2")),
            None
        );
        assert_eq!(assign_by_common_prefix(&[a], Path::new("fragment-3")), Some(0));
        assert_eq!(assign_by_common_prefix(&[], Path::new("fragment-3")), None);
    }

    #[test]
    fn upsert_preserves_other_sections_verbatim() {
        let existing = r#"{"other": {"custom": [1, 2, 3], "timestamp": "x"}}"#;
        let section = ScanSection::new(vec![], vec![entry("/src/fragment-a")], "t1".into());
        let out = upsert_section(&path(), Some(existing), "mine", &section).unwrap();
        assert!(out.changed);
        let parsed: Value = serde_json::from_str(&out.rendered).unwrap();
        assert_eq!(parsed["other"]["custom"], serde_json::json!([1, 2, 3]));
        assert_eq!(parsed["mine"]["fragments"][0]["fragmentId"], "frag-1");
    }

    #[test]
    fn unchanged_section_keeps_stored_timestamp() {
        let section = ScanSection::new(vec![], vec![entry("/a")], "t1".into());
        let first = upsert_section(&path(), None, "scan", &section).unwrap();

        let again = ScanSection::new(vec![], vec![entry("/a")], "t2".into());
        let second = upsert_section(&path(), Some(&first.rendered), "scan", &again).unwrap();
        assert!(!second.changed);
        assert_eq!(first.rendered, second.rendered);
    }

    #[test]
    fn unparseable_report_is_not_overwritten() {
        let section = ScanSection::new(vec![], vec![], "t".into());
        let err = upsert_section(&path(), Some("[1, 2]"), "scan", &section).unwrap_err();
        assert!(matches!(err, EngineError::IdempotencyViolation { .. }));
    }

    #[test]
    fn verify_untouched_detects_clobbering() {
        let mut before = Map::new();
        before.insert("a".into(), serde_json::json!({"n": 1}));
        before.insert("b".into(), serde_json::json!({"n": 2}));
        let mut after = before.clone();
        after.insert("a".into(), serde_json::json!({"n": 99}));
        after.insert("b".into(), serde_json::json!({"n": 3}));

        let err = verify_untouched(&path(), &before, &after, "a").unwrap_err();
        match err {
            EngineError::IdempotencyViolation { clobbered, .. } => assert_eq!(clobbered, "b"),
            other => panic!("unexpected error: {other}"),
        }

        after.insert("b".into(), serde_json::json!({"n": 2}));
        assert!(verify_untouched(&path(), &before, &after, "a").is_ok());
    }

    #[test]
    fn section_confidence_is_minimum_score() {
        let mut low = entry("/b");
        low.score = 0.25;
        let section = ScanSection::new(vec![entry("/a")], vec![low], "t".into());
        assert_eq!(section.confidence, 0.25);
        assert_eq!(ScanSection::new(vec![], vec![], "t".into()).confidence, 1.0);
    }
}
