//! Directory scanning and discovery.
//!
//! Walks a source tree once, scores every candidate directory as golden or
//! fragment, hashes fragments on the worker pool, and upserts one section
//! per golden into `<workspace>/<identifier>/scan_report.json`. With
//! `--ingest`, approved fragments are ingested and analysed; a fragment
//! whose content digest matches `scan_manifest.json` is not ingested again.

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use repo_merger_core::identity::sanitize_identifier;
use repo_merger_core::scan::{
    assign_by_common_prefix, classify_signals, upsert_section, Classification, Confidence,
    EntryStatus, GitLayout, RepoSignals, ScanClass, ScanEntry, ScanSection,
};

use crate::classify::analyze_workspace;
use crate::engine::Engine;
use crate::git;
use crate::ingest::ingest_fragments;
use crate::manifest::build_manifest;
use crate::progress::{Phase, ProgressEvent};
use crate::report::write_report;
use crate::workspace::{
    derive_identifier, materialize_workspace, mirror_golden, read_json, write_atomic, write_json,
    WorkspacePaths,
};

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub source: PathBuf,
    /// Report key; defaults to the source directory name.
    pub scan_id: Option<String>,
    /// Use this golden instead of discovered candidates.
    pub golden: Option<PathBuf>,
    pub golden_pattern: String,
    pub fragment_pattern: String,
    pub approve_low_confidence: bool,
    pub ingest: bool,
}

/// One row of `scan_manifest.json`, keyed by source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanManifestEntry {
    pub digest: String,
    pub fragment_id: String,
    pub identifier: String,
    pub updated_at: String,
}

pub type ScanManifest = BTreeMap<String, ScanManifestEntry>;

/// What a scan did for one identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierScan {
    pub identifier: String,
    pub golden: String,
    pub section: ScanSection,
    /// False when the stored section was already identical.
    pub report_changed: bool,
    pub newly_ingested: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub scan_id: String,
    pub identifiers: Vec<IdentifierScan>,
}

/// A scored directory found by the walk.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    relative: PathBuf,
    classification: Classification,
    bare: bool,
}

impl Candidate {
    fn source(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn entry(&self, status: EntryStatus) -> ScanEntry {
        ScanEntry {
            source: self.source(),
            score: self.classification.score,
            confidence: self.classification.confidence,
            reasons: self.classification.reasons.clone(),
            status,
            digest: None,
            fragment_id: None,
            bare: self.bare,
        }
    }

    fn approved(&self, approve_low_confidence: bool) -> bool {
        self.classification.confidence == Confidence::High || approve_low_confidence
    }
}

fn matcher(pattern: &str) -> Result<GlobMatcher> {
    Ok(Glob::new(pattern)
        .with_context(|| format!("Invalid glob pattern: '{}'", pattern))?
        .compile_matcher())
}

fn layout(dir: &Path) -> GitLayout {
    if git::has_git_metadata(dir) {
        GitLayout::Working {
            has_remote: git::has_remote(dir).unwrap_or(false),
        }
    } else if git::is_bare_repo(dir) {
        GitLayout::Bare {
            has_remote: git::has_remote(dir).unwrap_or(false),
        }
    } else {
        GitLayout::None
    }
}

/// Walk `source` and score each directory. Candidates are not descended
/// into; VCS internals and `skip` (the workspace root) are never entered.
fn discover(source: &Path, skip: Option<&Path>, golden: &GlobMatcher, fragment: &GlobMatcher) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    let mut walker = WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry during scan: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if VCS_DIRS.contains(&name.as_str()) {
            walker.skip_current_dir();
            continue;
        }
        let path = entry.path().to_path_buf();
        if skip.is_some_and(|s| path.canonicalize().ok().as_deref() == Some(s)) {
            debug!("Skipping workspace root {}", path.display());
            walker.skip_current_dir();
            continue;
        }

        let signals = RepoSignals {
            matches_golden_pattern: golden.is_match(&name),
            matches_fragment_pattern: fragment.is_match(&name),
            layout: layout(&path),
        };
        if !signals.is_candidate() {
            continue;
        }
        let classification = classify_signals(&signals);
        if classification.class == ScanClass::Ignored {
            continue;
        }
        let relative = path.strip_prefix(source).unwrap_or(&path).to_path_buf();
        candidates.push(Candidate {
            path: path.canonicalize().unwrap_or(path),
            relative,
            classification,
            bare: signals.is_bare(),
        });
        walker.skip_current_dir();
    }
    Ok(candidates)
}

/// Scan `options.source` and record the results per golden identifier.
pub async fn scan(engine: &Engine, options: &ScanOptions) -> Result<ScanSummary> {
    let source = options
        .source
        .canonicalize()
        .with_context(|| format!("Scan source not found: {}", options.source.display()))?;
    let scan_id = match options.scan_id.as_deref() {
        Some(id) => sanitize_identifier(id),
        None => sanitize_identifier(
            &source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        ),
    };
    engine.report(ProgressEvent::Started {
        identifier: scan_id.clone(),
        phase: Phase::Scanning,
    });

    let golden_glob = matcher(&options.golden_pattern)?;
    let fragment_glob = matcher(&options.fragment_pattern)?;
    let skip = engine.workspace_root.canonicalize().ok();
    let walk_source = source.clone();
    let candidates = engine
        .blocking(move || discover(&walk_source, skip.as_deref(), &golden_glob, &fragment_glob))
        .await?;
    engine.checkpoint()?;

    let (golden_candidates, fragments): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .partition(|c| c.classification.class == ScanClass::Golden);
    info!(
        "Scan '{}': {} golden candidate(s), {} fragment(s)",
        scan_id,
        golden_candidates.len(),
        fragments.len()
    );

    // Pick the goldens that get a workspace.
    let mut selected: Vec<(String, Candidate)> = Vec::new();
    let mut unselected: Vec<ScanEntry> = Vec::new();
    match &options.golden {
        Some(explicit) => {
            let path = explicit
                .canonicalize()
                .with_context(|| format!("Golden repository not found: {}", explicit.display()))?;
            let relative = path.strip_prefix(&source).unwrap_or(&path).to_path_buf();
            let identifier = derive_identifier(&path, None)?;
            let candidate = Candidate {
                bare: git::is_bare_repo(&path),
                path,
                relative,
                classification: Classification {
                    class: ScanClass::Golden,
                    score: 1.0,
                    confidence: Confidence::High,
                    reasons: vec!["explicit-golden".to_string()],
                },
            };
            selected.push((identifier, candidate));
            for other in &golden_candidates {
                if other.path != selected[0].1.path {
                    unselected.push(other.entry(EntryStatus::Candidate));
                }
            }
        }
        None => {
            for candidate in golden_candidates {
                if !candidate.approved(options.approve_low_confidence) {
                    unselected.push(candidate.entry(EntryStatus::PendingApproval));
                    continue;
                }
                let identifier = derive_identifier(&candidate.path, None)?;
                if selected.iter().any(|(id, _)| id == &identifier) {
                    unselected.push(candidate.entry(EntryStatus::Candidate));
                } else {
                    selected.push((identifier, candidate));
                }
            }
        }
    }
    if selected.is_empty() {
        bail!(
            "No golden repository found under {}. Pass --golden, adjust --golden-pattern, \
             or rerun with --approve-low-confidence",
            source.display()
        );
    }

    let digests = hash_fragments(engine, &scan_id, &fragments).await?;

    // Assign fragments to goldens by shared path prefix.
    let golden_paths: Vec<&Path> = selected.iter().map(|(_, c)| c.relative.as_path()).collect();
    let mut assigned: Vec<Vec<usize>> = vec![Vec::new(); selected.len()];
    let mut unassigned: Vec<usize> = Vec::new();
    for (index, fragment) in fragments.iter().enumerate() {
        match assign_by_common_prefix(&golden_paths, &fragment.relative) {
            Some(golden) => assigned[golden].push(index),
            None => unassigned.push(index),
        }
    }

    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut summary = ScanSummary {
        scan_id: scan_id.clone(),
        identifiers: Vec::new(),
    };
    for ((identifier, golden), members) in selected.iter().zip(&assigned) {
        engine.checkpoint()?;
        let job = IdentifierJob {
            identifier,
            golden,
            members,
            unassigned: &unassigned,
            unselected: &unselected,
            fragments: &fragments,
            digests: &digests,
            scan_id: &scan_id,
            timestamp: &timestamp,
        };
        summary.identifiers.push(job.run(engine, options).await?);
    }
    Ok(summary)
}

/// Content digest per fragment index; `Err` carries the failure reason.
async fn hash_fragments(
    engine: &Engine,
    scan_id: &str,
    fragments: &[Candidate],
) -> Result<Vec<Result<String, String>>> {
    let mut set = JoinSet::new();
    for (index, fragment) in fragments.iter().enumerate() {
        let engine = engine.clone();
        let path = fragment.path.clone();
        set.spawn(async move {
            let manifest = engine.blocking(move || build_manifest(&path)).await;
            (index, manifest.map(|m| m.digest()).map_err(|e| format!("{:#}", e)))
        });
    }
    let mut digests: Vec<Result<String, String>> =
        fragments.iter().map(|_| Err("not hashed".to_string())).collect();
    let total = fragments.len() as u64;
    let mut done = 0u64;
    while let Some(joined) = set.join_next().await {
        let (index, digest) = joined.context("hashing task panicked")?;
        done += 1;
        engine.report(ProgressEvent::Advanced {
            identifier: scan_id.to_string(),
            phase: Phase::Hashing,
            item: fragments[index].relative.to_string_lossy().to_string(),
            n: done,
            total,
        });
        digests[index] = digest;
    }
    Ok(digests)
}

/// Everything needed to record one golden's section.
struct IdentifierJob<'a> {
    identifier: &'a str,
    golden: &'a Candidate,
    members: &'a [usize],
    unassigned: &'a [usize],
    unselected: &'a [ScanEntry],
    fragments: &'a [Candidate],
    digests: &'a [Result<String, String>],
    scan_id: &'a str,
    timestamp: &'a str,
}

impl IdentifierJob<'_> {
    async fn run(&self, engine: &Engine, options: &ScanOptions) -> Result<IdentifierScan> {
        let paths = engine.paths(self.identifier);
        let known: ScanManifest = {
            let _guard = engine.locks.lock(self.identifier).await;
            read_json(&paths.scan_manifest_json())?.unwrap_or_default()
        };
        let mut rows: Vec<(String, ScanManifestEntry)> = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut entries: Vec<ScanEntry> = Vec::new();
        let mut to_ingest: Vec<(usize, String)> = Vec::new();

        for &index in self.members {
            let fragment = &self.fragments[index];
            let source = fragment.source();
            let digest = match &self.digests[index] {
                Ok(digest) => digest.clone(),
                Err(reason) => {
                    failures.push((source, reason.clone()));
                    entries.push(fragment.entry(EntryStatus::Failed));
                    continue;
                }
            };
            let mut entry = fragment.entry(EntryStatus::Discovered);
            entry.digest = Some(digest.clone());

            if !fragment.approved(options.approve_low_confidence) {
                entry.status = EntryStatus::PendingApproval;
            } else if let Some(known) = known
                .get(&source)
                .filter(|m| m.digest == digest && paths.fragment_dir(&m.fragment_id).exists())
            {
                debug!("{} unchanged since last scan; not re-ingesting", source);
                entry.status = EntryStatus::Ingested;
                entry.fragment_id = Some(known.fragment_id.clone());
            } else if options.ingest {
                to_ingest.push((entries.len(), digest));
            }
            entries.push(entry);
        }
        for &index in self.unassigned {
            let fragment = &self.fragments[index];
            let mut entry = fragment.entry(EntryStatus::Unassigned);
            entry.digest = self.digests[index].as_ref().ok().cloned();
            entries.push(entry);
        }

        let mut newly_ingested = 0;
        if options.ingest {
            let status = {
                let _guard = engine.locks.lock(self.identifier).await;
                materialize_workspace(&engine.workspace_root, self.identifier, false)?;
                let golden_source = self.golden.path.clone();
                let mirror_paths = paths.clone();
                engine
                    .blocking(move || mirror_golden(&golden_source, &mirror_paths, false))
                    .await?
            };
            info!("Golden for '{}': {}", self.identifier, status);

            let sources: Vec<PathBuf> = to_ingest
                .iter()
                .map(|(slot, _)| PathBuf::from(&entries[*slot].source))
                .collect();
            let outcome = ingest_fragments(engine, &paths, &sources).await?;
            for (slot, digest) in &to_ingest {
                let source = entries[*slot].source.clone();
                match outcome.record_for(Path::new(&source)) {
                    Some(record) => {
                        entries[*slot].status = EntryStatus::Ingested;
                        entries[*slot].fragment_id = Some(record.fragment_id.clone());
                        rows.push((
                            source,
                            ScanManifestEntry {
                                digest: digest.clone(),
                                fragment_id: record.fragment_id.clone(),
                                identifier: self.identifier.to_string(),
                                updated_at: self.timestamp.to_string(),
                            },
                        ));
                        newly_ingested += 1;
                    }
                    None => {
                        let reason = outcome
                            .failures
                            .iter()
                            .find(|f| f.source == source)
                            .map(|f| f.reason.clone())
                            .unwrap_or_else(|| "ingestion produced no record".to_string());
                        entries[*slot].status = EntryStatus::Failed;
                        failures.push((source, reason));
                    }
                }
            }

            // analysis.json covers the whole workspace, not just this scan.
            analyze_workspace(engine, &paths).await?;
        }

        let mut goldens = vec![self.golden.entry(EntryStatus::Selected)];
        goldens.extend(self.unselected.iter().cloned());
        let section = ScanSection::new(goldens, entries, self.timestamp.to_string());

        let _guard = engine.locks.lock(self.identifier).await;
        let report_changed = write_section(&paths, self.scan_id, &section)?;
        if !rows.is_empty() {
            let mut manifest: ScanManifest =
                read_json(&paths.scan_manifest_json())?.unwrap_or_default();
            manifest.extend(rows);
            write_json(&paths.scan_manifest_json(), &manifest)?;
        }
        write_failures(&paths, self.scan_id, &failures)?;
        if options.ingest {
            write_report(&paths)?;
        }

        Ok(IdentifierScan {
            identifier: self.identifier.to_string(),
            golden: self.golden.source(),
            section,
            report_changed,
            newly_ingested,
        })
    }
}

/// Upsert `section` into the identifier's `scan_report.json`; the file is
/// only rewritten when its content changes.
fn write_section(paths: &WorkspacePaths, scan_id: &str, section: &ScanSection) -> Result<bool> {
    let report = paths.scan_report_json();
    let existing = match fs::read_to_string(&report) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", report.display()));
        }
    };
    let outcome = upsert_section(&report, existing.as_deref(), scan_id, section)?;
    if outcome.changed {
        write_atomic(&report, outcome.rendered.as_bytes())?;
    }
    Ok(outcome.changed)
}

/// Replace this scan id's lines in `scan_failed.txt`; lines recorded by
/// other scan ids are kept. Each line is `scan_id<TAB>source<TAB>reason`.
fn write_failures(paths: &WorkspacePaths, scan_id: &str, failures: &[(String, String)]) -> Result<()> {
    let path = paths.scan_failed_txt();
    let existing = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.is_empty() && line.split('\t').next() != Some(scan_id))
        .map(str::to_string)
        .collect();
    lines.extend(
        failures
            .iter()
            .map(|(source, reason)| format!("{}\t{}\t{}", scan_id, source, reason)),
    );
    lines.sort();

    if lines.is_empty() {
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        return Ok(());
    }
    let text = lines.join("\n") + "\n";
    if existing != text {
        write_atomic(&path, text.as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn discover_scores_and_does_not_descend_into_candidates() {
        let src = TempDir::new().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("app-golden/.git")).unwrap();
        fs::create_dir_all(root.join("old/fragment-1/fragment-nested")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();

        let golden = matcher("*golden*").unwrap();
        let fragment = matcher("fragment*").unwrap();
        let found = discover(root, None, &golden, &fragment).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|c| c.relative.to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["app-golden", "old/fragment-1"]);
        assert_eq!(found[0].classification.class, ScanClass::Golden);
        assert_eq!(found[1].classification.class, ScanClass::Fragment);
    }

    #[test]
    fn workspace_root_is_skipped() {
        let src = TempDir::new().unwrap();
        let ws = src.path().join("workspace");
        fs::create_dir_all(ws.join("fragment-x")).unwrap();
        let golden = matcher("*golden*").unwrap();
        let fragment = matcher("fragment*").unwrap();
        let skip = ws.canonicalize().unwrap();
        let found = discover(src.path(), Some(&skip), &golden, &fragment).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn failures_file_keeps_other_scans() {
        let ws = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(ws.path(), "demo");
        write_failures(&paths, "nightly", &[("/src/b".into(), "denied".into())]).unwrap();
        write_failures(&paths, "weekly", &[("/src/c".into(), "gone".into())]).unwrap();
        assert_eq!(
            fs::read_to_string(paths.scan_failed_txt()).unwrap(),
            "nightly\t/src/b\tdenied\nweekly\t/src/c\tgone\n"
        );

        // A clean nightly scan drops only its own lines.
        write_failures(&paths, "nightly", &[]).unwrap();
        assert_eq!(
            fs::read_to_string(paths.scan_failed_txt()).unwrap(),
            "weekly\t/src/c\tgone\n"
        );
        write_failures(&paths, "weekly", &[]).unwrap();
        assert!(!paths.scan_failed_txt().exists());
    }
}
