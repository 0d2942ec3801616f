//! Fragment classification against the golden history.
//!
//! The status is decided purely from commit-graph reachability. Fragment
//! history is fetched into the golden repository under
//! [`git::FRAGMENT_REF_PREFIX`] so reachability can be asked in one object
//! store; the golden checkout and its branches are never touched. The
//! manifest diff against golden only fills in `detail`.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use repo_merger_core::handlers::{HandlerRegistry, Resolution, ScenarioContext, ScenarioKind};
use repo_merger_core::identity;
use repo_merger_core::models::{
    ClassificationFlag, ClassificationStatus, ContentManifest, FragmentAnalysis, FragmentRecord,
    GitInfo,
};
use repo_merger_core::EngineError;

use crate::engine::{Cancelled, Engine};
use crate::git;
use crate::ingest::{load_manifest, load_records};
use crate::manifest::build_manifest;
use crate::progress::{Phase, ProgressEvent, SharedProgress};
use crate::workspace::{write_json, WorkspacePaths};

/// How a fragment's HEAD relates to golden's HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Relation {
    /// The fragment repository has no commits.
    EmptyFragment,
    /// The golden repository has no commits.
    EmptyGolden,
    Equal,
    Behind(usize),
    Ahead(usize),
    Diverged { base: String },
    Unrelated,
}

/// Classifies fragments of one workspace against its golden checkout.
pub struct Classifier {
    golden: PathBuf,
    golden_head: Option<String>,
    golden_identity: String,
    golden_manifest: ContentManifest,
    handlers: Arc<HandlerRegistry>,
}

/// Origins that are filesystem paths carry no project identity.
fn is_local_origin(url: &str) -> bool {
    url.starts_with('/') || url.starts_with('.') || url.starts_with("file://")
}

fn origin_identity(repo: &Path) -> Option<String> {
    git::origin_url(repo)
        .ok()
        .flatten()
        .filter(|url| !is_local_origin(url))
        .and_then(|url| identity::remote_identity(&url))
}

impl Classifier {
    pub fn new(paths: &WorkspacePaths, handlers: Arc<HandlerRegistry>) -> Result<Self> {
        let golden = paths.golden.clone();
        let golden_head = git::head(&golden).ok().flatten();
        let golden_identity =
            origin_identity(&golden).unwrap_or_else(|| paths.identifier.clone());
        let golden_manifest = build_manifest(&golden)?;
        Ok(Self {
            golden,
            golden_head,
            golden_identity,
            golden_manifest,
            handlers,
        })
    }

    /// Classify one fragment. Never fails: problems are recorded on the
    /// returned analysis.
    pub fn classify(
        &self,
        record: &FragmentRecord,
        fragment_dir: &Path,
        manifest: Option<&ContentManifest>,
    ) -> FragmentAnalysis {
        let fid = &record.fragment_id;
        let mut analysis = FragmentAnalysis {
            fragment_id: fid.clone(),
            source_path: record.source_path.clone(),
            status: ClassificationStatus::NonGit,
            manifest_ref: manifest.map(|_| format!("manifests/{}.json", fid)),
            recovered_ref: record.recovered_ref.clone(),
            detail: None,
            flags: Vec::new(),
            git: None,
            handlers: Vec::new(),
        };
        let mut notes: Vec<String> = Vec::new();

        if !fragment_dir.exists() {
            let ctx = ScenarioContext::new(fid).with("path", fragment_dir.to_string_lossy());
            notes.push(self.scenario_note(ScenarioKind::MissingFragment, &ctx, &mut analysis));
            analysis.detail = Some(notes.join("; "));
            return analysis;
        }

        let has_metadata = git::has_git_metadata(fragment_dir) || git::is_bare_repo(fragment_dir);
        let git_usable = has_metadata && git::is_repository(fragment_dir);
        if has_metadata && !git_usable {
            let ctx = ScenarioContext::new(fid).with("path", fragment_dir.to_string_lossy());
            notes.push(self.scenario_note(ScenarioKind::GitMetadataMissing, &ctx, &mut analysis));
        }

        if git_usable {
            match self.inspect(fid, fragment_dir) {
                Ok((info, relation)) => {
                    if info.dirty {
                        let ctx = ScenarioContext::new(fid);
                        notes.push(self.scenario_note(
                            ScenarioKind::DirtyWorkingCopy,
                            &ctx,
                            &mut analysis,
                        ));
                    }
                    analysis.git = Some(info);
                    self.apply_relation(fid, fragment_dir, relation, &mut analysis, &mut notes);
                }
                Err(e) => {
                    let ctx = ScenarioContext::new(fid).with("error", format!("{:#}", e));
                    notes.push(self.scenario_note(
                        ScenarioKind::GitInspectionFailed,
                        &ctx,
                        &mut analysis,
                    ));
                    analysis.status = ClassificationStatus::Diverged;
                    analysis.flags.push(ClassificationFlag::Ambiguous);
                }
            }
        }

        if let Some(summary) = manifest.and_then(|m| self.golden_manifest.diff(m).summary()) {
            notes.push(summary);
        }
        if let Some(unreadable) = manifest.and_then(ContentManifest::unreadable_summary) {
            notes.push(unreadable);
        }
        analysis.flags.sort();
        analysis.flags.dedup();
        if !notes.is_empty() {
            analysis.detail = Some(notes.join("; "));
        }
        analysis
    }

    /// Dispatch a scenario and turn its resolution into a detail note.
    fn scenario_note(
        &self,
        kind: ScenarioKind,
        ctx: &ScenarioContext,
        analysis: &mut FragmentAnalysis,
    ) -> String {
        analysis.handlers.push(kind.to_string());
        match self.handlers.dispatch(kind, ctx) {
            Ok(Resolution::Note(note)) => note,
            Ok(Resolution::TreatAsNonGit) => {
                format!("{}: analysed without git history", kind)
            }
            Ok(Resolution::Proceed) => kind.to_string(),
            Err(e) => e.to_string(),
        }
    }

    fn inspect(&self, fid: &str, fragment: &Path) -> Result<(GitInfo, Relation)> {
        let info = GitInfo {
            head: git::head(fragment)?,
            branch: git::current_branch(fragment)?,
            dirty: !git::is_bare_repo(fragment) && git::is_dirty(fragment)?,
        };
        let relation = self.relate(fid, fragment, info.head.as_deref())?;
        Ok((info, relation))
    }

    fn relate(&self, fid: &str, fragment: &Path, fragment_head: Option<&str>) -> Result<Relation> {
        if fragment_head.is_none() {
            return Ok(Relation::EmptyFragment);
        }
        let refname = format!("{}{}", git::FRAGMENT_REF_PREFIX, fid);
        let Some(tip) = git::fetch_head_into(&self.golden, fragment, &refname)? else {
            return Ok(Relation::EmptyFragment);
        };
        let Some(golden_head) = self.golden_head.as_deref() else {
            return Ok(Relation::EmptyGolden);
        };
        if tip == golden_head {
            return Ok(Relation::Equal);
        }
        if git::is_ancestor(&self.golden, &tip, golden_head)? {
            let n = git::count_between(&self.golden, &tip, golden_head)?;
            return Ok(Relation::Behind(n));
        }
        if git::is_ancestor(&self.golden, golden_head, &tip)? {
            let n = git::count_between(&self.golden, golden_head, &tip)?;
            return Ok(Relation::Ahead(n));
        }
        match git::merge_base(&self.golden, golden_head, &tip)? {
            Some(base) => Ok(Relation::Diverged { base }),
            None => Ok(Relation::Unrelated),
        }
    }

    fn apply_relation(
        &self,
        fid: &str,
        fragment: &Path,
        relation: Relation,
        analysis: &mut FragmentAnalysis,
        notes: &mut Vec<String>,
    ) {
        let fragment_identity = origin_identity(fragment);
        let identity_differs = fragment_identity
            .as_deref()
            .is_some_and(|id| id != self.golden_identity);

        debug!("{}: {:?}", fid, relation);
        analysis.status = match relation {
            Relation::EmptyFragment => {
                notes.push("fragment has no commits".to_string());
                ClassificationStatus::InSync
            }
            Relation::Equal => ClassificationStatus::InSync,
            Relation::Behind(n) => {
                notes.push(format!("behind golden by {} commit(s)", n));
                ClassificationStatus::InSync
            }
            Relation::EmptyGolden => {
                notes.push("golden has no commits".to_string());
                ClassificationStatus::Ahead
            }
            Relation::Ahead(n) => {
                notes.push(format!("ahead of golden by {} commit(s)", n));
                ClassificationStatus::Ahead
            }
            Relation::Diverged { base } => {
                notes.push(format!("diverged from golden at {}", short(&base)));
                ClassificationStatus::Diverged
            }
            Relation::Unrelated if identity_differs => {
                notes.push(format!(
                    "unrelated history with origin identity '{}' (golden is '{}')",
                    fragment_identity.as_deref().unwrap_or_default(),
                    self.golden_identity
                ));
                analysis.flags.push(ClassificationFlag::IdentityHeuristic);
                ClassificationStatus::Orphaned
            }
            Relation::Unrelated => {
                let ambiguous = EngineError::ClassificationAmbiguous {
                    fragment_id: fid.to_string(),
                    detail: "no common history with golden".to_string(),
                };
                notes.push(ambiguous.to_string());
                analysis.flags.push(ClassificationFlag::Ambiguous);
                ClassificationStatus::Diverged
            }
        };

        if identity_differs && analysis.status != ClassificationStatus::Orphaned {
            analysis.flags.push(ClassificationFlag::IdentityMismatch);
            let origin = git::origin_url(fragment).ok().flatten().unwrap_or_default();
            let ctx = ScenarioContext::new(fid).with("origin", origin);
            notes.push(self.scenario_note(ScenarioKind::IdentityMismatch, &ctx, analysis));
        }
    }
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}

/// Classify `records` and write `analysis.json`.
///
/// Runs as one blocking task: classification fetches into the golden
/// repository, so fragments of one workspace are handled one at a time.
pub async fn analyze_fragments(
    engine: &Engine,
    paths: &WorkspacePaths,
    records: &[FragmentRecord],
) -> Result<Vec<FragmentAnalysis>> {
    let _guard = engine.locks.lock(&paths.identifier).await;
    analyze_locked(engine, paths, records).await
}

/// Re-analyse every fragment recorded in `fragments.json`. Records are
/// read under the same lock that writes `analysis.json`.
pub async fn analyze_workspace(engine: &Engine, paths: &WorkspacePaths) -> Result<Vec<FragmentAnalysis>> {
    let _guard = engine.locks.lock(&paths.identifier).await;
    let records = load_records(paths)?;
    analyze_locked(engine, paths, &records).await
}

async fn analyze_locked(
    engine: &Engine,
    paths: &WorkspacePaths,
    records: &[FragmentRecord],
) -> Result<Vec<FragmentAnalysis>> {
    let handlers = engine.handlers.clone();
    let cancel = engine.cancel.clone();
    let progress = engine.progress();
    let task_paths = paths.clone();
    let task_records = records.to_vec();
    let analyses = engine
        .blocking(move || classify_all(&task_paths, &task_records, handlers, &cancel, &progress))
        .await?;
    write_json(&paths.analysis_json(), &analyses)?;
    info!(
        "Classified {} fragment(s) for '{}'",
        analyses.len(),
        paths.identifier
    );
    Ok(analyses)
}

fn classify_all(
    paths: &WorkspacePaths,
    records: &[FragmentRecord],
    handlers: Arc<HandlerRegistry>,
    cancel: &CancellationToken,
    progress: &SharedProgress,
) -> Result<Vec<FragmentAnalysis>> {
    let classifier = Classifier::new(paths, handlers)?;
    let total = records.len() as u64;
    let mut analyses = Vec::with_capacity(records.len());
    for (n, record) in records.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let manifest = load_manifest(paths, &record.fragment_id).ok();
        let analysis = classifier.classify(
            record,
            &paths.fragment_dir(&record.fragment_id),
            manifest.as_ref(),
        );
        info!("{} -> {}", record.fragment_id, analysis.status);
        progress.report(ProgressEvent::Advanced {
            identifier: paths.identifier.clone(),
            phase: Phase::Classifying,
            item: record.fragment_id.clone(),
            n: n as u64 + 1,
            total,
        });
        analyses.push(analysis);
    }
    Ok(analyses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_origins_carry_no_identity() {
        assert!(is_local_origin("/srv/git/widgets"));
        assert!(is_local_origin("../widgets"));
        assert!(is_local_origin("file:///srv/git/widgets"));
        assert!(!is_local_origin("git@example.com:acme/widgets.git"));
        assert!(!is_local_origin("https://example.com/acme/widgets"));
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
