//! Fragment ingestion.
//!
//! Hashing runs concurrently on the worker pool, one task per source.
//! Writes into the workspace (fragment copies, manifests, `fragments.json`)
//! happen under the identifier's lock, one fragment at a time, so two
//! sources that resolve to the same fragment id never race.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::{info, warn};

use repo_merger_core::handlers::{ScenarioContext, ScenarioKind};
use repo_merger_core::identity;
use repo_merger_core::models::{ContentManifest, FragmentRecord, SourceKind};

use crate::engine::Engine;
use crate::git;
use crate::manifest::{self, build_manifest};
use crate::progress::{Phase, ProgressEvent};
use crate::workspace::{read_json, write_json, WorkspacePaths};

/// A source that could not be ingested, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFailure {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// Records for this run's sources, in input order, de-duplicated.
    pub records: Vec<FragmentRecord>,
    pub failures: Vec<IngestFailure>,
}

impl IngestOutcome {
    pub fn record_for(&self, source: &Path) -> Option<&FragmentRecord> {
        let source = source.to_string_lossy();
        self.records.iter().find(|r| r.source_path == source)
    }
}

/// All fragments ever ingested into the workspace, in ingestion order.
pub fn load_records(paths: &WorkspacePaths) -> Result<Vec<FragmentRecord>> {
    Ok(read_json(&paths.fragments_json())?.unwrap_or_default())
}

pub fn save_records(paths: &WorkspacePaths, records: &[FragmentRecord]) -> Result<()> {
    write_json(&paths.fragments_json(), records)
}

pub fn load_manifest(paths: &WorkspacePaths, fragment_id: &str) -> Result<ContentManifest> {
    read_json(&paths.manifest_file(fragment_id))?
        .with_context(|| format!("No manifest recorded for fragment '{}'", fragment_id))
}

fn source_kind(path: &Path) -> SourceKind {
    if path.is_file() {
        SourceKind::File
    } else if git::has_git_metadata(path) || git::is_bare_repo(path) {
        SourceKind::Git
    } else {
        SourceKind::Directory
    }
}

/// Ingest `sources` into the workspace.
///
/// A missing source is routed through the `missing-fragment` scenario
/// handler and recorded as a failure; it never aborts the batch.
pub async fn ingest_fragments(
    engine: &Engine,
    paths: &WorkspacePaths,
    sources: &[PathBuf],
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();
    let identifier = paths.identifier.clone();

    let mut resolved: Vec<PathBuf> = Vec::new();
    for source in sources {
        match source.canonicalize() {
            Ok(path) if !resolved.contains(&path) => resolved.push(path),
            Ok(_) => {}
            Err(e) => {
                let ctx = ScenarioContext::new(&source.to_string_lossy())
                    .with("path", source.to_string_lossy())
                    .with("error", e.to_string());
                let reason = match engine.handlers.dispatch(ScenarioKind::MissingFragment, &ctx) {
                    Err(err) => err.to_string(),
                    Ok(_) => format!("fragment path does not exist: {}", e),
                };
                warn!("Fragment {} skipped: {}", source.display(), reason);
                outcome.failures.push(IngestFailure {
                    source: source.to_string_lossy().to_string(),
                    reason,
                });
            }
        }
    }

    // Hash every source concurrently; results are slotted back by index.
    engine.report(ProgressEvent::Started {
        identifier: identifier.clone(),
        phase: Phase::Hashing,
    });
    let mut hashing = JoinSet::new();
    for (index, source) in resolved.iter().cloned().enumerate() {
        let engine = engine.clone();
        hashing.spawn(async move {
            let manifest = engine.blocking(move || build_manifest(&source)).await;
            (index, manifest)
        });
    }
    let mut manifests: Vec<Option<Result<ContentManifest>>> =
        (0..resolved.len()).map(|_| None).collect();
    while let Some(joined) = hashing.join_next().await {
        let (index, manifest) = joined.context("hashing task panicked")?;
        manifests[index] = Some(manifest);
    }
    engine.checkpoint()?;

    let _guard = engine.locks.lock(&identifier).await;
    let mut all_records = load_records(paths)?;
    let total = resolved.len() as u64;

    for (n, (source, manifest)) in resolved.iter().zip(manifests).enumerate() {
        engine.checkpoint()?;
        let manifest = match manifest {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                outcome.failures.push(IngestFailure {
                    source: source.to_string_lossy().to_string(),
                    reason: format!("{:#}", e),
                });
                continue;
            }
            None => continue,
        };

        let source_path = source.to_string_lossy().to_string();
        let digest = manifest.digest();
        let fragment_id = identity::fragment_id(&source_path, &digest);
        let kind = source_kind(source);
        let dest = paths.fragment_dir(&fragment_id);

        let copy_source = source.clone();
        let copy_dest = dest.clone();
        let copy_manifest = manifest.clone();
        let copied = engine
            .blocking(move || copy_fragment(&copy_source, kind, &copy_manifest, &copy_dest))
            .await;
        if let Err(e) = copied {
            warn!("Failed to ingest {}: {:#}", source.display(), e);
            outcome.failures.push(IngestFailure {
                source: source_path,
                reason: format!("{:#}", e),
            });
            continue;
        }
        write_json(&paths.manifest_file(&fragment_id), &manifest)?;

        let record = match all_records.iter().find(|r| r.fragment_id == fragment_id) {
            Some(existing) => existing.clone(),
            None => {
                let record = FragmentRecord {
                    fragment_id: fragment_id.clone(),
                    source_path: source_path.clone(),
                    destination: format!("fragments/{}", fragment_id),
                    source_kind: kind,
                    ingested_at: Utc::now(),
                    content_digest: digest,
                    recovered_ref: None,
                };
                info!("Ingested {} as {}", source.display(), fragment_id);
                all_records.push(record.clone());
                record
            }
        };
        engine.report(ProgressEvent::Advanced {
            identifier: identifier.clone(),
            phase: Phase::Ingesting,
            item: fragment_id,
            n: n as u64 + 1,
            total,
        });
        outcome.records.push(record);
    }

    save_records(paths, &all_records)?;
    Ok(outcome)
}

/// Copy one fragment into `dest`, writing only what differs.
fn copy_fragment(source: &Path, kind: SourceKind, manifest: &ContentManifest, dest: &Path) -> Result<()> {
    match kind {
        SourceKind::Git if git::is_bare_repo(source) => {
            if !dest.join(".git").exists() {
                if dest.exists() {
                    std::fs::remove_dir_all(dest)
                        .with_context(|| format!("Failed to clear {}", dest.display()))?;
                }
                git::clone(source, dest)?;
            }
            Ok(())
        }
        SourceKind::Git => manifest::copy_tree(source, dest).map(|_| ()),
        SourceKind::Directory | SourceKind::File => {
            manifest::copy_delta(source, manifest, dest).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::workspace::materialize_workspace;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ingestion_is_idempotent_and_wraps_files() {
        let ws = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let dir_fragment = src.path().join("fragment-a");
        fs::create_dir_all(&dir_fragment).unwrap();
        fs::write(dir_fragment.join("app.txt"), "hello").unwrap();
        let file_fragment = src.path().join("notes.txt");
        fs::write(&file_fragment, "loose").unwrap();

        let engine = Engine::new(ws.path(), Config::minimal());
        let paths = materialize_workspace(ws.path(), "demo", false).unwrap();
        let sources = vec![dir_fragment.clone(), file_fragment.clone(), dir_fragment.clone()];

        let first = ingest_fragments(&engine, &paths, &sources).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(first.failures.is_empty());

        let file_record = &first.records[1];
        assert_eq!(file_record.source_kind, SourceKind::File);
        assert!(paths
            .fragment_dir(&file_record.fragment_id)
            .join("notes.txt")
            .is_file());

        let second = ingest_fragments(&engine, &paths, &sources).await.unwrap();
        assert_eq!(first.records, second.records);
        assert_eq!(load_records(&paths).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_source_is_recorded_not_fatal() {
        let ws = TempDir::new().unwrap();
        let engine = Engine::new(ws.path(), Config::minimal());
        let paths = materialize_workspace(ws.path(), "demo", false).unwrap();
        let outcome = ingest_fragments(&engine, &paths, &[PathBuf::from("/no/such/fragment")])
            .await
            .unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("missing-fragment"));
    }

    #[tokio::test]
    async fn changed_content_gets_new_identity() {
        let ws = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let fragment = src.path().join("fragment-b");
        fs::create_dir_all(&fragment).unwrap();
        fs::write(fragment.join("a.txt"), "v1").unwrap();

        let engine = Engine::new(ws.path(), Config::minimal());
        let paths = materialize_workspace(ws.path(), "demo", false).unwrap();
        let first = ingest_fragments(&engine, &paths, &[fragment.clone()]).await.unwrap();
        fs::write(fragment.join("a.txt"), "v2").unwrap();
        let second = ingest_fragments(&engine, &paths, &[fragment.clone()]).await.unwrap();
        assert_ne!(first.records[0].fragment_id, second.records[0].fragment_id);
        assert_eq!(load_records(&paths).unwrap().len(), 2);
    }
}
