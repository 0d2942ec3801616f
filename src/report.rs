//! Workspace reports: `report.md` and the stdout summary.
//!
//! Both are rendered from what is already on disk (`fragments.json`,
//! `analysis.json`, `merge_report.json`), so `repo-merger report` can
//! regenerate them at any time without rerunning anything.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use repo_merger_core::models::{
    ClassificationStatus, FragmentAnalysis, FragmentRecord, MergeOutcome, MergeReport,
};

use crate::ingest::load_records;
use crate::merge::load_report;
use crate::workspace::{read_json, write_atomic, WorkspacePaths};

/// Everything a report is rendered from.
pub struct ReportInputs {
    pub identifier: String,
    pub golden: String,
    pub records: Vec<FragmentRecord>,
    pub analyses: Vec<FragmentAnalysis>,
    pub merge: Option<MergeReport>,
}

impl ReportInputs {
    pub fn load(paths: &WorkspacePaths) -> Result<Self> {
        Ok(Self {
            identifier: paths.identifier.clone(),
            golden: paths.golden.to_string_lossy().to_string(),
            records: load_records(paths)?,
            analyses: read_json(&paths.analysis_json())?.unwrap_or_default(),
            merge: load_report(paths)?,
        })
    }

    fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for analysis in &self.analyses {
            *counts.entry(analysis.status.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

pub fn render_markdown(inputs: &ReportInputs) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Repo Merger Report: {}", inputs.identifier);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Golden: `{}`", inputs.golden);
    let _ = writeln!(out, "- Fragments ingested: {}", inputs.records.len());
    let _ = writeln!(out, "- Fragments analysed: {}", inputs.analyses.len());
    for (status, count) in inputs.status_counts() {
        let _ = writeln!(out, "  - {}: {}", status, count);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Fragments");
    let _ = writeln!(out);
    if inputs.analyses.is_empty() {
        let _ = writeln!(out, "_No fragments analysed._");
    }
    for analysis in &inputs.analyses {
        let _ = writeln!(out, "### {}", analysis.fragment_id);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Source: `{}`", analysis.source_path);
        let _ = writeln!(out, "- Status: **{}**", analysis.status);
        if !analysis.flags.is_empty() {
            let flags: Vec<String> = analysis.flags.iter().map(|f| f.to_string()).collect();
            let _ = writeln!(out, "- Low confidence: {}", flags.join(", "));
        }
        if let Some(git) = &analysis.git {
            let _ = writeln!(
                out,
                "- HEAD: `{}` on {}{}",
                git.head.as_deref().unwrap_or("(no commits)"),
                git.branch.as_deref().unwrap_or("(detached)"),
                if git.dirty { ", dirty" } else { "" }
            );
        }
        if let Some(detail) = &analysis.detail {
            let _ = writeln!(out, "- Detail: {}", detail);
        }
        if let Some(manifest) = &analysis.manifest_ref {
            let _ = writeln!(out, "- Manifest: `{}`", manifest);
        }
        if let Some(recovered) = &analysis.recovered_ref {
            let _ = writeln!(out, "- Recovered history: `{}`", recovered);
        }
        if !analysis.handlers.is_empty() {
            let _ = writeln!(out, "- Scenarios: {}", analysis.handlers.join(", "));
        }
        let _ = writeln!(out);
    }

    if let Some(merge) = &inputs.merge {
        let _ = writeln!(out, "## Merge");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Fragment | Outcome | Worktree | Notes |");
        let _ = writeln!(out, "|---|---|---|---|");
        for session in &merge.sessions {
            let notes = match (&session.conflict_details, &session.reason) {
                (Some(details), _) => format!("conflict in {}", details.paths.join(", ")),
                (None, Some(reason)) => reason.clone(),
                (None, None) => format!("{} commit(s) applied", session.applied_commits.len()),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                session.fragment_id,
                session.outcome,
                session.worktree.as_deref().unwrap_or("-"),
                notes.replace('|', "\\|")
            );
        }
        let _ = writeln!(out);
        match &merge.resume_cursor {
            Some(cursor) => {
                let _ = writeln!(
                    out,
                    "Resume with `repo-merger merge --identifier {} --resume-from {}`.",
                    inputs.identifier, cursor
                );
            }
            None => {
                let _ = writeln!(out, "All fragments merged.");
            }
        }
    }
    out
}

/// Render and write `report.md`. Returns its path.
pub fn write_report(paths: &WorkspacePaths) -> Result<PathBuf> {
    let inputs = ReportInputs::load(paths)?;
    let path = paths.report_md();
    write_atomic(&path, render_markdown(&inputs).as_bytes())?;
    Ok(path)
}

/// Print the run summary to stdout.
pub fn print_summary(paths: &WorkspacePaths) -> Result<()> {
    let inputs = ReportInputs::load(paths)?;

    println!("Repo Merger: {}", inputs.identifier);
    println!("==========================================");
    println!();
    println!("  Workspace:   {}", paths.root.display());
    println!("  Fragments:   {}", inputs.analyses.len());
    for (status, count) in inputs.status_counts() {
        println!("    {:<12} {}", status, count);
    }
    for analysis in &inputs.analyses {
        let marker = match analysis.status {
            ClassificationStatus::InSync => "=",
            ClassificationStatus::Ahead => "+",
            ClassificationStatus::Diverged => "~",
            ClassificationStatus::Orphaned => "?",
            ClassificationStatus::NonGit => "-",
        };
        println!("  {} {:<32} {}", marker, analysis.fragment_id, analysis.status);
    }

    if let Some(merge) = &inputs.merge {
        let count = |outcome: MergeOutcome| {
            merge
                .sessions
                .iter()
                .filter(|s| s.outcome == outcome)
                .count()
        };
        println!();
        println!(
            "  Merge:       {} merged, {} conflicted, {} skipped",
            count(MergeOutcome::Merged),
            count(MergeOutcome::Conflicted),
            count(MergeOutcome::Skipped)
        );
        if let Some(cursor) = &merge.resume_cursor {
            println!("  Resume from: {}", cursor);
        }
    }
    println!();
    println!("  Report:      {}", paths.report_md().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_merger_core::models::{ClassificationFlag, MergeSession};

    fn analysis(id: &str, status: ClassificationStatus) -> FragmentAnalysis {
        FragmentAnalysis {
            fragment_id: id.to_string(),
            source_path: format!("/src/{}", id),
            status,
            manifest_ref: Some(format!("manifests/{}.json", id)),
            recovered_ref: None,
            detail: Some("added:1 (new.txt)".to_string()),
            flags: Vec::new(),
            git: None,
            handlers: Vec::new(),
        }
    }

    #[test]
    fn markdown_lists_fragments_and_resume_hint() {
        let mut orphan = analysis("frag-b", ClassificationStatus::Orphaned);
        orphan.flags.push(ClassificationFlag::IdentityHeuristic);
        let inputs = ReportInputs {
            identifier: "demo".to_string(),
            golden: "/ws/demo/golden".to_string(),
            records: Vec::new(),
            analyses: vec![analysis("frag-a", ClassificationStatus::Ahead), orphan],
            merge: Some(MergeReport {
                sessions: vec![MergeSession::skipped("frag-b", "orphaned")],
                resume_cursor: Some("frag-b".to_string()),
                cancelled: false,
            }),
        };
        let md = render_markdown(&inputs);
        assert!(md.contains("# Repo Merger Report: demo"));
        assert!(md.contains("- Status: **ahead**"));
        assert!(md.contains("Low confidence: identity-heuristic"));
        assert!(md.contains("| frag-b | skipped | - | orphaned |"));
        assert!(md.contains("--resume-from frag-b"));
    }
}
