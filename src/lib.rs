//! # Repo Merger
//!
//! Consolidates one authoritative **golden** checkout and any number of
//! **fragments** (partial clones, stale working copies, loose file drops)
//! into a single per-project workspace.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Scan /     │──▶│ Workspace  │──▶│ Manifest +   │──▶│ Recovery   │
//! │ CLI input  │   │ + Ingest   │   │ Classifier   │   │ (non-git)  │
//! └────────────┘   └────────────┘   └──────────────┘   └─────┬──────┘
//!                                                            │
//!                                   ┌──────────────┐         │
//!                                   │ Merge        │◀────────┘
//!                                   │ (worktrees)  │
//!                                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! repo-merger run --golden ~/src/app --fragment ~/old/app-copy --fragment ~/drop/app.zip-extract
//! repo-merger run --golden ~/src/app --fragment ~/old/app-copy --mode merge
//! repo-merger merge --identifier acme-app --resume-from app-copy-1a2b3c4d5e6f
//! repo-merger scan --source ~/archive --ingest
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`engine`] | Shared run context: worker pool, locks, cancellation |
//! | [`git`] | Git collaborator (shells out to `git`) |
//! | [`manifest`] | Content manifest builder and delta copy |
//! | [`workspace`] | Directory contract, golden mirroring, locks |
//! | [`ingest`] | Fragment ingestion |
//! | [`classify`] | Fragment classification against golden |
//! | [`recovery`] | Synthetic history for non-git fragments |
//! | [`merge`] | Worktree-based merge orchestration |
//! | [`scan`] | Directory discovery and `scan_report.json` |
//! | [`pipeline`] | The `run` command end to end |
//! | [`report`] | `report.md` and stdout summaries |
//! | [`progress`] | Progress reporting on stderr |

pub mod classify;
pub mod config;
pub mod engine;
pub mod git;
pub mod ingest;
pub mod manifest;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod report;
pub mod scan;
pub mod workspace;
