//! # Repo Merger Core
//!
//! Shared, I/O-free logic for repo-merger: data models, the error
//! taxonomy, identifier derivation, recovery planning, scan scoring,
//! scan-report merging, and the scenario handler registry.
//!
//! This crate contains no tokio, process spawning, or filesystem I/O.
//! Everything here is a pure function of its inputs, which is what makes
//! the determinism guarantees (identity, recovery, scan reports) testable
//! without a git executable.

pub mod error;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod recovery;
pub mod scan;

pub use error::{EngineError, EngineResult};
