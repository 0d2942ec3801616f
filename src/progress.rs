//! Progress reporting for scans, ingestion, and merges.
//!
//! Progress is emitted on **stderr** so stdout stays parseable for
//! scripts. Diagnostics go through `tracing`; this is only the per-item
//! "where are we" stream an operator watches during a long run.

use std::io::Write;
use std::sync::Arc;

/// Stage of the pipeline an event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Scanning,
    Hashing,
    Ingesting,
    Classifying,
    Recovering,
    Merging,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scanning => "scanning",
            Phase::Hashing => "hashing",
            Phase::Ingesting => "ingesting",
            Phase::Classifying => "classifying",
            Phase::Recovering => "recovering",
            Phase::Merging => "merging",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Work started with no known total.
    Started { identifier: String, phase: Phase },
    /// `n` of `total` items done; `item` names the last one.
    Advanced {
        identifier: String,
        phase: Phase,
        item: String,
        n: u64,
        total: u64,
    },
}

/// Receives progress events. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

pub type SharedProgress = Arc<dyn ProgressReporter>;

/// Human-friendly progress: "demo-repo  merging  3 / 12  fragment-a1b2".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started { identifier, phase } => {
                format!("{}  {}...\n", identifier, phase.as_str())
            }
            ProgressEvent::Advanced {
                identifier,
                phase,
                item,
                n,
                total,
            } => format!(
                "{}  {}  {} / {}  {}\n",
                identifier,
                phase.as_str(),
                format_number(*n),
                format_number(*total),
                item
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Started { identifier, phase } => serde_json::json!({
                "event": "progress",
                "identifier": identifier,
                "phase": phase.as_str(),
            }),
            ProgressEvent::Advanced {
                identifier,
                phase,
                item,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "identifier": identifier,
                "phase": phase.as_str(),
                "item": item,
                "n": n,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human, or JSON.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> SharedProgress {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Merging.as_str(), "merging");
        assert_eq!(Phase::Hashing.as_str(), "hashing");
    }
}
