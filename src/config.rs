//! TOML configuration.
//!
//! Every section is optional; a missing file yields [`Config::minimal`].
//! Command-line flags override whatever is loaded here.
//!
//! ```toml
//! [workspace]
//! root = "./workspace"
//!
//! [scan]
//! golden_pattern = "*golden*"
//! fragment_pattern = "fragment*"
//! workers = 4
//!
//! [recovery]
//! threshold_minutes = 30
//! author_name = "repo-merger"
//! author_email = "repo-merger@example.invalid"
//!
//! [merge]
//! continue_through_conflicts = false
//! ```

use anyhow::{Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use repo_merger_core::recovery::DEFAULT_THRESHOLD_MINUTES;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./workspace")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_golden_pattern")]
    pub golden_pattern: String,
    #[serde(default = "default_fragment_pattern")]
    pub fragment_pattern: String,
    /// Size of the blocking worker pool used for hashing and git calls.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub approve_low_confidence: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            golden_pattern: default_golden_pattern(),
            fragment_pattern: default_fragment_pattern(),
            workers: default_workers(),
            approve_low_confidence: false,
        }
    }
}

fn default_golden_pattern() -> String {
    "*golden*".to_string()
}
fn default_fragment_pattern() -> String {
    "fragment*".to_string()
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    #[serde(default = "default_threshold_minutes")]
    pub threshold_minutes: u32,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: default_threshold_minutes(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

impl RecoveryConfig {
    /// `Name <email>` form used in synthetic commits.
    pub fn author(&self) -> String {
        format!("{} <{}>", self.author_name, self.author_email)
    }
}

fn default_threshold_minutes() -> u32 {
    DEFAULT_THRESHOLD_MINUTES
}
fn default_author_name() -> String {
    "repo-merger".to_string()
}
fn default_author_email() -> String {
    "repo-merger@example.invalid".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MergeConfig {
    #[serde(default)]
    pub continue_through_conflicts: bool,
}

impl Config {
    /// Defaults for every section, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to [`Config::minimal`].
pub fn load_or_minimal(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.scan.workers == 0 {
        anyhow::bail!("scan.workers must be > 0");
    }
    if config.recovery.threshold_minutes == 0 {
        anyhow::bail!("recovery.threshold_minutes must be > 0");
    }
    if config.recovery.author_name.trim().is_empty() {
        anyhow::bail!("recovery.author_name must not be empty");
    }
    if config.recovery.author_email.trim().is_empty() {
        anyhow::bail!("recovery.author_email must not be empty");
    }
    for (key, pattern) in [
        ("scan.golden_pattern", &config.scan.golden_pattern),
        ("scan.fragment_pattern", &config.scan.fragment_pattern),
    ] {
        Glob::new(pattern).with_context(|| format!("Invalid glob in {}: '{}'", key, pattern))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scan.golden_pattern, "*golden*");
        assert_eq!(config.scan.fragment_pattern, "fragment*");
        assert_eq!(config.recovery.threshold_minutes, 30);
        assert!(!config.merge.continue_through_conflicts);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config: Config = toml::from_str(
            r#"
[scan]
workers = 8

[recovery]
threshold_minutes = 5
"#,
        )
        .unwrap();
        assert_eq!(config.scan.workers, 8);
        assert_eq!(config.scan.golden_pattern, "*golden*");
        assert_eq!(config.recovery.threshold_minutes, 5);
        assert_eq!(
            config.recovery.author(),
            "repo-merger <repo-merger@example.invalid>"
        );
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::minimal();
        config.scan.workers = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("scan.workers"));
    }

    #[test]
    fn bad_glob_rejected() {
        let mut config = Config::minimal();
        config.scan.golden_pattern = "[unterminated".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn missing_file_is_minimal() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_or_minimal(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("./workspace"));
    }
}
