//! Git collaborator.
//!
//! Every repository operation shells out to the `git` executable; its
//! exit status and output are the only source of truth. Failures come back
//! as [`EngineError::Git`] wrapped in `anyhow::Error`, so callers can
//! `downcast_ref` when they need to branch on them.
//!
//! Commands that create commits get a default identity from
//! `GIT_AUTHOR_*`/`GIT_COMMITTER_*` when those are unset, so the tool works
//! on machines without `user.name` configured. Signing is always disabled.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use repo_merger_core::EngineError;

const DEFAULT_NAME: &str = "repo-merger";
const DEFAULT_EMAIL: &str = "repo-merger@example.invalid";

/// Private ref namespace for fetched fragment history.
pub const FRAGMENT_REF_PREFIX: &str = "refs/repo-merger/fragments/";

/// Identity and date applied to a commit.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Unix seconds; `None` lets git use the current time.
    pub timestamp: Option<i64>,
}

impl Signature {
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("GIT_AUTHOR_NAME".to_string(), self.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), self.email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), self.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), self.email.clone()),
        ];
        if let Some(ts) = self.timestamp {
            let date = format!("@{} +0000", ts);
            env.push(("GIT_AUTHOR_DATE".to_string(), date.clone()));
            env.push(("GIT_COMMITTER_DATE".to_string(), date));
        }
        env
    }
}

fn command(dir: &Path, args: &[&str], env: &[(String, String)]) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(["-c", "commit.gpgsign=false", "-c", "core.quotepath=off"]);
    cmd.args(args);
    cmd.current_dir(dir);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (key, fallback) in [
        ("GIT_AUTHOR_NAME", DEFAULT_NAME),
        ("GIT_AUTHOR_EMAIL", DEFAULT_EMAIL),
        ("GIT_COMMITTER_NAME", DEFAULT_NAME),
        ("GIT_COMMITTER_EMAIL", DEFAULT_EMAIL),
    ] {
        if std::env::var_os(key).is_none() {
            cmd.env(key, fallback);
        }
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd
}

fn failure(dir: &Path, args: &[&str], output: &Output) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    EngineError::Git {
        args: args.join(" "),
        dir: dir.to_path_buf(),
        stderr,
    }
    .into()
}

fn output(dir: &Path, args: &[&str], env: &[(String, String)]) -> Result<Output> {
    command(dir, args, env)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args.join(" ")))
}

/// Run git and return raw stdout; non-zero exit is an error.
pub fn run_raw(dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let out = output(dir, args, &[])?;
    if !out.status.success() {
        return Err(failure(dir, args, &out));
    }
    Ok(out.stdout)
}

/// Run git and return trimmed stdout.
pub fn run(dir: &Path, args: &[&str]) -> Result<String> {
    run_with_env(dir, args, &[])
}

pub fn run_with_env(dir: &Path, args: &[&str], env: &[(String, String)]) -> Result<String> {
    let out = output(dir, args, env)?;
    if !out.status.success() {
        return Err(failure(dir, args, &out));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run git with `input` on stdin and return trimmed stdout.
pub fn run_with_stdin(
    dir: &Path,
    args: &[&str],
    input: &[u8],
    env: &[(String, String)],
) -> Result<String> {
    let mut child = command(dir, args, env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .with_context(|| format!("Failed to write stdin of 'git {}'", args.join(" ")))?;
    }
    let out = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for 'git {}'", args.join(" ")))?;
    if !out.status.success() {
        return Err(failure(dir, args, &out));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run a git query whose exit status is the answer: 0 is true, 1 is false,
/// anything else is an error.
fn probe(dir: &Path, args: &[&str]) -> Result<bool> {
    let out = output(dir, args, &[])?;
    match out.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(failure(dir, args, &out)),
    }
}

/// Like [`run`], but exit status 1 means "no value".
fn query(dir: &Path, args: &[&str]) -> Result<Option<String>> {
    let out = output(dir, args, &[])?;
    match out.status.code() {
        Some(0) => {
            let value = String::from_utf8_lossy(&out.stdout).trim().to_string();
            Ok(if value.is_empty() { None } else { Some(value) })
        }
        Some(1) => Ok(None),
        _ => Err(failure(dir, args, &out)),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Inspection
// ═══════════════════════════════════════════════════════════════════════

/// A `.git` directory or gitfile is present.
pub fn has_git_metadata(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Structural bare-repository check: `HEAD`, `objects/`, and `refs/` at
/// the top level and no `.git` entry.
pub fn is_bare_repo(path: &Path) -> bool {
    path.join("HEAD").is_file()
        && path.join("objects").is_dir()
        && path.join("refs").is_dir()
        && !path.join(".git").exists()
}

/// Git can open the repository at `path`.
pub fn is_repository(path: &Path) -> bool {
    output(path, &["rev-parse", "--git-dir"], &[])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Locate the config file of a working copy (`.git/config`, following a
/// `gitdir:` pointer) or of a bare repository.
pub fn config_path(repo: &Path) -> Option<PathBuf> {
    let git_dir = repo.join(".git");
    if git_dir.is_dir() {
        let config = git_dir.join("config");
        return config.is_file().then_some(config);
    }
    if git_dir.is_file() {
        let pointer = std::fs::read_to_string(&git_dir).ok()?;
        let target = pointer.trim().strip_prefix("gitdir:")?.trim();
        let config = repo.join(target).join("config");
        // Linked worktrees keep their config in the common dir.
        if config.is_file() {
            return Some(config);
        }
        let common = repo.join(target).join("commondir");
        let common = std::fs::read_to_string(common).ok()?;
        let config = repo.join(target).join(common.trim()).join("config");
        return config.is_file().then_some(config);
    }
    let bare = repo.join("config");
    bare.is_file().then_some(bare)
}

/// `remote.origin.url`, read straight from the config file.
pub fn origin_url(repo: &Path) -> Result<Option<String>> {
    let Some(config) = config_path(repo) else {
        return Ok(None);
    };
    let dir = config.parent().unwrap_or(repo);
    let config_arg = config.to_string_lossy().to_string();
    query(
        dir,
        &["config", "--file", &config_arg, "--get", "remote.origin.url"],
    )
}

/// Any remote configured at all.
pub fn has_remote(repo: &Path) -> Result<bool> {
    let Some(config) = config_path(repo) else {
        return Ok(false);
    };
    let dir = config.parent().unwrap_or(repo);
    let config_arg = config.to_string_lossy().to_string();
    Ok(query(
        dir,
        &["config", "--file", &config_arg, "--get-regexp", r"^remote\..*\.url$"],
    )?
    .is_some())
}

/// Commit id of `HEAD`, or `None` for a repository without commits.
pub fn head(repo: &Path) -> Result<Option<String>> {
    resolve(repo, "HEAD")
}

pub fn resolve(repo: &Path, rev: &str) -> Result<Option<String>> {
    let spec = format!("{}^{{commit}}", rev);
    query(repo, &["rev-parse", "--verify", "-q", &spec])
}

/// Short branch name, or `None` on a detached HEAD.
pub fn current_branch(repo: &Path) -> Result<Option<String>> {
    query(repo, &["symbolic-ref", "--short", "-q", "HEAD"])
}

pub fn is_dirty(repo: &Path) -> Result<bool> {
    Ok(!run(repo, &["status", "--porcelain"])?.is_empty())
}

pub fn has_commit(repo: &Path, sha: &str) -> Result<bool> {
    let spec = format!("{}^{{commit}}", sha);
    let out = output(repo, &["cat-file", "-e", &spec], &[])?;
    Ok(out.status.success())
}

/// `ancestor` is reachable from `descendant` (true when equal).
pub fn is_ancestor(repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    probe(repo, &["merge-base", "--is-ancestor", ancestor, descendant])
}

pub fn merge_base(repo: &Path, a: &str, b: &str) -> Result<Option<String>> {
    query(repo, &["merge-base", a, b])
}

/// Number of commits reachable from `tip` but not from `exclude`.
pub fn count_between(repo: &Path, exclude: &str, tip: &str) -> Result<usize> {
    let range = format!("{}..{}", exclude, tip);
    let count = run(repo, &["rev-list", "--count", &range])?;
    count
        .parse()
        .with_context(|| format!("Unexpected rev-list count '{}'", count))
}

/// Non-merge commits reachable from `tip` but not from `base`, oldest first.
pub fn replay_list(repo: &Path, base: Option<&str>, tip: &str) -> Result<Vec<String>> {
    let exclude = base.map(|b| format!("^{}", b));
    let mut args = vec!["rev-list", "--reverse", "--topo-order", "--no-merges", tip];
    if let Some(exclude) = exclude.as_deref() {
        args.push(exclude);
    }
    Ok(run(repo, &args)?
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect())
}

// ═══════════════════════════════════════════════════════════════════════
// Mutation
// ═══════════════════════════════════════════════════════════════════════

pub fn clone(source: &Path, dest: &Path) -> Result<()> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    let source_arg = source.to_string_lossy().to_string();
    let dest_arg = dest.to_string_lossy().to_string();
    run(parent, &["clone", "-q", &source_arg, &dest_arg])?;
    Ok(())
}

/// Initialise a repository whose initial branch is `main`.
pub fn init(dir: &Path) -> Result<()> {
    run(dir, &["init", "-q"])?;
    run(dir, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
    Ok(())
}

/// Fetch `source`'s HEAD into `repo` under `refname`. Returns the fetched
/// commit, or `None` when the source has no commits.
pub fn fetch_head_into(repo: &Path, source: &Path, refname: &str) -> Result<Option<String>> {
    if head(source)?.is_none() {
        return Ok(None);
    }
    let source_arg = source.to_string_lossy().to_string();
    let refspec = format!("+HEAD:{}", refname);
    run(repo, &["fetch", "-q", "--no-tags", &source_arg, &refspec])?;
    resolve(repo, refname)
}

/// Stage exactly `paths` (additions, modifications, and deletions).
pub fn add_paths(repo: &Path, paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let mut input = Vec::new();
    for path in paths {
        input.extend_from_slice(path.as_bytes());
        input.push(0);
    }
    run_with_stdin(
        repo,
        &[
            "add",
            "-A",
            "-f",
            "--pathspec-from-file=-",
            "--pathspec-file-nul",
        ],
        &input,
        &[],
    )?;
    Ok(())
}

/// Commit the index. Returns the new HEAD.
pub fn commit(repo: &Path, message: &str, signature: &Signature, allow_empty: bool) -> Result<String> {
    let mut args = vec!["commit", "-q", "--no-verify", "-m", message];
    if allow_empty {
        args.push("--allow-empty");
    }
    run_with_env(repo, &args, &signature.env())?;
    head(repo)?.ok_or_else(|| anyhow::anyhow!("commit in {} produced no HEAD", repo.display()))
}

pub fn has_staged_changes(repo: &Path) -> Result<bool> {
    Ok(!probe(repo, &["diff", "--cached", "--quiet"])?)
}

pub fn unmerged_paths(repo: &Path) -> Result<Vec<String>> {
    Ok(run(repo, &["diff", "--name-only", "--diff-filter=U"])?
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect())
}

// ═══════════════════════════════════════════════════════════════════════
// Worktrees and replay
// ═══════════════════════════════════════════════════════════════════════

/// Add a worktree at `path` on `branch`, (re)pointing the branch at `start`.
pub fn worktree_add(repo: &Path, path: &Path, branch: &str, start: &str) -> Result<()> {
    run(repo, &["worktree", "prune"])?;
    let path_arg = path.to_string_lossy().to_string();
    run(
        repo,
        &["worktree", "add", "-q", "-f", "-B", branch, &path_arg, start],
    )?;
    Ok(())
}

/// Remove the worktree at `path`, falling back to deleting the directory
/// when git no longer knows about it.
pub fn worktree_remove(repo: &Path, path: &Path) -> Result<()> {
    let path_arg = path.to_string_lossy().to_string();
    if run(repo, &["worktree", "remove", "--force", &path_arg]).is_err() && path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove worktree {}", path.display()))?;
    }
    run(repo, &["worktree", "prune"])?;
    Ok(())
}

/// Result of applying one commit or patch to a worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Clean,
    Conflict { paths: Vec<String>, message: String },
}

/// Cherry-pick `sha` onto the worktree. Empty results are kept so replay
/// always advances one commit per source commit.
pub fn cherry_pick(worktree: &Path, sha: &str) -> Result<Applied> {
    let args = [
        "cherry-pick",
        "--allow-empty",
        "--keep-redundant-commits",
        "-x",
        sha,
    ];
    let out = output(worktree, &args, &[])?;
    if out.status.success() {
        return Ok(Applied::Clean);
    }
    let message = String::from_utf8_lossy(&out.stderr).trim().to_string();
    Ok(Applied::Conflict {
        paths: unmerged_paths(worktree)?,
        message,
    })
}

pub fn cherry_pick_in_progress(worktree: &Path) -> Result<bool> {
    Ok(query(
        worktree,
        &["rev-parse", "-q", "--verify", "CHERRY_PICK_HEAD"],
    )?
    .is_some())
}

/// Conclude an in-progress cherry-pick whose conflicts were resolved.
/// A resolution that leaves nothing to commit is recorded as an empty
/// commit, so its `-x` trailer still marks the source commit as picked.
pub fn cherry_pick_continue(worktree: &Path) -> Result<()> {
    let env = vec![("GIT_EDITOR".to_string(), "true".to_string())];
    if has_staged_changes(worktree)? {
        run_with_env(worktree, &["cherry-pick", "--continue"], &env)?;
    } else {
        run_with_env(
            worktree,
            &["commit", "-q", "--no-verify", "--allow-empty"],
            &env,
        )?;
    }
    Ok(())
}

/// Some commit in `base..HEAD` carries the `-x` trailer naming `sha`.
pub fn has_picked(worktree: &Path, base: &str, sha: &str) -> Result<bool> {
    let range = format!("{}..HEAD", base);
    let grep = format!("--grep=(cherry picked from commit {})", sha);
    Ok(!run(worktree, &["log", "-F", &grep, "--format=%H", &range])?.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════
// File-level patches
// ═══════════════════════════════════════════════════════════════════════

/// A file to overlay onto a tree: repository path plus where its content
/// comes from.
#[derive(Debug, Clone)]
pub struct OverlayFile {
    pub path: String,
    pub source: PathBuf,
    pub symlink: Option<String>,
    pub executable: bool,
}

/// Write a tree equal to `base`'s tree with `files` overlaid, using a
/// throwaway index so neither the repository's index nor its working copy
/// is touched. Returns the tree id.
pub fn overlay_tree(repo: &Path, base: &str, files: &[OverlayFile], scratch: &Path) -> Result<String> {
    let index = scratch.join("overlay.index");
    let _ = std::fs::remove_file(&index);
    let env = vec![(
        "GIT_INDEX_FILE".to_string(),
        index.to_string_lossy().to_string(),
    )];
    run_with_env(repo, &["read-tree", base], &env)?;
    for file in files {
        let (blob, mode) = match &file.symlink {
            Some(target) => (
                run_with_stdin(repo, &["hash-object", "-w", "--stdin"], target.as_bytes(), &[])?,
                "120000",
            ),
            None => {
                let source = file.source.to_string_lossy().to_string();
                let mode = if file.executable { "100755" } else { "100644" };
                (
                    run(repo, &["hash-object", "-w", "--no-filters", &source])?,
                    mode,
                )
            }
        };
        let cacheinfo = format!("{},{},{}", mode, blob, file.path);
        run_with_env(
            repo,
            &["update-index", "--add", "--cacheinfo", &cacheinfo],
            &env,
        )?;
    }
    let tree = run_with_env(repo, &["write-tree"], &env)?;
    let _ = std::fs::remove_file(&index);
    Ok(tree)
}

/// Binary-safe patch from `from` to `to`.
pub fn diff_binary(repo: &Path, from: &str, to: &str) -> Result<Vec<u8>> {
    run_raw(repo, &["diff", "--binary", "--full-index", from, to])
}

/// Apply `patch` to the worktree and index with three-way fallback.
pub fn apply_patch(worktree: &Path, patch: &[u8]) -> Result<Applied> {
    if patch.is_empty() {
        return Ok(Applied::Clean);
    }
    let mut child = command(worktree, &["apply", "--3way", "--index", "-"], &[])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| "Failed to execute 'git apply'")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(patch)
            .with_context(|| "Failed to write patch to 'git apply'")?;
    }
    let out = child
        .wait_with_output()
        .with_context(|| "Failed to wait for 'git apply'")?;
    if out.status.success() {
        return Ok(Applied::Clean);
    }
    Ok(Applied::Conflict {
        paths: unmerged_paths(worktree)?,
        message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo_with_commit() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        add_paths(dir.path(), &["a.txt".to_string()]).unwrap();
        let sig = Signature {
            name: "Tester".into(),
            email: "t@example.invalid".into(),
            timestamp: Some(1_700_000_000),
        };
        let sha = commit(dir.path(), "first", &sig, false).unwrap();
        (dir, sha)
    }

    #[test]
    fn head_of_empty_repo_is_none() {
        let dir = TempDir::new().unwrap();
        init(dir.path()).unwrap();
        assert_eq!(head(dir.path()).unwrap(), None);
        assert_eq!(current_branch(dir.path()).unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn fixed_signature_gives_reproducible_commit() {
        let (a, sha_a) = repo_with_commit();
        let (b, sha_b) = repo_with_commit();
        assert_eq!(sha_a, sha_b);
        assert_eq!(head(a.path()).unwrap(), Some(sha_a));
        assert!(!is_dirty(b.path()).unwrap());
    }

    #[test]
    fn failures_are_typed() {
        let (dir, _) = repo_with_commit();
        let err = run(dir.path(), &["rev-parse", "--verify", "no-such-ref"]).unwrap_err();
        let engine = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine, EngineError::Git { .. }));
    }

    #[test]
    fn origin_url_read_from_config() {
        let (dir, _) = repo_with_commit();
        assert_eq!(origin_url(dir.path()).unwrap(), None);
        run(
            dir.path(),
            &["remote", "add", "origin", "git@example.com:acme/widgets.git"],
        )
        .unwrap();
        assert_eq!(
            origin_url(dir.path()).unwrap().as_deref(),
            Some("git@example.com:acme/widgets.git")
        );
        assert!(has_remote(dir.path()).unwrap());
    }

    #[test]
    fn bare_detection_is_structural() {
        let (dir, _) = repo_with_commit();
        assert!(!is_bare_repo(dir.path()));
        let bare = TempDir::new().unwrap();
        let target = bare.path().join("mirror.git");
        run(
            bare.path(),
            &[
                "clone",
                "-q",
                "--bare",
                &dir.path().to_string_lossy(),
                &target.to_string_lossy(),
            ],
        )
        .unwrap();
        assert!(is_bare_repo(&target));
        assert!(config_path(&target).is_some());
    }

    #[test]
    fn picked_commits_are_found_by_trailer() {
        let (dir, base) = repo_with_commit();
        let repo = dir.path();
        run(repo, &["checkout", "-q", "-b", "side"]).unwrap();
        std::fs::write(repo.join("b.txt"), "two\n").unwrap();
        add_paths(repo, &["b.txt".to_string()]).unwrap();
        let sig = Signature {
            name: "Tester".into(),
            email: "t@example.invalid".into(),
            timestamp: None,
        };
        let side = commit(repo, "second", &sig, false).unwrap();
        run(repo, &["checkout", "-q", "main"]).unwrap();

        assert!(!has_picked(repo, &base, &side).unwrap());
        assert_eq!(cherry_pick(repo, &side).unwrap(), Applied::Clean);
        assert!(has_picked(repo, &base, &side).unwrap());
        assert!(!has_picked(repo, &base, &base).unwrap());
    }
}
