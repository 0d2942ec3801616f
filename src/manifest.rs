//! Content manifest builder.
//!
//! Walks a tree with `walkdir` (symlinks recorded, never followed),
//! hashing every regular file with SHA-256. Version-control internals are
//! excluded unless [`ManifestOptions::include_vcs`] is set. A file that
//! cannot be read is recorded in [`ContentManifest::unreadable`] and the
//! walk continues.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use repo_merger_core::models::{ContentManifest, FileEntry};
use repo_merger_core::EngineError;

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestOptions {
    /// Also inventory `.git`/`.hg`/`.svn`; used when copying repositories.
    pub include_vcs: bool,
}

pub fn build_manifest(root: &Path) -> Result<ContentManifest> {
    build_manifest_with(root, ManifestOptions::default())
}

/// Build a manifest of `root`, which may be a directory or a single file.
///
/// A single file yields a one-entry manifest keyed by its file name.
pub fn build_manifest_with(root: &Path, options: ManifestOptions) -> Result<ContentManifest> {
    let meta = fs::symlink_metadata(root)
        .with_context(|| format!("Failed to read fragment root: {}", root.display()))?;
    let mut manifest = ContentManifest::new();

    if !meta.is_dir() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        record(&mut manifest, root, &name);
        return Ok(manifest);
    }

    let mut visited: HashSet<PathBuf> = HashSet::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| should_descend(e, options, &mut visited));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                record_unreadable(&mut manifest, &path, e.to_string());
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        record(&mut manifest, entry.path(), &relative);
    }

    debug!(
        "Manifest of {}: {} files, {} unreadable",
        root.display(),
        manifest.len(),
        manifest.unreadable.len()
    );
    Ok(manifest)
}

/// VCS entries are skipped whether they are directories or gitfiles.
fn should_descend(entry: &DirEntry, options: ManifestOptions, visited: &mut HashSet<PathBuf>) -> bool {
    if entry.depth() > 0 && !options.include_vcs {
        let name = entry.file_name().to_string_lossy();
        if VCS_DIRS.contains(&name.as_ref()) {
            return false;
        }
    }
    if !entry.file_type().is_dir() {
        return true;
    }
    match entry.path().canonicalize() {
        Ok(canonical) => visited.insert(canonical),
        Err(_) => true,
    }
}

fn record(manifest: &mut ContentManifest, path: &Path, relative: &str) {
    match file_entry(path) {
        Ok(Some(entry)) => {
            manifest.insert(relative, entry);
        }
        Ok(None) => {}
        Err(e) => record_unreadable(manifest, relative, e.to_string()),
    }
}

fn record_unreadable(manifest: &mut ContentManifest, relative: &str, reason: String) {
    let err = EngineError::UnreadableFile {
        path: relative.to_string(),
        reason,
    };
    warn!("{}", err);
    manifest.record_unreadable(relative, err.to_string());
}

/// Entry for one path; `None` for things that are neither files nor
/// symlinks (sockets, fifos).
fn file_entry(path: &Path) -> io::Result<Option<FileEntry>> {
    let meta = fs::symlink_metadata(path)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?.to_string_lossy().to_string();
        let digest = hex::encode(Sha256::digest(target.as_bytes()));
        return Ok(Some(FileEntry {
            size: target.len() as u64,
            sha256: digest,
            modified,
            symlink: Some(target),
            executable: false,
        }));
    }
    if !meta.is_file() {
        return Ok(None);
    }
    let (size, sha256) = hash_file(path)?;
    Ok(Some(FileEntry {
        size,
        sha256,
        modified,
        symlink: None,
        executable: is_executable(&meta),
    }))
}

/// Streaming SHA-256 of a file. Returns `(bytes read, hex digest)`.
pub fn hash_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Where the bytes for manifest key `relative` live under `root`.
pub fn entry_source(root: &Path, relative: &str) -> PathBuf {
    if root.is_dir() {
        root.join(relative)
    } else {
        root.to_path_buf()
    }
}

/// Copy the files of `source` that are missing from, or differ in,
/// `dest`. Nothing in `dest` is deleted. Returns the number of files
/// written.
pub fn copy_delta(source: &Path, source_manifest: &ContentManifest, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
    let existing = build_manifest_with(dest, ManifestOptions { include_vcs: true })?;
    let delta = existing.diff(source_manifest).contributed();

    for relative in &delta {
        let Some(entry) = source_manifest.files.get(relative) else {
            continue;
        };
        let from = entry_source(source, relative);
        let to = dest.join(relative);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        if fs::symlink_metadata(&to).is_ok() {
            fs::remove_file(&to)
                .with_context(|| format!("Failed to replace {}", to.display()))?;
        }
        match &entry.symlink {
            Some(target) => make_symlink(target, &to)?,
            None => {
                fs::copy(&from, &to).with_context(|| {
                    format!("Failed to copy {} -> {}", from.display(), to.display())
                })?;
            }
        }
    }
    Ok(delta.len())
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("Failed to create symlink {}", link.display()))
}

#[cfg(not(unix))]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    bail!(
        "cannot recreate symlink {} -> {} on this platform",
        link.display(),
        target
    )
}

/// Copy a complete tree including version-control metadata.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    if !source.exists() {
        bail!("Source does not exist: {}", source.display());
    }
    let manifest = build_manifest_with(source, ManifestOptions { include_vcs: true })?;
    copy_delta(source, &manifest, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn excludes_vcs_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::write(root.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("src/nested/z.txt"), "z").unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let manifest = build_manifest(root).unwrap();
        let keys: Vec<&str> = manifest.files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a.txt", "b.txt", "src/nested/z.txt"]);

        let full = build_manifest_with(root, ManifestOptions { include_vcs: true }).unwrap();
        assert!(full.files.contains_key(".git/HEAD"));
    }

    #[test]
    fn gitfile_is_not_content() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join(".git"), "gitdir: /elsewhere/.git/worktrees/x\n").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        let manifest = build_manifest(root).unwrap();
        assert_eq!(manifest.files.keys().collect::<Vec<_>>(), vec!["a.txt"]);
    }

    #[test]
    fn identical_content_gives_identical_manifest_json() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        // Creation order differs between the two trees.
        for name in ["one", "two", "three"] {
            fs::write(a.path().join(name), name).unwrap();
        }
        for name in ["three", "one", "two"] {
            fs::write(b.path().join(name), name).unwrap();
        }
        let ma = build_manifest(a.path()).unwrap();
        let mb = build_manifest(b.path()).unwrap();
        assert_eq!(ma.digest(), mb.digest());
        let keys_a: Vec<_> = ma.files.keys().collect();
        let keys_b: Vec<_> = mb.files.keys().collect();
        assert_eq!(keys_a, keys_b);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_recorded_not_followed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("loop")).unwrap();
        std::os::unix::fs::symlink("..", root.join("loop/up")).unwrap();
        fs::write(root.join("real.txt"), "data").unwrap();

        let manifest = build_manifest(root).unwrap();
        let link = &manifest.files["loop/up"];
        assert_eq!(link.symlink.as_deref(), Some(".."));
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn vanished_file_recorded_without_touching_others() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("ok.txt"), "fine").unwrap();
        let clean = build_manifest(root).unwrap();

        let mut manifest = clean.clone();
        record(&mut manifest, &root.join("gone.txt"), "gone.txt");
        assert_eq!(manifest.unreadable.len(), 1);
        assert_eq!(manifest.unreadable[0].path, "gone.txt");
        assert!(manifest.unreadable[0].reason.starts_with("cannot read gone.txt:"));
        assert_eq!(manifest.files, clean.files);
        assert_eq!(manifest.digest(), clean.digest());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_recorded_and_walk_continues() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("ok.txt"), "fine").unwrap();
        let locked = root.join("locked.txt");
        fs::write(&locked, "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::File::open(&locked).is_ok() {
            eprintln!("skipping: permission bits are not enforced for this user");
            return;
        }

        let manifest = build_manifest(root).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(manifest.unreadable.len(), 1);
        assert_eq!(manifest.unreadable[0].path, "locked.txt");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.files["ok.txt"].size, 4);
    }

    #[test]
    fn single_file_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(&file, "# notes").unwrap();
        let manifest = build_manifest(&file).unwrap();
        assert_eq!(manifest.len(), 1);
        assert!(manifest.files.contains_key("notes.md"));
        assert_eq!(entry_source(&file, "notes.md"), file);
    }

    #[test]
    fn copy_delta_only_writes_changes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("same.txt"), "same").unwrap();
        fs::write(src.path().join("changed.txt"), "new").unwrap();
        fs::write(dst.path().join("same.txt"), "same").unwrap();
        fs::write(dst.path().join("changed.txt"), "old").unwrap();
        fs::write(dst.path().join("extra.txt"), "kept").unwrap();

        let manifest = build_manifest(src.path()).unwrap();
        let written = copy_delta(src.path(), &manifest, dst.path()).unwrap();
        assert_eq!(written, 1);
        assert_eq!(fs::read_to_string(dst.path().join("changed.txt")).unwrap(), "new");
        assert!(dst.path().join("extra.txt").exists());
        assert_eq!(copy_delta(src.path(), &manifest, dst.path()).unwrap(), 0);
    }
}
