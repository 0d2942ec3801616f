//! Stable identifiers for workspaces, fragments, and published mirrors.
//!
//! All functions here are deterministic: the same inputs always yield the
//! same identifier, which is what lets a rerun find the directories and
//! report sections written by an earlier run.

use sha2::{Digest, Sha256};

const FALLBACK_IDENTIFIER: &str = "workspace";
const FRAGMENT_DIGEST_LEN: usize = 12;
const PUBLISH_DIGEST_LEN: usize = 8;

/// Squeeze arbitrary text into a directory-safe identifier.
///
/// Runs of characters outside `[A-Za-z0-9._-]` become a single `-`;
/// leading and trailing `-` are trimmed. Empty results fall back to
/// `"workspace"`.
///
/// ```rust
/// use repo_merger_core::identity::sanitize_identifier;
///
/// assert_eq!(sanitize_identifier("  my repo (old) "), "my-repo-old");
/// assert_eq!(sanitize_identifier("///"), "workspace");
/// ```
pub fn sanitize_identifier(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_IDENTIFIER.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Derive an `owner-repo` slug from a remote URL.
///
/// Handles scp-style (`git@host:owner/repo.git`), URL-style
/// (`https://host/owner/repo`), and plain paths. Returns `None` when the
/// URL has no usable segments.
pub fn slug_from_remote(url: &str) -> Option<String> {
    let mut cleaned = url.trim().to_string();
    if let Some(stripped) = cleaned.strip_suffix(".git") {
        cleaned = stripped.to_string();
    }
    let cleaned = cleaned.replace(':', "/");
    let parts: Vec<&str> = cleaned.split('/').filter(|s| !s.is_empty()).collect();
    let repo = parts.last()?;
    let owner = if parts.len() >= 2 {
        let raw = parts[parts.len() - 2];
        Some(raw.rsplit('@').next().unwrap_or(raw))
    } else {
        None
    };
    Some(match owner {
        Some(owner) => format!("{}-{}", owner, repo),
        None => repo.to_string(),
    })
}

/// Workspace identifier for a golden repository.
///
/// Precedence: explicit override, then the origin remote, then the
/// directory name.
pub fn derive_identifier(
    explicit: Option<&str>,
    origin_url: Option<&str>,
    dir_name: &str,
) -> String {
    if let Some(explicit) = explicit.filter(|s| !s.trim().is_empty()) {
        return sanitize_identifier(explicit);
    }
    if let Some(slug) = origin_url.and_then(slug_from_remote) {
        return sanitize_identifier(&slug);
    }
    sanitize_identifier(dir_name)
}

/// Identity a remote URL maps to, for comparison against a workspace
/// identifier.
pub fn remote_identity(url: &str) -> Option<String> {
    slug_from_remote(url).map(|slug| sanitize_identifier(&slug))
}

/// Fragment identifier from its canonical source path and content digest.
///
/// The same physical fragment with the same content always maps to the
/// same identifier; a content change yields a new one.
pub fn fragment_id(source_path: &str, content_digest: &str) -> String {
    let name = source_path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "fragment" } else { slug };

    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_digest.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", slug, &digest[..FRAGMENT_DIGEST_LEN])
}

/// Name a published mirror of the golden repository should use.
///
/// With an origin remote this is the lowercase `owner-repo` slug; without
/// one it is the directory name plus a short digest of the canonical path,
/// so two unrelated `project/` directories never collide.
pub fn publish_name(origin_url: Option<&str>, dir_name: &str, canonical_path: &str) -> String {
    if let Some(slug) = origin_url.and_then(slug_from_remote) {
        return squeeze(&sanitize_identifier(&slug).to_ascii_lowercase());
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_path.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let base = squeeze(&sanitize_identifier(dir_name).to_ascii_lowercase());
    format!("{}-{}", base, &digest[..PUBLISH_DIGEST_LEN])
}

fn squeeze(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        let ch = if ch == '_' || ch == '.' { '-' } else { ch };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_ssh_and_https() {
        assert_eq!(
            slug_from_remote("git@github.com:rickhohler/repo-merger.git").as_deref(),
            Some("rickhohler-repo-merger")
        );
        assert_eq!(
            slug_from_remote("https://github.com/acme/widgets").as_deref(),
            Some("acme-widgets")
        );
        assert_eq!(slug_from_remote("widgets.git").as_deref(), Some("widgets"));
        assert_eq!(slug_from_remote("   "), None);
    }

    #[test]
    fn identifier_precedence() {
        let origin = Some("git@example.com:demo/repo.git");
        assert_eq!(derive_identifier(Some("Override Me"), origin, "dir"), "Override-Me");
        assert_eq!(derive_identifier(None, origin, "dir"), "demo-repo");
        assert_eq!(derive_identifier(None, None, "repo-golden"), "repo-golden");
        assert_eq!(derive_identifier(Some("  "), None, "dir"), "dir");
    }

    #[test]
    fn fragment_id_is_stable_and_content_addressed() {
        let a = fragment_id("/src/fragment-alpha", "abc");
        let b = fragment_id("/src/fragment-alpha", "abc");
        let c = fragment_id("/src/fragment-alpha", "abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("fragment-alpha-"));
        assert_eq!(a.len(), "fragment-alpha-".len() + 12);
    }

    #[test]
    fn fragment_id_sanitizes_names() {
        let id = fragment_id("/drops/old copy (2)/", "d");
        assert!(id.starts_with("old-copy--2-"));
        assert!(fragment_id("/", "d").starts_with("fragment-"));
    }

    #[test]
    fn publish_name_with_and_without_origin() {
        assert_eq!(
            publish_name(Some("git@github.com:Acme/Big_Widgets.git"), "x", "/x"),
            "acme-big-widgets"
        );
        let a = publish_name(None, "project", "/home/a/project");
        let b = publish_name(None, "project", "/home/b/project");
        assert!(a.starts_with("project-"));
        assert_ne!(a, b);
    }
}
