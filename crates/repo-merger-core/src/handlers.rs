//! Scenario handlers for edge cases the engine meets while analysing
//! fragments.
//!
//! The registry is an explicit value passed to the engine, not global
//! state. Each [`ScenarioKind`] maps to a [`ScenarioHandler`]; kinds with
//! no real behaviour are registered as [`StubHandler`]s, which fail with
//! [`EngineError::UnimplementedScenario`] so the caller can record the
//! gap against the fragment and move on.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScenarioKind {
    /// A fragment path given on the command line does not exist.
    MissingFragment,
    /// A fragment has a `.git` entry that git cannot open.
    GitMetadataMissing,
    /// A git command against the fragment failed.
    GitInspectionFailed,
    /// The fragment working copy has uncommitted changes.
    DirtyWorkingCopy,
    /// The fragment's origin does not map to the workspace identifier.
    IdentityMismatch,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 5] = [
        ScenarioKind::MissingFragment,
        ScenarioKind::GitMetadataMissing,
        ScenarioKind::GitInspectionFailed,
        ScenarioKind::DirtyWorkingCopy,
        ScenarioKind::IdentityMismatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::MissingFragment => "missing-fragment",
            ScenarioKind::GitMetadataMissing => "git-metadata-missing",
            ScenarioKind::GitInspectionFailed => "git-inspection-failed",
            ScenarioKind::DirtyWorkingCopy => "dirty-working-copy",
            ScenarioKind::IdentityMismatch => "identity-mismatch",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine observed when a scenario fired.
#[derive(Debug, Clone, Default)]
pub struct ScenarioContext {
    pub fragment_id: String,
    pub details: BTreeMap<String, String>,
}

impl ScenarioContext {
    pub fn new(fragment_id: &str) -> Self {
        Self {
            fragment_id: fragment_id.to_string(),
            details: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// How the engine should continue after a handled scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Carry on as if nothing happened.
    Proceed,
    /// Treat the fragment as a plain directory with no history.
    TreatAsNonGit,
    /// Carry on, attaching a note to the fragment's detail.
    Note(String),
}

pub trait ScenarioHandler: Send + Sync {
    fn kind(&self) -> ScenarioKind;

    /// One-line description for `repo-merger handlers`.
    fn description(&self) -> &str;

    fn is_implemented(&self) -> bool {
        true
    }

    fn handle(&self, ctx: &ScenarioContext) -> EngineResult<Resolution>;
}

/// Placeholder for a scenario without real behaviour yet.
pub struct StubHandler {
    kind: ScenarioKind,
    description: String,
}

impl StubHandler {
    pub fn new(kind: ScenarioKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

impl ScenarioHandler for StubHandler {
    fn kind(&self) -> ScenarioKind {
        self.kind
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn is_implemented(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &ScenarioContext) -> EngineResult<Resolution> {
        Err(EngineError::UnimplementedScenario {
            kind: self.kind.to_string(),
            fragment_id: ctx.fragment_id.clone(),
        })
    }
}

/// A `.git` entry git cannot read is treated as absent.
struct BrokenGitMetadata;

impl ScenarioHandler for BrokenGitMetadata {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::GitMetadataMissing
    }

    fn description(&self) -> &str {
        "unreadable .git metadata; fragment is analysed as non-git"
    }

    fn handle(&self, _ctx: &ScenarioContext) -> EngineResult<Resolution> {
        Ok(Resolution::TreatAsNonGit)
    }
}

struct DirtyWorkingCopy;

impl ScenarioHandler for DirtyWorkingCopy {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::DirtyWorkingCopy
    }

    fn description(&self) -> &str {
        "uncommitted changes are noted; only committed history is merged"
    }

    fn handle(&self, _ctx: &ScenarioContext) -> EngineResult<Resolution> {
        Ok(Resolution::Note(
            "working copy has uncommitted changes that will not be merged".to_string(),
        ))
    }
}

struct IdentityMismatch;

impl ScenarioHandler for IdentityMismatch {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::IdentityMismatch
    }

    fn description(&self) -> &str {
        "origin differs from the workspace identity; flagged for review"
    }

    fn handle(&self, ctx: &ScenarioContext) -> EngineResult<Resolution> {
        let origin = ctx
            .details
            .get("origin")
            .map(String::as_str)
            .unwrap_or("unknown origin");
        Ok(Resolution::Note(format!(
            "origin {} does not match the workspace identity",
            origin
        )))
    }
}

/// Registry of scenario handlers, keyed by kind.
pub struct HandlerRegistry {
    handlers: BTreeMap<ScenarioKind, Box<dyn ScenarioHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with every known kind: implemented handlers where they
    /// exist, stubs for the rest.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(StubHandler::new(
            ScenarioKind::MissingFragment,
            "fragment path does not exist; no recovery strategy yet",
        )));
        registry.register(Box::new(BrokenGitMetadata));
        registry.register(Box::new(StubHandler::new(
            ScenarioKind::GitInspectionFailed,
            "git inspection failed; no retry strategy yet",
        )));
        registry.register(Box::new(DirtyWorkingCopy));
        registry.register(Box::new(IdentityMismatch));
        registry
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: Box<dyn ScenarioHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn find(&self, kind: ScenarioKind) -> Option<&dyn ScenarioHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }

    /// Run the handler for `kind`. An unregistered kind behaves like a stub.
    pub fn dispatch(&self, kind: ScenarioKind, ctx: &ScenarioContext) -> EngineResult<Resolution> {
        match self.find(kind) {
            Some(handler) => handler.handle(ctx),
            None => Err(EngineError::UnimplementedScenario {
                kind: kind.to_string(),
                fragment_id: ctx.fragment_id.clone(),
            }),
        }
    }

    /// Handlers in kind order.
    pub fn handlers(&self) -> impl Iterator<Item = &dyn ScenarioHandler> {
        self.handlers.values().map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_kind() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(registry.len(), ScenarioKind::ALL.len());
        for kind in ScenarioKind::ALL {
            assert!(registry.find(kind).is_some(), "missing {kind}");
        }
    }

    #[test]
    fn stub_fails_with_typed_error() {
        let registry = HandlerRegistry::with_defaults();
        let ctx = ScenarioContext::new("frag-1");
        let err = registry
            .dispatch(ScenarioKind::MissingFragment, &ctx)
            .unwrap_err();
        match err {
            EngineError::UnimplementedScenario { kind, fragment_id } => {
                assert_eq!(kind, "missing-fragment");
                assert_eq!(fragment_id, "frag-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_registry_treats_everything_as_unimplemented() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        let err = registry
            .dispatch(ScenarioKind::DirtyWorkingCopy, &ScenarioContext::new("f"))
            .unwrap_err();
        assert!(err.is_per_fragment());
    }

    #[test]
    fn implemented_handlers_resolve() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(
            registry
                .dispatch(ScenarioKind::GitMetadataMissing, &ScenarioContext::new("f"))
                .unwrap(),
            Resolution::TreatAsNonGit
        );
        let ctx = ScenarioContext::new("f").with("origin", "git@x:other/repo.git");
        match registry.dispatch(ScenarioKind::IdentityMismatch, &ctx).unwrap() {
            Resolution::Note(note) => assert!(note.contains("other/repo")),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn register_replaces_existing_kind() {
        let mut registry = HandlerRegistry::with_defaults();
        registry.register(Box::new(StubHandler::new(
            ScenarioKind::DirtyWorkingCopy,
            "disabled",
        )));
        assert_eq!(registry.len(), ScenarioKind::ALL.len());
        let handler = registry.find(ScenarioKind::DirtyWorkingCopy).unwrap();
        assert!(!handler.is_implemented());
    }
}
