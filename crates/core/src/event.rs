//! Change events and the sink they are reported to

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Type of file system change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Entry was created (or renamed into place)
    Created,
    /// Entry was removed (or renamed away)
    Removed,
    /// Entry content or metadata changed
    Modified,
    /// Changes under this root may have been lost; cached state is stale
    Invalidate,
    /// The native layer reported something we do not classify
    Unknown,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "CREATED",
            ChangeKind::Removed => "REMOVED",
            ChangeKind::Modified => "MODIFIED",
            ChangeKind::Invalidate => "INVALIDATE",
            ChangeKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded change
///
/// Produced and consumed within one decode step; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of change
    pub kind: ChangeKind,
    /// Absolute path in caller form (no extended-length marker)
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Root-scoped invalidation
    pub fn invalidate(root: impl Into<PathBuf>) -> Self {
        Self::new(ChangeKind::Invalidate, root)
    }
}

/// Receiver of decoded changes
///
/// The engine moves its sink onto the dedicated watcher thread and calls
/// `report` only from there, between `open` returning and `close` returning.
/// Implementations must not block for long: the watcher thread re-arms the
/// native watch only after the sink returns.
pub trait EventSink: Send + 'static {
    fn report(&self, kind: ChangeKind, path: &Path);
}

impl<F> EventSink for F
where
    F: Fn(ChangeKind, &Path) + Send + 'static,
{
    fn report(&self, kind: ChangeKind, path: &Path) {
        self(kind, path)
    }
}

impl EventSink for crossbeam_channel::Sender<ChangeEvent> {
    fn report(&self, kind: ChangeKind, path: &Path) {
        // Receiver gone means nobody is listening anymore; dropping is fine
        if self.send(ChangeEvent::new(kind, path)).is_err() {
            tracing::trace!("Event receiver dropped, discarding {} {}", kind, path.display());
        }
    }
}

impl EventSink for Box<dyn EventSink> {
    fn report(&self, kind: ChangeKind, path: &Path) {
        (**self).report(kind, path)
    }
}
