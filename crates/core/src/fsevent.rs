//! Coalescing-stream event model
//!
//! The coalescing backend watches a whole set of roots with one native stream
//! and hands back batches of `(path, flags, id)` triples. This module holds the
//! platform-neutral half of that backend:
//!
//! - [`StreamFlags`]: the per-entry flag word
//! - [`classify`]: flag word to [`ChangeKind`]
//! - [`WatchRoots`]: longest-prefix dispatch of a reported path to its root
//! - [`decode_batch`]: one batch to ordered, root-tagged events, plus the last
//!   observed sequence id to resume from when the stream is recreated

#![allow(clippy::bad_bit_mask)]

use crate::event::{ChangeEvent, ChangeKind};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Sequence id meaning "only changes from now on"
pub const EVENT_ID_SINCE_NOW: u64 = u64::MAX;

bitflags::bitflags! {
    /// Flags attached to one stream entry
    pub struct StreamFlags: u32 {
        const NONE = 0x0000_0000;
        const MUST_SCAN_SUBDIRS = 0x0000_0001;
        const USER_DROPPED = 0x0000_0002;
        const KERNEL_DROPPED = 0x0000_0004;
        const IDS_WRAPPED = 0x0000_0008;
        const HISTORY_DONE = 0x0000_0010;
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        const INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        const ITEM_MODIFIED = 0x0000_1000;
        const FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const IS_FILE = 0x0001_0000;
        const IS_DIR = 0x0002_0000;
        const IS_SYMLINK = 0x0004_0000;
        const OWN_EVENT = 0x0008_0000;
        const IS_HARDLINK = 0x0010_0000;
        const IS_LAST_HARDLINK = 0x0020_0000;
        const ITEM_CLONED = 0x0040_0000;
    }
}

impl StreamFlags {
    /// Entries whose changes the OS could not report individually
    pub fn needs_rescan(&self) -> bool {
        self.intersects(
            StreamFlags::MUST_SCAN_SUBDIRS
                | StreamFlags::USER_DROPPED
                | StreamFlags::KERNEL_DROPPED
                | StreamFlags::ROOT_CHANGED
                | StreamFlags::MOUNT
                | StreamFlags::UNMOUNT,
        )
    }

    fn is_metadata_change(&self) -> bool {
        self.intersects(
            StreamFlags::ITEM_MODIFIED
                | StreamFlags::INODE_META_MOD
                | StreamFlags::FINDER_INFO_MOD
                | StreamFlags::ITEM_CHANGE_OWNER
                | StreamFlags::ITEM_XATTR_MOD,
        )
    }
}

/// Map one entry's flags to a change kind.
///
/// Returns `None` for entries that carry no change (end of history replay).
/// The stream coalesces, so a rename or a create+remove pair only tells us the
/// entry was touched; `exists` settles which side of it we are on.
pub fn classify(flags: StreamFlags, exists: impl FnOnce() -> bool) -> Option<ChangeKind> {
    if flags.contains(StreamFlags::HISTORY_DONE) {
        return None;
    }
    let kind = if flags.needs_rescan() {
        ChangeKind::Invalidate
    } else if flags.contains(StreamFlags::ITEM_RENAMED)
        || flags.contains(StreamFlags::ITEM_CREATED | StreamFlags::ITEM_REMOVED)
    {
        if exists() {
            ChangeKind::Created
        } else {
            ChangeKind::Removed
        }
    } else if flags.contains(StreamFlags::ITEM_REMOVED) {
        ChangeKind::Removed
    } else if flags.contains(StreamFlags::ITEM_CREATED) {
        ChangeKind::Created
    } else if flags.is_metadata_change() {
        ChangeKind::Modified
    } else {
        ChangeKind::Unknown
    };
    Some(kind)
}

/// One registered root of a coalescing stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    /// Path as the caller supplied it; reported paths are re-rooted onto this
    pub root: PathBuf,
    /// Resolved path the native layer reports under
    pub canonical: PathBuf,
}

/// Registered roots of one stream, unique by caller path
#[derive(Debug, Default, Clone)]
pub struct WatchRoots {
    roots: Vec<WatchRoot>,
}

impl WatchRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the root was already registered
    pub fn insert(&mut self, root: PathBuf, canonical: PathBuf) -> bool {
        if self.contains(&root) {
            return false;
        }
        self.roots.push(WatchRoot { root, canonical });
        true
    }

    pub fn remove(&mut self, root: &Path) -> bool {
        let before = self.roots.len();
        self.roots.retain(|r| r.root != root);
        self.roots.len() != before
    }

    pub fn contains(&self, root: &Path) -> bool {
        self.roots.iter().any(|r| r.root == root)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn clear(&mut self) {
        self.roots.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchRoot> {
        self.roots.iter()
    }

    /// Root whose canonical path is the longest component-wise prefix of `path`
    pub fn longest_match(&self, path: &Path) -> Option<&WatchRoot> {
        self.roots
            .iter()
            .filter(|r| path.starts_with(&r.canonical))
            .max_by_key(|r| r.canonical.components().count())
    }

    /// Translate a native path into caller form under its root
    pub fn resolve(&self, path: &Path) -> Option<(&WatchRoot, PathBuf)> {
        let root = self.longest_match(path)?;
        let relative = path.strip_prefix(&root.canonical).ok()?;
        let resolved = if relative.as_os_str().is_empty() {
            root.root.clone()
        } else {
            root.root.join(relative)
        };
        Some((root, resolved))
    }
}

/// One entry of a native batch, copied out of the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: String,
    pub flags: u32,
    pub id: u64,
}

impl RawEvent {
    pub fn new(path: impl Into<String>, flags: StreamFlags, id: u64) -> Self {
        Self {
            path: path.into(),
            flags: flags.bits(),
            id,
        }
    }
}

/// Decoded batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    /// `(caller root, event)` in batch order
    pub events: Vec<(PathBuf, ChangeEvent)>,
    /// Id of the last entry in the batch, if any
    pub last_event_id: Option<u64>,
}

/// Decode one batch against the registered roots.
///
/// Entries under no registered root are dropped. Entries that need a rescan
/// become one `Invalidate` of their root. The last id is taken from the last
/// entry rather than the maximum so a wrapped id counter is followed.
pub fn decode_batch(
    batch: &[RawEvent],
    roots: &WatchRoots,
    exists: impl Fn(&Path) -> bool,
) -> DecodedBatch {
    let mut decoded = DecodedBatch::default();

    for raw in batch {
        decoded.last_event_id = Some(raw.id);

        let flags = StreamFlags::from_bits_truncate(raw.flags);
        // Directory entries may come with a trailing separator
        let trimmed = raw.path.trim_end_matches('/');
        let native = Path::new(if trimmed.is_empty() { "/" } else { trimmed });

        let Some((root, path)) = roots.resolve(native) else {
            debug!("Dropping event for unwatched path '{}'", raw.path);
            continue;
        };

        let Some(kind) = classify(flags, || exists(native)) else {
            trace!("Skipping marker event {:?} for '{}'", flags, raw.path);
            continue;
        };

        let event = if kind == ChangeKind::Invalidate {
            ChangeEvent::invalidate(root.root.clone())
        } else {
            ChangeEvent::new(kind, path)
        };
        debug!("Change detected: {:?} '{}'", flags, event.path.display());
        decoded.events.push((root.root.clone(), event));
    }

    decoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(entries: &[(&str, &str)]) -> WatchRoots {
        let mut roots = WatchRoots::new();
        for (root, canonical) in entries {
            roots.insert(PathBuf::from(root), PathBuf::from(canonical));
        }
        roots
    }

    fn kinds(decoded: &DecodedBatch) -> Vec<ChangeKind> {
        decoded.events.iter().map(|(_, e)| e.kind).collect()
    }

    #[test]
    fn test_classify_priorities() {
        let never = || -> bool { panic!("existence check not expected") };
        assert_eq!(classify(StreamFlags::HISTORY_DONE, never), None);
        assert_eq!(
            classify(StreamFlags::MUST_SCAN_SUBDIRS | StreamFlags::ITEM_CREATED, never),
            Some(ChangeKind::Invalidate)
        );
        assert_eq!(
            classify(StreamFlags::ITEM_REMOVED | StreamFlags::IS_FILE, never),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            classify(StreamFlags::ITEM_CREATED | StreamFlags::ITEM_MODIFIED, never),
            Some(ChangeKind::Created)
        );
        assert_eq!(classify(StreamFlags::ITEM_XATTR_MOD, never), Some(ChangeKind::Modified));
        assert_eq!(classify(StreamFlags::IS_FILE, never), Some(ChangeKind::Unknown));
    }

    #[test]
    fn test_classify_rename_uses_existence() {
        assert_eq!(classify(StreamFlags::ITEM_RENAMED, || true), Some(ChangeKind::Created));
        assert_eq!(classify(StreamFlags::ITEM_RENAMED, || false), Some(ChangeKind::Removed));
        assert_eq!(
            classify(StreamFlags::ITEM_CREATED | StreamFlags::ITEM_REMOVED, || false),
            Some(ChangeKind::Removed)
        );
    }

    #[test]
    fn test_longest_prefix_dispatch() {
        let roots = roots(&[("/w", "/w"), ("/w/inner", "/w/inner")]);

        let (root, path) = roots.resolve(Path::new("/w/inner/a.txt")).unwrap();
        assert_eq!(root.root, Path::new("/w/inner"));
        assert_eq!(path, Path::new("/w/inner/a.txt"));

        let (root, _) = roots.resolve(Path::new("/w/innerfile")).unwrap();
        assert_eq!(root.root, Path::new("/w"));

        assert!(roots.resolve(Path::new("/elsewhere/a")).is_none());
    }

    #[test]
    fn test_resolve_rewrites_canonical_prefix() {
        let roots = roots(&[("/var/tmp/w", "/private/var/tmp/w")]);
        let (_, path) = roots.resolve(Path::new("/private/var/tmp/w/sub/a")).unwrap();
        assert_eq!(path, Path::new("/var/tmp/w/sub/a"));

        let (_, path) = roots.resolve(Path::new("/private/var/tmp/w")).unwrap();
        assert_eq!(path, Path::new("/var/tmp/w"));
    }

    #[test]
    fn test_decode_batch_in_order_with_last_id() {
        let roots = roots(&[("/w", "/w")]);
        let batch = vec![
            RawEvent::new("/w/a.txt", StreamFlags::ITEM_REMOVED | StreamFlags::IS_FILE, 10),
            RawEvent::new("/w/a.txt", StreamFlags::ITEM_CREATED | StreamFlags::IS_FILE, 11),
            RawEvent::new("/w/dir/", StreamFlags::ITEM_MODIFIED | StreamFlags::IS_DIR, 12),
            RawEvent::new("/other/x", StreamFlags::ITEM_CREATED, 13),
        ];

        let decoded = decode_batch(&batch, &roots, |_| true);
        assert_eq!(
            kinds(&decoded),
            vec![ChangeKind::Removed, ChangeKind::Created, ChangeKind::Modified]
        );
        assert_eq!(decoded.events[2].1.path, Path::new("/w/dir"));
        assert_eq!(decoded.last_event_id, Some(13));
    }

    #[test]
    fn test_dropped_events_invalidate_root() {
        let roots = roots(&[("/w", "/w")]);
        let batch = vec![RawEvent::new("/w/deep/sub", StreamFlags::KERNEL_DROPPED, 5)];

        let decoded = decode_batch(&batch, &roots, |_| true);
        assert_eq!(
            decoded.events,
            vec![(PathBuf::from("/w"), ChangeEvent::invalidate("/w"))]
        );
    }

    #[test]
    fn test_history_done_only_advances_id() {
        let roots = roots(&[("/w", "/w")]);
        let batch = vec![RawEvent::new("/w", StreamFlags::HISTORY_DONE, 99)];

        let decoded = decode_batch(&batch, &roots, |_| true);
        assert!(decoded.events.is_empty());
        assert_eq!(decoded.last_event_id, Some(99));
    }

    #[test]
    fn test_decode_batch_is_pure() {
        let roots = roots(&[("/w", "/w")]);
        let batch = vec![
            RawEvent::new("/w/a", StreamFlags::ITEM_RENAMED, 1),
            RawEvent::new("/w/b", StreamFlags::ITEM_RENAMED, 2),
        ];
        let exists = |p: &Path| p.ends_with("b");
        assert_eq!(decode_batch(&batch, &roots, exists), decode_batch(&batch, &roots, exists));
        assert_eq!(
            kinds(&decode_batch(&batch, &roots, exists)),
            vec![ChangeKind::Removed, ChangeKind::Created]
        );
    }

    #[test]
    fn test_roots_are_unique() {
        let mut roots = WatchRoots::new();
        assert!(roots.insert("/w".into(), "/w".into()));
        assert!(!roots.insert("/w".into(), "/w".into()));
        assert_eq!(roots.len(), 1);
        assert!(roots.remove(Path::new("/w")));
        assert!(!roots.remove(Path::new("/w")));
        assert!(roots.is_empty());
    }
}
