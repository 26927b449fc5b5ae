//! Watch point registry
//!
//! Native completions carry a [`WatchId`] instead of a pointer to the watch
//! point. A completion whose id is no longer registered is simply dropped.

use crate::watch_point::{Completion, NativeWatch, WatchPoint, WatchStatus};
use ahash::AHashMap;
use fsw_core::EventSink;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Registry key for one watch point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    /// Rebuild an id smuggled through a native context word
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Live watch points, keyed by id and indexed by caller root
pub struct WatchRegistry<N: NativeWatch> {
    points: AHashMap<WatchId, WatchPoint<N>>,
    by_root: AHashMap<PathBuf, WatchId>,
    next_id: u64,
}

impl<N: NativeWatch> Default for WatchRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NativeWatch> WatchRegistry<N> {
    pub fn new() -> Self {
        Self {
            points: AHashMap::new(),
            by_root: AHashMap::new(),
            // Zero stays free so a cleared context word never matches
            next_id: 1,
        }
    }

    /// Reserve the id the next inserted watch point will get
    pub fn next_id(&self) -> WatchId {
        WatchId(self.next_id)
    }

    /// Insert a watch point under the id returned by [`Self::next_id`]
    pub fn insert(&mut self, point: WatchPoint<N>) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.by_root.insert(point.root().to_path_buf(), id);
        self.points.insert(id, point);
        id
    }

    pub fn get(&self, id: WatchId) -> Option<&WatchPoint<N>> {
        self.points.get(&id)
    }

    pub fn get_mut(&mut self, id: WatchId) -> Option<&mut WatchPoint<N>> {
        self.points.get_mut(&id)
    }

    pub fn id_for_root(&self, root: &Path) -> Option<WatchId> {
        self.by_root.get(root).copied()
    }

    /// Remove a watch point, dropping any native state it still holds
    pub fn remove(&mut self, id: WatchId) -> Option<WatchPoint<N>> {
        let point = self.points.remove(&id)?;
        if self.by_root.get(point.root()) == Some(&id) {
            self.by_root.remove(point.root());
        }
        Some(point)
    }

    /// Remove the watch point if it reached a terminal status
    pub fn reap(&mut self, id: WatchId) -> bool {
        let terminal = self
            .points
            .get(&id)
            .map(|p| p.status().is_terminal())
            .unwrap_or(false);
        if terminal {
            self.remove(id);
        }
        terminal
    }

    /// Create, arm and register a watch point for `root`.
    ///
    /// A root already registered reports its current status. A point that
    /// fails to arm is never registered.
    pub fn start(&mut self, root: &Path, native: impl FnOnce(WatchId) -> N) -> WatchStatus {
        if let Some(point) = self.id_for_root(root).and_then(|id| self.points.get(&id)) {
            debug!("Already watching '{}'", root.display());
            return point.status();
        }
        let id = self.next_id();
        let mut point = WatchPoint::new(root.to_path_buf(), native(id));
        let status = point.start();
        if status == WatchStatus::Listening {
            self.insert(point);
        }
        status
    }

    /// Request cancellation of the point watching `root`
    pub fn cancel(&mut self, root: &Path) -> bool {
        let Some(id) = self.id_for_root(root) else {
            return false;
        };
        // A point whose cancellation completes later stays registered (and
        // keeps its buffer) until that completion arrives, but no longer
        // answers to its root
        self.by_root.remove(root);
        if let Some(point) = self.points.get_mut(&id) {
            point.cancel();
        }
        self.reap(id);
        true
    }

    pub fn cancel_all(&mut self) {
        for id in self.ids() {
            if let Some(point) = self.points.get_mut(&id) {
                point.cancel();
            }
            self.reap(id);
        }
        self.by_root.clear();
    }

    /// Route a native completion to its point.
    ///
    /// Returns `None` when the id is stale and the completion was dropped.
    pub fn complete(
        &mut self,
        id: WatchId,
        completion: Completion,
        sink: &dyn EventSink,
    ) -> Option<WatchStatus> {
        let Some(point) = self.points.get_mut(&id) else {
            trace!("Dropping completion for unknown watch {:?}", id);
            return None;
        };
        let status = point.handle_completion(completion, sink);
        self.reap(id);
        Some(status)
    }

    pub fn ids(&self) -> Vec<WatchId> {
        let mut ids: Vec<WatchId> = self.points.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
