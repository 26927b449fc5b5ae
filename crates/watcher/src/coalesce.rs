//! Root set bookkeeping for coalescing streams
//!
//! A coalescing stream covers a fixed set of roots, so every change to the set
//! retires the running stream and starts a new one. [`StreamSet`] owns that
//! cycle:
//! - batches still held by a retired stream are decoded against the roots it
//!   was created for
//! - every new stream resumes from the last event id seen on any earlier one
//! - a stream that cannot be created for the new set falls back to the old set
//!
//! The native stream itself sits behind [`StreamFactory`].

use fsw_core::fsevent::{decode_batch, DecodedBatch, RawEvent, WatchRoots, EVENT_ID_SINCE_NOW};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Creates and retires native streams
pub trait StreamFactory {
    type Stream;

    /// Start a stream over `roots` delivering events after `since`
    fn create(&mut self, roots: &WatchRoots, since: u64) -> io::Result<Self::Stream>;

    /// Flush and release `stream`, returning the batches it still held
    fn retire(&mut self, stream: Self::Stream) -> Vec<Vec<RawEvent>>;
}

pub struct StreamSet<F: StreamFactory> {
    factory: F,
    roots: WatchRoots,
    stream: Option<F::Stream>,
    last_event_id: u64,
    backlog: VecDeque<DecodedBatch>,
}

impl<F: StreamFactory> StreamSet<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            roots: WatchRoots::new(),
            stream: None,
            last_event_id: EVENT_ID_SINCE_NOW,
            backlog: VecDeque::new(),
        }
    }

    pub fn roots(&self) -> &WatchRoots {
        &self.roots
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Decode delivered batches against the current root set and queue them
    pub fn decode(&mut self, batches: impl IntoIterator<Item = Vec<RawEvent>>) {
        for batch in batches {
            let decoded = decode_batch(&batch, &self.roots, |p| p.exists());
            if let Some(id) = decoded.last_event_id {
                self.last_event_id = id;
            }
            self.backlog.push_back(decoded);
        }
    }

    /// Next decoded batch in delivery order
    pub fn pop_batch(&mut self) -> Option<DecodedBatch> {
        self.backlog.pop_front()
    }

    /// Add a root and restart the stream over the new set.
    ///
    /// On failure the root is dropped again and the stream restarted over the
    /// previous set.
    pub fn add_root(&mut self, root: PathBuf, canonical: PathBuf) -> io::Result<()> {
        self.retire();
        self.roots.insert(root.clone(), canonical);
        if let Err(e) = self.start() {
            self.roots.remove(&root);
            if let Err(restore) = self.start() {
                error!("Couldn't restore stream for remaining roots: {}", restore);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a root and restart the stream over what is left
    pub fn remove_root(&mut self, root: &Path) -> bool {
        if !self.roots.contains(root) {
            return false;
        }
        self.retire();
        self.roots.remove(root);
        if let Err(e) = self.start() {
            error!("Couldn't recreate stream after removing '{}': {}", root.display(), e);
        }
        true
    }

    /// Stop the stream and forget every root and undelivered batch
    pub fn clear(&mut self) {
        self.retire();
        self.roots.clear();
        self.backlog.clear();
    }

    fn retire(&mut self) {
        if let Some(stream) = self.stream.take() {
            let flushed = self.factory.retire(stream);
            self.decode(flushed);
        }
    }

    fn start(&mut self) -> io::Result<()> {
        debug_assert!(self.stream.is_none());
        if self.roots.is_empty() {
            debug!("No roots left, stream stopped");
            return Ok(());
        }
        debug!(
            "Starting stream for {} root(s) since {}",
            self.roots.len(),
            self.last_event_id
        );
        self.stream = Some(self.factory.create(&self.roots, self.last_event_id)?);
        Ok(())
    }
}

impl<F: StreamFactory> Drop for StreamSet<F> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.factory.retire(stream);
        }
    }
}
