//! Watch point lifecycle
//!
//! ```text
//! Uninitialized --start ok--> Listening <--rearm ok-- NotListening
//!       |                         |                      |  |
//!   start failed             completion ---------------->+  |
//!       v                                                   v
//! FailedToListen                     Finished <-- cancelled / rearm failed
//! ```
//!
//! `FailedToListen` and `Finished` are terminal. The native watch is held in an
//! `Option` that is taken on entry into a terminal state, so its resources are
//! released exactly once and no later call can reach them.

use fsw_core::{ChangeEvent, ChangeKind, EventSink};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Lifecycle status of one watch point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchStatus {
    Uninitialized,
    Listening,
    NotListening,
    FailedToListen,
    Finished,
}

impl WatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WatchStatus::FailedToListen | WatchStatus::Finished)
    }

    /// Whether the native handle is held in this status
    pub fn holds_native(self) -> bool {
        matches!(self, WatchStatus::Listening | WatchStatus::NotListening)
    }

    fn can_become(self, next: WatchStatus) -> bool {
        use WatchStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Listening)
                | (Uninitialized, FailedToListen)
                | (Listening, NotListening)
                | (Listening, Finished)
                | (NotListening, Listening)
                | (NotListening, Finished)
        )
    }
}

impl fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchStatus::Uninitialized => "UNINITIALIZED",
            WatchStatus::Listening => "LISTENING",
            WatchStatus::NotListening => "NOT_LISTENING",
            WatchStatus::FailedToListen => "FAILED_TO_LISTEN",
            WatchStatus::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// Native half of a watch point
///
/// Implementations own the OS handle and buffer; dropping the value releases
/// them. They are only ever touched from the watcher thread.
pub trait NativeWatch {
    /// Issue (or re-issue) the asynchronous native read
    fn listen(&mut self) -> io::Result<()>;

    /// Request cancellation of the outstanding read
    ///
    /// Returns true when cancellation completed synchronously; otherwise the
    /// backend delivers a [`Completion::Cancelled`] later.
    fn cancel(&mut self) -> io::Result<bool>;
}

/// Outcome of one native completion, already decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Changes reported by the OS
    Events(Vec<ChangeEvent>),
    /// The OS dropped changes before reporting them
    Overflow,
    /// The outstanding read was cancelled
    Cancelled,
}

/// One native watch registration for one root
pub struct WatchPoint<N: NativeWatch> {
    root: PathBuf,
    status: WatchStatus,
    native: Option<N>,
}

impl<N: NativeWatch> fmt::Debug for WatchPoint<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchPoint")
            .field("root", &self.root)
            .field("status", &self.status)
            .finish()
    }
}

impl<N: NativeWatch> WatchPoint<N> {
    pub fn new(root: PathBuf, native: N) -> Self {
        Self {
            root,
            status: WatchStatus::Uninitialized,
            native: Some(native),
        }
    }

    /// Root in caller form
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> WatchStatus {
        self.status
    }

    pub fn native_mut(&mut self) -> Option<&mut N> {
        self.native.as_mut()
    }

    fn transition(&mut self, next: WatchStatus) {
        debug_assert!(
            self.status.can_become(next),
            "invalid watch point transition {} -> {} for '{}'",
            self.status,
            next,
            self.root.display()
        );
        self.status = next;
        if next.is_terminal() {
            // Releases the native handle and buffer
            self.native = None;
        }
    }

    /// Arm the native watch for the first time
    pub fn start(&mut self) -> WatchStatus {
        if self.status != WatchStatus::Uninitialized {
            return self.status;
        }
        let result = match self.native.as_mut() {
            Some(native) => native.listen(),
            None => Err(io::Error::new(io::ErrorKind::Other, "native watch missing")),
        };
        match result {
            Ok(()) => {
                info!("Started watching '{}'", self.root.display());
                self.transition(WatchStatus::Listening)
            }
            Err(e) => {
                warn!("Couldn't start watching '{}': {}", self.root.display(), e);
                self.transition(WatchStatus::FailedToListen);
            }
        }
        self.status
    }

    /// Process one completion: report its events, then re-arm.
    ///
    /// Decoding always finishes before the next native read is issued, so a
    /// buffer is never overwritten while it is still being read.
    pub fn handle_completion(
        &mut self,
        completion: Completion,
        sink: &dyn EventSink,
    ) -> WatchStatus {
        if self.status != WatchStatus::Listening {
            debug!(
                "Ignoring completion for '{}' in status {}",
                self.root.display(),
                self.status
            );
            return self.status;
        }
        self.transition(WatchStatus::NotListening);

        match completion {
            Completion::Cancelled => {
                info!("Finished watching '{}'", self.root.display());
                self.transition(WatchStatus::Finished);
                return self.status;
            }
            Completion::Overflow => {
                sink.report(ChangeKind::Invalidate, &self.root);
            }
            Completion::Events(events) => {
                for event in events {
                    sink.report(event.kind, &event.path);
                }
            }
        }

        self.rearm()
    }

    fn rearm(&mut self) -> WatchStatus {
        let result = match self.native.as_mut() {
            Some(native) => native.listen(),
            None => Err(io::Error::new(io::ErrorKind::Other, "native watch missing")),
        };
        match result {
            Ok(()) => self.transition(WatchStatus::Listening),
            Err(e) => {
                warn!("Couldn't re-arm watch for '{}': {}", self.root.display(), e);
                self.transition(WatchStatus::Finished);
            }
        }
        self.status
    }

    /// Request cancellation; failures are logged and never fatal.
    ///
    /// Returns the status after the request: `Finished` when the backend
    /// cancelled synchronously, unchanged when the cancellation completes
    /// asynchronously.
    pub fn cancel(&mut self) -> WatchStatus {
        if !self.status.holds_native() {
            return self.status;
        }
        let result = match self.native.as_mut() {
            Some(native) => native.cancel(),
            None => Ok(true),
        };
        match result {
            Ok(true) => {
                info!("Finished watching '{}'", self.root.display());
                self.finish();
            }
            Ok(false) => {}
            Err(e) => {
                // The handle is being discarded either way
                error!("Couldn't cancel watch for '{}': {}", self.root.display(), e);
            }
        }
        self.status
    }

    /// Move to `Finished` from any non-terminal status
    pub fn finish(&mut self) {
        match self.status {
            WatchStatus::Listening | WatchStatus::NotListening => {
                self.transition(WatchStatus::Finished)
            }
            WatchStatus::Uninitialized => {
                self.status = WatchStatus::FailedToListen;
                self.native = None;
            }
            WatchStatus::FailedToListen | WatchStatus::Finished => {}
        }
    }
}
