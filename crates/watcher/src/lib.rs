//! Native file system watch engine
//!
//! This crate watches a set of directory roots recursively and reports every
//! change to an [`EventSink`]:
//! - One dedicated thread owns every native handle and runs the platform loop
//! - Callers on any thread register and unregister roots through a mailbox
//! - Lost changes surface as one `Invalidate` for the affected root
//! - Closing releases every native resource before it returns
//!
//! ```no_run
//! use fsw_watcher::{Engine, WatchOptions};
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let (engine, statuses) = Engine::open(["/tmp/project"], WatchOptions::default(), tx)?;
//! println!("{:?}", statuses);
//! for event in rx.iter().take(10) {
//!     println!("{} {}", event.kind, event.path.display());
//! }
//! engine.close()?;
//! # Ok::<(), fsw_watcher::WatchError>(())
//! ```

pub mod coalesce;
pub mod error;
pub mod registry;
pub mod server;
pub mod watch_point;

mod platform;

pub use error::{Result, WatchError};
pub use fsw_core::{ChangeEvent, ChangeKind, EventSink};
pub use watch_point::WatchStatus;

use serde::{Deserialize, Serialize};
use server::Server;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Engine options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// How long the coalescing backend may hold changes before delivering
    /// them; `None` delivers as soon as possible. Other backends ignore it.
    #[serde(rename = "latency_ms", with = "millis", skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
}

/// `Option<Duration>` as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(latency) => s.serialize_u64(latency.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Handle to a running watch engine
pub struct Engine {
    server: Server,
}

impl Engine {
    /// Start the engine and try to watch every root.
    ///
    /// Returns one status per root, in order: `Listening` or
    /// `FailedToListen`. A root that fails does not affect the others.
    pub fn open<I, P, S>(
        roots: I,
        options: WatchOptions,
        sink: S,
    ) -> Result<(Self, Vec<WatchStatus>)>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        S: EventSink,
    {
        let latency = options.latency;
        let server = Server::start(move || platform::NativeRunLoop::new(latency), sink)?;
        let engine = Self { server };

        let mut statuses = Vec::new();
        for root in roots {
            match engine.start_watching(root) {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    if let Err(close_err) = engine.close() {
                        tracing::warn!("Failed to close engine after open error: {}", close_err);
                    }
                    return Err(e);
                }
            }
        }

        let listening = statuses
            .iter()
            .filter(|s| **s == WatchStatus::Listening)
            .count();
        info!("Watching {} of {} root(s)", listening, statuses.len());
        Ok((engine, statuses))
    }

    /// Watch another root. Watching a root twice reports its current status.
    pub fn start_watching(&self, root: impl AsRef<Path>) -> Result<WatchStatus> {
        self.server.start_watching(root.as_ref())
    }

    /// Stop watching a root; returns whether it was being watched.
    ///
    /// The root's watch point finishes once the native cancellation
    /// completes, which may be after this returns.
    pub fn stop_watching(&self, root: impl AsRef<Path>) -> Result<bool> {
        self.server.stop_watching(root.as_ref())
    }

    /// Stop everything and wait for the watcher thread to exit.
    ///
    /// When this returns every native resource has been released and the sink
    /// has been dropped.
    pub fn close(self) -> Result<()> {
        self.server.close()
    }
}
