//! Engine infrastructure errors
//!
//! Failures that only affect one root never show up here; they are reported as
//! `WatchStatus::FailedToListen` for that root.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The dedicated watcher thread could not be created
    #[error("failed to spawn watcher thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The native run loop could not be set up on the watcher thread
    #[error("failed to initialize native run loop: {0}")]
    RunLoop(#[source] io::Error),

    /// The watcher thread went away before reporting ready
    #[error("watcher thread exited during startup")]
    ThreadStartup,

    /// A request could not be delivered to the watcher thread
    #[error("failed to dispatch request to watcher thread: {0}")]
    Dispatch(#[source] io::Error),

    /// The engine is shutting down (or its thread already exited)
    #[error("watch engine is terminating")]
    Terminating,

    /// The watcher thread panicked
    #[error("watcher thread panicked")]
    ThreadPanicked,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, WatchError>;
