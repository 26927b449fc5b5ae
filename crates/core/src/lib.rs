//! Platform-neutral primitives for the fsw watch engine
//!
//! This crate provides:
//! - Change events and the `EventSink` reporting interface
//! - Extended-length path encoding (`codec`)
//! - Bounds-checked decoding of directory-change completion buffers (`record`)
//! - Coalescing-stream flag classification and root dispatch (`fsevent`)
//!
//! Nothing in here touches the OS, so every decoder is a pure function of its
//! input bytes and can be replayed in tests.

pub mod codec;
pub mod event;
pub mod fsevent;
pub mod record;

// Re-exports
pub use event::{ChangeEvent, ChangeKind, EventSink};
