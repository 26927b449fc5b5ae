//! Directory-change completion buffer decoding
//!
//! A completion fills the watch buffer with variable-length records chained by
//! an offset-to-next field, the last record carrying offset 0:
//!
//! ```text
//! +0  u32  next_entry_offset   (bytes from this record to the next, 0 = last)
//! +4  u32  action
//! +8  u32  file_name_length    (bytes, UTF-16LE)
//! +12 u16  file_name[file_name_length / 2]
//! ```
//!
//! [`NotifyRecords`] walks that chain with a bounds-checked cursor over a byte
//! slice. Every step validates that the next record lies inside the buffer
//! before advancing, so a corrupt chain ends the walk with an error instead of
//! reading outside the buffer.

use crate::codec;
use crate::event::{ChangeEvent, ChangeKind};
use bytes::Buf;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Size of the fixed record header
pub const RECORD_HEADER_LEN: usize = 12;

pub const FILE_ACTION_ADDED: u32 = 0x1;
pub const FILE_ACTION_REMOVED: u32 = 0x2;
pub const FILE_ACTION_MODIFIED: u32 = 0x3;
pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 0x4;
pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 0x5;

/// Native action code of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    Added,
    Removed,
    Modified,
    RenamedOldName,
    RenamedNewName,
    Other(u32),
}

impl From<u32> for NotifyAction {
    fn from(code: u32) -> Self {
        match code {
            FILE_ACTION_ADDED => NotifyAction::Added,
            FILE_ACTION_REMOVED => NotifyAction::Removed,
            FILE_ACTION_MODIFIED => NotifyAction::Modified,
            FILE_ACTION_RENAMED_OLD_NAME => NotifyAction::RenamedOldName,
            FILE_ACTION_RENAMED_NEW_NAME => NotifyAction::RenamedNewName,
            other => NotifyAction::Other(other),
        }
    }
}

impl NotifyAction {
    /// Renames arrive as an old-name/new-name pair and are reported as an
    /// independent remove and create.
    pub fn change_kind(self) -> ChangeKind {
        match self {
            NotifyAction::Added | NotifyAction::RenamedNewName => ChangeKind::Created,
            NotifyAction::Removed | NotifyAction::RenamedOldName => ChangeKind::Removed,
            NotifyAction::Modified => ChangeKind::Modified,
            NotifyAction::Other(_) => ChangeKind::Unknown,
        }
    }
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRecord {
    pub action: NotifyAction,
    /// Path relative to the watch root, native separators
    pub name: String,
}

/// Malformed completion buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record header at offset {offset} needs 12 bytes, buffer has {len}")]
    TruncatedHeader { offset: usize, len: usize },

    #[error("file name of record at offset {offset} needs {name_len} bytes, buffer has {available}")]
    TruncatedName {
        offset: usize,
        name_len: usize,
        available: usize,
    },

    #[error("file name length {name_len} of record at offset {offset} is not a whole number of UTF-16 units")]
    OddNameLength { offset: usize, name_len: usize },

    #[error("next entry offset {next} of record at offset {offset} leaves the {len} byte buffer")]
    NextOutOfBounds { offset: usize, next: usize, len: usize },
}

/// Iterator over the records of one completion buffer
///
/// Lazy, finite and restartable: cloning the iterator (or calling
/// [`NotifyRecords::new`] again on the same bytes) replays the same sequence.
/// After yielding an error the iterator is exhausted.
#[derive(Debug, Clone)]
pub struct NotifyRecords<'a> {
    buf: &'a [u8],
    offset: Option<usize>,
    pending_error: Option<RecordError>,
}

impl<'a> NotifyRecords<'a> {
    /// Walk the first `buf.len()` bytes; an empty buffer yields nothing.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: if buf.is_empty() { None } else { Some(0) },
            pending_error: None,
        }
    }

    fn read_at(&self, offset: usize) -> Result<(NotifyRecord, u32), RecordError> {
        let len = self.buf.len();
        let header_end = offset
            .checked_add(RECORD_HEADER_LEN)
            .filter(|end| *end <= len)
            .ok_or(RecordError::TruncatedHeader { offset, len })?;

        let mut header = &self.buf[offset..header_end];
        let next_entry_offset = header.get_u32_le();
        let action = header.get_u32_le();
        let name_len = header.get_u32_le() as usize;

        if name_len % 2 != 0 {
            return Err(RecordError::OddNameLength { offset, name_len });
        }
        let available = len - header_end;
        if name_len > available {
            return Err(RecordError::TruncatedName {
                offset,
                name_len,
                available,
            });
        }

        let mut raw_name = &self.buf[header_end..header_end + name_len];
        let mut units = Vec::with_capacity(name_len / 2);
        while raw_name.has_remaining() {
            units.push(raw_name.get_u16_le());
        }

        let record = NotifyRecord {
            action: NotifyAction::from(action),
            name: String::from_utf16_lossy(&units),
        };
        Ok((record, next_entry_offset))
    }
}

impl<'a> Iterator for NotifyRecords<'a> {
    type Item = Result<NotifyRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let offset = self.offset.take()?;

        let (record, next_entry_offset) = match self.read_at(offset) {
            Ok(read) => read,
            Err(e) => return Some(Err(e)),
        };

        if next_entry_offset != 0 {
            let next = offset.saturating_add(next_entry_offset as usize);
            if next.saturating_add(RECORD_HEADER_LEN) > self.buf.len() {
                // Hand out the record we did read; the broken link is reported next
                self.pending_error = Some(RecordError::NextOutOfBounds {
                    offset,
                    next,
                    len: self.buf.len(),
                });
            } else {
                self.offset = Some(next);
            }
        }

        Some(Ok(record))
    }
}

/// Decode one completion of a watch rooted at `native_root`.
///
/// `data` holds exactly the bytes the OS reported as transferred. Zero bytes
/// means the OS dropped changes before reporting them: the result is a single
/// `Invalidate` for the root and nothing else. A malformed chain keeps the
/// records decoded before the fault and ends with an `Invalidate` for the root.
///
/// Pure: the same root and bytes always produce the same events in the same
/// order.
pub fn decode_notify_buffer(native_root: &str, data: &[u8]) -> Vec<ChangeEvent> {
    let root = PathBuf::from(codec::from_native(native_root).into_owned());

    if data.is_empty() {
        return vec![ChangeEvent::invalidate(root)];
    }

    let mut events = Vec::new();
    for record in NotifyRecords::new(data) {
        match record {
            Ok(record) => {
                let kind = record.action.change_kind();
                if let NotifyAction::Other(code) = record.action {
                    warn!("Unknown event 0x{:x} for {}", code, record.name);
                }
                let native_path = codec::join_native(native_root, &record.name);
                let path = codec::from_native(&native_path).into_owned();
                debug!("Change detected: {:?} '{}'", record.action, path);
                events.push(ChangeEvent::new(kind, path));
            }
            Err(e) => {
                warn!("Malformed change buffer for '{}': {}", root.display(), e);
                events.push(ChangeEvent::invalidate(root));
                break;
            }
        }
    }
    events
}
