//! Extended-length path encoding
//!
//! Paths handed to the directory-change backend are rewritten to request
//! extended-length semantics once they get close to the legacy path limit:
//!
//! ```text
//! C:\very\long\...          ->  \\?\C:\very\long\...
//! \\server\share\long\...   ->  \\?\UNC\server\share\long\...
//! ```
//!
//! Every path reported back to a sink goes through [`from_native`], so callers
//! only ever see the form they supplied.

use std::borrow::Cow;

/// Longest path (in UTF-16 code units) passed through unchanged.
///
/// `MAX_PATH` is 260, but several directory APIs already fail at 240, so one
/// threshold covers both.
pub const MAX_SHORT_PATH_LEN: usize = 240;

/// Marker requesting extended-length semantics for a drive path
pub const EXTENDED_PREFIX: &str = r"\\?\";

/// Marker requesting extended-length semantics for a UNC path
pub const EXTENDED_UNC_PREFIX: &str = r"\\?\UNC\";

const UNC_PREFIX: &str = r"\\";

/// Native path separator of the directory-change backend
pub const SEPARATOR: char = '\\';

/// `X:\...`
fn is_absolute_local_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

/// `\\server\...`
fn is_absolute_unc_path(path: &str) -> bool {
    path.len() >= 3 && path.starts_with(UNC_PREFIX)
}

fn utf16_len(path: &str) -> usize {
    path.encode_utf16().count()
}

/// Convert a caller-supplied absolute path into its native form.
///
/// Paths at or below [`MAX_SHORT_PATH_LEN`], paths that already carry a
/// marker, and paths of unrecognized shape are returned unchanged.
pub fn to_native(path: &str) -> Cow<'_, str> {
    if utf16_len(path) <= MAX_SHORT_PATH_LEN || path.starts_with(EXTENDED_PREFIX) {
        return Cow::Borrowed(path);
    }

    if is_absolute_local_path(path) {
        Cow::Owned(format!("{EXTENDED_PREFIX}{path}"))
    } else if is_absolute_unc_path(path) {
        Cow::Owned(format!("{EXTENDED_UNC_PREFIX}{}", &path[UNC_PREFIX.len()..]))
    } else {
        Cow::Borrowed(path)
    }
}

/// Strip the extended-length marker from a native path.
///
/// Inverse of [`to_native`]: the UNC marker restores the leading `\\`, the
/// plain marker is simply removed.
pub fn from_native(path: &str) -> Cow<'_, str> {
    if let Some(rest) = path.strip_prefix(EXTENDED_UNC_PREFIX) {
        Cow::Owned(format!("{UNC_PREFIX}{rest}"))
    } else if let Some(rest) = path.strip_prefix(EXTENDED_PREFIX) {
        Cow::Borrowed(rest)
    } else {
        Cow::Borrowed(path)
    }
}

/// Join a native root and a root-relative name reported by the OS.
///
/// An empty name denotes the root itself.
pub fn join_native(root: &str, relative: &str) -> String {
    if relative.is_empty() {
        return root.to_string();
    }
    let mut joined = String::with_capacity(root.len() + 1 + relative.len());
    joined.push_str(root);
    if !root.ends_with(SEPARATOR) {
        joined.push(SEPARATOR);
    }
    joined.push_str(relative);
    joined
}
