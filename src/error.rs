// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// Errors returned by [`crate::reader::Reader`] and [`crate::builder::Builder`].
#[derive(Debug, Clone)]
pub enum Error {
    /// The underlying file or memory-mapped I/O operation failed.
    Io(String),
    /// The archive header's `name` or `version` field did not match.
    HeaderInvalid,
    /// The decryption key's verify bytes did not match the header.
    KeyInvalid,
    /// An entry's padding was nonzero after decryption, or a chain pointer
    /// referenced an offset outside the archive.
    Corrupt,
    /// Path resolution failed to find the named entry.
    NotFound,
    /// The builder was asked to add a file entry that already exists.
    Duplicate,
    /// A path component traversed through a file entry, or tokenized to
    /// nothing.
    InvalidPath,
    /// `get_entries` was called on a non-directory, or `extract` on a
    /// non-file.
    TypeMismatch,
    /// The operation was called in the wrong lifecycle state, e.g. `add_file`
    /// before `new`, or `finalize` on an empty builder.
    State(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(message) => write!(f, "i/o error: {message}"),
            Error::HeaderInvalid => write!(f, "invalid PK2 header (name or version mismatch)"),
            Error::KeyInvalid => write!(f, "invalid blowfish key"),
            Error::Corrupt => write!(f, "corrupt entry (padding check failed or bad chain offset)"),
            Error::NotFound => write!(f, "the entry does not exist"),
            Error::Duplicate => write!(f, "the entry already exists"),
            Error::InvalidPath => write!(f, "invalid path"),
            Error::TypeMismatch => write!(f, "entry is not the expected type"),
            Error::State(what) => write!(f, "invalid builder/reader state: {what}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
