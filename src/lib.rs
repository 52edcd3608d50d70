// SPDX-License-Identifier: MIT OR Apache-2.0

#![doc = include_str!("../README.md")]

#[doc(hidden)]
pub const PK2_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The on-disk header, entry, and entry-block layout.
pub mod format;

/// A standalone Blowfish ECB cipher used for directory-metadata encryption.
pub mod blowfish;

/// Pseudorandom Blowfish P-array/S-box initial state.
mod blowfish_constants;

/// Blowfish key derivation from a caller-supplied ASCII key.
pub mod keys;

/// Conversion between `SystemTime` and the Windows `FILETIME` encoding used
/// by an entry's `access_time`/`create_time`/`modify_time` fields. The
/// builder leaves those fields zeroed, matching the zero-initialized entry
/// the original writer produces; this module is for callers who decode or
/// set those fields themselves.
pub mod filetime;

// NOTE: brought up to the top-level because it's a basic error type.
mod error;
pub use error::Error;

/// Read-only access to a PK2 archive.
pub mod reader;
pub use reader::{EntrySlice, Reader};

/// Builds a new PK2 archive from scratch.
pub mod builder;
pub use builder::Builder;
