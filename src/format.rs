//! On-disk format primitives: the archive header, the 128-byte
//! entry, and the 20-entry (2560-byte) entry block, plus the fixed archive-wide
//! constants. All multi-byte fields are little-endian and tightly packed,
//! mirroring how `physis::sqpack::SqPackHeader` and `physis::index::IndexFile`
//! declare their `#[binrw]` wire structures.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};

use crate::error::Error;

/// Size in bytes of [`Header`] on disk.
pub const HEADER_SIZE: u64 = 256;
/// Size in bytes of a single [`Entry`] on disk.
pub const ENTRY_SIZE: u64 = 128;
/// Number of entries packed into one [`EntryBlock`].
pub const ENTRIES_PER_BLOCK: usize = 20;
/// Size in bytes of one [`EntryBlock`] on disk.
pub const BLOCK_SIZE: u64 = ENTRY_SIZE * ENTRIES_PER_BLOCK as u64;
/// Archives are padded to a multiple of this size at finalization.
pub const ARCHIVE_ALIGNMENT: u64 = 4096;

/// `PK2Header::name`, fixed and zero-padded.
pub const ARCHIVE_NAME: &[u8; 30] = b"JoyMax File Manager!\n\0\0\0\0\0\0\0\0\0";
/// `PK2Header::version`.
pub const ARCHIVE_VERSION: u32 = 0x0100_0002;
/// Plaintext whose Blowfish encoding's first 3 bytes are stored in `verify`.
pub const VERIFY_PLAINTEXT: [u8; 16] = *b"Joymax Pak File\0";

/// Lowercases and backslash-normalizes `pathname` for use as a cache key.
pub(crate) fn normalize_path(pathname: &str) -> String {
    pathname.replace('/', "\\").to_ascii_lowercase()
}

/// Splits `pathname` on `/` and `\`, dropping empty components. A pathname
/// with no components (e.g. `""`) tokenizes to a single `"."`, mirroring the
/// original builder's handling of an empty leading component.
pub(crate) fn tokenize_path(pathname: &str) -> Vec<String> {
    let tokens: Vec<String> = pathname
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    if tokens.is_empty() {
        vec![".".to_string()]
    } else {
        tokens
    }
}

/// An entry's discriminant.
#[binrw]
#[brw(repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An empty, reusable slot.
    Empty = 0,
    /// A directory entry; `position` points at its first entry block.
    Directory = 1,
    /// A file entry; `position` points at its payload.
    File = 2,
}

/// The fixed-size archive header, 256 bytes.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct Header {
    pub name: [u8; 30],
    pub version: u32,
    pub encryption: u8,
    pub verify: [u8; 16],
    pub reserved: [u8; 205],
}

impl Header {
    /// A fresh, unencrypted header as written by `Builder::new`.
    pub fn new() -> Self {
        Self {
            name: *ARCHIVE_NAME,
            version: ARCHIVE_VERSION,
            encryption: 0,
            verify: [0; 16],
            reserved: [0; 205],
        }
    }

    pub fn is_name_valid(&self) -> bool {
        self.name == *ARCHIVE_NAME
    }

    pub fn is_version_valid(&self) -> bool {
        self.version == ARCHIVE_VERSION
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// A single 128-byte directory/file/empty-slot record.
///
/// `name` is stored as a raw NUL-terminated ASCII buffer so the struct can be
/// Blowfish-encrypted/decrypted as an opaque 128-byte block; use
/// [`Entry::name`]/[`Entry::set_name`] for the decoded string.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    name_raw: [u8; 81],
    pub access_time: u64,
    pub create_time: u64,
    pub modify_time: u64,
    pub position: i64,
    pub size: u32,
    pub next_chain: i64,
    pub padding: [u8; 2],
}

impl Entry {
    /// An empty, all-zero slot.
    pub fn empty() -> Self {
        Self {
            kind: EntryKind::Empty,
            name_raw: [0; 81],
            access_time: 0,
            create_time: 0,
            modify_time: 0,
            position: 0,
            size: 0,
            next_chain: 0,
            padding: [0; 2],
        }
    }

    /// Decodes the NUL-terminated ASCII name.
    pub fn name(&self) -> String {
        let end = self
            .name_raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name_raw.len());
        String::from_utf8_lossy(&self.name_raw[..end]).into_owned()
    }

    /// Writes `name` into the 81-byte name field, zero-padding the remainder.
    /// Fails if `name` is not ASCII or is longer than 80 bytes (the 81st byte
    /// is reserved for the NUL terminator).
    pub fn set_name(&mut self, name: &str) -> Result<(), Error> {
        if !name.is_ascii() || name.len() > 80 {
            return Err(Error::InvalidPath);
        }
        self.name_raw = [0; 81];
        self.name_raw[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    pub fn is_empty_slot(&self) -> bool {
        self.kind == EntryKind::Empty
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// True for the synthetic `.`/`..` slots every directory block carries.
    pub fn is_dot_entry(&self) -> bool {
        self.is_dir() && matches!(self.name().as_str(), "." | "..")
    }

    /// Serializes this entry to its 128-byte wire representation.
    pub fn to_bytes(&self) -> Result<[u8; ENTRY_SIZE as usize], Error> {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        let mut cursor = Cursor::new(&mut buf[..]);
        self.write(&mut cursor)
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(buf)
    }

    /// Parses a 128-byte wire representation back into an `Entry`. Any parse
    /// failure — including an out-of-range entry-kind discriminant — is
    /// reported as [`Error::Corrupt`], matching `block_from_bytes`'s handling
    /// of a malformed block.
    pub fn from_bytes(bytes: &[u8; ENTRY_SIZE as usize]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(&bytes[..]);
        Entry::read(&mut cursor).map_err(|_| Error::Corrupt)
    }
}

/// 20 contiguous entries (2560 bytes); the unit of I/O and encryption
/// chaining.
pub type EntryBlock = [Entry; ENTRIES_PER_BLOCK];

/// A block of 20 empty slots, as written for a freshly appended directory
/// block.
pub fn empty_block() -> EntryBlock {
    [Entry::empty(); ENTRIES_PER_BLOCK]
}

/// Serializes an entry block to its 2560-byte wire representation.
pub fn block_to_bytes(block: &EntryBlock) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);
    for entry in block {
        buf.extend_from_slice(&entry.to_bytes()?);
    }
    Ok(buf)
}

/// Parses a 2560-byte buffer into 20 entries.
pub fn block_from_bytes(bytes: &[u8]) -> Result<EntryBlock, Error> {
    if bytes.len() != BLOCK_SIZE as usize {
        return Err(Error::Corrupt);
    }
    let mut block = empty_block();
    for (i, slot) in block.iter_mut().enumerate() {
        let start = i * ENTRY_SIZE as usize;
        let chunk: [u8; ENTRY_SIZE as usize] = bytes[start..start + ENTRY_SIZE as usize]
            .try_into()
            .unwrap();
        *slot = Entry::from_bytes(&chunk)?;
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_256_bytes() {
        let header = Header::new();
        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);
        header.write(&mut cursor).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE as usize);
    }

    #[test]
    fn entry_is_128_bytes() {
        let entry = Entry::empty();
        assert_eq!(entry.to_bytes().unwrap().len(), ENTRY_SIZE as usize);
    }

    #[test]
    fn name_round_trips() {
        let mut entry = Entry::empty();
        entry.set_name("bar.txt").unwrap();
        assert_eq!(entry.name(), "bar.txt");
    }

    #[test]
    fn name_at_exactly_80_bytes_is_preserved() {
        let name = "a".repeat(80);
        let mut entry = Entry::empty();
        entry.set_name(&name).unwrap();
        assert_eq!(entry.name(), name);
    }

    #[test]
    fn name_at_81_bytes_is_rejected() {
        let name = "a".repeat(81);
        let mut entry = Entry::empty();
        assert!(entry.set_name(&name).is_err());
    }

    #[test]
    fn block_round_trips_through_bytes() {
        let mut block = empty_block();
        block[0].kind = EntryKind::Directory;
        block[0].set_name(".").unwrap();
        block[0].position = 256;

        let bytes = block_to_bytes(&block).unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE as usize);

        let parsed = block_from_bytes(&bytes).unwrap();
        assert_eq!(parsed[0].name(), ".");
        assert_eq!(parsed[0].position, 256);
    }
}
