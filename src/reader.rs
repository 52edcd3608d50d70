//! Read-only access to a PK2 archive.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard};

use memmap2::Mmap;
use tracing::{debug, warn};

use binrw::BinRead;

use crate::blowfish::Blowfish;
use crate::error::Error;
use crate::format::{self, Entry, BLOCK_SIZE, ENTRIES_PER_BLOCK, HEADER_SIZE, VERIFY_PLAINTEXT};
use crate::format::{normalize_path, tokenize_path};
use crate::keys::{self, DEFAULT_ASCII_KEY, DEFAULT_BASE_KEY};

struct ReaderState {
    mmap: Option<Mmap>,
    header: format::Header,
    root_offset: u64,
    blowfish: Option<Blowfish>,
    ascii_key: Vec<u8>,
    base_key: Vec<u8>,
    cache: HashMap<String, Entry>,
}

impl ReaderState {
    fn read_block(&self, offset: u64) -> Result<[Entry; ENTRIES_PER_BLOCK], Error> {
        let mmap = self.mmap.as_ref().ok_or_else(|| Error::State("reader is not open"))?;
        let start = offset as usize;
        let end = start
            .checked_add(BLOCK_SIZE as usize)
            .ok_or(Error::Corrupt)?;
        let raw = mmap.get(start..end).ok_or(Error::Corrupt)?;

        // Entries are decrypted as raw bytes before being parsed, since the
        // on-disk bytes of an encrypted entry are not a valid `Entry` until
        // decoded.
        let plaintext = if let Some(blowfish) = &self.blowfish {
            let mut decrypted = vec![0u8; BLOCK_SIZE as usize];
            blowfish.decode(raw, &mut decrypted)?;
            decrypted
        } else {
            raw.to_vec()
        };

        let block = format::block_from_bytes(&plaintext)?;

        // Applied uniformly regardless of entry type or encryption, matching
        // the original reader's unconditional check on every decoded slot.
        for entry in &block {
            if entry.padding != [0, 0] {
                return Err(Error::Corrupt);
            }
        }

        Ok(block)
    }
}

/// A view into the archive's memory mapping, borrowed from the reader's lock
/// for the lifetime of the returned slice. Returned by `extract_zero_copy`.
pub struct EntrySlice<'a> {
    guard: MutexGuard<'a, ReaderState>,
    start: usize,
    len: usize,
}

impl<'a> Deref for EntrySlice<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let mmap = self.guard.mmap.as_ref().expect("reader is not open");
        &mmap[self.start..self.start + self.len]
    }
}

/// Opens and queries a PK2 archive.
///
/// All public methods are serialized by a single internal lock; the
/// memory-mapped archive is read-only, so zero-copy slices returned by
/// [`Reader::extract_zero_copy`] observe a consistent view as long as the
/// reader stays open.
pub struct Reader {
    state: Mutex<ReaderState>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    /// Creates an unopened reader with the default Silkroad decryption key.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReaderState {
                mmap: None,
                header: format::Header::new(),
                root_offset: HEADER_SIZE,
                blowfish: None,
                ascii_key: DEFAULT_ASCII_KEY.to_vec(),
                base_key: DEFAULT_BASE_KEY.to_vec(),
                cache: HashMap::new(),
            }),
        }
    }

    /// Replaces the key material used on the next [`Reader::open`]. Must be
    /// called before `open`.
    pub fn set_decryption_key(&self, ascii_key: &[u8], base_key: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.mmap.is_some() {
            return Err(Error::State("cannot change the key while the archive is open"));
        }
        state.ascii_key = ascii_key.to_vec();
        state.base_key = base_key.to_vec();
        Ok(())
    }

    /// Opens `path` as a read-only memory-mapped archive, validating the
    /// header and, if encryption is enabled, the derived key's verify bytes.
    pub fn open(&self, path: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if state.mmap.is_some() {
            return Err(Error::State("there is already an archive opened"));
        }

        debug!(path, "opening PK2 archive");

        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if (mmap.len() as u64) < HEADER_SIZE {
            return Err(Error::HeaderInvalid);
        }

        let header = format::Header::read_le(&mut std::io::Cursor::new(&mmap[..HEADER_SIZE as usize]))
            .map_err(|e| Error::Io(e.to_string()))?;

        if !header.is_name_valid() || !header.is_version_valid() {
            warn!("invalid PK2 header");
            return Err(Error::HeaderInvalid);
        }

        let root_offset = HEADER_SIZE;

        let blowfish = if header.encryption != 0 {
            let derived = keys::derive_key(&state.ascii_key, &state.base_key);
            let blowfish = Blowfish::new(&derived)?;

            let mut encoded = [0u8; 16];
            blowfish.encode(&VERIFY_PLAINTEXT, &mut encoded)?;

            if encoded[..3] != header.verify[..3] {
                warn!("blowfish key verification failed");
                return Err(Error::KeyInvalid);
            }

            Some(blowfish)
        } else {
            None
        };

        state.header = header;
        state.root_offset = root_offset;
        state.blowfish = blowfish;
        state.mmap = Some(mmap);

        Ok(())
    }

    /// Drops the memory mapping and clears the path cache.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.mmap = None;
        state.blowfish = None;
        state.cache.clear();
    }

    /// Clears every cached resolved path.
    pub fn clear_cache(&self) {
        self.state.lock().unwrap().cache.clear();
    }

    /// Number of entries currently cached.
    pub fn cache_size(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }

    /// Resolves `pathname`, optionally relative to `parent` (a directory
    /// entry previously returned by this reader). Pass `None` to resolve
    /// from the archive root.
    pub fn get_entry(&self, pathname: &str, parent: Option<&Entry>) -> Result<Entry, Error> {
        let mut state = self.state.lock().unwrap();

        if state.mmap.is_none() {
            return Err(Error::State("there is no archive opened yet"));
        }

        let cache_key = normalize_path(pathname);
        if let Some(cached) = state.cache.get(&cache_key) {
            return Ok(*cached);
        }

        let mut tokens = tokenize_path(pathname);
        let mut offset = match parent {
            Some(entry) if entry.position != 0 => entry.position as u64,
            _ => state.root_offset,
        };

        while !tokens.is_empty() {
            let wanted = tokens.remove(0).to_ascii_lowercase();

            let block = state.read_block(offset)?;
            let mut matched: Option<Entry> = None;

            for entry in &block {
                if entry.is_empty_slot() {
                    continue;
                }
                if entry.name().to_ascii_lowercase() == wanted {
                    matched = Some(*entry);
                    break;
                }
            }

            match matched {
                Some(entry) if tokens.is_empty() => {
                    state.cache.insert(cache_key, entry);
                    return Ok(entry);
                }
                Some(entry) => {
                    if !entry.is_dir() {
                        return Err(Error::InvalidPath);
                    }
                    offset = entry.position as u64;
                }
                None => {
                    let chain = block[ENTRIES_PER_BLOCK - 1].next_chain;
                    if chain != 0 {
                        offset = chain as u64;
                        tokens.insert(0, wanted);
                        continue;
                    }
                    return Err(Error::NotFound);
                }
            }
        }

        Err(Error::NotFound)
    }

    /// Every non-empty entry (including the `.`/`..` slots) in `parent`'s
    /// full entry chain.
    pub fn get_entries(&self, parent: &Entry) -> Result<Vec<Entry>, Error> {
        let state = self.state.lock().unwrap();

        if state.mmap.is_none() {
            return Err(Error::State("there is no archive opened yet"));
        }

        if !parent.is_dir() {
            return Err(Error::TypeMismatch);
        }

        let mut entries = Vec::new();
        let mut offset = parent.position as u64;

        loop {
            let block = state.read_block(offset)?;
            for entry in &block {
                if !entry.is_empty_slot() {
                    entries.push(*entry);
                }
            }

            let chain = block[ENTRIES_PER_BLOCK - 1].next_chain;
            if chain == 0 {
                break;
            }
            offset = chain as u64;
        }

        Ok(entries)
    }

    /// Breadth-first traversal from the root. `visitor` receives the
    /// directory's normalized path and its decrypted entry block; returning
    /// `false` stops the walk early.
    pub fn for_each_entry_do(
        &self,
        mut visitor: impl FnMut(&str, &[Entry; ENTRIES_PER_BLOCK]) -> bool,
    ) -> Result<(), Error> {
        let state = self.state.lock().unwrap();

        if state.mmap.is_none() {
            return Err(Error::State("there is no archive opened yet"));
        }

        let mut frontier: std::collections::VecDeque<(u64, String)> = std::collections::VecDeque::new();
        frontier.push_back((state.root_offset, String::new()));

        while let Some((offset, path)) = frontier.pop_front() {
            let block = state.read_block(offset)?;

            for entry in &block {
                if entry.is_dir() && !entry.is_dot_entry() {
                    let child_path = if path.is_empty() {
                        entry.name()
                    } else {
                        format!("{path}\\{}", entry.name())
                    };
                    frontier.push_back((entry.position as u64, child_path));
                }
            }

            let chain = block[ENTRIES_PER_BLOCK - 1].next_chain;
            if chain != 0 {
                frontier.push_front((chain as u64, path.clone()));
            }

            if !visitor(&path, &block) {
                break;
            }
        }

        Ok(())
    }

    /// Copies `entry`'s full payload into a freshly allocated buffer.
    pub fn extract_to_memory(&self, entry: &Entry) -> Result<Vec<u8>, Error> {
        let state = self.state.lock().unwrap();

        if !entry.is_file() {
            return Err(Error::TypeMismatch);
        }

        let mmap = state.mmap.as_ref().ok_or_else(|| Error::State("reader is not open"))?;
        let start = entry.position as usize;
        let end = start.checked_add(entry.size as usize).ok_or(Error::Corrupt)?;
        let slice = mmap.get(start..end).ok_or(Error::Corrupt)?;

        Ok(slice.to_vec())
    }

    /// Returns a zero-copy view into the mapping at `entry.position`, valid
    /// until [`Reader::close`].
    pub fn extract_zero_copy(&self, entry: &Entry) -> Result<EntrySlice<'_>, Error> {
        let state = self.state.lock().unwrap();

        if !entry.is_file() {
            return Err(Error::TypeMismatch);
        }

        let mmap = state.mmap.as_ref().ok_or_else(|| Error::State("reader is not open"))?;
        let start = entry.position as usize;
        let end = start.checked_add(entry.size as usize).ok_or(Error::Corrupt)?;
        if mmap.get(start..end).is_none() {
            return Err(Error::Corrupt);
        }

        Ok(EntrySlice {
            guard: state,
            start,
            len: entry.size as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use tempfile::tempdir;

    #[test]
    fn open_rejects_missing_file() {
        let reader = Reader::new();
        assert!(reader.open("/nonexistent/path.pk2").is_err());
    }

    #[test]
    fn round_trip_plain_archive() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let out = dir.path().join("out.pk2");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.add_file("foo", "bar.txt", b"hi").unwrap();
        builder.finalize(out.to_str().unwrap(), None).unwrap();

        let reader = Reader::new();
        reader.open(out.to_str().unwrap()).unwrap();

        let entry = reader.get_entry("foo\\bar.txt", None).unwrap();
        assert_eq!(entry.size, 2);
        assert_eq!(reader.extract_to_memory(&entry).unwrap(), b"hi");
    }

    #[test]
    fn path_resolution_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let out = dir.path().join("out.pk2");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.add_file("A", "B.TXT", b"x").unwrap();
        builder.finalize(out.to_str().unwrap(), None).unwrap();

        let reader = Reader::new();
        reader.open(out.to_str().unwrap()).unwrap();

        let a = reader.get_entry("A/B.TXT", None).unwrap();
        reader.clear_cache();
        let b = reader.get_entry("a\\b.txt", None).unwrap();
        assert_eq!(a.name().to_ascii_lowercase(), b.name().to_ascii_lowercase());
    }
}
