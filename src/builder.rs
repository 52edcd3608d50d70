//! Builds a fresh PK2 archive from scratch.
//!
//! A [`Builder`] writes into two growing scratch files — a header stream of
//! entry blocks and a data stream of file payloads — using construction
//! offsets local to each stream. [`Builder::finalize`] rebases every file
//! entry's offset, optionally Blowfish-encrypts the directory metadata, and
//! concatenates both streams into the distributable archive.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use binrw::BinWrite;

use crate::blowfish::Blowfish;
use crate::error::Error;
use crate::format::{self, Entry, BLOCK_SIZE, ENTRIES_PER_BLOCK};
use crate::keys;

/// Builds a new PK2 archive. Not thread-safe; one owner at a time.
pub struct Builder {
    header_file: File,
    data_file: File,
    header_path: PathBuf,
    data_path: PathBuf,
    header: format::Header,
    root_offset: u64,
    is_open: bool,
}

impl Builder {
    /// Creates the scratch files `{name}_header.pk2` and `{name}_data.pk2`
    /// and writes the archive header plus an empty root directory block.
    pub fn new(name: &str) -> Result<Self, Error> {
        let header_path = PathBuf::from(format!("{name}_header.pk2"));
        let data_path = PathBuf::from(format!("{name}_data.pk2"));

        let mut header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&header_path)?;
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;

        let header = format::Header::new();
        let mut header_bytes = Vec::new();
        header
            .write(&mut Cursor::new(&mut header_bytes))
            .map_err(|e| Error::Io(e.to_string()))?;
        header_file.write_all(&header_bytes)?;

        let root_offset = header_file.stream_position()?;

        let mut root_block = format::empty_block();
        root_block[0].kind = format::EntryKind::Directory;
        root_block[0].set_name(".")?;
        root_block[0].position = root_offset as i64;

        header_file.write_all(&format::block_to_bytes(&root_block)?)?;

        Ok(Self {
            header_file,
            data_file,
            header_path,
            data_path,
            header,
            root_offset,
            is_open: true,
        })
    }

    /// Adds a folder at `path`, creating intermediate directories as needed.
    /// Adding a folder that already exists is a no-op.
    pub fn add_folder(&mut self, path: &str, name: &str) -> Result<(), Error> {
        let mut entry = Entry::empty();
        entry.kind = format::EntryKind::Directory;
        entry.set_name(name)?;
        self.add_entry(path, entry, None)
    }

    /// Adds a file at `path` with `name`, creating intermediate directories
    /// as needed. Fails with [`Error::Duplicate`] if the file already exists.
    pub fn add_file(&mut self, path: &str, name: &str, data: &[u8]) -> Result<(), Error> {
        let mut entry = Entry::empty();
        entry.kind = format::EntryKind::File;
        entry.size = data.len() as u32;
        entry.set_name(name)?;
        self.add_entry(path, entry, Some(data))
    }

    /// Reads `source_file` from disk and adds it under `pathname`, splitting
    /// the final path component off as the entry's name.
    pub fn add_file_from_disk(&mut self, pathname: &str, source_file: &str) -> Result<(), Error> {
        let normalized = pathname.replace('/', "\\");
        let (path, name) = match normalized.rfind('\\') {
            Some(idx) => (normalized[..idx].to_string(), normalized[idx + 1..].to_string()),
            None => (".".to_string(), normalized.clone()),
        };
        let data = fs::read(source_file)?;
        self.add_file(&path, &name, &data)
    }

    /// Discards the scratch files; the builder is no longer usable.
    pub fn discard(&mut self) {
        if self.is_open {
            let _ = fs::remove_file(&self.header_path);
            let _ = fs::remove_file(&self.data_path);
            self.is_open = false;
        }
    }

    /// Rebases every entry's offsets, optionally encrypts the directory
    /// metadata with a key derived from `ascii_key`, and writes the merged,
    /// 4096-byte-aligned archive to `output_path`. On success or failure the
    /// scratch files are discarded.
    pub fn finalize(&mut self, output_path: &str, ascii_key: Option<&[u8]>) -> Result<(), Error> {
        if !self.is_open {
            return Err(Error::State("builder is not open"));
        }

        match self.finalize_inner(output_path, ascii_key) {
            Ok(()) => {
                self.discard();
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(output_path);
                self.discard();
                Err(e)
            }
        }
    }

    fn finalize_inner(&mut self, output_path: &str, ascii_key: Option<&[u8]>) -> Result<(), Error> {
        let file_offset = self.header_file.seek(SeekFrom::End(0))?;

        let blowfish = match ascii_key {
            Some(ascii_key) => {
                let derived = keys::derive_key(ascii_key, &keys::DEFAULT_BASE_KEY);
                let blowfish = Blowfish::new(&derived)?;

                let mut encoded = [0u8; 16];
                blowfish.encode(&format::VERIFY_PLAINTEXT, &mut encoded)?;

                self.header.encryption = 1;
                self.header.verify = [0; 16];
                self.header.verify[..3].copy_from_slice(&encoded[..3]);
                self.write_header()?;

                Some(blowfish)
            }
            None => None,
        };

        let mut frontier: VecDeque<u64> = VecDeque::new();
        frontier.push_back(self.root_offset);

        while let Some(offset) = frontier.pop_front() {
            let mut block = self.read_header_block(offset)?;

            for entry in block.iter_mut() {
                if entry.is_file() {
                    entry.position += file_offset as i64;
                } else if entry.is_dir() && !entry.is_dot_entry() {
                    frontier.push_back(entry.position as u64);
                }
            }

            let chain = block[ENTRIES_PER_BLOCK - 1].next_chain;
            if chain != 0 {
                frontier.push_front(chain as u64);
            }

            self.write_header_block_encrypted(offset, &block, blowfish.as_ref())?;
        }

        let mut output = File::create(output_path)?;
        self.header_file.seek(SeekFrom::Start(0))?;
        io::copy(&mut self.header_file, &mut output)?;
        self.data_file.seek(SeekFrom::Start(0))?;
        io::copy(&mut self.data_file, &mut output)?;

        let total_len = output.stream_position()?;
        let remainder = total_len % format::ARCHIVE_ALIGNMENT;
        if remainder != 0 {
            let pad = vec![0u8; (format::ARCHIVE_ALIGNMENT - remainder) as usize];
            output.write_all(&pad)?;
        }

        Ok(())
    }

    /// Canonical add algorithm shared by `add_folder` and `add_file`. Any
    /// failure other than [`Error::Duplicate`] invalidates the builder.
    fn add_entry(&mut self, pathname: &str, entry: Entry, user_data: Option<&[u8]>) -> Result<(), Error> {
        if !self.is_open {
            return Err(Error::State("builder is not open"));
        }

        match self.add_entry_inner(pathname, entry, user_data) {
            Ok(()) => Ok(()),
            Err(Error::Duplicate) => Err(Error::Duplicate),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    fn add_entry_inner(&mut self, pathname: &str, entry: Entry, user_data: Option<&[u8]>) -> Result<(), Error> {
        let mut parts: VecDeque<String> = format::tokenize_path(pathname).into_iter().collect();
        parts.push_back(entry.name());

        let mut roots: VecDeque<u64> = VecDeque::new();
        roots.push_back(self.root_offset);
        let mut root_offset = self.root_offset;

        while let Some(current_part) = parts.pop_front() {
            let cur_offset = roots.pop_front().ok_or(Error::Corrupt)?;
            let wanted = current_part.to_ascii_lowercase();

            let block = self.read_header_block(cur_offset)?;

            let matched = block
                .iter()
                .find(|e| !e.is_empty_slot() && e.name().to_ascii_lowercase() == wanted)
                .copied();

            if let Some(found) = matched {
                if parts.is_empty() {
                    if entry.is_file() {
                        return Err(Error::Duplicate);
                    }
                    return Ok(());
                }
                if !found.is_dir() {
                    return Err(Error::InvalidPath);
                }
                root_offset = found.position as u64;
                roots.push_front(root_offset);
                continue;
            }

            let chain = block[ENTRIES_PER_BLOCK - 1].next_chain;
            if chain != 0 {
                parts.push_front(current_part);
                roots.push_front(chain as u64);
                continue;
            }

            if current_part == ".." {
                roots.push_front(cur_offset);
                continue;
            }

            self.create_entry(root_offset, &current_part, parts.is_empty(), &entry, user_data, &mut roots, &mut root_offset)?;
        }

        Ok(())
    }

    /// Scans forward from `start_offset` (the directory's first block) for
    /// the first empty slot, then writes the new entry there, extending the
    /// chain or auto-creating a child directory block as needed.
    #[allow(clippy::too_many_arguments)]
    fn create_entry(
        &mut self,
        start_offset: u64,
        name: &str,
        is_terminal: bool,
        entry: &Entry,
        user_data: Option<&[u8]>,
        roots: &mut VecDeque<u64>,
        root_offset: &mut u64,
    ) -> Result<(), Error> {
        let mut scan_offset = start_offset;

        loop {
            let mut block = self.read_header_block(scan_offset)?;
            let mut placed_child: Option<u64> = None;
            let mut placed = false;

            for (i, slot) in block.iter_mut().enumerate() {
                if !slot.is_empty_slot() {
                    continue;
                }

                if is_terminal {
                    slot.kind = entry.kind;
                    slot.size = entry.size;
                } else {
                    slot.kind = format::EntryKind::Directory;
                    slot.size = 0;
                }
                slot.set_name(name)?;

                if is_terminal && slot.is_file() {
                    let data = user_data.unwrap_or(&[]);
                    let data_offset = self.append_data(data)?;
                    slot.position = data_offset as i64;
                }

                if slot.is_dir() {
                    let child_offset = self.header_file.seek(SeekFrom::End(0))?;
                    let mut child_block = format::empty_block();
                    child_block[0].kind = format::EntryKind::Directory;
                    child_block[0].set_name(".")?;
                    child_block[0].position = child_offset as i64;
                    child_block[1].kind = format::EntryKind::Directory;
                    child_block[1].set_name("..")?;
                    child_block[1].position = start_offset as i64;

                    self.write_header_block(child_offset, &child_block)?;
                    slot.position = child_offset as i64;
                    placed_child = Some(child_offset);
                }

                if i == ENTRIES_PER_BLOCK - 1 {
                    let sibling_offset = self.header_file.seek(SeekFrom::End(0))?;
                    self.write_header_block(sibling_offset, &format::empty_block())?;
                    slot.next_chain = sibling_offset as i64;
                }

                placed = true;
                break;
            }

            if placed {
                self.write_header_block(scan_offset, &block)?;
                if let Some(child_offset) = placed_child {
                    roots.push_front(child_offset);
                    *root_offset = child_offset;
                }
                return Ok(());
            }

            let chain = block[ENTRIES_PER_BLOCK - 1].next_chain;
            if chain == 0 {
                return Err(Error::Corrupt);
            }
            scan_offset = chain as u64;
        }
    }

    fn write_header(&mut self) -> Result<(), Error> {
        self.header_file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.header
            .write(&mut Cursor::new(&mut buf))
            .map_err(|e| Error::Io(e.to_string()))?;
        self.header_file.write_all(&buf)?;
        Ok(())
    }

    fn read_header_block(&mut self, offset: u64) -> Result<format::EntryBlock, Error> {
        self.header_file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        self.header_file.read_exact(&mut buf)?;
        format::block_from_bytes(&buf)
    }

    fn write_header_block(&mut self, offset: u64, block: &format::EntryBlock) -> Result<(), Error> {
        self.header_file.seek(SeekFrom::Start(offset))?;
        self.header_file.write_all(&format::block_to_bytes(block)?)?;
        Ok(())
    }

    /// Writes `block` at `offset`, Blowfish-encoding the whole 2560-byte
    /// buffer first if `blowfish` is given; mirrors [`crate::reader`]'s
    /// decrypt-the-whole-block-then-parse discipline in reverse.
    fn write_header_block_encrypted(
        &mut self,
        offset: u64,
        block: &format::EntryBlock,
        blowfish: Option<&Blowfish>,
    ) -> Result<(), Error> {
        let plaintext = format::block_to_bytes(block)?;
        let bytes = match blowfish {
            Some(bf) => {
                let mut cipher = vec![0u8; BLOCK_SIZE as usize];
                bf.encode(&plaintext, &mut cipher)?;
                cipher
            }
            None => plaintext,
        };
        self.header_file.seek(SeekFrom::Start(offset))?;
        self.header_file.write_all(&bytes)?;
        Ok(())
    }

    fn append_data(&mut self, data: &[u8]) -> Result<u64, Error> {
        let offset = self.data_file.seek(SeekFrom::End(0))?;
        self.data_file.write_all(data)?;
        Ok(offset)
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_archive_is_exactly_one_page() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let out = dir.path().join("out.pk2");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.finalize(out.to_str().unwrap(), None).unwrap();

        assert_eq!(fs::metadata(&out).unwrap().len(), format::ARCHIVE_ALIGNMENT);
    }

    #[test]
    fn adding_same_folder_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.add_folder("", "assets").unwrap();
        builder.add_folder("", "assets").unwrap();
    }

    #[test]
    fn adding_duplicate_file_fails_without_discarding() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.add_file("", "a.txt", b"one").unwrap();
        let err = builder.add_file("", "a.txt", b"two").unwrap_err();
        assert!(matches!(err, Error::Duplicate));

        // the builder is still usable after a duplicate rejection
        builder.add_file("", "b.txt", b"three").unwrap();
    }

    #[test]
    fn auto_creates_intermediate_directories() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.add_file("a/b/c", "d.txt", b"nested").unwrap();
    }

    #[test]
    fn dotdot_above_the_root_falls_back_to_the_root_without_hanging() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        // ".." has no slot in the root block, so the defensive guard must
        // consume the component and retry against the same directory
        // instead of looping on it forever.
        builder.add_folder("..", "lifted").unwrap();
        builder.add_file("", "sibling.txt", b"y").unwrap();
    }

    #[test]
    fn twentieth_child_allocates_a_chain_block() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let out = dir.path().join("out.pk2");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        for i in 0..25 {
            builder
                .add_file("", &format!("file{i}.dat"), b"x")
                .unwrap();
        }
        builder.finalize(out.to_str().unwrap(), None).unwrap();

        // header: 256-byte header + root block + chain block, data: 25 bytes,
        // padded up to the next 4096-byte multiple.
        let len = fs::metadata(&out).unwrap().len();
        assert_eq!(len % format::ARCHIVE_ALIGNMENT, 0);
        assert!(len >= format::ARCHIVE_ALIGNMENT);
    }

    #[test]
    fn discard_removes_scratch_files() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");

        let mut builder = Builder::new(scratch.to_str().unwrap()).unwrap();
        builder.add_file("", "a.txt", b"x").unwrap();
        builder.discard();

        assert!(!dir.path().join("scratch_header.pk2").exists());
        assert!(!dir.path().join("scratch_data.pk2").exists());
    }
}
