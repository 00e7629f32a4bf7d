//! Directory contents and path lookup
//!
//! A directory's data is a packed run of records:
//!
//! ```text
//! inode  u64
//! len    u32
//! name   [u8; len]
//! ```
//!
//! The inode's `size` is the number of valid bytes. Parsing stops at the end
//! of those bytes, at a zero inode number or at a truncated record. Every
//! directory carries `.` and `..` entries written when it is created.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::ops::Range;

use crate::codec::{prefixed_len, read_prefixed, write_prefixed};
use crate::error::Result;
use crate::fs::Lfs;
use crate::layout::{Inode, BLOCK_SIZE, INVALID_INODE, ROOT_INODE};
use crate::path;

/// One decoded directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode the name refers to
    pub inode: u64,
    /// Entry name, a single path component
    pub name: String,
}

impl DirEntry {
    /// Create an entry
    pub fn new(inode: u64, name: impl Into<String>) -> Self {
        Self {
            inode,
            name: name.into(),
        }
    }

    /// Encoded size of this record
    pub fn encoded_len(&self) -> usize {
        8 + prefixed_len(self.name.as_bytes())
    }

    /// Append the encoded record to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.inode.to_le_bytes());
        write_prefixed(out, self.name.as_bytes())?;
        Ok(())
    }
}

/// Decode records together with the byte range each one occupies
fn parse_entries(bytes: &[u8]) -> Vec<(DirEntry, Range<usize>)> {
    let mut cursor = Cursor::new(bytes);
    let mut entries = Vec::new();

    loop {
        let start = cursor.position() as usize;
        let inode = match cursor.read_u64::<LittleEndian>() {
            Ok(inode) if inode != INVALID_INODE => inode,
            _ => break,
        };
        let name = match read_prefixed(&mut cursor) {
            Ok(name) => name,
            Err(_) => {
                log::warn!("truncated directory record at byte {}", start);
                break;
            }
        };
        let end = cursor.position() as usize;
        entries.push((
            DirEntry::new(inode, String::from_utf8_lossy(&name).into_owned()),
            start..end,
        ));
    }

    entries
}

impl Lfs {
    /// The valid bytes of a directory
    async fn read_directory_bytes(&mut self, dir: &Inode) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(dir.block_span() as usize * BLOCK_SIZE);
        for index in 0..dir.block_span() {
            let block = self.read_block_of_file(dir, index).await?;
            bytes.extend_from_slice(&block);
        }
        bytes.truncate(dir.size as usize);
        Ok(bytes)
    }

    /// Rewrite a directory's data with `bytes`, block by block
    async fn write_directory_bytes(&mut self, dir: &mut Inode, bytes: &[u8]) -> Result<()> {
        for (index, chunk) in bytes.chunks(BLOCK_SIZE).enumerate() {
            self.write_block_of_file(dir, index as u64, chunk).await?;
        }
        dir.size = bytes.len() as u64;
        dir.dirty = true;
        Ok(())
    }

    /// Decoded entries of `dir`, in on-disk order
    pub async fn read_directory_entries(&mut self, dir: &Inode) -> Result<Vec<DirEntry>> {
        let bytes = self.read_directory_bytes(dir).await?;
        Ok(parse_entries(&bytes)
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    /// Inode number of `name` in `dir`, or 0 if absent
    pub async fn find_directory_entry(&mut self, dir: &Inode, name: &str) -> Result<u64> {
        let entries = self.read_directory_entries(dir).await?;
        Ok(entries
            .into_iter()
            .find(|entry| entry.name == name)
            .map_or(INVALID_INODE, |entry| entry.inode))
    }

    /// Names in `dir`, including `.` and `..`
    pub async fn list_directory_entries(&mut self, dir: &Inode) -> Result<Vec<String>> {
        let entries = self.read_directory_entries(dir).await?;
        Ok(entries.into_iter().map(|entry| entry.name).collect())
    }

    /// Append an entry `name -> target` to directory `dir_number`.
    ///
    /// Only the block holding the end of the old data and the blocks after it
    /// are rewritten.
    pub async fn add_directory_entry(
        &mut self,
        dir_number: u64,
        name: &str,
        target: u64,
    ) -> Result<()> {
        let mut dir = match self.load_inode(dir_number).await? {
            Some(dir) if dir.is_dir() => dir,
            _ => {
                log::warn!("add_directory_entry: inode {} is not a directory", dir_number);
                return Ok(());
            }
        };

        let first_block = dir.size / BLOCK_SIZE as u64;
        let tail_start = (first_block * BLOCK_SIZE as u64) as usize;

        let mut tail = if dir.size as usize > tail_start {
            let mut block = self.read_block_of_file(&dir, first_block).await?;
            block.truncate(dir.size as usize - tail_start);
            block
        } else {
            Vec::new()
        };
        DirEntry::new(target, name).encode_into(&mut tail)?;

        for (i, chunk) in tail.chunks(BLOCK_SIZE).enumerate() {
            self.write_block_of_file(&mut dir, first_block + i as u64, chunk)
                .await?;
        }
        dir.size = (tail_start + tail.len()) as u64;
        dir.dirty = true;

        log::debug!("linked {} -> inode {} in directory {}", name, target, dir_number);
        self.store_inode(dir_number, dir);
        Ok(())
    }

    /// Remove the entry `name` from directory `dir_number`, shifting the
    /// records after it down. Returns false if there was no such entry.
    pub async fn delete_directory_entry(&mut self, dir_number: u64, name: &str) -> Result<bool> {
        let mut dir = match self.load_inode(dir_number).await? {
            Some(dir) if dir.is_dir() => dir,
            _ => return Ok(false),
        };

        let mut bytes = self.read_directory_bytes(&dir).await?;
        let range = match parse_entries(&bytes)
            .into_iter()
            .find(|(entry, _)| entry.name == name)
        {
            Some((_, range)) => range,
            None => return Ok(false),
        };

        bytes.drain(range);
        self.write_directory_bytes(&mut dir, &bytes).await?;

        log::debug!("unlinked {} from directory {}", name, dir_number);
        self.store_inode(dir_number, dir);
        Ok(true)
    }

    /// Inode number for `path`, or 0 if any component is missing or a
    /// non-final component is not a directory
    pub async fn lookup(&mut self, path: &str) -> Result<u64> {
        let mut current = ROOT_INODE;

        for component in path::components(path) {
            let dir = match self.load_inode(current).await? {
                Some(inode) if inode.is_dir() => inode,
                _ => return Ok(INVALID_INODE),
            };
            current = self.find_directory_entry(&dir, component).await?;
            if current == INVALID_INODE {
                return Ok(INVALID_INODE);
            }
        }

        Ok(current)
    }
}
