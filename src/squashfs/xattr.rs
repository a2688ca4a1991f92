//! Extended attribute tables.
//!
//! Xattrs live in two tables: the entry table holds runs of
//! name/value records, and the id table maps an inode's `xattr_index` to
//! the `(ref, count, size)` of its run. The id table is found through a
//! header at `superblock.xattr_table` which also records where the entry
//! table starts.

use std::io::{Read, Seek, SeekFrom, Write};

use deku::bitvec::{BitVec, Msb0};
use deku::prelude::*;

use crate::error::Error;
use crate::squashfs::metadata::{self, TableWriter, METADATA_MAXSIZE};

/// A single attribute as seen by callers, with the full name
/// (e.g. `security.capability`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Name prefixes are stored as a numeric type with the prefix stripped.
const PREFIXES: &[(u16, &str)] = &[(0, "user."), (1, "trusted."), (2, "security.")];

fn split_prefix(name: &str) -> Result<(u16, &str), Error> {
    for (kind, prefix) in PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            return Ok((*kind, rest));
        }
    }
    Err(Error::CorruptedSquashfs("xattr name prefix not user/trusted/security"))
}

fn join_prefix(kind: u16, rest: &[u8]) -> Result<String, Error> {
    let prefix = PREFIXES
        .iter()
        .find(|(k, _)| *k == kind & 0xff)
        .map(|(_, p)| *p)
        .ok_or(Error::CorruptedSquashfs("unknown xattr name prefix"))?;
    Ok(format!("{prefix}{}", std::str::from_utf8(rest)?))
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct XattrEntry {
    pub kind: u16,
    pub name_size: u16,
    #[deku(count = "*name_size")]
    pub name: Vec<u8>,
    pub value_size: u32,
    #[deku(count = "*value_size")]
    pub value: Vec<u8>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct XattrId {
    pub xattr: u64,
    pub count: u32,
    pub size: u32,
}

const XATTR_ID_SIZE: usize = 16;

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy)]
#[deku(endian = "little")]
pub(crate) struct XattrTableHeader {
    pub xattr_table_start: u64,
    pub xattr_ids: u32,
    pub unused: u32,
}

/// Accumulates xattr runs while an image is being written.
#[derive(Debug, Default)]
pub(crate) struct XattrWriter {
    entries: TableWriter,
    ids: Vec<XattrId>,
}

impl XattrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Store one inode's attributes, returning its xattr table index.
    pub fn add(&mut self, xattrs: &[Xattr]) -> Result<u32, Error> {
        let pos = self.entries.position();
        let mut size = 0u32;
        for x in xattrs {
            let (kind, rest) = split_prefix(&x.name)?;
            let entry = XattrEntry {
                kind,
                name_size: rest.len() as u16,
                name: rest.as_bytes().to_vec(),
                value_size: x.value.len() as u32,
                value: x.value.clone(),
            };
            let mut bv = BitVec::<u8, Msb0>::new();
            entry.write(&mut bv, ()).unwrap();
            let bytes = bv.as_raw_slice();
            self.entries.write_all(bytes);
            size += bytes.len() as u32;
        }
        let id = XattrId { xattr: self.entries.ref_at(pos), count: xattrs.len() as u32, size };
        self.ids.push(id);
        Ok(self.ids.len() as u32 - 1)
    }

    /// Write entry blocks, id blocks, then the header with its pointer
    /// list. Returns the header position for the superblock.
    pub fn finalize<W: Write + Seek>(&self, w: &mut W) -> Result<u64, Error> {
        let entries_start = w.stream_position()?;
        self.entries.finalize(w)?;

        let mut id_bytes = Vec::with_capacity(self.ids.len() * XATTR_ID_SIZE);
        for id in &self.ids {
            let mut bv = BitVec::<u8, Msb0>::new();
            id.write(&mut bv, ()).unwrap();
            id_bytes.extend_from_slice(bv.as_raw_slice());
        }
        let mut block_positions = vec![];
        for chunk in id_bytes.chunks(METADATA_MAXSIZE) {
            block_positions.push(w.stream_position()?);
            w.write_all(&metadata::set_uncompressed(chunk.len() as u16).to_le_bytes())?;
            w.write_all(chunk)?;
        }

        let header_pos = w.stream_position()?;
        let header = XattrTableHeader {
            xattr_table_start: entries_start,
            xattr_ids: self.ids.len() as u32,
            unused: 0,
        };
        let mut bv = BitVec::<u8, Msb0>::new();
        header.write(&mut bv, ()).unwrap();
        w.write_all(bv.as_raw_slice())?;
        for pos in block_positions {
            w.write_all(&pos.to_le_bytes())?;
        }
        Ok(header_pos)
    }
}

/// The decoded xattr tables of one image.
#[derive(Debug, Default)]
pub(crate) struct XattrTable {
    /// Start of the entry table on disk; entry refs are relative to it.
    entries_start: u64,
    entry_bytes: Vec<u8>,
    /// disk block offset (relative to `entries_start`) -> offset in `entry_bytes`
    block_offsets: Vec<(u64, usize)>,
    ids: Vec<XattrId>,
}

impl XattrTable {
    /// Parse the tables found at `header_pos` (`superblock.xattr_table`).
    pub fn read<R: Read + Seek>(r: &mut R, header_pos: u64) -> Result<Self, Error> {
        r.seek(SeekFrom::Start(header_pos))?;
        let mut head = [0u8; 16];
        r.read_exact(&mut head).map_err(|_| Error::Truncated("xattr table"))?;
        let (_, header) = XattrTableHeader::from_bytes((&head, 0))?;

        let id_byte_len = header.xattr_ids as usize * XATTR_ID_SIZE;
        let block_count = (id_byte_len + METADATA_MAXSIZE - 1) / METADATA_MAXSIZE;
        let mut pointers = vec![0u8; block_count * 8];
        r.read_exact(&mut pointers).map_err(|_| Error::Truncated("xattr table"))?;

        let mut id_bytes = vec![];
        for p in pointers.chunks_exact(8) {
            let pos = u64::from_le_bytes(p.try_into().unwrap());
            r.seek(SeekFrom::Start(pos))?;
            id_bytes.extend(metadata::read_block(r, "xattr id table")?);
        }
        let mut ids = Vec::with_capacity(header.xattr_ids as usize);
        let mut rest = &id_bytes[..];
        for _ in 0..header.xattr_ids {
            let ((r2, _), id) = XattrId::from_bytes((rest, 0))?;
            ids.push(id);
            rest = r2;
        }

        // entry blocks run from xattr_table_start up to the first id block
        let entries_end = pointers
            .chunks_exact(8)
            .map(|p| u64::from_le_bytes(p.try_into().unwrap()))
            .min()
            .unwrap_or(header_pos);
        let mut entry_bytes = vec![];
        let mut block_offsets = vec![];
        r.seek(SeekFrom::Start(header.xattr_table_start))?;
        let mut pos = header.xattr_table_start;
        while pos < entries_end {
            block_offsets.push((pos - header.xattr_table_start, entry_bytes.len()));
            let block = metadata::read_block(r, "xattr entries")?;
            pos += 2 + block.len() as u64;
            entry_bytes.extend(block);
        }

        Ok(Self { entries_start: header.xattr_table_start, entry_bytes, block_offsets, ids })
    }

    fn resolve_ref(&self, xattr_ref: u64) -> Result<usize, Error> {
        let block = crate::squashfs::ref_block(xattr_ref);
        let offset = crate::squashfs::ref_offset(xattr_ref);
        let base = self
            .block_offsets
            .iter()
            .find(|(disk, _)| *disk == block)
            .map(|(_, buf)| *buf)
            .ok_or(Error::CorruptedSquashfs("dangling xattr reference"))?;
        Ok(base + offset)
    }

    /// All attributes of the run at `index`, or an empty list for
    /// [`crate::squashfs::NO_XATTR`].
    pub fn list(&self, index: u32) -> Result<Vec<Xattr>, Error> {
        if index == crate::squashfs::NO_XATTR {
            return Ok(vec![]);
        }
        let id = self
            .ids
            .get(index as usize)
            .ok_or(Error::CorruptedSquashfs("xattr index out of range"))?;
        let mut out = Vec::with_capacity(id.count as usize);
        let start = self.resolve_ref(id.xattr)?;
        let mut rest = &self.entry_bytes[start..];
        for _ in 0..id.count {
            let ((r2, _), entry) = XattrEntry::from_bytes((rest, 0))?;
            out.push(Xattr { name: join_prefix(entry.kind, &entry.name)?, value: entry.value });
            rest = r2;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_prefix_split() {
        assert_eq!(split_prefix("security.capability").unwrap(), (2, "capability"));
        assert_eq!(split_prefix("user.foo").unwrap(), (0, "foo"));
        assert!(split_prefix("system.posix_acl_access").is_err());
    }

    #[test]
    fn test_xattr_roundtrip() {
        let mut w = XattrWriter::new();
        let attrs = vec![
            Xattr::new("security.capability", vec![1u8, 2, 3]),
            Xattr::new("user.note", b"hi".to_vec()),
        ];
        let idx = w.add(&attrs).unwrap();
        assert_eq!(idx, 0);

        let mut cur = Cursor::new(vec![]);
        let header_pos = w.finalize(&mut cur).unwrap();
        let table = XattrTable::read(&mut cur, header_pos).unwrap();
        assert_eq!(table.list(idx).unwrap(), attrs);
        assert_eq!(table.list(crate::squashfs::NO_XATTR).unwrap(), vec![]);
    }
}
