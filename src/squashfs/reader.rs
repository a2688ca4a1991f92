//! The image decoder.
//!
//! [`Reader::new`] parses the superblock and slurps the (small,
//! uncompressed) metadata tables into memory, so every subsequent
//! metadata operation is seek-free; only file contents go back to the
//! underlying source. Inodes are addressed by their
//! `(block << 16) | offset` reference, which is stable for the lifetime
//! of the image and is the identifier the overlay hands to the kernel.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use deku::bitvec::{BitView, Msb0};
use deku::prelude::*;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::Error;
use crate::squashfs::inode::{Inode, InodeInner};
use crate::squashfs::xattr::{Xattr, XattrTable};
use crate::squashfs::{
    self, dir, metadata, SuperBlock, MAGIC, NO_FRAGMENT, NO_TABLE, NO_XATTR, SUPERBLOCK_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// What `stat` returns: enough to fill a `struct stat` plus the inode's
/// own number.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub inode_number: u32,
    pub size: u64,
    /// Type and permission bits, setuid included.
    pub mode: u32,
    pub mtime: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub kind: FileKind,
    pub(crate) xattr_index: u32,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_ref: u64,
    pub inode_number: u32,
    pub kind: FileKind,
}

/// One decoded metadata table: the concatenated uncompressed payloads and
/// a map from on-disk block offset to position in the buffer.
#[derive(Debug, Default)]
struct Table {
    bytes: Vec<u8>,
    blocks: FxHashMap<u64, usize>,
}

impl Table {
    fn slurp<R: Read + Seek>(
        io: &mut R,
        start: u64,
        end: u64,
        name: &'static str,
    ) -> Result<Self, Error> {
        let mut table = Table::default();
        io.seek(SeekFrom::Start(start))?;
        let mut pos = start;
        while pos < end {
            table.blocks.insert(pos - start, table.bytes.len());
            let block = metadata::read_block(io, name)?;
            pos += 2 + block.len() as u64;
            table.bytes.extend(block);
        }
        Ok(table)
    }

    fn resolve(&self, block: u64, offset: usize) -> Option<usize> {
        let base = *self.blocks.get(&block)?;
        let pos = base + offset;
        (pos <= self.bytes.len()).then_some(pos)
    }
}

pub struct Reader<R: Read + Seek> {
    io: R,
    sb: SuperBlock,
    inodes: Table,
    dirs: Table,
    xattrs: Option<XattrTable>,
    ids: Vec<squashfs::id::Id>,
}

impl<R: Read + Seek> Reader<R> {
    pub fn new(mut io: R) -> Result<Self, Error> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        io.seek(SeekFrom::Start(0))?;
        io.read_exact(&mut raw).map_err(|_| Error::Truncated("superblock"))?;
        let (_, sb) = SuperBlock::from_bytes((&raw, 0))?;
        if sb.magic != MAGIC {
            return Err(Error::BadMagic);
        }
        if (sb.version_major, sb.version_minor) != (4, 0) {
            return Err(Error::UnsupportedVersion(sb.version_major, sb.version_minor));
        }
        trace!(
            inode_table = sb.inode_table,
            dir_table = sb.dir_table,
            inode_count = sb.inode_count,
            "superblock"
        );

        let inodes = Table::slurp(&mut io, sb.inode_table, sb.dir_table, "inode table")?;
        let dir_end = dir_table_end(&mut io, &sb)?;
        let dirs = Table::slurp(&mut io, sb.dir_table, dir_end, "directory table")?;

        let xattrs = if sb.xattr_table != NO_TABLE {
            Some(XattrTable::read(&mut io, sb.xattr_table)?)
        } else {
            None
        };

        let ids = if sb.id_count > 0 {
            squashfs::id::read_id_table(&mut io, sb.id_table, sb.id_count)?
        } else {
            vec![]
        };

        Ok(Self { io, sb, inodes, dirs, xattrs, ids })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// The root directory's inode reference.
    pub fn root_ref(&self) -> u64 {
        self.sb.root_inode
    }

    fn inode(&self, inode_ref: u64) -> Result<Inode, Error> {
        let pos = self
            .inodes
            .resolve(squashfs::ref_block(inode_ref), squashfs::ref_offset(inode_ref))
            .ok_or(Error::UnexpectedInode(inode_ref))?;
        if pos + 2 > self.inodes.bytes.len() {
            return Err(Error::Truncated("inode table"));
        }
        let type_raw = u16::from_le_bytes([self.inodes.bytes[pos], self.inodes.bytes[pos + 1]]);
        if !matches!(type_raw, 1 | 2 | 3 | 8 | 9) {
            return Err(Error::UnsupportedInode(type_raw));
        }
        let bits = self.inodes.bytes.view_bits::<Msb0>();
        let (_, inode) = Inode::read(&bits[pos * 8..], (self.sb.block_size, self.sb.block_log))?;
        Ok(inode)
    }

    pub fn stat(&self, inode_ref: u64) -> Result<FileInfo, Error> {
        let inode = self.inode(inode_ref)?;
        let uid = self.ids.get(inode.header.uid as usize).map(|id| id.num).unwrap_or(0);
        let gid = self.ids.get(inode.header.gid as usize).map(|id| id.num).unwrap_or(0);
        let (kind, size, nlink, xattr_index) = match &inode.inner {
            InodeInner::BasicDirectory(d) => {
                (FileKind::Directory, u64::from(d.file_size), d.link_count, NO_XATTR)
            }
            InodeInner::ExtendedDirectory(d) => {
                (FileKind::Directory, u64::from(d.file_size), d.link_count, d.xattr_index)
            }
            InodeInner::BasicFile(f) => (FileKind::File, u64::from(f.file_size), 1, NO_XATTR),
            InodeInner::ExtendedFile(f) => {
                (FileKind::File, f.file_size, f.link_count, f.xattr_index)
            }
            InodeInner::BasicSymlink(s) => {
                (FileKind::Symlink, u64::from(s.target_size), s.link_count, NO_XATTR)
            }
        };
        let type_bits = match kind {
            FileKind::Directory => libc::S_IFDIR,
            FileKind::File => libc::S_IFREG,
            FileKind::Symlink => libc::S_IFLNK,
        };
        Ok(FileInfo {
            inode_number: inode.header.inode_number,
            size,
            mode: type_bits | u32::from(inode.header.permissions),
            mtime: inode.header.mtime,
            nlink,
            uid,
            gid,
            kind,
            xattr_index,
        })
    }

    /// Children of a directory, in the order they are stored.
    pub fn readdir(&self, inode_ref: u64) -> Result<Vec<DirEntry>, Error> {
        let inode = self.inode(inode_ref)?;
        let (block_index, block_offset, file_size) = match &inode.inner {
            InodeInner::BasicDirectory(d) => {
                (u64::from(d.block_index), usize::from(d.block_offset), u64::from(d.file_size))
            }
            InodeInner::ExtendedDirectory(d) => {
                (u64::from(d.block_index), usize::from(d.block_offset), u64::from(d.file_size))
            }
            _ => return Err(Error::UnexpectedInode(inode_ref)),
        };
        // an empty directory is stored with the 3 byte "." / ".." offset only
        if file_size <= 3 {
            return Ok(vec![]);
        }
        let listing_len = (file_size - 3) as usize;
        let start = self
            .dirs
            .resolve(block_index, block_offset)
            .ok_or(Error::CorruptedSquashfs("directory listing outside directory table"))?;
        if start + listing_len > self.dirs.bytes.len() {
            return Err(Error::Truncated("directory table"));
        }

        let bits = self.dirs.bytes.view_bits::<Msb0>();
        let end_bit = (start + listing_len) * 8;
        let mut rest = &bits[start * 8..end_bit];
        let mut entries = vec![];
        while !rest.is_empty() {
            let (r2, header) = dir::DirHeader::read(rest, ())?;
            rest = r2;
            for _ in 0..=header.count {
                let (r3, raw) = dir::DirEntryRaw::read(rest, ())?;
                rest = r3;
                let kind = match raw.t {
                    1 | 8 => FileKind::Directory,
                    2 | 9 => FileKind::File,
                    3 | 10 => FileKind::Symlink,
                    t => return Err(Error::UnsupportedInode(t)),
                };
                entries.push(DirEntry {
                    name: String::from_utf8(raw.name)?,
                    inode_ref: squashfs::make_ref(u64::from(header.start), raw.offset as usize),
                    inode_number: (i64::from(header.inode_num) + i64::from(raw.inode_offset))
                        as u32,
                    kind,
                });
            }
        }
        Ok(entries)
    }

    /// The symlink target, as stored; never resolved.
    pub fn readlink(&self, inode_ref: u64) -> Result<PathBuf, Error> {
        let inode = self.inode(inode_ref)?;
        match inode.inner {
            InodeInner::BasicSymlink(s) => {
                Ok(PathBuf::from(String::from_utf8(s.target_path)?))
            }
            _ => Err(Error::UnexpectedInode(inode_ref)),
        }
    }

    /// Walk `path` (relative to the image root) to an inode reference.
    pub fn lookup_path<P: AsRef<Path>>(&self, path: P) -> Result<u64, Error> {
        let mut cur = self.root_ref();
        for comp in path.as_ref().components() {
            let name = match comp {
                Component::Normal(n) => n.to_str().ok_or(Error::NotFound)?,
                Component::RootDir | Component::CurDir => continue,
                _ => return Err(Error::NotFound),
            };
            cur = self
                .readdir(cur)?
                .into_iter()
                .find(|e| e.name == name)
                .map(|e| e.inode_ref)
                .ok_or(Error::NotFound)?;
        }
        Ok(cur)
    }

    /// A positioned reader over a regular file's contents.
    pub fn file_reader(&mut self, inode_ref: u64) -> Result<FileReader<'_, R>, Error> {
        let inode = self.inode(inode_ref)?;
        let (blocks_start, file_size, frag_index, block_sizes) = match inode.inner {
            InodeInner::BasicFile(f) => {
                (u64::from(f.blocks_start), u64::from(f.file_size), f.frag_index, f.block_sizes)
            }
            InodeInner::ExtendedFile(f) => {
                (f.blocks_start, f.file_size, f.frag_index, f.block_sizes)
            }
            _ => return Err(Error::UnexpectedInode(inode_ref)),
        };
        if frag_index != NO_FRAGMENT {
            return Err(Error::CorruptedSquashfs("file uses fragments"));
        }
        for word in &block_sizes {
            if word & squashfs::DATA_UNCOMPRESSED == 0 {
                return Err(Error::Compressed("data"));
            }
        }
        Ok(FileReader { io: &mut self.io, start: blocks_start, size: file_size })
    }

    pub fn list_xattrs(&self, inode_ref: u64) -> Result<Vec<Xattr>, Error> {
        let info = self.stat(inode_ref)?;
        match &self.xattrs {
            Some(table) => table.list(info.xattr_index),
            None => Ok(vec![]),
        }
    }

    pub fn get_xattr(&self, inode_ref: u64, name: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .list_xattrs(inode_ref)?
            .into_iter()
            .find(|x| x.name == name)
            .map(|x| x.value))
    }
}

/// Positioned reads over one regular file. Contents are stored
/// uncompressed and contiguous, so a read is a single seek.
pub struct FileReader<'a, R: Read + Seek> {
    io: &'a mut R,
    start: u64,
    size: u64,
}

impl<R: Read + Seek> FileReader<'_, R> {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = usize::try_from((self.size - offset).min(buf.len() as u64)).unwrap();
        self.io.seek(SeekFrom::Start(self.start + offset))?;
        self.io
            .read_exact(&mut buf[..n])
            .map_err(|_| Error::Truncated("file data"))?;
        Ok(n)
    }

    /// Read the whole file. Convenience for small files.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; usize::try_from(self.size).unwrap()];
        self.read_at(&mut buf, 0)?;
        Ok(buf)
    }
}

/// The directory table has no explicit length; it ends where the next
/// table's first metadata block begins. Each candidate section stores a
/// pointer list, so the earliest pointed-at block bounds the directory
/// table.
fn dir_table_end<R: Read + Seek>(io: &mut R, sb: &SuperBlock) -> Result<u64, Error> {
    let mut end = u64::MAX;

    let mut pointer_at = |io: &mut R, pos: u64| -> Result<u64, Error> {
        io.seek(SeekFrom::Start(pos))?;
        let mut buf = [0u8; 8];
        io.read_exact(&mut buf).map_err(|_| Error::Truncated("table pointer"))?;
        Ok(u64::from_le_bytes(buf))
    };

    if sb.frag_count > 0 && sb.frag_table != NO_TABLE {
        end = end.min(pointer_at(io, sb.frag_table)?);
    }
    if sb.export_table != NO_TABLE {
        end = end.min(pointer_at(io, sb.export_table)?);
    }
    if sb.xattr_table != NO_TABLE {
        io.seek(SeekFrom::Start(sb.xattr_table))?;
        let mut buf = [0u8; 8];
        io.read_exact(&mut buf).map_err(|_| Error::Truncated("xattr table"))?;
        end = end.min(u64::from_le_bytes(buf));
    }
    if sb.id_count > 0 && sb.id_table != NO_TABLE {
        end = end.min(pointer_at(io, sb.id_table)?);
    }

    if end == u64::MAX || end < sb.dir_table {
        return Err(Error::CorruptedSquashfs("cannot bound directory table"));
    }
    Ok(end)
}
