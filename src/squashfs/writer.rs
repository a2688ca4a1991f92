//! The image encoder.
//!
//! File contents stream straight to the output as they are written; the
//! inode, directory, id and xattr tables are buffered and written by
//! [`Writer::finish`], which then rewrites the superblock in place and
//! pads the image to a page boundary.
//!
//! The builder surface mirrors how images are produced: obtain the root
//! with [`Writer::root`], add children, then flush each directory exactly
//! once, innermost first. The borrow checker enforces that a directory
//! cannot gain children after one of its subdirectories is still being
//! built, and `flush` consumes the builder so late additions are
//! impossible.

use std::io::{Seek, SeekFrom, Write};

use deku::prelude::*;
use tracing::trace;

use crate::error::Error;
use crate::squashfs::dir::{self, Entry};
use crate::squashfs::id::{self, Id};
use crate::squashfs::inode::{
    BasicSymlink, ExtendedDirectory, ExtendedFile, Inode, InodeHeader, InodeId, InodeInner,
};
use crate::squashfs::metadata::TableWriter;
use crate::squashfs::xattr::{Xattr, XattrWriter};
use crate::squashfs::{
    self, Flags, SuperBlock, BLOCK_SIZE, NO_FRAGMENT, NO_XATTR, PAD_SIZE, SUPERBLOCK_SIZE,
};

struct Shared<W: Write + Seek> {
    out: W,
    inode_table: TableWriter,
    dir_table: TableWriter,
    xattrs: XattrWriter,
    next_inode: u32,
    /// `(inode ref, inode number)` of the flushed root directory.
    root: Option<(u64, u32)>,
}

impl<W: Write + Seek> Shared<W> {
    fn alloc_inode(&mut self) -> u32 {
        let n = self.next_inode;
        self.next_inode += 1;
        n
    }
}

pub struct Writer<W: Write + Seek> {
    shared: Shared<W>,
    root_sink: Vec<Entry>,
    root_taken: bool,
    mod_time: u32,
}

impl<W: Write + Seek> Writer<W> {
    /// Start a new image. The superblock slot is written immediately so
    /// file data can stream behind it.
    pub fn new(mut out: W, mod_time: u32) -> Result<Self, Error> {
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&[0u8; SUPERBLOCK_SIZE])?;
        Ok(Self {
            shared: Shared {
                out,
                inode_table: TableWriter::new(),
                dir_table: TableWriter::new(),
                xattrs: XattrWriter::new(),
                next_inode: 1,
                root: None,
            },
            root_sink: vec![],
            root_taken: false,
            mod_time,
        })
    }

    /// The root directory builder. Must be taken exactly once.
    pub fn root(&mut self, mtime: u32) -> Directory<'_, W> {
        if self.root_taken {
            panic!("root directory taken twice");
        }
        self.root_taken = true;
        let inode_number = self.shared.alloc_inode();
        Directory {
            shared: &mut self.shared,
            parent: &mut self.root_sink,
            name: b"/".to_vec(),
            mtime,
            mode: 0o755,
            inode_number,
            parent_inode_number: 0,
            entries: vec![],
            subdirs: 0,
        }
    }

    /// Write the metadata tables and the final superblock. Returns the
    /// total image size including padding.
    pub fn finish(mut self) -> Result<u64, Error> {
        let (root_ref, _) = self
            .shared
            .root
            .ok_or(Error::CorruptedSquashfs("root directory was not flushed"))?;

        let mut sb = SuperBlock::new(self.mod_time);
        sb.inode_count = self.shared.next_inode - 1;
        sb.root_inode = root_ref;

        let out = &mut self.shared.out;
        sb.inode_table = out.stream_position()?;
        self.shared.inode_table.finalize(out)?;

        sb.dir_table = out.stream_position()?;
        self.shared.dir_table.finalize(out)?;

        let (id_table, id_count) = id::write_id_table(out, &Id::root())?;
        sb.id_table = id_table;
        sb.id_count = id_count;

        if !self.shared.xattrs.is_empty() {
            sb.xattr_table = self.shared.xattrs.finalize(out)?;
            sb.flags &= !(Flags::NoXattrsInArchive as u16);
        }

        sb.bytes_used = out.stream_position()?;

        // Pad so the kernel can page-cache the whole image.
        let total = (sb.bytes_used + PAD_SIZE - 1) / PAD_SIZE * PAD_SIZE;
        let zeros = [0u8; 1024];
        let mut pos = sb.bytes_used;
        while pos < total {
            let n = usize::try_from((total - pos).min(zeros.len() as u64)).unwrap();
            out.write_all(&zeros[..n])?;
            pos += n as u64;
        }

        out.rewind()?;
        let raw = sb.to_bytes()?;
        out.write_all(&raw)?;
        out.flush()?;
        trace!(bytes_used = sb.bytes_used, total, inodes = sb.inode_count, "image finished");
        Ok(total)
    }
}

/// Builder for one directory of the image being written.
pub struct Directory<'a, W: Write + Seek> {
    shared: &'a mut Shared<W>,
    parent: &'a mut Vec<Entry>,
    name: Vec<u8>,
    mtime: u32,
    mode: u16,
    inode_number: u32,
    parent_inode_number: u32,
    entries: Vec<Entry>,
    subdirs: u32,
}

impl<'a, W: Write + Seek> Directory<'a, W> {
    /// Add a subdirectory. The returned builder must be flushed before
    /// this directory is used again.
    pub fn directory(&mut self, name: &str, mtime: u32) -> Directory<'_, W> {
        let inode_number = self.shared.alloc_inode();
        self.subdirs += 1;
        Directory {
            shared: &mut *self.shared,
            parent: &mut self.entries,
            name: name.as_bytes().to_vec(),
            mtime,
            mode: 0o755,
            inode_number,
            parent_inode_number: self.inode_number,
            entries: vec![],
            subdirs: 0,
        }
    }

    /// Add a regular file; contents are streamed through the returned
    /// writer, which must be finished.
    pub fn file(
        &mut self,
        name: &str,
        mtime: u32,
        mode: u16,
        xattrs: &[Xattr],
    ) -> Result<FileWriter<'_, W>, Error> {
        let xattr_index =
            if xattrs.is_empty() { NO_XATTR } else { self.shared.xattrs.add(xattrs)? };
        let inode_number = self.shared.alloc_inode();
        let blocks_start = self.shared.out.stream_position()?;
        Ok(FileWriter {
            shared: &mut *self.shared,
            parent: &mut self.entries,
            name: name.as_bytes().to_vec(),
            mtime,
            mode,
            xattr_index,
            inode_number,
            blocks_start,
            block_sizes: vec![],
            buf: Vec::with_capacity(BLOCK_SIZE as usize),
            size: 0,
        })
    }

    /// Add a symlink named `newname` pointing at `oldname`.
    pub fn symlink(
        &mut self,
        oldname: &str,
        newname: &str,
        mtime: u32,
        mode: u16,
    ) -> Result<(), Error> {
        let inode_number = self.shared.alloc_inode();
        let target = oldname.as_bytes();
        let inode = Inode {
            id: InodeId::BasicSymlink,
            header: InodeHeader { permissions: mode, uid: 0, gid: 0, mtime, inode_number },
            inner: InodeInner::BasicSymlink(BasicSymlink {
                link_count: 1,
                target_size: target.len() as u32,
                target_path: target.to_vec(),
            }),
        };
        let iref = inode.to_table(&mut self.shared.inode_table);
        self.entries.push(Entry {
            start: squashfs::ref_block(iref) as u32,
            offset: squashfs::ref_offset(iref) as u16,
            inode_number,
            t: InodeId::BasicSymlink.dirent_type(),
            name: newname.as_bytes().to_vec(),
        });
        Ok(())
    }

    /// Write this directory's listing and inode. Children must all have
    /// been added (and flushed) first.
    pub fn flush(mut self) -> Result<(), Error> {
        let listing_pos = self.shared.dir_table.position();
        let listing_ref = self.shared.dir_table.ref_at(listing_pos);
        let listing_len = dir::write_listing(&mut self.entries, &mut self.shared.dir_table);

        // the root's parent points past the last inode, per convention
        let parent_inode = if self.parent_inode_number == 0 {
            self.inode_number + 1
        } else {
            self.parent_inode_number
        };
        let inode = Inode {
            id: InodeId::ExtendedDirectory,
            header: InodeHeader {
                permissions: self.mode,
                uid: 0,
                gid: 0,
                mtime: self.mtime,
                inode_number: self.inode_number,
            },
            inner: InodeInner::ExtendedDirectory(ExtendedDirectory {
                link_count: 2 + self.subdirs,
                file_size: listing_len as u32 + 3,
                block_index: squashfs::ref_block(listing_ref) as u32,
                parent_inode,
                index_count: 0,
                block_offset: squashfs::ref_offset(listing_ref) as u16,
                xattr_index: NO_XATTR,
                dir_index: vec![],
            }),
        };
        let iref = inode.to_table(&mut self.shared.inode_table);
        if self.parent_inode_number == 0 {
            self.shared.root = Some((iref, self.inode_number));
        } else {
            self.parent.push(Entry {
                start: squashfs::ref_block(iref) as u32,
                offset: squashfs::ref_offset(iref) as u16,
                inode_number: self.inode_number,
                t: InodeId::ExtendedDirectory.dirent_type(),
                name: self.name,
            });
        }
        Ok(())
    }
}

/// Streams one regular file's contents into the image in 128 KiB blocks.
pub struct FileWriter<'a, W: Write + Seek> {
    shared: &'a mut Shared<W>,
    parent: &'a mut Vec<Entry>,
    name: Vec<u8>,
    mtime: u32,
    mode: u16,
    xattr_index: u32,
    inode_number: u32,
    blocks_start: u64,
    block_sizes: Vec<u32>,
    buf: Vec<u8>,
    size: u64,
}

impl<W: Write + Seek> FileWriter<'_, W> {
    fn flush_block(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.shared.out.write_all(&self.buf)?;
        self.block_sizes.push(self.buf.len() as u32 | squashfs::DATA_UNCOMPRESSED);
        self.buf.clear();
        Ok(())
    }

    /// Record the inode and directory entry. Must be called exactly once.
    pub fn finish(mut self) -> Result<(), Error> {
        self.flush_block()?;
        let inode = Inode {
            id: InodeId::ExtendedFile,
            header: InodeHeader {
                permissions: self.mode,
                uid: 0,
                gid: 0,
                mtime: self.mtime,
                inode_number: self.inode_number,
            },
            inner: InodeInner::ExtendedFile(ExtendedFile {
                blocks_start: self.blocks_start,
                file_size: self.size,
                sparse: 0,
                link_count: 1,
                frag_index: NO_FRAGMENT,
                block_offset: 0,
                xattr_index: self.xattr_index,
                block_sizes: std::mem::take(&mut self.block_sizes),
            }),
        };
        let iref = inode.to_table(&mut self.shared.inode_table);
        self.parent.push(Entry {
            start: squashfs::ref_block(iref) as u32,
            offset: squashfs::ref_offset(iref) as u16,
            inode_number: self.inode_number,
            t: InodeId::ExtendedFile.dirent_type(),
            name: std::mem::take(&mut self.name),
        });
        Ok(())
    }
}

impl<W: Write + Seek> Write for FileWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = BLOCK_SIZE as usize - self.buf.len();
            let n = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.buf.len() == BLOCK_SIZE as usize {
                self.flush_block()?;
            }
        }
        self.size += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squashfs::Reader;
    use std::io::Cursor;

    #[test]
    fn test_write_read_minimal() {
        let mut cur = Cursor::new(vec![]);
        let mut w = Writer::new(&mut cur, 1577836800).unwrap();
        let mut root = w.root(1577836800);
        let mut fw = root.file("hello.txt", 1577836800, 0o644, &[]).unwrap();
        fw.write_all(b"hi\n").unwrap();
        fw.finish().unwrap();
        root.flush().unwrap();
        let total = w.finish().unwrap();
        assert_eq!(total % PAD_SIZE, 0);
        assert_eq!(total, cur.get_ref().len() as u64);

        let rdr = Reader::new(cur).unwrap();
        let ino = rdr.lookup_path("hello.txt").unwrap();
        let info = rdr.stat(ino).unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(info.mode & 0o7777, 0o644);
    }

    #[test]
    fn test_empty_directory_size() {
        let mut cur = Cursor::new(vec![]);
        let mut w = Writer::new(&mut cur, 0).unwrap();
        let mut root = w.root(0);
        let sub = root.directory("empty", 0);
        sub.flush().unwrap();
        root.flush().unwrap();
        w.finish().unwrap();

        let rdr = Reader::new(cur).unwrap();
        let ino = rdr.lookup_path("empty").unwrap();
        assert_eq!(rdr.stat(ino).unwrap().size, 3);
        assert!(rdr.readdir(ino).unwrap().is_empty());
    }
}
