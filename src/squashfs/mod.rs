//! Reading and writing of the package image format.
//!
//! Images are squashfs v4.0, little endian, with every metadata and data
//! block stored uncompressed so the kernel can page-cache the file and the
//! reader never has to inflate anything. Any compliant squashfs reader can
//! mount an image produced by [`Writer`]; [`Reader`] in turn reads images
//! produced by `mksquashfs` as long as they are uncompressed and do not use
//! fragments.

pub mod dir;
pub mod id;
pub mod inode;
pub mod metadata;
pub mod reader;
pub mod writer;
pub mod xattr;

use deku::prelude::*;

pub use reader::{DirEntry, FileInfo, FileKind, FileReader, Reader};
pub use writer::{Directory, FileWriter, Writer};
pub use xattr::Xattr;

pub const MAGIC: u32 = 0x73717368;
pub const BLOCK_SIZE: u32 = 0x20000;
pub const BLOCK_LOG: u16 = 17;
/// Images are padded so the whole file is page-cacheable.
pub const PAD_SIZE: u64 = 4096;
/// Data block size word bit signalling an uncompressed block.
pub const DATA_UNCOMPRESSED: u32 = 1 << 24;
/// "no entry" marker for the fragment/export/xattr table pointers.
pub const NO_TABLE: u64 = !0;
pub const NO_FRAGMENT: u32 = 0xffff_ffff;
pub const NO_XATTR: u32 = 0xffff_ffff;

/// Compressor ids as defined by the format. The writer always stores
/// uncompressed blocks but a valid compressor id is still required in the
/// superblock; `mksquashfs -noI -noD` behaves the same way.
pub const COMPRESSOR_GZIP: u16 = 1;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SuperBlock {
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: u16,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

pub const SUPERBLOCK_SIZE: usize = 96;

#[rustfmt::skip]
pub enum Flags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    Unused                      = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed         = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NFSExportTableExists        = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}

impl SuperBlock {
    pub(crate) fn new(mod_time: u32) -> Self {
        Self {
            magic: MAGIC,
            inode_count: 0,
            mod_time,
            block_size: BLOCK_SIZE,
            frag_count: 0,
            compressor: COMPRESSOR_GZIP,
            block_log: BLOCK_LOG,
            flags: Flags::InodesStoredUncompressed as u16
                | Flags::DataBlockStoredUncompressed as u16
                | Flags::FragmentsStoredUncompressed as u16
                | Flags::FragmentsAreNotUsed as u16
                | Flags::XattrsAreStoredUncompressed as u16
                | Flags::NoXattrsInArchive as u16,
            id_count: 0,
            version_major: 4,
            version_minor: 0,
            root_inode: 0,
            bytes_used: 0,
            id_table: NO_TABLE,
            xattr_table: NO_TABLE,
            inode_table: 0,
            dir_table: 0,
            frag_table: NO_TABLE,
            export_table: NO_TABLE,
        }
    }

    pub fn inodes_uncompressed(&self) -> bool {
        self.flags & Flags::InodesStoredUncompressed as u16 != 0
    }

    pub fn fragments_are_not_used(&self) -> bool {
        self.flags & Flags::FragmentsAreNotUsed as u16 != 0
    }

    pub fn no_xattrs_in_archive(&self) -> bool {
        self.flags & Flags::NoXattrsInArchive as u16 != 0
    }
}

/// Inode references pack `(byte offset of the metadata block within its
/// table) << 16 | (offset within the uncompressed block)`. This is the
/// external inode identifier used by the rest of the system.
pub(crate) fn ref_block(inode_ref: u64) -> u64 {
    inode_ref >> 16
}

pub(crate) fn ref_offset(inode_ref: u64) -> usize {
    (inode_ref & 0xffff) as usize
}

pub(crate) fn make_ref(block: u64, offset: usize) -> u64 {
    (block << 16) | offset as u64
}
