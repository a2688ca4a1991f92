//! Directory table headers and entries.

use deku::bitvec::{BitVec, Msb0};
use deku::prelude::*;

use crate::squashfs::metadata::TableWriter;

/// A run of entries sharing one header. `count` stores one less than the
/// number of entries that follow.
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirHeader {
    pub(crate) count: u32,
    pub(crate) start: u32,
    pub(crate) inode_num: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirEntryRaw {
    pub(crate) offset: u16,
    pub(crate) inode_offset: i16,
    pub(crate) t: u16,
    pub(crate) name_size: u16,
    #[deku(count = "*name_size + 1")]
    pub(crate) name: Vec<u8>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirectoryIndex {
    pub(crate) index: u32,
    pub(crate) start: u32,
    pub(crate) name_size: u32,
    #[deku(count = "*name_size + 1")]
    pub(crate) name: Vec<u8>,
}

/// One child of a directory being written: where its inode landed, its
/// inode number, its dirent type and its name.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub start: u32,
    pub offset: u16,
    pub inode_number: u32,
    pub t: u16,
    pub name: Vec<u8>,
}

/// A header is emitted whenever the start block of the referenced inodes
/// changes, a run reaches 256 entries, or an inode number no longer fits
/// the i16 delta against the run's base.
const MAX_RUN: usize = 256;

pub(crate) fn write_listing(entries: &mut Vec<Entry>, dir_table: &mut TableWriter) -> usize {
    entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));

    let mut written = 0usize;
    let mut i = 0;
    while i < entries.len() {
        let base = &entries[i];
        let (run_start, base_inode) = (base.start, base.inode_number);
        let mut n = 0;
        while i + n < entries.len() && n < MAX_RUN {
            let e = &entries[i + n];
            if e.start != run_start {
                break;
            }
            let delta = i64::from(e.inode_number) - i64::from(base_inode);
            if i16::try_from(delta).is_err() {
                break;
            }
            n += 1;
        }

        let header = DirHeader {
            count: (n - 1) as u32,
            start: run_start,
            inode_num: base_inode,
        };
        let mut bv = BitVec::<u8, Msb0>::new();
        header.write(&mut bv, ()).unwrap();
        for e in &entries[i..i + n] {
            let raw = DirEntryRaw {
                offset: e.offset,
                inode_offset: (i64::from(e.inode_number) - i64::from(base_inode)) as i16,
                t: e.t,
                name_size: e.name.len() as u16 - 1,
                name: e.name.clone(),
            };
            raw.write(&mut bv, ()).unwrap();
        }
        let bytes = bv.as_raw_slice();
        dir_table.write_all(bytes);
        written += bytes.len();
        i += n;
    }
    written
}
