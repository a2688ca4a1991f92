//! The uid/gid lookup table.
//!
//! Every file in an image is owned by root, so the table always has
//! exactly one entry and every inode stores index 0.

use std::io::{Read, Seek, SeekFrom, Write};

use deku::prelude::*;

use crate::error::Error;
use crate::squashfs::metadata;

/// 32 bit user and group IDs
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Id {
    pub num: u32,
}

impl Id {
    pub fn root() -> Vec<Id> {
        vec![Id { num: 0 }]
    }
}

/// Write the id table: one metadata block holding the ids, then the list
/// of u64 pointers to those blocks, which is what the superblock points at.
pub(crate) fn write_id_table<W: Write + Seek>(
    w: &mut W,
    ids: &[Id],
) -> Result<(u64, u16), Error> {
    let block_pos = w.stream_position()?;
    let mut bytes = Vec::with_capacity(ids.len() * 4);
    for id in ids {
        bytes.extend_from_slice(&id.num.to_le_bytes());
    }
    w.write_all(&metadata::set_uncompressed(bytes.len() as u16).to_le_bytes())?;
    w.write_all(&bytes)?;

    let table_pos = w.stream_position()?;
    w.write_all(&block_pos.to_le_bytes())?;
    Ok((table_pos, ids.len() as u16))
}

/// Read the id table back: follow the pointer list, then parse each block.
pub(crate) fn read_id_table<R: Read + Seek>(
    r: &mut R,
    table_start: u64,
    id_count: u16,
) -> Result<Vec<Id>, Error> {
    let byte_len = id_count as usize * 4;
    let block_count = (byte_len + metadata::METADATA_MAXSIZE - 1) / metadata::METADATA_MAXSIZE;
    r.seek(SeekFrom::Start(table_start))?;
    let mut pointers = vec![0u8; block_count * 8];
    r.read_exact(&mut pointers)
        .map_err(|_| Error::Truncated("id table"))?;

    let mut bytes = vec![];
    for p in pointers.chunks_exact(8) {
        let pos = u64::from_le_bytes(p.try_into().unwrap());
        r.seek(SeekFrom::Start(pos))?;
        bytes.extend(metadata::read_block(r, "id table")?);
    }

    let mut ids = Vec::with_capacity(id_count as usize);
    for chunk in bytes.chunks_exact(4).take(id_count as usize) {
        ids.push(Id { num: u32::from_le_bytes(chunk.try_into().unwrap()) });
    }
    if ids.len() != id_count as usize {
        return Err(Error::Truncated("id table"));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_id_table_roundtrip() {
        let mut cur = Cursor::new(vec![]);
        let (table_pos, count) = write_id_table(&mut cur, &Id::root()).unwrap();
        assert_eq!(count, 1);
        let ids = read_id_table(&mut cur, table_pos, count).unwrap();
        assert_eq!(ids, Id::root());
    }
}
