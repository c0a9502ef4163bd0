//! Free-list over variable-size blocks in the resource file.
//!
//! This follows a first-fit walk ("a block fits if `free.size >= need`"),
//! not best-fit, despite occasional documentation calling it best-fit
//! elsewhere. Unlike the
//! tree's own free-list (`crate::freelist`, a simple LIFO stack of same-size
//! pages), blocks here vary in size and must split and coalesce, so each
//! `alloc`/`free` loads the whole chain into memory as `(offset, size)` pairs
//! and writes it back rather than mutating the on-disk links in place — an
//! asset catalog's free chain is expected to stay short, and this keeps
//! splitting and two-sided coalescing simple to get right.

use crate::block_io::BlockIo;
use crate::errors::Result;
use tracing::{debug, trace};

pub const FREE_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy)]
struct FreeHeader {
    size: u32,
    next: u64,
}

impl FreeHeader {
    fn encode(&self) -> [u8; FREE_HEADER_SIZE] {
        let mut buf = [0u8; FREE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..12].copy_from_slice(&self.next.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Self {
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let next = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        FreeHeader { size, next }
    }
}

fn read_free_header(io: &mut dyn BlockIo, offset: u64) -> Result<FreeHeader> {
    let mut buf = [0u8; FREE_HEADER_SIZE];
    io.seek(offset)?;
    io.read_exact(&mut buf)?;
    Ok(FreeHeader::decode(&buf))
}

fn write_free_header(io: &mut dyn BlockIo, offset: u64, header: FreeHeader) -> Result<()> {
    io.seek(offset)?;
    io.write_all(&header.encode())
}

fn read_chain(io: &mut dyn BlockIo, mut head: u64) -> Result<Vec<(u64, u32)>> {
    let mut entries = Vec::new();
    while head != 0 {
        let header = read_free_header(io, head)?;
        entries.push((head, header.size));
        head = header.next;
    }
    Ok(entries)
}

/// Rewrites the chain from scratch and returns the new head.
fn write_chain(io: &mut dyn BlockIo, entries: &[(u64, u32)]) -> Result<u64> {
    let mut next = 0u64;
    for &(offset, size) in entries.iter().rev() {
        write_free_header(io, offset, FreeHeader { size, next })?;
        next = offset;
    }
    Ok(next)
}

pub fn total_free_bytes(io: &mut dyn BlockIo, freelist_head: u64) -> Result<u64> {
    Ok(read_chain(io, freelist_head)?.iter().map(|&(_, size)| size as u64).sum())
}

/// First-fit allocation of a `need`-byte block. Returns `None` if nothing in
/// the chain fits; the caller grows the file itself in that case. The
/// returned size is the block actually consumed: `need` when the remainder
/// was split off and kept free, or the whole original block's size when the
/// leftover was too small to hold a `FreeHeader` and was handed out too —
/// callers must record this size in the used block's own header, or the
/// untracked tail bytes are lost to both the used region and the free-list.
pub fn alloc(io: &mut dyn BlockIo, freelist_head: &mut u64, need: u32) -> Result<Option<(u64, u32)>> {
    let mut entries = read_chain(io, *freelist_head)?;
    let pos = match entries.iter().position(|&(_, size)| size >= need) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let (offset, size) = entries.remove(pos);
    let (allocated, allocated_size) = if size - need <= FREE_HEADER_SIZE as u32 {
        (offset, size)
    } else {
        let remainder_size = size - need;
        entries.push((offset, remainder_size));
        (offset + remainder_size as u64, need)
    };
    *freelist_head = write_chain(io, &entries)?;
    trace!(allocated, allocated_size, need, "allocated blob block from free-list");
    Ok(Some((allocated, allocated_size)))
}

/// Releases `[offset, offset+size)`, coalescing with an immediately
/// adjacent predecessor and/or successor block before relinking.
pub fn free(io: &mut dyn BlockIo, freelist_head: &mut u64, offset: u64, size: u32) -> Result<()> {
    let mut entries = read_chain(io, *freelist_head)?;
    let mut merged_offset = offset;
    let mut merged_size = size;

    if let Some(pos) = entries.iter().position(|&(o, s)| o + s as u64 == merged_offset) {
        let (pred_offset, pred_size) = entries.remove(pos);
        merged_offset = pred_offset;
        merged_size += pred_size;
    }
    if let Some(pos) = entries.iter().position(|&(o, _)| merged_offset + merged_size as u64 == o) {
        let (_, succ_size) = entries.remove(pos);
        merged_size += succ_size;
    }
    entries.push((merged_offset, merged_size));
    *freelist_head = write_chain(io, &entries)?;
    debug!(merged_offset, merged_size, "freed blob block");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::FileBlockIo;

    #[test]
    fn allocates_first_fitting_block_and_splits_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileBlockIo::create(dir.path().join("blobs.1")).unwrap();
        io.write_all(&[0u8; 4096]).unwrap();

        let mut head = 0u64;
        write_free_header(&mut io, 32, FreeHeader { size: 100, next: head }).unwrap();
        head = 32;

        let (allocated, allocated_size) = alloc(&mut io, &mut head, 40).unwrap().unwrap();
        // remainder (100-40=60) kept low, allocation takes the high part.
        assert_eq!(allocated, 32 + 60);
        assert_eq!(allocated_size, 40);
        assert_eq!(head, 32);
        let remaining = read_chain(&mut io, head).unwrap();
        assert_eq!(remaining, vec![(32, 60)]);
    }

    #[test]
    fn alloc_returns_whole_block_size_when_remainder_too_small_to_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileBlockIo::create(dir.path().join("blobs.1")).unwrap();
        io.write_all(&[0u8; 4096]).unwrap();

        let mut head = 0u64;
        // remainder would be 45-40=5 bytes, too small for a FreeHeader (12).
        write_free_header(&mut io, 32, FreeHeader { size: 45, next: head }).unwrap();
        head = 32;

        let (allocated, allocated_size) = alloc(&mut io, &mut head, 40).unwrap().unwrap();
        assert_eq!(allocated, 32);
        assert_eq!(allocated_size, 45);
        assert_eq!(head, 0);
    }

    #[test]
    fn alloc_returns_none_when_nothing_fits() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileBlockIo::create(dir.path().join("blobs.1")).unwrap();
        io.write_all(&[0u8; 4096]).unwrap();
        let mut head = 0u64;
        write_free_header(&mut io, 32, FreeHeader { size: 10, next: 0 }).unwrap();
        head = 32;
        assert!(alloc(&mut io, &mut head, 40).unwrap().is_none());
    }

    #[test]
    fn free_coalesces_with_both_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileBlockIo::create(dir.path().join("blobs.1")).unwrap();
        io.write_all(&[0u8; 4096]).unwrap();

        // Free blocks at [32,52) and [100,120); freeing [52,100) should
        // merge all three into one [32,120) block.
        write_free_header(&mut io, 32, FreeHeader { size: 20, next: 100 }).unwrap();
        write_free_header(&mut io, 100, FreeHeader { size: 20, next: 0 }).unwrap();
        let mut head = 32u64;

        free(&mut io, &mut head, 52, 48).unwrap();

        let entries = read_chain(&mut io, head).unwrap();
        assert_eq!(entries, vec![(32, 88)]);
    }
}
