//! Tree node free-list: released index-file pages.

use crate::block_io::BlockIo;
use crate::cache::NodeCache;
use crate::errors::Result;
use crate::node::Node;
use crate::page::{IndexHeader, NDX_POS_SIZE, PAGE_SIZE};
use tracing::debug;

/// Allocates a page for a new node: unlinks the free-list head if one
/// exists, otherwise extends the file by one zeroed page.
pub fn alloc_node(
    header: &mut IndexHeader,
    io: &mut dyn BlockIo,
    cache: &mut NodeCache,
) -> Result<u64> {
    let offset = if header.freelist != 0 {
        let off = header.freelist as u64;
        let mut buf = [0u8; NDX_POS_SIZE];
        io.seek(off)?;
        io.read_exact(&mut buf)?;
        header.freelist = u32::from_le_bytes(buf);
        debug!(offset = off, "reused free-list page");
        off
    } else {
        let off = header.eof as u64;
        io.seek(off)?;
        io.write_all(&[0u8; PAGE_SIZE])?;
        header.eof = header
            .eof
            .checked_add(PAGE_SIZE as u32)
            .ok_or_else(|| err!(Corrupt, "index file grew past u32 offset range"))?;
        debug!(offset = off, "extended index file for new page");
        off
    };
    cache.insert(Node::new_leaf(offset), io)?;
    Ok(offset)
}

/// Releases a node's page back onto the free-list without writing its
/// contents back to disk (they are about to be overwritten with a
/// free-list link anyway).
pub fn free_node(
    header: &mut IndexHeader,
    offset: u64,
    io: &mut dyn BlockIo,
    cache: &mut NodeCache,
) -> Result<()> {
    cache.evict_without_writeback(offset);
    io.seek(offset)?;
    io.write_all(&header.freelist.to_le_bytes())?;
    header.freelist = offset as u32;
    debug!(offset, "freed page onto tree free-list");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::FileBlockIo;

    #[test]
    fn reuses_freed_pages_before_growing() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileBlockIo::create(dir.path().join("idx.0")).unwrap();
        io.write_all(&[0u8; PAGE_SIZE]).unwrap();
        let mut header = IndexHeader::new(false);
        header.eof = PAGE_SIZE as u32;
        let mut cache = NodeCache::new(4);

        let a = alloc_node(&mut header, &mut io, &mut cache).unwrap();
        let b = alloc_node(&mut header, &mut io, &mut cache).unwrap();
        assert_ne!(a, b);
        assert_eq!(header.eof, PAGE_SIZE as u32 * 3);

        free_node(&mut header, a, &mut io, &mut cache).unwrap();
        assert_eq!(header.freelist, a as u32);

        let c = alloc_node(&mut header, &mut io, &mut cache).unwrap();
        assert_eq!(c, a, "freed page should be reused before growing the file");
        assert_eq!(header.freelist, 0);
    }
}
