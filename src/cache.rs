//! `NodeCache`: bounded, MRU in-memory set of decoded nodes.
//!
//! Node pointers are aliasing-sensitive: any `get` may evict another slot.
//! This makes that explicit in the types: callers never hold a
//! `&Node`/`&mut Node` across an intervening `get` — they hold the page
//! offset (already what the path stack and free-list carry) and re-resolve
//! it through `NodeCache::get` each time they need the data.

use crate::block_io::BlockIo;
use crate::codec::KeyCodec;
use crate::node::Node;
use crate::page::PAGE_SIZE;
use tracing::{debug, trace};

pub const DEFAULT_CAPACITY: usize = 10;

pub struct NodeCache {
    capacity: usize,
    /// MRU at the front, LRU at the back.
    slots: Vec<Node>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, slots: Vec::with_capacity(capacity) }
    }

    /// Fetches the node at `offset`, reading it from `io` on a miss and
    /// evicting (flushing first, if dirty) the LRU slot if the cache is
    /// full. Bubbles the slot to MRU position.
    pub fn get(
        &mut self,
        offset: u64,
        io: &mut dyn BlockIo,
        codec: &dyn KeyCodec,
    ) -> crate::errors::Result<&mut Node> {
        if let Some(pos) = self.slots.iter().position(|n| n.offset == offset) {
            trace!(offset, "cache hit");
            if pos != 0 {
                let node = self.slots.remove(pos);
                self.slots.insert(0, node);
            }
            return Ok(&mut self.slots[0]);
        }

        trace!(offset, "cache miss");
        if self.slots.len() >= self.capacity {
            self.evict_lru(io)?;
        }

        let mut buf = [0u8; PAGE_SIZE];
        io.seek(offset)?;
        io.read_exact(&mut buf)?;
        let node = Node::decode(offset, &buf, codec)?;
        self.slots.insert(0, node);
        Ok(&mut self.slots[0])
    }

    /// Registers a freshly allocated node (already bound to a page offset)
    /// as the MRU slot, evicting if necessary.
    pub fn insert(&mut self, node: Node, io: &mut dyn BlockIo) -> crate::errors::Result<&mut Node> {
        if let Some(pos) = self.slots.iter().position(|n| n.offset == node.offset) {
            self.slots.remove(pos);
        }
        if self.slots.len() >= self.capacity {
            self.evict_lru(io)?;
        }
        self.slots.insert(0, node);
        Ok(&mut self.slots[0])
    }

    /// Drops a slot without writing it back — used when a node has just
    /// been handed to the free-list and its on-disk contents are about to
    /// be overwritten with a free-list link anyway.
    pub fn evict_without_writeback(&mut self, offset: u64) {
        self.slots.retain(|n| n.offset != offset);
    }

    fn evict_lru(&mut self, io: &mut dyn BlockIo) -> crate::errors::Result<()> {
        if let Some(victim) = self.slots.pop() {
            debug!(offset = victim.offset, dirty = victim.dirty, "evicting node");
            if victim.dirty {
                self.write_back(&victim, io)?;
            }
        }
        Ok(())
    }

    fn write_back(&self, node: &Node, io: &mut dyn BlockIo) -> crate::errors::Result<()> {
        let bytes = node.encode()?;
        io.seek(node.offset)?;
        io.write_all(&bytes)?;
        Ok(())
    }

    /// Flushes every dirty slot, in LRU-to-MRU order, without evicting them.
    pub fn flush_all(&mut self, io: &mut dyn BlockIo) -> crate::errors::Result<()> {
        for node in self.slots.iter_mut() {
            if node.dirty {
                let bytes = node.encode()?;
                io.seek(node.offset)?;
                io.write_all(&bytes)?;
                node.dirty = false;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::FileBlockIo;
    use crate::codec::ByteStringCodec;

    #[test]
    fn evicts_lru_and_writes_back_dirty_slots() {
        let codec = ByteStringCodec;
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileBlockIo::create(dir.path().join("idx.0")).unwrap();
        io.write_all(&[0u8; PAGE_SIZE * 4]).unwrap();

        let mut cache = NodeCache::new(2);
        let mut n1 = Node::new_leaf(PAGE_SIZE as u64);
        n1.insert_at(0, codec.encode(b"a"), 1);
        cache.insert(n1, &mut io).unwrap();

        let n2 = Node::new_leaf((PAGE_SIZE * 2) as u64);
        cache.insert(n2, &mut io).unwrap();
        assert_eq!(cache.len(), 2);

        // A third distinct node evicts the LRU slot (n1), which is dirty
        // and must be written back before its bytes are dropped.
        let n3 = Node::new_leaf((PAGE_SIZE * 3) as u64);
        cache.insert(n3, &mut io).unwrap();
        assert_eq!(cache.len(), 2);

        let reloaded = cache.get(PAGE_SIZE as u64, &mut io, &codec).unwrap();
        assert_eq!(reloaded.entries.len(), 1);
    }
}
