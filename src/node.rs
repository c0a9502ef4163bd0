//! On-disk B-tree node packing.
//!
//! On disk a node is exactly `{count: i32, entries..., rson: ndxPos}` with
//! each entry self-delimiting (`{lson: ndxPos, data_offset: datPos, key}`,
//! the key's own length determined by the active `KeyCodec`). A classic
//! downward-growing `u16` offset table is a legacy in-memory packing trick
//! for a raw page buffer that gets reconstructed on load rather than
//! persisted; this port keeps entries as an owned `Vec<Entry>` (the natural
//! Rust stand-in for "reconstructed on load") and recomputes an offset table
//! on demand only where it's actually needed.

use crate::codec::KeyCodec;
use crate::errors::{Error, Result};
use crate::page::{DAT_POS_SIZE, NDX_POS_SIZE, PAGE_SIZE};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Offset of the child holding keys less than this entry's key; 0 for a
    /// leaf entry.
    pub lson: u32,
    pub data_offset: u64,
    /// Wire-format key bytes (already codec-encoded, including terminator).
    pub key: Vec<u8>,
}

impl Entry {
    pub(crate) fn byte_len(&self) -> usize {
        NDX_POS_SIZE + DAT_POS_SIZE + self.key.len()
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Page offset naming this node; 0 means "not yet bound to a page".
    pub offset: u64,
    pub entries: Vec<Entry>,
    /// Rightmost child pointer; 0 for a leaf.
    pub rson: u32,
    pub dirty: bool,
}

impl Node {
    pub fn new_leaf(offset: u64) -> Self {
        Node { offset, entries: Vec::new(), rson: 0, dirty: true }
    }

    pub fn count(&self) -> i32 {
        self.entries.len() as i32
    }

    pub fn is_leaf(&self) -> bool {
        self.rson == 0 && self.entries.iter().all(|e| e.lson == 0)
    }

    /// Bytes consumed by `{lson,data_offset,key}` across every entry, i.e.
    /// everything except the leading `count` and the trailing `rson`.
    pub fn used_entry_bytes(&self) -> usize {
        self.entries.iter().map(Entry::byte_len).sum()
    }

    /// Whether a new entry of `new_key_len` bytes still fits. The capacity
    /// formula budgets a `u16` offset-table slot per entry even though this
    /// port never persists that table — see module docs.
    pub fn fits_new_entry(&self, new_key_len: usize) -> bool {
        let new_entry_size = NDX_POS_SIZE + DAT_POS_SIZE + new_key_len;
        new_entry_size + 2 + self.used_entry_bytes() + NDX_POS_SIZE + self.entries.len() * 2
            <= PAGE_SIZE
    }

    /// Split pivot: walk the offset table and pick the first
    /// entry whose start offset is `>=` the byte-midpoint of the key data,
    /// not the entry at the midpoint by count.
    pub fn pivot_index(&self) -> usize {
        let mid = self.used_entry_bytes() / 2;
        let mut pos = 0usize;
        for (idx, entry) in self.entries.iter().enumerate() {
            if pos >= mid {
                return idx;
            }
            pos += entry.byte_len();
        }
        self.entries.len().saturating_sub(1)
    }

    /// The offset table a faithful port needs to be able to reconstruct:
    /// byte offset (from the start of the key area, i.e.
    /// right after `count`) of each entry, plus one trailing slot marking
    /// where `rson` begins.
    pub fn offset_table(&self) -> Vec<u16> {
        let mut offsets = Vec::with_capacity(self.entries.len() + 1);
        let mut pos = 0u16;
        for entry in &self.entries {
            offsets.push(pos);
            pos += entry.byte_len() as u16;
        }
        offsets.push(pos);
        offsets
    }

    /// Smallest index `i` such that every entry at `< i` compares less than
    /// `(key, data_offset)` and every entry at `>= i` compares greater or
    /// equal. `data_offset` is only consulted when duplicates
    /// are in play; pass `None` to compare on key alone.
    pub fn lower_bound(
        &self,
        key: &[u8],
        data_offset: Option<u64>,
        codec: &dyn KeyCodec,
    ) -> usize {
        self.lower_bound_by(|entry| self.compare_entry_tuple(entry, key, data_offset, codec))
    }

    /// Same binary search, parameterized over an arbitrary per-entry
    /// comparator. Used where the tuple comparison in `lower_bound` isn't
    /// quite what's needed (e.g. locating the leftmost duplicate by key
    /// alone, ignoring `data_offset`).
    pub fn lower_bound_by(&self, cmp: impl Fn(&Entry) -> Ordering) -> usize {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp(&self.entries[mid]) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn compare_entry_tuple(
        &self,
        entry: &Entry,
        key: &[u8],
        data_offset: Option<u64>,
        codec: &dyn KeyCodec,
    ) -> Ordering {
        codec.compare(&entry.key, key).then_with(|| match data_offset {
            Some(d) => entry.data_offset.cmp(&d),
            None => Ordering::Equal,
        })
    }

    /// Splices a brand-new leaf entry at `index`, shifting later entries up.
    /// Caller must have already verified `fits_new_entry`.
    pub fn insert_at(&mut self, index: usize, key: Vec<u8>, data_offset: u64) {
        self.entries.insert(index, Entry { lson: 0, data_offset, key });
        self.dirty = true;
    }

    pub fn remove_at(&mut self, index: usize) -> Entry {
        self.dirty = true;
        self.entries.remove(index)
    }

    pub fn encode(&self) -> Result<[u8; PAGE_SIZE]> {
        let mut page = [0u8; PAGE_SIZE];
        page[0..4].copy_from_slice(&self.count().to_le_bytes());
        let mut pos = 4usize;
        for entry in &self.entries {
            let end = pos + entry.byte_len();
            if end + NDX_POS_SIZE > PAGE_SIZE {
                return Err(err!(
                    Corrupt,
                    "node at {} overflows page ({} bytes needed)",
                    self.offset,
                    end + NDX_POS_SIZE
                ));
            }
            page[pos..pos + NDX_POS_SIZE].copy_from_slice(&entry.lson.to_le_bytes());
            pos += NDX_POS_SIZE;
            page[pos..pos + DAT_POS_SIZE].copy_from_slice(&entry.data_offset.to_le_bytes());
            pos += DAT_POS_SIZE;
            page[pos..pos + entry.key.len()].copy_from_slice(&entry.key);
            pos += entry.key.len();
        }
        page[pos..pos + NDX_POS_SIZE].copy_from_slice(&self.rson.to_le_bytes());
        Ok(page)
    }

    pub fn decode(offset: u64, bytes: &[u8], codec: &dyn KeyCodec) -> Result<Self> {
        if bytes.len() < PAGE_SIZE {
            return Err(err!(Corrupt, "short page at {}", offset));
        }
        let count = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if count < 0 {
            return Err(err!(Corrupt, "negative entry count at {}", offset));
        }
        let mut pos = 4usize;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if pos + NDX_POS_SIZE + DAT_POS_SIZE > PAGE_SIZE {
                return Err(err!(Corrupt, "node at {} truncated mid-entry", offset));
            }
            let lson = u32::from_le_bytes(bytes[pos..pos + NDX_POS_SIZE].try_into().unwrap());
            pos += NDX_POS_SIZE;
            let data_offset =
                u64::from_le_bytes(bytes[pos..pos + DAT_POS_SIZE].try_into().unwrap());
            pos += DAT_POS_SIZE;
            let key_len = codec.size(&bytes[pos..]);
            if pos + key_len > PAGE_SIZE {
                return Err(err!(Corrupt, "node at {} has an oversized key", offset));
            }
            let key = bytes[pos..pos + key_len].to_vec();
            pos += key_len;
            entries.push(Entry { lson, data_offset, key });
        }
        if pos + NDX_POS_SIZE > PAGE_SIZE {
            return Err(err!(Corrupt, "node at {} missing rson", offset));
        }
        let rson = u32::from_le_bytes(bytes[pos..pos + NDX_POS_SIZE].try_into().unwrap());
        Ok(Node { offset, entries, rson, dirty: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteStringCodec;

    fn key(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    #[test]
    fn encode_decode_round_trips() {
        let codec = ByteStringCodec;
        let mut node = Node::new_leaf(4096);
        node.insert_at(0, key("ant"), 1);
        node.insert_at(1, key("bee"), 2);
        node.insert_at(2, key("cat"), 3);
        let bytes = node.encode().unwrap();
        let decoded = Node::decode(4096, &bytes, &codec).unwrap();
        assert_eq!(decoded.entries, node.entries);
        assert_eq!(decoded.rson, 0);
    }

    #[test]
    fn lower_bound_finds_insertion_point() {
        let codec = ByteStringCodec;
        let mut node = Node::new_leaf(4096);
        node.insert_at(0, key("ant"), 1);
        node.insert_at(1, key("cat"), 3);
        assert_eq!(node.lower_bound(&key("bee"), None, &codec), 1);
        assert_eq!(node.lower_bound(&key("ant"), None, &codec), 0);
        assert_eq!(node.lower_bound(&key("dog"), None, &codec), 2);
    }

    #[test]
    fn lower_bound_breaks_ties_on_data_offset_with_dups() {
        let codec = ByteStringCodec;
        let mut node = Node::new_leaf(4096);
        node.insert_at(0, key("x"), 3);
        node.insert_at(1, key("x"), 10);
        node.insert_at(2, key("x"), 20);
        assert_eq!(node.lower_bound(&key("x"), Some(10), &codec), 1);
    }

    #[test]
    fn pivot_index_splits_near_byte_midpoint() {
        let mut node = Node::new_leaf(4096);
        for k in ["ant", "bee", "cat", "dog", "eel"] {
            let i = node.lower_bound(&key(k), None, &ByteStringCodec);
            node.insert_at(i, key(k), 1);
        }
        let pivot = node.pivot_index();
        assert!(pivot > 0 && pivot < node.entries.len());
    }

    #[test]
    fn offset_table_matches_entry_lengths() {
        let mut node = Node::new_leaf(4096);
        node.insert_at(0, key("ant"), 1);
        node.insert_at(1, key("bumblebee"), 2);
        let table = node.offset_table();
        assert_eq!(table.len(), 3);
        assert_eq!(table[0], 0);
        assert_eq!(table[1] as usize, node.entries[0].byte_len());
        assert_eq!(table[2] as usize, node.used_entry_bytes());
    }
}
