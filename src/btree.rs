//! The sorted B-tree over variable-length keys.
//!
//! This is the bulk of the store's engineering: insert/find/remove/traverse
//! with in-place split and sibling-merge, built on `NodeCache` (aliasing
//! handled by re-resolving offsets, never holding a node reference across an
//! intervening cache access) and `PathStack` (the descent trail, reset at the
//! start of every top-level operation and otherwise carried as the cursor).

use crate::block_io::{BlockIo, FileBlockIo};
use crate::cache::{NodeCache, DEFAULT_CAPACITY};
use crate::codec::KeyCodec;
use crate::errors::{Error, Result};
use crate::freelist;
use crate::node::{Entry, Node};
use crate::page::{IndexHeader, MAX_KEY_SIZE, NDX_POS_SIZE, PAGE_SIZE};
use crate::path_stack::PathStack;
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, info, trace, warn};

pub struct BTree {
    io: Box<dyn BlockIo>,
    codec: Box<dyn KeyCodec>,
    header: IndexHeader,
    cache: NodeCache,
    path: PathStack,
    open: bool,
}

impl BTree {
    pub fn create(path: impl AsRef<Path>, dups: bool, codec: Box<dyn KeyCodec>) -> Result<Self> {
        let mut io = FileBlockIo::create(path)?;
        let header = IndexHeader::new(dups);
        io.seek(0)?;
        io.write_all(&header.encode()?)?;
        io.seek(header.root as u64)?;
        io.write_all(&Node::new_leaf(header.root as u64).encode()?)?;
        info!(root = header.root, dups, "created index");
        Ok(BTree {
            io: Box::new(io),
            codec,
            header,
            cache: NodeCache::new(DEFAULT_CAPACITY),
            path: PathStack::new(),
            open: true,
        })
    }

    pub fn open(path: impl AsRef<Path>, codec: Box<dyn KeyCodec>) -> Result<Self> {
        let mut io = FileBlockIo::open(path)?;
        let mut buf = [0u8; PAGE_SIZE];
        io.seek(0)?;
        io.read_exact(&mut buf)?;
        let header = IndexHeader::decode(&buf)?;
        header.check_compatible()?;
        info!(root = header.root, n = header.n, "opened index");
        Ok(BTree {
            io: Box::new(io),
            codec,
            header,
            cache: NodeCache::new(DEFAULT_CAPACITY),
            path: PathStack::new(),
            open: true,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.cache.flush_all(&mut *self.io)?;
        self.io.seek(0)?;
        self.io.write_all(&self.header.encode()?)?;
        self.io.sync()?;
        self.open = false;
        info!(n = self.header.n, "closed index");
        Ok(())
    }

    fn poison(&mut self) {
        self.open = false;
        warn!("index poisoned after unrecoverable I/O error");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn count(&self) -> i32 {
        self.header.n
    }

    pub fn max_key_size(&self) -> usize {
        MAX_KEY_SIZE
    }

    pub fn dups_allowed(&self) -> bool {
        self.header.dups()
    }

    fn child_at(node: &Node, k: usize) -> u32 {
        if k < node.entries.len() {
            node.entries[k].lson
        } else {
            node.rson
        }
    }

    // ---- descent helpers -------------------------------------------------

    /// Exact `(key[, data_offset])` lookup, no ancestor fallback: on a miss
    /// the path is left at the raw local insertion index of the leaf it
    /// bottomed out at. Used by `insert` (needs the splice point) and by
    /// the exact-tuple `find`.
    fn descend_exact(&mut self, key: &[u8], tiebreak: Option<u64>) -> Result<bool> {
        self.path.clear();
        let mut offset = self.header.root as u64;
        loop {
            let (i, is_leaf, child, equal_here) = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                let i = node.lower_bound(key, tiebreak, self.codec.as_ref());
                let equal_here = i < node.entries.len()
                    && self.codec.compare(&node.entries[i].key, key) == Ordering::Equal
                    && tiebreak.map_or(true, |d| node.entries[i].data_offset == d);
                (i, node.is_leaf(), Self::child_at(node, i), equal_here)
            };
            self.path.push(offset, i)?;
            if equal_here {
                return Ok(true);
            }
            if is_leaf {
                return Ok(false);
            }
            offset = child as u64;
        }
    }

    /// `(key[, data_offset])` lookup that, on a miss, repositions the cursor
    /// at the smallest tuple strictly greater, by
    /// remembering the deepest ancestor frame whose local index still names
    /// a live entry and truncating the path back to it.
    fn descend_find(&mut self, key: &[u8], tiebreak: Option<u64>) -> Result<bool> {
        self.path.clear();
        let mut offset = self.header.root as u64;
        let mut candidate_depth: Option<usize> = None;
        loop {
            let (i, is_leaf, child, equal_here, has_candidate) = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                let i = node.lower_bound(key, tiebreak, self.codec.as_ref());
                let equal_here = i < node.entries.len()
                    && self.codec.compare(&node.entries[i].key, key) == Ordering::Equal
                    && tiebreak.map_or(true, |d| node.entries[i].data_offset == d);
                (i, node.is_leaf(), Self::child_at(node, i), equal_here, i < node.entries.len())
            };
            self.path.push(offset, i)?;
            if equal_here {
                return Ok(true);
            }
            if has_candidate {
                candidate_depth = Some(self.path.len());
            }
            if is_leaf {
                break;
            }
            offset = child as u64;
        }
        match candidate_depth {
            Some(depth) => {
                while self.path.len() > depth {
                    self.path.pop();
                }
                Ok(false)
            }
            None => {
                self.path.clear();
                Ok(false)
            }
        }
    }

    /// For `dups=true`, positions at the first (lowest `data_offset`)
    /// occurrence of `key`. Descends by key alone, tracking the deepest node
    /// whose key matches exactly — since equal keys can recur with a smaller
    /// `data_offset` further down the left subtree of an internal match.
    fn descend_leftmost_duplicate(&mut self, key: &[u8]) -> Result<bool> {
        self.path.clear();
        let mut offset = self.header.root as u64;
        let mut candidate_depth: Option<usize> = None;
        loop {
            let (i, is_leaf, child, equal_here) = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                let i = node.lower_bound(key, None, self.codec.as_ref());
                let equal_here =
                    i < node.entries.len() && self.codec.compare(&node.entries[i].key, key) == Ordering::Equal;
                (i, node.is_leaf(), Self::child_at(node, i), equal_here)
            };
            self.path.push(offset, i)?;
            if equal_here {
                candidate_depth = Some(self.path.len());
            }
            if is_leaf {
                break;
            }
            offset = child as u64;
        }
        match candidate_depth {
            Some(depth) => {
                while self.path.len() > depth {
                    self.path.pop();
                }
                Ok(true)
            }
            None => {
                self.path.clear();
                Ok(false)
            }
        }
    }

    // ---- find / change -----------------------------------------------------

    pub fn find(&mut self, key: &[u8]) -> Result<bool> {
        let r = if self.header.dups() {
            self.descend_leftmost_duplicate(key)
        } else {
            self.descend_find(key, None)
        };
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    pub fn find_tuple(&mut self, key: &[u8], data_offset: u64) -> Result<bool> {
        let r = self.descend_exact(key, Some(data_offset));
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        if let Ok(false) = r {
            self.path.clear();
        }
        r
    }

    pub fn current_key(&mut self) -> Result<Vec<u8>> {
        let frame = *self.path.top().ok_or_else(|| err!(LogicError, "no current key"))?;
        let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
        Ok(node.entries[frame.index].key.clone())
    }

    pub fn current_offset(&mut self) -> Result<u64> {
        let frame = *self.path.top().ok_or_else(|| err!(LogicError, "no current key"))?;
        let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
        Ok(node.entries[frame.index].data_offset)
    }

    pub fn change(&mut self, data_offset: u64) -> Result<()> {
        let frame = *self
            .path
            .top()
            .ok_or_else(|| err!(LogicError, "change requires a current key"))?;
        let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
        node.entries[frame.index].data_offset = data_offset;
        node.dirty = true;
        Ok(())
    }

    // ---- insert / split ----------------------------------------------------

    pub fn insert(&mut self, key: &[u8], data_offset: u64) -> Result<bool> {
        let r = self.insert_inner(key, data_offset);
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn insert_inner(&mut self, key: &[u8], data_offset: u64) -> Result<bool> {
        if key.len() > MAX_KEY_SIZE {
            return Err(err!(
                InvalidArgument,
                "key length {} exceeds max_key_size {}",
                key.len(),
                MAX_KEY_SIZE
            ));
        }
        let tiebreak = if self.header.dups() { Some(data_offset) } else { None };
        loop {
            if self.descend_exact(key, tiebreak)? {
                return Ok(false);
            }
            let frame = *self.path.top().expect("descend always leaves at least one frame");
            let fits = {
                let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
                node.fits_new_entry(key.len())
            };
            if fits {
                let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
                node.insert_at(frame.index, key.to_vec(), data_offset);
                self.header.n += 1;
                trace!(key_len = key.len(), data_offset, "inserted entry");
                return Ok(true);
            }
            self.split_once()?;
        }
    }

    /// Splits the deepest overflowing node on the current path, walking up
    /// toward the root if ancestors also lack room for the promoted pivot.
    /// Performs exactly one
    /// structural split and returns; the caller's insert loop restarts the
    /// descent from the root afterward rather than patching up frames here.
    fn split_once(&mut self) -> Result<()> {
        loop {
            let frame = match self.path.pop() {
                Some(f) => f,
                None => return Ok(()),
            };
            let offset = frame.node_offset;
            let (pivot, left_entries, left_rson, right_entries, right_rson) = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                let pivot_idx = node.pivot_index();
                let pivot = node.entries[pivot_idx].clone();
                (
                    pivot.clone(),
                    node.entries[..pivot_idx].to_vec(),
                    pivot.lson,
                    node.entries[pivot_idx + 1..].to_vec(),
                    node.rson,
                )
            };

            let parent_frame = self.path.top().copied();
            if let Some(pf) = parent_frame {
                let parent_has_room = {
                    let parent = self.cache.get(pf.node_offset, &mut *self.io, self.codec.as_ref())?;
                    parent.fits_new_entry(pivot.key.len())
                };
                if !parent_has_room {
                    debug!(parent = pf.node_offset, "parent full too, splitting it first");
                    continue;
                }
            }

            let sibling_offset = freelist::alloc_node(&mut self.header, &mut *self.io, &mut self.cache)?;
            {
                let left = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                left.entries = left_entries;
                left.rson = left_rson;
                left.dirty = true;
            }
            {
                let sibling = self.cache.get(sibling_offset, &mut *self.io, self.codec.as_ref())?;
                sibling.entries = right_entries;
                sibling.rson = right_rson;
                sibling.dirty = true;
            }

            match parent_frame {
                Some(pf) => {
                    let parent = self.cache.get(pf.node_offset, &mut *self.io, self.codec.as_ref())?;
                    if pf.index < parent.entries.len() {
                        parent.entries[pf.index].lson = sibling_offset as u32;
                    } else {
                        parent.rson = sibling_offset as u32;
                    }
                    parent.entries.insert(
                        pf.index,
                        Entry { lson: offset as u32, data_offset: pivot.data_offset, key: pivot.key },
                    );
                    parent.dirty = true;
                }
                None => {
                    let new_root_offset =
                        freelist::alloc_node(&mut self.header, &mut *self.io, &mut self.cache)?;
                    let new_root = self.cache.get(new_root_offset, &mut *self.io, self.codec.as_ref())?;
                    new_root.entries =
                        vec![Entry { lson: offset as u32, data_offset: pivot.data_offset, key: pivot.key }];
                    new_root.rson = sibling_offset as u32;
                    new_root.dirty = true;
                    self.header.root = new_root_offset as u32;
                    debug!(new_root = new_root_offset, "allocated new root");
                }
            }
            debug!(offset, sibling_offset, "split node");
            return Ok(());
        }
    }

    // ---- remove / merge ----------------------------------------------------

    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let r = self.remove_with(key, None);
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    pub fn remove_tuple(&mut self, key: &[u8], data_offset: u64) -> Result<bool> {
        let r = self.remove_with(key, Some(data_offset));
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn remove_with(&mut self, key: &[u8], data_offset: Option<u64>) -> Result<bool> {
        let found = match data_offset {
            Some(d) => self.descend_exact(key, Some(d))?,
            None if self.header.dups() => self.descend_leftmost_duplicate(key)?,
            None => self.descend_exact(key, None)?,
        };
        if !found {
            self.path.clear();
            return Ok(false);
        }
        self.remove_current()
    }

    pub fn remove_current(&mut self) -> Result<bool> {
        let r = self.remove_current_inner();
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn remove_current_inner(&mut self) -> Result<bool> {
        let frame = match self.path.top().copied() {
            Some(f) => f,
            None => return Ok(false),
        };
        let (is_internal, removed_key, removed_data_offset) = {
            let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
            let e = &node.entries[frame.index];
            (e.lson != 0, e.key.clone(), e.data_offset)
        };
        if is_internal {
            self.remove_internal(frame.node_offset, frame.index)?;
        } else {
            self.remove_leaf(frame.node_offset, frame.index)?;
        }
        self.header.n -= 1;
        let tiebreak = if self.header.dups() { Some(removed_data_offset) } else { None };
        self.descend_find(&removed_key, tiebreak)?;
        Ok(true)
    }

    /// Case A: splice a leaf entry out, then free the node if it
    /// emptied or opportunistically merge it with a sibling.
    fn remove_leaf(&mut self, offset: u64, idx: usize) -> Result<()> {
        let became_empty = {
            let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
            node.remove_at(idx);
            node.entries.is_empty()
        };
        trace!(offset, idx, "removed leaf entry");
        if became_empty {
            self.handle_emptied_node(offset)?;
        } else {
            self.rebalance_from(offset)?;
        }
        Ok(())
    }

    /// Case B: substitute the in-order predecessor's tuple for
    /// the internal key being removed, then delete the predecessor from its
    /// leaf (which may itself trigger merges). If the substitution would
    /// overflow the node, split it first and retry the whole removal against
    /// the entry's new home instead of giving up.
    fn remove_internal(&mut self, offset: u64, idx: usize) -> Result<()> {
        let offset_frame_depth = self.path.len();
        let (original_key, original_data_offset) = {
            let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
            let e = &node.entries[idx];
            (e.key.clone(), e.data_offset)
        };
        let mut cursor = {
            let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
            node.entries[idx].lson as u64
        };
        loop {
            let (count, is_leaf, rson) = {
                let node = self.cache.get(cursor, &mut *self.io, self.codec.as_ref())?;
                (node.entries.len(), node.is_leaf(), node.rson)
            };
            if is_leaf {
                self.path.push(cursor, count.saturating_sub(1))?;
                break;
            }
            self.path.push(cursor, count)?;
            cursor = rson as u64;
        }
        let pred_frame = *self.path.top().expect("predecessor descent always pushes a leaf frame");
        let predecessor = {
            let node = self.cache.get(pred_frame.node_offset, &mut *self.io, self.codec.as_ref())?;
            node.entries[pred_frame.index].clone()
        };

        let fits = {
            let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
            let current_len = node.entries[idx].key.len();
            if predecessor.key.len() <= current_len {
                true
            } else {
                let delta = predecessor.key.len() - current_len;
                node.used_entry_bytes() + delta + node.entries.len() * 2 + NDX_POS_SIZE <= PAGE_SIZE
            }
        };
        if !fits {
            debug!(offset, idx, "substitution would overflow the node, splitting it first");
            while self.path.len() > offset_frame_depth {
                self.path.pop();
            }
            self.split_once()?;
            self.path.clear();
            if !self.descend_exact(&original_key, Some(original_data_offset))? {
                return Err(err!(
                    RuntimeError,
                    "internal key at {} vanished while splitting before substitution",
                    offset
                ));
            }
            let frame = *self.path.top().expect("descend_exact leaves a frame");
            return self.remove_internal(frame.node_offset, frame.index);
        }
        {
            let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
            node.entries[idx].key = predecessor.key;
            node.entries[idx].data_offset = predecessor.data_offset;
            node.dirty = true;
        }
        debug!(offset, idx, predecessor_leaf = pred_frame.node_offset, "substituted predecessor");
        self.remove_leaf(pred_frame.node_offset, pred_frame.index)
    }

    fn handle_emptied_node(&mut self, offset: u64) -> Result<()> {
        self.path.pop();
        match self.path.top().copied() {
            None => {
                debug!(offset, "root emptied, leaving it as an empty root");
            }
            Some(pf) => {
                {
                    let parent = self.cache.get(pf.node_offset, &mut *self.io, self.codec.as_ref())?;
                    if pf.index < parent.entries.len() {
                        parent.entries[pf.index].lson = 0;
                    } else {
                        parent.rson = 0;
                    }
                    parent.dirty = true;
                }
                freelist::free_node(&mut self.header, offset, &mut *self.io, &mut self.cache)?;
                debug!(offset, "freed emptied leaf");
            }
        }
        Ok(())
    }

    /// Opportunistic sibling merge: while the node at `offset`
    /// is at most half full, try the right sibling first, then the left;
    /// re-examine after a right merge since it leaves the result at the same
    /// offset, but stop after a left merge since the surviving node moves.
    fn rebalance_from(&mut self, offset: u64) -> Result<()> {
        // The top frame is `offset`'s own; discard it so `path.top()` names
        // its parent, the frame merges are keyed on.
        self.path.pop();
        loop {
            let used = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                node.used_entry_bytes()
            };
            if used > PAGE_SIZE / 2 {
                return Ok(());
            }
            let parent_frame = match self.path.top().copied() {
                Some(pf) => pf,
                None => return Ok(()),
            };
            let k = parent_frame.index;
            if self.try_merge_with_right(parent_frame.node_offset, k, offset)? {
                continue;
            }
            if self.try_merge_with_left(parent_frame.node_offset, k, offset)? {
                return Ok(());
            }
            return Ok(());
        }
    }

    fn try_merge_with_right(&mut self, parent_offset: u64, k: usize, left_offset: u64) -> Result<bool> {
        let right_offset = {
            let parent = self.cache.get(parent_offset, &mut *self.io, self.codec.as_ref())?;
            if k >= parent.entries.len() {
                return Ok(false);
            }
            Self::child_at(parent, k + 1) as u64
        };
        self.merge_pair(parent_offset, k, left_offset, right_offset)
    }

    fn try_merge_with_left(&mut self, parent_offset: u64, k: usize, right_offset: u64) -> Result<bool> {
        if k == 0 {
            return Ok(false);
        }
        let left_offset = {
            let parent = self.cache.get(parent_offset, &mut *self.io, self.codec.as_ref())?;
            Self::child_at(parent, k - 1) as u64
        };
        self.merge_pair(parent_offset, k - 1, left_offset, right_offset)
    }

    fn merge_pair(&mut self, parent_offset: u64, k: usize, left_offset: u64, right_offset: u64) -> Result<bool> {
        let separator = {
            let parent = self.cache.get(parent_offset, &mut *self.io, self.codec.as_ref())?;
            parent.entries[k].clone()
        };
        let (left_entries, left_rson, left_used) = {
            let left = self.cache.get(left_offset, &mut *self.io, self.codec.as_ref())?;
            (left.entries.clone(), left.rson, left.used_entry_bytes())
        };
        let (right_entries, right_rson, right_used) = {
            let right = self.cache.get(right_offset, &mut *self.io, self.codec.as_ref())?;
            (right.entries.clone(), right.rson, right.used_entry_bytes())
        };
        let combined_entry_count = left_entries.len() + 1 + right_entries.len();
        let combined_bytes = left_used + separator.byte_len() + right_used;
        if combined_bytes + combined_entry_count * 2 + NDX_POS_SIZE > PAGE_SIZE {
            return Ok(false);
        }

        let mut merged_entries = left_entries;
        merged_entries.push(Entry { lson: left_rson, data_offset: separator.data_offset, key: separator.key });
        merged_entries.extend(right_entries);

        {
            let left = self.cache.get(left_offset, &mut *self.io, self.codec.as_ref())?;
            left.entries = merged_entries;
            left.rson = right_rson;
            left.dirty = true;
        }
        {
            let parent = self.cache.get(parent_offset, &mut *self.io, self.codec.as_ref())?;
            if k + 1 < parent.entries.len() {
                parent.entries[k + 1].lson = left_offset as u32;
            } else {
                parent.rson = left_offset as u32;
            }
            parent.entries.remove(k);
            parent.dirty = true;
        }
        freelist::free_node(&mut self.header, right_offset, &mut *self.io, &mut self.cache)?;
        debug!(left_offset, right_offset, "merged sibling nodes");

        self.collapse_empty_parent_if_needed(parent_offset)?;
        Ok(true)
    }

    /// If a merge left `parent_offset` with zero entries, promote its
    /// surviving child to root, or splice it into the grandparent.
    fn collapse_empty_parent_if_needed(&mut self, parent_offset: u64) -> Result<()> {
        let (is_empty, surviving_child) = {
            let parent = self.cache.get(parent_offset, &mut *self.io, self.codec.as_ref())?;
            (parent.entries.is_empty(), parent.rson)
        };
        if !is_empty {
            return Ok(());
        }
        let ancestor_pos = self.path.iter().position(|f| f.node_offset == parent_offset);
        match ancestor_pos {
            None | Some(0) => {
                self.header.root = surviving_child;
                freelist::free_node(&mut self.header, parent_offset, &mut *self.io, &mut self.cache)?;
                debug!(new_root = surviving_child, "promoted surviving child to root");
            }
            Some(pos) => {
                let grandparent = *self.path.iter().nth(pos - 1).unwrap();
                {
                    let gp = self.cache.get(grandparent.node_offset, &mut *self.io, self.codec.as_ref())?;
                    if grandparent.index < gp.entries.len() {
                        gp.entries[grandparent.index].lson = surviving_child;
                    } else {
                        gp.rson = surviving_child;
                    }
                    gp.dirty = true;
                }
                freelist::free_node(&mut self.header, parent_offset, &mut *self.io, &mut self.cache)?;
                debug!(parent_offset, "spliced surviving child into grandparent");
            }
        }
        Ok(())
    }

    // ---- ordered traversal --------------------------------------------------

    pub fn first(&mut self) -> Result<bool> {
        let r = self.first_inner();
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn first_inner(&mut self) -> Result<bool> {
        self.path.clear();
        let mut offset = self.header.root as u64;
        loop {
            let (is_leaf, empty, child) = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                (node.is_leaf(), node.entries.is_empty(), Self::child_at(node, 0))
            };
            if is_leaf {
                if empty {
                    self.path.clear();
                    return Ok(false);
                }
                self.path.push(offset, 0)?;
                return Ok(true);
            }
            self.path.push(offset, 0)?;
            offset = child as u64;
        }
    }

    pub fn last(&mut self) -> Result<bool> {
        let r = self.last_inner();
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn last_inner(&mut self) -> Result<bool> {
        self.path.clear();
        let mut offset = self.header.root as u64;
        loop {
            let (is_leaf, count, rson) = {
                let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                (node.is_leaf(), node.entries.len(), node.rson)
            };
            if is_leaf {
                if count == 0 {
                    self.path.clear();
                    return Ok(false);
                }
                self.path.push(offset, count - 1)?;
                return Ok(true);
            }
            self.path.push(offset, count)?;
            offset = rson as u64;
        }
    }

    pub fn next(&mut self) -> Result<bool> {
        let r = self.next_inner();
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn next_inner(&mut self) -> Result<bool> {
        let frame = match self.path.top().copied() {
            Some(f) => f,
            None => return Ok(false),
        };
        let (is_leaf, stays_in_node, right_child) = {
            let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
            (
                node.is_leaf(),
                frame.index + 1 < node.entries.len(),
                Self::child_at(node, frame.index + 1),
            )
        };
        if is_leaf {
            if stays_in_node {
                self.path.top_mut().expect("frame just read above").index += 1;
                return Ok(true);
            }
        } else if right_child != 0 {
            let mut offset = right_child as u64;
            loop {
                let (is_leaf, child0) = {
                    let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                    (node.is_leaf(), Self::child_at(node, 0))
                };
                self.path.push(offset, 0)?;
                if is_leaf {
                    return Ok(true);
                }
                offset = child0 as u64;
            }
        }
        loop {
            self.path.pop();
            match self.path.top_mut() {
                None => return Ok(false),
                Some(f) => {
                    f.index += 1;
                    let idx = f.index;
                    let node_offset = f.node_offset;
                    let has_entry = {
                        let node = self.cache.get(node_offset, &mut *self.io, self.codec.as_ref())?;
                        idx < node.entries.len()
                    };
                    if has_entry {
                        return Ok(true);
                    }
                }
            }
        }
    }

    pub fn prev(&mut self) -> Result<bool> {
        let r = self.prev_inner();
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    fn prev_inner(&mut self) -> Result<bool> {
        let frame = match self.path.top().copied() {
            Some(f) => f,
            None => return Ok(false),
        };
        let (is_leaf, stays_in_node, left_child) = {
            let node = self.cache.get(frame.node_offset, &mut *self.io, self.codec.as_ref())?;
            (node.is_leaf(), frame.index > 0, Self::child_at(node, frame.index))
        };
        if is_leaf {
            if stays_in_node {
                self.path.top_mut().expect("frame just read above").index -= 1;
                return Ok(true);
            }
        } else if left_child != 0 {
            let mut offset = left_child as u64;
            loop {
                let (is_leaf, count, rson) = {
                    let node = self.cache.get(offset, &mut *self.io, self.codec.as_ref())?;
                    (node.is_leaf(), node.entries.len(), node.rson)
                };
                if is_leaf {
                    self.path.push(offset, count.saturating_sub(1))?;
                    return Ok(true);
                }
                self.path.push(offset, count)?;
                offset = rson as u64;
            }
        }
        loop {
            self.path.pop();
            match self.path.top_mut() {
                None => return Ok(false),
                Some(f) if f.index == 0 => continue,
                Some(f) => {
                    f.index -= 1;
                    return Ok(true);
                }
            }
        }
    }
}

impl Drop for BTree {
    /// A caller that drops without calling `close` must not lose dirty
    /// nodes or the in-memory header (`n`, `root`, `freelist`); run the same
    /// flush `close` does. Errors are logged, not propagated — `Drop` can't
    /// return a `Result` and the file descriptor is going away regardless.
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to flush index on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteStringCodec;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ndxstore-test-{}-{}.ndx", name, uuid::Uuid::new_v4()))
    }

    fn fresh(name: &str, dups: bool) -> BTree {
        BTree::create(scratch_path(name), dups, Box::new(ByteStringCodec)).unwrap()
    }

    #[test]
    fn unique_keys_insert_and_traverse_in_order() {
        let mut t = fresh("s1", false);
        assert!(t.insert(&ByteStringCodec.encode(b"ant"), 1).unwrap());
        assert!(t.insert(&ByteStringCodec.encode(b"bee"), 2).unwrap());
        assert!(t.insert(&ByteStringCodec.encode(b"cat"), 3).unwrap());

        assert!(t.find(&ByteStringCodec.encode(b"bee")).unwrap());
        assert_eq!(t.current_offset().unwrap(), 2);
        assert!(t.next().unwrap());
        assert_eq!(t.current_key().unwrap(), ByteStringCodec.encode(b"cat"));
        assert!(!t.next().unwrap());
    }

    #[test]
    fn duplicate_keys_ordered_by_data_offset() {
        let mut t = fresh("s2", true);
        let x = ByteStringCodec.encode(b"x");
        assert!(t.insert(&x, 10).unwrap());
        assert!(t.insert(&x, 3).unwrap());
        assert!(t.insert(&x, 20).unwrap());

        assert!(t.find(&x).unwrap());
        assert_eq!(t.current_offset().unwrap(), 3);
        assert!(t.next().unwrap());
        assert_eq!(t.current_offset().unwrap(), 10);
        assert!(t.next().unwrap());
        assert_eq!(t.current_offset().unwrap(), 20);
        assert!(!t.next().unwrap());
    }

    #[test]
    fn insert_duplicate_key_without_dups_is_idempotent() {
        let mut t = fresh("idempotent", false);
        let k = ByteStringCodec.encode(b"ant");
        assert!(t.insert(&k, 1).unwrap());
        assert!(!t.insert(&k, 99).unwrap());
        assert_eq!(t.count(), 1);
        assert!(t.find(&k).unwrap());
        assert_eq!(t.current_offset().unwrap(), 1);
    }

    #[test]
    fn remove_then_find_reflects_new_count() {
        let mut t = fresh("remove", false);
        let a = ByteStringCodec.encode(b"ant");
        let b = ByteStringCodec.encode(b"bee");
        t.insert(&a, 1).unwrap();
        t.insert(&b, 2).unwrap();
        assert!(t.remove(&a).unwrap());
        assert_eq!(t.count(), 1);
        assert!(!t.find(&a).unwrap());
        assert!(t.find(&b).unwrap());
    }

    #[test]
    fn insert_many_keeps_in_order_traversal_sorted() {
        let mut t = fresh("sorted", false);
        let words = [
            "mango", "apple", "fig", "date", "kiwi", "pear", "lime", "plum", "zinc", "oak",
        ];
        for (i, w) in words.iter().enumerate() {
            assert!(t.insert(&ByteStringCodec.encode(w.as_bytes()), i as u64).unwrap());
        }
        assert_eq!(t.count() as usize, words.len());

        let mut seen = Vec::new();
        assert!(t.first().unwrap());
        seen.push(t.current_key().unwrap());
        while t.next().unwrap() {
            seen.push(t.current_key().unwrap());
        }
        let mut sorted_words = words.to_vec();
        sorted_words.sort();
        let expected: Vec<Vec<u8>> = sorted_words.iter().map(|w| ByteStringCodec.encode(w.as_bytes())).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn backward_traversal_visits_every_entry_in_a_single_leaf() {
        let mut t = fresh("prev-single-leaf", false);
        for w in ["ant", "bee", "cat"] {
            assert!(t.insert(&ByteStringCodec.encode(w.as_bytes()), 0).unwrap());
        }
        assert!(t.last().unwrap());
        assert_eq!(t.current_key().unwrap(), ByteStringCodec.encode(b"cat"));
        assert!(t.prev().unwrap());
        assert_eq!(t.current_key().unwrap(), ByteStringCodec.encode(b"bee"));
        assert!(t.prev().unwrap());
        assert_eq!(t.current_key().unwrap(), ByteStringCodec.encode(b"ant"));
        assert!(!t.prev().unwrap());
    }

    #[test]
    fn forward_and_backward_traversal_agree_over_many_keys() {
        let mut t = fresh("prev-forward-agree", false);
        let words = ["mango", "apple", "fig", "date", "kiwi", "pear", "lime", "plum"];
        for w in &words {
            assert!(t.insert(&ByteStringCodec.encode(w.as_bytes()), 0).unwrap());
        }
        let mut forward = Vec::new();
        assert!(t.first().unwrap());
        forward.push(t.current_key().unwrap());
        while t.next().unwrap() {
            forward.push(t.current_key().unwrap());
        }

        let mut backward = Vec::new();
        assert!(t.last().unwrap());
        backward.push(t.current_key().unwrap());
        while t.prev().unwrap() {
            backward.push(t.current_key().unwrap());
        }
        backward.reverse();

        assert_eq!(forward, backward);
    }

    #[test]
    fn internal_key_substitution_splits_node_when_predecessor_key_is_longer() {
        let mut t = fresh("case-b-split", false);
        // Short keys first so the internal separator picked on split is short;
        // a later removal whose predecessor has a much longer key then forces
        // the "substitution would overflow, split and retry" path.
        let short_keys: Vec<Vec<u8>> =
            (0..60).map(|i| ByteStringCodec.encode(format!("k{:02}", i).as_bytes())).collect();
        for (i, k) in short_keys.iter().enumerate() {
            assert!(t.insert(k, i as u64).unwrap());
        }
        let long_keys: Vec<Vec<u8>> = (0..60)
            .map(|i| ByteStringCodec.encode(format!("z-{:0140}", i).as_bytes()))
            .collect();
        for (i, k) in long_keys.iter().enumerate() {
            assert!(t.insert(k, (1000 + i) as u64).unwrap());
        }
        let total = short_keys.len() + long_keys.len();
        assert_eq!(t.count() as usize, total);

        for k in short_keys.iter().chain(long_keys.iter()) {
            assert!(t.remove(k).unwrap());
        }
        assert_eq!(t.count(), 0);
        assert!(!t.first().unwrap());
    }

    #[test]
    fn split_and_remove_back_to_empty_root() {
        let mut t = fresh("split", false);
        // Long-ish keys to force splits quickly within a handful of inserts.
        let keys: Vec<Vec<u8>> = (0..200)
            .map(|i| ByteStringCodec.encode(format!("key-{:0150}", i).as_bytes()))
            .collect();
        for (i, k) in keys.iter().enumerate() {
            assert!(t.insert(k, i as u64).unwrap());
        }
        assert_eq!(t.count() as usize, keys.len());

        for k in &keys {
            assert!(t.remove(k).unwrap());
        }
        assert_eq!(t.count(), 0);
        assert!(!t.first().unwrap());
    }

    #[test]
    fn rejects_oversized_key() {
        let mut t = fresh("oversize", false);
        let huge = vec![b'a'; MAX_KEY_SIZE + 10];
        assert!(matches!(t.insert(&huge, 1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn change_requires_a_current_key() {
        let mut t = fresh("change", false);
        assert!(matches!(t.change(5), Err(Error::LogicError(_))));
        let k = ByteStringCodec.encode(b"ant");
        t.insert(&k, 1).unwrap();
        t.find(&k).unwrap();
        t.change(99).unwrap();
        assert_eq!(t.current_offset().unwrap(), 99);
    }

    #[test]
    fn persists_across_close_and_reopen() {
        let path = scratch_path("persist");
        {
            let mut t = BTree::create(&path, false, Box::new(ByteStringCodec)).unwrap();
            t.insert(&ByteStringCodec.encode(b"ant"), 1).unwrap();
            t.insert(&ByteStringCodec.encode(b"bee"), 2).unwrap();
            t.close().unwrap();
        }
        let mut reopened = BTree::open(&path, Box::new(ByteStringCodec)).unwrap();
        assert_eq!(reopened.count(), 2);
        assert!(reopened.find(&ByteStringCodec.encode(b"bee")).unwrap());
        assert_eq!(reopened.current_offset().unwrap(), 2);
    }

    #[test]
    fn open_rejects_mismatched_header() {
        let path = scratch_path("mismatch");
        {
            let mut header = IndexHeader::new(false);
            header.page_size = 512;
            let mut io = FileBlockIo::create(&path).unwrap();
            io.write_all(&header.encode().unwrap()).unwrap();
        }
        assert!(matches!(
            BTree::open(&path, Box::new(ByteStringCodec)),
            Err(Error::Corrupt(_))
        ));
    }

    /// Small xorshift64 PRNG so the sequence is reproducible without pulling
    /// in an external fuzzing crate.
    fn xorshift64(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn thousand_random_keys_stay_sorted() {
        let mut t = fresh("s3", false);
        let mut rng_state = 0x2545F4914F6CDD1Du64;
        let mut distinct = std::collections::BTreeSet::new();
        let mut accepted = 0i32;

        for _ in 0..1000 {
            let mut raw = [0u8; 16];
            for chunk in raw.chunks_mut(8) {
                let word = xorshift64(&mut rng_state).to_le_bytes();
                for (dst, src) in chunk.iter_mut().zip(word.iter()) {
                    // Never 0: ByteStringCodec keys are NUL-terminated.
                    *dst = (*src % 255) + 1;
                }
            }
            let key = ByteStringCodec.encode(&raw);
            if t.insert(&key, 0).unwrap() {
                accepted += 1;
            }
            distinct.insert(raw.to_vec());
        }

        assert_eq!(t.count(), accepted);
        assert_eq!(accepted as usize, distinct.len());

        let mut prev: Option<Vec<u8>> = None;
        assert!(t.first().unwrap());
        loop {
            let key = t.current_key().unwrap();
            if let Some(p) = &prev {
                assert_ne!(ByteStringCodec.compare(p, &key), Ordering::Greater);
            }
            prev = Some(key);
            if !t.next().unwrap() {
                break;
            }
        }
    }
}
