//! `BlobStore`: put/get/remove of LZO-framed payloads, keyed by name through
//! a `BTree`.

use super::freelist;
use crate::block_io::{BlockIo, FileBlockIo};
use crate::btree::BTree;
use crate::codec::ByteStringCodec;
use crate::errors::{Error, Result};
use crate::lzo::{Compressor, Lzo};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BLOB_HEADER_SIZE: usize = 32;
const BLOB_HEADER_ENCODED_SIZE: usize = 16;
const USED_HEADER_SIZE: usize = 12;

fn header_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone, Copy, PartialEq, Eq)]
struct BlobHeader {
    filesize: u64,
    freelist: u64,
}

impl BlobHeader {
    fn new() -> Self {
        BlobHeader { filesize: BLOB_HEADER_SIZE as u64, freelist: 0 }
    }

    fn encode(&self) -> Result<[u8; BLOB_HEADER_SIZE]> {
        let mut page = [0u8; BLOB_HEADER_SIZE];
        let encoded = bincode::encode_to_vec(self, header_config())
            .map_err(|e| Error::Corrupt(format!("failed to encode blob header: {}", e)))?;
        page[..encoded.len()].copy_from_slice(&encoded);
        Ok(page)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, _): (Self, usize) =
            bincode::decode_from_slice(&bytes[..BLOB_HEADER_ENCODED_SIZE], header_config())
                .map_err(|e| Error::Corrupt(format!("failed to decode blob header: {}", e)))?;
        Ok(header)
    }
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone, Copy)]
struct UsedHeader {
    size: u32,
    comp_size: u32,
    uncomp_size: u32,
}

impl UsedHeader {
    fn encode(&self) -> Result<[u8; USED_HEADER_SIZE]> {
        let mut buf = [0u8; USED_HEADER_SIZE];
        let encoded = bincode::encode_to_vec(self, header_config())
            .map_err(|e| Error::Corrupt(format!("failed to encode blob used header: {}", e)))?;
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, _): (Self, usize) = bincode::decode_from_slice(bytes, header_config())
            .map_err(|e| Error::Corrupt(format!("failed to decode blob used header: {}", e)))?;
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlobStats {
    pub entry_count: i32,
    pub filesize: u64,
    pub free_bytes: u64,
}

/// `Closed → Open → Closed`: `create`/`open` produce an open
/// store; any unrecoverable I/O error poisons it back to effectively closed.
pub struct BlobStore {
    io: Box<dyn BlockIo>,
    header: BlobHeader,
    compressor: Box<dyn Compressor>,
    index: BTree,
    open: bool,
}

impl BlobStore {
    pub fn create(base_path: impl AsRef<Path>) -> Result<Self> {
        let (index_path, blob_path) = Self::paired_paths(base_path.as_ref());
        let index = BTree::create(index_path, false, Box::new(ByteStringCodec))?;
        let mut io = FileBlockIo::create(blob_path)?;
        let header = BlobHeader::new();
        io.seek(0)?;
        io.write_all(&header.encode()?)?;
        info!("created blob store");
        Ok(BlobStore { io: Box::new(io), header, compressor: Box::new(Lzo), index, open: true })
    }

    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let (index_path, blob_path) = Self::paired_paths(base_path.as_ref());
        let index = BTree::open(index_path, Box::new(ByteStringCodec))?;
        let mut io = FileBlockIo::open(blob_path)?;
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        io.seek(0)?;
        io.read_exact(&mut buf)?;
        let header = BlobHeader::decode(&buf)?;
        info!(filesize = header.filesize, "opened blob store");
        Ok(BlobStore { io: Box::new(io), header, compressor: Box::new(Lzo), index, open: true })
    }

    fn paired_paths(base: &Path) -> (PathBuf, PathBuf) {
        let mut index_path = base.as_os_str().to_owned();
        index_path.push(".0");
        let mut blob_path = base.as_os_str().to_owned();
        blob_path.push(".1");
        (PathBuf::from(index_path), PathBuf::from(blob_path))
    }

    /// The blob-file header (`filesize`,
    /// `freelist`) is only rewritten here, not after every `put`/`remove` —
    /// an untidy shutdown can leak blob space but never corrupts the tree.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.index.close()?;
        self.io.seek(0)?;
        self.io.write_all(&self.header.encode()?)?;
        self.io.sync()?;
        self.open = false;
        info!("closed blob store");
        Ok(())
    }

    fn poison(&mut self) {
        self.open = false;
        warn!("blob store poisoned after unrecoverable I/O error");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn stats(&mut self) -> Result<BlobStats> {
        let free_bytes = freelist::total_free_bytes(&mut *self.io, self.header.freelist)?;
        Ok(BlobStats { entry_count: self.index.count(), filesize: self.header.filesize, free_bytes })
    }

    pub fn put(&mut self, name: &[u8], bytes: &[u8]) -> Result<()> {
        let mut scratch = Vec::new();
        let r = self.put_compressed(name, bytes, &mut scratch);
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    pub fn get(&mut self, name: &[u8]) -> Result<Option<Vec<u8>>> {
        let r = self.get_inner(name);
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    pub fn remove(&mut self, name: &[u8]) -> Result<bool> {
        let r = self.remove_inner(name);
        if let Err(Error::Io(_)) = &r {
            self.poison();
        }
        r
    }

    pub fn list(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut names = Vec::new();
        if !self.index.first()? {
            return Ok(names);
        }
        names.push(strip_terminator(self.index.current_key()?));
        while self.index.next()? {
            names.push(strip_terminator(self.index.current_key()?));
        }
        Ok(names)
    }

    /// Scopes a reusable compression buffer across many `put`s; a bare
    /// `put` still works without it.
    pub fn with_batch_workspace<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BatchWorkspace) -> Result<()>,
    {
        let mut batch = BatchWorkspace { store: self, scratch: Vec::new() };
        f(&mut batch)
    }

    fn put_compressed(&mut self, name: &[u8], bytes: &[u8], scratch: &mut Vec<u8>) -> Result<()> {
        scratch.clear();
        scratch.extend(self.compressor.compress(bytes));
        let (comp_size, stored_len): (u32, usize) =
            if scratch.len() < bytes.len() { (scratch.len() as u32, scratch.len()) } else { (0, bytes.len()) };
        let need = (USED_HEADER_SIZE + stored_len) as u32;

        let (offset, block_size) = match freelist::alloc(&mut *self.io, &mut self.header.freelist, need)? {
            Some((offset, allocated_size)) => (offset, allocated_size),
            None => {
                let offset = self.header.filesize;
                self.header.filesize += need as u64;
                (offset, need)
            }
        };

        let used = UsedHeader { size: block_size, comp_size, uncomp_size: bytes.len() as u32 };
        self.io.seek(offset)?;
        self.io.write_all(&used.encode()?)?;
        if comp_size == 0 {
            self.io.write_all(bytes)?;
        } else {
            self.io.write_all(scratch)?;
        }
        debug!(offset, need, block_size, comp_size, "wrote blob");

        let key = ByteStringCodec.encode(name);
        if self.index.find(&key)? {
            let old_offset = self.index.current_offset()?;
            self.free_blob_at(old_offset)?;
            self.index.change(offset)?;
        } else {
            self.index.insert(&key, offset)?;
        }
        Ok(())
    }

    fn get_inner(&mut self, name: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = ByteStringCodec.encode(name);
        if !self.index.find(&key)? {
            return Ok(None);
        }
        let offset = self.index.current_offset()?;
        let used = self.read_used_header(offset)?;
        if used.comp_size == 0 {
            let mut buf = vec![0u8; used.uncomp_size as usize];
            self.io.seek(offset + USED_HEADER_SIZE as u64)?;
            self.io.read_exact(&mut buf)?;
            Ok(Some(buf))
        } else {
            let mut compressed = vec![0u8; used.comp_size as usize];
            self.io.seek(offset + USED_HEADER_SIZE as u64)?;
            self.io.read_exact(&mut compressed)?;
            let decompressed = self.compressor.decompress(&compressed, used.uncomp_size as usize)?;
            Ok(Some(decompressed))
        }
    }

    fn remove_inner(&mut self, name: &[u8]) -> Result<bool> {
        let key = ByteStringCodec.encode(name);
        if !self.index.find(&key)? {
            return Ok(false);
        }
        let offset = self.index.current_offset()?;
        self.free_blob_at(offset)?;
        self.index.remove_current()?;
        Ok(true)
    }

    fn free_blob_at(&mut self, offset: u64) -> Result<()> {
        let used = self.read_used_header(offset)?;
        freelist::free(&mut *self.io, &mut self.header.freelist, offset, used.size)
    }

    fn read_used_header(&mut self, offset: u64) -> Result<UsedHeader> {
        let mut buf = [0u8; USED_HEADER_SIZE];
        self.io.seek(offset)?;
        self.io.read_exact(&mut buf)?;
        UsedHeader::decode(&buf)
    }
}

impl Drop for BlobStore {
    /// Mirrors `BTree`'s `Drop`: a caller that drops without calling `close`
    /// must not lose the blob header's `filesize`/`freelist` or the index's
    /// own dirty nodes. `self.close` already closes the inner `index`.
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to flush blob store on drop");
        }
    }
}

fn strip_terminator(mut key: Vec<u8>) -> Vec<u8> {
    if key.last() == Some(&0) {
        key.pop();
    }
    key
}

pub struct BatchWorkspace<'a> {
    store: &'a mut BlobStore,
    scratch: Vec<u8>,
}

impl<'a> BatchWorkspace<'a> {
    pub fn put(&mut self, name: &[u8], bytes: &[u8]) -> Result<()> {
        self.store.put_compressed(name, bytes, &mut self.scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_base(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn put_after_remove_reuses_freed_region() {
        let base = scratch_base("s5");
        let mut store = BlobStore::create(&base).unwrap();

        store.put(b"a", &[0xAAu8; 8192]).unwrap();
        store.put(b"b", &[0xBBu8; 8192]).unwrap();
        let stats_before = store.stats().unwrap();
        store.remove(b"a").unwrap();
        store.put(b"c", &[0xCCu8; 4096]).unwrap();

        let got = store.get(b"c").unwrap().unwrap();
        assert_eq!(got, vec![0xCCu8; 4096]);
        let stats_after = store.stats().unwrap();
        assert!(stats_after.filesize <= stats_before.filesize);
    }

    #[test]
    fn round_trips_compressible_and_incompressible_payloads() {
        let base = scratch_base("roundtrip");
        let mut store = BlobStore::create(&base).unwrap();
        let repetitive = vec![0x11u8; 4096];
        let random_ish: Vec<u8> = (0..4096u32).map(|i| (i * 2654435761).to_le_bytes()[0]).collect();

        store.put(b"rep", &repetitive).unwrap();
        store.put(b"rand", &random_ish).unwrap();

        assert_eq!(store.get(b"rep").unwrap().unwrap(), repetitive);
        assert_eq!(store.get(b"rand").unwrap().unwrap(), random_ish);
    }

    #[test]
    fn put_overwrites_existing_name() {
        let base = scratch_base("overwrite");
        let mut store = BlobStore::create(&base).unwrap();
        store.put(b"a", &[1u8; 100]).unwrap();
        store.put(b"a", &[2u8; 50]).unwrap();
        assert_eq!(store.get(b"a").unwrap().unwrap(), vec![2u8; 50]);
        assert_eq!(store.stats().unwrap().entry_count, 1);
    }

    #[test]
    fn persists_across_close_and_reopen() {
        let base = scratch_base("persist");
        {
            let mut store = BlobStore::create(&base).unwrap();
            store.put(b"a", b"hello world").unwrap();
            store.close().unwrap();
        }
        let mut reopened = BlobStore::open(&base).unwrap();
        assert_eq!(reopened.get(b"a").unwrap().unwrap(), b"hello world");
    }

    #[test]
    fn list_returns_names_in_sorted_order() {
        let base = scratch_base("list");
        let mut store = BlobStore::create(&base).unwrap();
        store.put(b"mango", b"1").unwrap();
        store.put(b"apple", b"2").unwrap();
        store.put(b"fig", b"3").unwrap();
        assert_eq!(store.list().unwrap(), vec![b"apple".to_vec(), b"fig".to_vec(), b"mango".to_vec()]);
    }

    #[test]
    fn batch_workspace_reuses_scratch_buffer_across_puts() {
        let base = scratch_base("batch");
        let mut store = BlobStore::create(&base).unwrap();
        store
            .with_batch_workspace(|batch| {
                batch.put(b"a", &[7u8; 2048])?;
                batch.put(b"b", &[8u8; 2048])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get(b"a").unwrap().unwrap(), vec![7u8; 2048]);
        assert_eq!(store.get(b"b").unwrap().unwrap(), vec![8u8; 2048]);
    }

    #[test]
    fn remove_missing_name_returns_false() {
        let base = scratch_base("missing");
        let mut store = BlobStore::create(&base).unwrap();
        assert!(!store.remove(b"nope").unwrap());
    }
}
