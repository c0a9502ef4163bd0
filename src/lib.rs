//! Embedded, single-process key/value store: a sorted on-disk B-tree index
//! paired with an LZO-framed blob file.
//!
//! The index (`btree`) and the blob file (`blob`) are independent layers;
//! `blob::BlobStore` is the thing most callers want, wiring a `BTree` (names
//! to blob offsets) together with the blob file's own free-list and LZO
//! framing.

#[macro_use]
mod errors;

mod block_io;
mod blob;
mod btree;
mod cache;
mod codec;
mod freelist;
mod lzo;
mod node;
mod page;
mod path_stack;

pub use block_io::{BlockIo, FileBlockIo};
pub use blob::{BlobStats, BlobStore};
pub use btree::BTree;
pub use codec::{ByteStringCodec, KeyCodec, WideStringCodec};
pub use errors::{Error, Result};
pub use page::MAX_KEY_SIZE;
