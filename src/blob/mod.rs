//! The resource file: named, optionally LZO-compressed blobs addressed
//! through a BTree that maps names to blob offsets.

mod freelist;
mod store;

pub use store::{BatchWorkspace, BlobStats, BlobStore};
