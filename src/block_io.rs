//! `BlockIo`: the positional byte-I/O collaborator.
//!
//! The core never buffers beyond what the OS gives it and never retries; it
//! just asks for bytes at an offset. This module is a thin wrapper over
//! `std::fs::File`, kept deliberately uninteresting.

use crate::errors::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Positional read/write over a single named file.
///
/// All offsets are absolute (`u64`) from the start of the file. A short
/// read or write is reported as `Error::Io`, never silently padded.
pub trait BlockIo {
    fn seek(&mut self, offset: u64) -> Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn name(&self) -> &str;
    fn len(&mut self) -> Result<u64>;
    fn sync(&mut self) -> Result<()>;
}

/// `BlockIo` backed by a real file on disk.
pub struct FileBlockIo {
    file: File,
    path: PathBuf,
}

impl FileBlockIo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }
}

impl BlockIo for FileBlockIo {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Read::read_exact(&mut self.file, buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Corrupt(format!(
                    "short read on {:?}: wanted {} bytes",
                    self.path,
                    buf.len()
                ))
            } else {
                Error::Io(e)
            }
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(&mut self.file, buf)?;
        Ok(())
    }

    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("<non-utf8 path>")
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");
        let mut io = FileBlockIo::create(&path).unwrap();
        io.write_all(&[0u8; 16]).unwrap();
        io.seek(4).unwrap();
        io.write_all(b"hello").unwrap();

        let mut io = FileBlockIo::open(&path).unwrap();
        io.seek(4).unwrap();
        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn short_read_is_corrupt_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let mut io = FileBlockIo::create(&path).unwrap();
        io.write_all(&[1, 2, 3]).unwrap();
        io.seek(0).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(io.read_exact(&mut buf), Err(Error::Corrupt(_))));
    }
}
