//! Index-file page geometry and the page-0 header.

use crate::errors::{Error, Result};

/// Chosen once for this format: a format built with different constants is
/// refused on open rather than silently reinterpreted.
pub const PAGE_SIZE: usize = 4096;
pub const NDX_POS_SIZE: usize = 4;
pub const DAT_POS_SIZE: usize = 8;
pub const MAJOR_VERSION: u8 = 6;
pub const MINOR_VERSION: u8 = 0;

/// `K = P/3 - (ndx_pos_size + dat_pos_size + 2) - 4`.
pub const MAX_KEY_SIZE: usize =
    PAGE_SIZE / 3 - (NDX_POS_SIZE + DAT_POS_SIZE + 2) - 4;

pub const HEADER_SIZE: usize = 28;

fn header_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Page 0 of the index file, bit-exact.
#[derive(bincode::Encode, bincode::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub major: u8,
    pub minor: u8,
    pub ndx_pos_size: u8,
    pub dat_pos_size: u8,
    pub page_size: u16,
    pub max_key_size: u16,
    pub root: u32,
    pub eof: u32,
    pub freelist: u32,
    pub n: i32,
    pub dups: u8,
    pub pad: [u8; 3],
}

impl IndexHeader {
    pub fn new(dups: bool) -> Self {
        IndexHeader {
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            ndx_pos_size: NDX_POS_SIZE as u8,
            dat_pos_size: DAT_POS_SIZE as u8,
            page_size: PAGE_SIZE as u16,
            max_key_size: MAX_KEY_SIZE as u16,
            root: PAGE_SIZE as u32,
            eof: (PAGE_SIZE * 2) as u32,
            freelist: 0,
            n: 0,
            dups: dups as u8,
            pad: [0; 3],
        }
    }

    pub fn dups(&self) -> bool {
        self.dups != 0
    }

    /// Checks every field the compile-time configuration above must agree
    /// with, bit-exact.
    pub fn check_compatible(&self) -> Result<()> {
        if self.major != MAJOR_VERSION {
            return Err(err!(
                Corrupt,
                "unsupported major version {} (expected {})",
                self.major,
                MAJOR_VERSION
            ));
        }
        if self.ndx_pos_size as usize != NDX_POS_SIZE {
            return Err(err!(
                Corrupt,
                "ndx_pos_size {} does not match configured {}",
                self.ndx_pos_size,
                NDX_POS_SIZE
            ));
        }
        if self.dat_pos_size as usize != DAT_POS_SIZE {
            return Err(err!(
                Corrupt,
                "dat_pos_size {} does not match configured {}",
                self.dat_pos_size,
                DAT_POS_SIZE
            ));
        }
        if self.page_size as usize != PAGE_SIZE {
            return Err(err!(
                Corrupt,
                "page_size {} does not match configured {}",
                self.page_size,
                PAGE_SIZE
            ));
        }
        if self.max_key_size as usize != MAX_KEY_SIZE {
            return Err(err!(
                Corrupt,
                "max_key_size {} does not match configured {}",
                self.max_key_size,
                MAX_KEY_SIZE
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<[u8; PAGE_SIZE]> {
        let mut page = [0u8; PAGE_SIZE];
        let encoded = bincode::encode_to_vec(self, header_config())
            .map_err(|e| Error::Corrupt(format!("failed to encode header: {}", e)))?;
        if encoded.len() > HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "encoded header ({} bytes) overflows reserved {} bytes",
                encoded.len(),
                HEADER_SIZE
            )));
        }
        page[..encoded.len()].copy_from_slice(&encoded);
        Ok(page)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, _): (Self, usize) =
            bincode::decode_from_slice(&bytes[..HEADER_SIZE], header_config())
                .map_err(|e| Error::Corrupt(format!("failed to decode header: {}", e)))?;
        Ok(header)
    }
}
