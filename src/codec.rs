//! `KeyCodec`: pluggable key ordering.
//!
//! The codec only governs how two key byte slices compare, how long a raw key
//! is, and what the empty sentinel looks like. It never touches node layout
//! or persistence — those always operate on raw bytes.

use std::cmp::Ordering;

pub trait KeyCodec: Send + Sync {
    /// Number of bytes the wire-format key starting at `bytes` occupies,
    /// including any codec-owned terminator.
    fn size(&self, bytes: &[u8]) -> usize;
    /// Three-way compare of two wire-format key byte slices.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
    /// Encodes a raw, caller-supplied key (no terminator) into `dst` in wire
    /// format, returning the number of bytes written.
    fn copy(&self, dst: &mut [u8], src: &[u8]) -> usize;
    /// The empty-key sentinel, already in wire format.
    fn empty_key(&self) -> Vec<u8>;

    /// Convenience wrapper around `copy` for callers that just want the
    /// owned wire-format bytes for a raw key.
    fn encode(&self, src: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; src.len() + self.terminator_len()];
        let written = self.copy(&mut buf, src);
        buf.truncate(written);
        buf
    }

    /// Bytes the terminator itself occupies (1 for byte strings, 2 for wide).
    fn terminator_len(&self) -> usize;
}

/// NUL-terminated 8-bit byte strings, compared lexicographically as bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteStringCodec;

impl KeyCodec for ByteStringCodec {
    fn size(&self, bytes: &[u8]) -> usize {
        bytes.iter().position(|&b| b == 0).map_or(bytes.len(), |p| p + 1)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        trim_nul_u8(a).cmp(trim_nul_u8(b))
    }

    fn copy(&self, dst: &mut [u8], src: &[u8]) -> usize {
        dst[..src.len()].copy_from_slice(src);
        dst[src.len()] = 0;
        src.len() + 1
    }

    fn empty_key(&self) -> Vec<u8> {
        vec![0u8]
    }

    fn terminator_len(&self) -> usize {
        1
    }
}

fn trim_nul_u8(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(p) => &bytes[..p],
        None => bytes,
    }
}

/// NUL-terminated 16-bit-unit strings, compared lexicographically as units
/// (little-endian pairs).
#[derive(Debug, Default, Clone, Copy)]
pub struct WideStringCodec;

impl WideStringCodec {
    fn units(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect()
    }
}

impl KeyCodec for WideStringCodec {
    fn size(&self, bytes: &[u8]) -> usize {
        let mut n = 0;
        for chunk in bytes.chunks_exact(2) {
            n += 2;
            if chunk[0] == 0 && chunk[1] == 0 {
                break;
            }
        }
        n
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::units(a).cmp(&Self::units(b))
    }

    fn copy(&self, dst: &mut [u8], src: &[u8]) -> usize {
        dst[..src.len()].copy_from_slice(src);
        dst[src.len()] = 0;
        dst[src.len() + 1] = 0;
        src.len() + 2
    }

    fn empty_key(&self) -> Vec<u8> {
        vec![0u8, 0u8]
    }

    fn terminator_len(&self) -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_codec_orders_lexicographically() {
        let c = ByteStringCodec;
        assert_eq!(c.compare(b"ant\0", b"bee\0"), Ordering::Less);
        assert_eq!(c.compare(b"cat\0", b"cat\0"), Ordering::Equal);
        assert_eq!(c.size(b"ant\0trailing"), 4);
    }

    #[test]
    fn byte_codec_encode_appends_terminator() {
        let c = ByteStringCodec;
        assert_eq!(c.encode(b"ant"), b"ant\0");
    }

    #[test]
    fn wide_codec_orders_by_unit() {
        let c = WideStringCodec;
        let a: Vec<u8> = [0x41u16, 0x0000u16]
            .iter()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let b: Vec<u8> = [0x42u16, 0x0000u16]
            .iter()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(c.compare(&a, &b), Ordering::Less);
        assert_eq!(c.size(&a), 4);
    }
}
