//! Geometry aligned I/O buffers and helpers for verifying their content.

use std::fmt;
use std::ops::{Deref, DerefMut};

use num_integer::Integer;

use crate::error::{NvmError, Result};
use crate::geo::Geometry;

/// Zeroed heap buffer whose first byte is aligned for direct transfers.
pub struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
    align: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize, align: usize) -> Self {
        let raw = vec![0u8; len + align];
        let misalign = raw.as_ptr() as usize % align;
        let offset = (align - misalign) % align;

        AlignedBuf {
            raw,
            offset,
            len,
            align,
        }
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}

/// Allocates `nbytes`, a non-zero multiple of `geo.vpg_nbytes()`, aligned to
/// the virtual page size rounded up to a power of two.
pub fn alloc(geo: &Geometry, nbytes: usize) -> Result<AlignedBuf> {
    let vpg_nbytes = geo.vpg_nbytes();
    if nbytes == 0 || !Integer::is_multiple_of(&nbytes, &vpg_nbytes) {
        return Err(NvmError::Misaligned {
            nbytes,
            align: vpg_nbytes,
        });
    }

    Ok(AlignedBuf::zeroed(nbytes, vpg_nbytes.next_power_of_two()))
}

/// Fills `buf` with the letters A to Z, repeating.
pub fn fill(buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = b'A' + (i % 26) as u8;
    }
}

/// Byte range ignored when comparing: in every `stride` bytes, the first `nbytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DontCare {
    pub stride: usize,
    pub nbytes: usize,
}

/// Number of positions at which `expected` and `actual` differ, over the
/// shorter of the two.
pub fn diff(expected: &[u8], actual: &[u8]) -> usize {
    diff_masked(expected, actual, None)
}

pub fn diff_masked(expected: &[u8], actual: &[u8], mask: Option<DontCare>) -> usize {
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(i, _)| match mask {
            Some(DontCare { stride, nbytes }) if stride > 0 => i % stride >= nbytes,
            _ => true,
        })
        .filter(|(_, (e, a))| e != a)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(1, 1, 2, 10, 4, 4, 4096, 16).unwrap()
    }

    #[test]
    fn alloc_requires_whole_virtual_pages() {
        let geo = geo();

        assert!(matches!(alloc(&geo, 0), Err(NvmError::Misaligned { .. })));
        assert!(matches!(
            alloc(&geo, geo.vpg_nbytes() + 512),
            Err(NvmError::Misaligned { align: 32768, .. })
        ));

        let buf = alloc(&geo, 2 * geo.vpg_nbytes()).unwrap();
        assert_eq!(buf.len(), 2 * geo.vpg_nbytes());
        assert_eq!(buf.as_ptr() as usize % geo.vpg_nbytes(), 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn alloc_rounds_odd_alignment_up() {
        let geo = Geometry::new(1, 1, 3, 1, 1, 1, 512, 8).unwrap();
        let buf = alloc(&geo, geo.vpg_nbytes()).unwrap();

        assert_eq!(buf.align(), 2048);
        assert_eq!(buf.as_ptr() as usize % 2048, 0);
    }

    #[test]
    fn fill_cycles_alphabet() {
        let mut buf = [0u8; 60];
        fill(&mut buf);

        assert_eq!(&buf[..3], b"ABC");
        assert_eq!(buf[25], b'Z');
        assert_eq!(buf[26], b'A');
        assert_eq!(buf[59], b'A' + (59 % 26) as u8);
    }

    #[test]
    fn diff_counts_mismatches() {
        let mut a = [0u8; 64];
        fill(&mut a);
        let mut b = a;
        assert_eq!(diff(&a, &b), 0);

        b[0] ^= 0xff;
        b[21] ^= 0xff;
        b[40] ^= 0xff;
        assert_eq!(diff(&a, &b), 3);

        // bytes 0..4 of every 16 are ignored
        let mask = Some(DontCare { stride: 16, nbytes: 4 });
        assert_eq!(diff_masked(&a, &b, mask), 2);
        b[32] ^= 0xff;
        assert_eq!(diff_masked(&a, &b, mask), 2);
        assert_eq!(diff(&a, &b), 4);
    }
}
