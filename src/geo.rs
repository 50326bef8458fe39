use std::fmt;

use byte_unit::Byte;

use crate::addr::Field;
use crate::error::{NvmError, Result};

/// Shape of a device, or of a spanning block, and the byte sizes derived from it.
///
/// A virtual page is one flash page across all planes of a LUN and is the
/// smallest unit the I/O accessors transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    nchannels: usize,
    nluns: usize,
    nplanes: usize,
    nblocks: usize,
    npages: usize,
    nsectors: usize,

    sector_nbytes: usize,
    page_nbytes: usize,
    meta_nbytes: usize,

    tbytes: usize,
    vblk_nbytes: usize,
    vpg_nbytes: usize,
}

const CAPACITY_OVERFLOW: NvmError = NvmError::InvalidGeometry("capacity overflows usize");

impl Geometry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nchannels: usize,
        nluns: usize,
        nplanes: usize,
        nblocks: usize,
        npages: usize,
        nsectors: usize,
        sector_nbytes: usize,
        meta_nbytes: usize,
    ) -> Result<Self> {
        let counts = [
            (Field::Channel, nchannels),
            (Field::Lun, nluns),
            (Field::Plane, nplanes),
            (Field::Block, nblocks),
            (Field::Page, npages),
            (Field::Sector, nsectors),
        ];
        for (field, n) in counts {
            if n == 0 {
                return Err(NvmError::InvalidGeometry("dimension counts must be non-zero"));
            }
            if n as u64 > field.mask() + 1 {
                return Err(NvmError::InvalidGeometry(
                    "dimension count exceeds its generic address field",
                ));
            }
        }
        if sector_nbytes == 0 {
            return Err(NvmError::InvalidGeometry("sector size must be non-zero"));
        }

        let page_nbytes = nsectors.checked_mul(sector_nbytes).ok_or(CAPACITY_OVERFLOW)?;
        let vpg_nbytes = nplanes.checked_mul(page_nbytes).ok_or(CAPACITY_OVERFLOW)?;
        let vblk_nbytes = npages.checked_mul(vpg_nbytes).ok_or(CAPACITY_OVERFLOW)?;
        let tbytes = [nchannels, nluns, nblocks]
            .into_iter()
            .try_fold(vblk_nbytes, |acc, n| acc.checked_mul(n))
            .ok_or(CAPACITY_OVERFLOW)?;

        Ok(Geometry {
            nchannels,
            nluns,
            nplanes,
            nblocks,
            npages,
            nsectors,
            sector_nbytes,
            page_nbytes,
            meta_nbytes,
            tbytes,
            vblk_nbytes,
            vpg_nbytes,
        })
    }

    /// Geometry of a block spanning `nchannels` x `nluns` LUNs at one block index.
    pub fn span(&self, nchannels: usize, nluns: usize) -> Result<Geometry> {
        let width = nchannels.checked_mul(nluns).ok_or(CAPACITY_OVERFLOW)?;
        let vblk_nbytes = self.vblk_nbytes.checked_mul(width).ok_or(CAPACITY_OVERFLOW)?;

        Ok(Geometry {
            nchannels,
            nluns,
            nblocks: 1,
            tbytes: vblk_nbytes,
            vblk_nbytes,
            vpg_nbytes: self.vpg_nbytes * width,
            ..*self
        })
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    pub fn nluns(&self) -> usize {
        self.nluns
    }

    pub fn nplanes(&self) -> usize {
        self.nplanes
    }

    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn nsectors(&self) -> usize {
        self.nsectors
    }

    pub fn sector_nbytes(&self) -> usize {
        self.sector_nbytes
    }

    pub fn page_nbytes(&self) -> usize {
        self.page_nbytes
    }

    pub fn meta_nbytes(&self) -> usize {
        self.meta_nbytes
    }

    /// Total number of bytes in the geometry.
    pub fn tbytes(&self) -> usize {
        self.tbytes
    }

    pub fn vblk_nbytes(&self) -> usize {
        self.vblk_nbytes
    }

    pub fn vpg_nbytes(&self) -> usize {
        self.vpg_nbytes
    }

    /// Upper bound, exclusive, of `field` within this geometry.
    pub fn count(&self, field: Field) -> usize {
        match field {
            Field::Channel => self.nchannels,
            Field::Lun => self.nluns,
            Field::Plane => self.nplanes,
            Field::Block => self.nblocks,
            Field::Page => self.npages,
            Field::Sector => self.nsectors,
        }
    }

    /// Sector addresses making up one virtual page.
    pub fn vpg_naddrs(&self) -> usize {
        self.nplanes * self.nsectors
    }

    /// Entries in a bad-block-table: every block of every plane in a LUN.
    pub fn lun_nblocks(&self) -> usize {
        self.nplanes * self.nblocks
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch({}) lun({}) pl({}) blk({}) pg({}) sec({}) sector_nbytes({}) meta_nbytes({}) vpg_nbytes({}) vblk_nbytes({}) tbytes({}, {})",
            self.nchannels,
            self.nluns,
            self.nplanes,
            self.nblocks,
            self.npages,
            self.nsectors,
            self.sector_nbytes,
            self.meta_nbytes,
            self.vpg_nbytes,
            self.vblk_nbytes,
            self.tbytes,
            Byte::from_bytes(self.tbytes as u128).get_appropriate_unit(true).to_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_byte_sizes() {
        let geo = Geometry::new(1, 1, 2, 10, 4, 4, 4096, 16).unwrap();

        assert_eq!(geo.page_nbytes(), 16384);
        assert_eq!(geo.vpg_nbytes(), 32768);
        assert_eq!(geo.vblk_nbytes(), 131072);
        assert_eq!(geo.tbytes(), 10 * 131072);
        assert_eq!(geo.vpg_naddrs(), 8);
        assert_eq!(geo.lun_nblocks(), 20);
    }

    #[test]
    fn derivation_holds_across_shapes() {
        for nplanes in [1, 2, 4] {
            for nsectors in [1, 2, 4, 8] {
                for npages in [1, 3, 64] {
                    let geo = Geometry::new(2, 3, nplanes, 5, npages, nsectors, 4096, 16).unwrap();
                    assert_eq!(geo.vpg_nbytes(), nplanes * nsectors * geo.sector_nbytes());
                    assert_eq!(geo.vblk_nbytes(), npages * geo.vpg_nbytes());
                    assert_eq!(geo.page_nbytes(), nsectors * geo.sector_nbytes());
                }
            }
        }
    }

    #[test]
    fn rejects_empty_and_oversized_dimensions() {
        assert!(Geometry::new(0, 1, 1, 1, 1, 1, 4096, 16).is_err());
        assert!(Geometry::new(1, 1, 1, 1, 1, 0, 4096, 16).is_err());
        assert!(Geometry::new(1, 1, 1, 1, 1, 1, 0, 16).is_err());
        // channel field is 7 bits wide
        assert!(Geometry::new(128, 1, 1, 1, 1, 1, 4096, 16).is_ok());
        assert!(Geometry::new(129, 1, 1, 1, 1, 1, 4096, 16).is_err());
        assert!(Geometry::new(1, 1, 1, 65537, 1, 1, 4096, 16).is_err());
    }

    #[test]
    fn capacity_overflow_is_an_error() {
        // every count fits its address field, the product does not
        assert!(matches!(
            Geometry::new(128, 256, 256, 65536, 65536, 256, 4096, 0),
            Err(NvmError::InvalidGeometry(_))
        ));
        assert!(matches!(
            Geometry::new(1, 1, 256, 1, 1, 256, usize::MAX / 2, 0),
            Err(NvmError::InvalidGeometry(_))
        ));

        let geo = Geometry::new(1, 1, 1, 1, 1, 1, usize::MAX / 4, 0).unwrap();
        assert!(matches!(geo.span(128, 256), Err(NvmError::InvalidGeometry(_))));
    }

    #[test]
    fn span_scales_capacities() {
        let geo = Geometry::new(4, 4, 2, 100, 8, 4, 4096, 16).unwrap();
        let span = geo.span(2, 3).unwrap();

        assert_eq!(span.nchannels(), 2);
        assert_eq!(span.nluns(), 3);
        assert_eq!(span.nblocks(), 1);
        assert_eq!(span.vpg_nbytes(), geo.vpg_nbytes() * 6);
        assert_eq!(span.vblk_nbytes(), geo.vblk_nbytes() * 6);
        assert_eq!(span.tbytes(), span.vblk_nbytes());
        assert_eq!(span.npages(), geo.npages());
    }
}
