use crate::buf::DontCare;
use crate::error::Result;
use crate::geo::Geometry;

pub type BaseType = usize;

pub const CHANNELS: BaseType = 2;
pub const LUNS: BaseType = 2;
pub const PLANES: BaseType = 2;
pub const BLOCKS: BaseType = 16;
pub const PAGES: BaseType = 8;
pub const SECTORS: BaseType = 4;

pub const SECTOR_NBYTES: BaseType = 4096;
pub const META_NBYTES: BaseType = 16;

// leading bytes of every META_NBYTES stride the scrambler may garble
pub const QUIRK_NBYTES: BaseType = 4;

pub const SEED: u64 = 7;

pub const ALL_LUNS: BaseType = CHANNELS * LUNS;
pub const ALL_BLOCKS: BaseType = ALL_LUNS * BLOCKS;
pub const CAPACITY: BaseType = ALL_BLOCKS * PLANES * PAGES * SECTORS * SECTOR_NBYTES;

/// Shape and behaviour of the in-memory media model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmuConfig {
    pub channels: usize,
    pub luns: usize,
    pub planes: usize,
    pub blocks: usize,
    pub pages: usize,
    pub sectors: usize,
    pub sector_nbytes: usize,
    pub meta_nbytes: usize,
    /// Garble the don't-care bytes of every read.
    pub quirk: bool,
    pub seed: u64,
}

impl Default for EmuConfig {
    fn default() -> Self {
        EmuConfig {
            channels: CHANNELS,
            luns: LUNS,
            planes: PLANES,
            blocks: BLOCKS,
            pages: PAGES,
            sectors: SECTORS,
            sector_nbytes: SECTOR_NBYTES,
            meta_nbytes: META_NBYTES,
            quirk: false,
            seed: SEED,
        }
    }
}

impl EmuConfig {
    pub fn channels(mut self, n: usize) -> Self {
        self.channels = n;
        self
    }

    pub fn luns(mut self, n: usize) -> Self {
        self.luns = n;
        self
    }

    pub fn planes(mut self, n: usize) -> Self {
        self.planes = n;
        self
    }

    pub fn blocks(mut self, n: usize) -> Self {
        self.blocks = n;
        self
    }

    pub fn pages(mut self, n: usize) -> Self {
        self.pages = n;
        self
    }

    pub fn sectors(mut self, n: usize) -> Self {
        self.sectors = n;
        self
    }

    pub fn sector_nbytes(mut self, n: usize) -> Self {
        self.sector_nbytes = n;
        self
    }

    pub fn meta_nbytes(mut self, n: usize) -> Self {
        self.meta_nbytes = n;
        self
    }

    pub fn quirk(mut self, enabled: bool) -> Self {
        self.quirk = enabled;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(
            self.channels,
            self.luns,
            self.planes,
            self.blocks,
            self.pages,
            self.sectors,
            self.sector_nbytes,
            self.meta_nbytes,
        )
    }

    /// Bytes a reader has to ignore when comparing data read back.
    pub fn dont_care(&self) -> Option<DontCare> {
        if !self.quirk || self.meta_nbytes == 0 {
            return None;
        }

        Some(DontCare {
            stride: self.meta_nbytes,
            nbytes: QUIRK_NBYTES.min(self.meta_nbytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_constants() {
        let geo = EmuConfig::default().geometry().unwrap();

        assert_eq!(geo.tbytes(), CAPACITY);
        assert_eq!(geo.nchannels() * geo.nluns() * geo.nblocks(), ALL_BLOCKS);
        assert_eq!(EmuConfig::default().dont_care(), None);
    }

    #[test]
    fn setters_chain() {
        let config = EmuConfig::default().channels(1).luns(1).planes(4).quirk(true);
        let geo = config.geometry().unwrap();

        assert_eq!((geo.nchannels(), geo.nluns(), geo.nplanes()), (1, 1, 4));
        assert_eq!(
            config.dont_care(),
            Some(DontCare { stride: META_NBYTES, nbytes: QUIRK_NBYTES })
        );
        assert!(EmuConfig::default().sectors(0).geometry().is_err());
    }
}
