use std::fmt;

use crate::addr::{Addr, Field};
use crate::dev::{Device, Flags};
use crate::error::{NvmError, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    Good = 0x0,
    Bad = 0x1,
    GrownBad = 0x2,
}

impl TryFrom<u8> for BlockState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x0 => Ok(BlockState::Good),
            0x1 => Ok(BlockState::Bad),
            0x2 => Ok(BlockState::GrownBad),
            other => Err(other),
        }
    }
}

pub struct BadBlockTable<'a> {
    dev: &'a Device,
    addr: Addr,
    blks: Vec<u8>,
}

impl<'a> BadBlockTable<'a> {
    /// Fetches the table of the LUN `lun_addr` belongs to.
    pub fn get(dev: &'a Device, lun_addr: Addr) -> Result<Self> {
        lun_addr.ensure_within(dev.geo())?;

        let addr = Addr::default()
            .set(Field::Channel, lun_addr.ch())
            .set(Field::Lun, lun_addr.lun());
        let mut blks = vec![0u8; dev.geo().lun_nblocks()];
        dev.get_bbt(addr, &mut blks)?;

        debug!("bbt: fetched {} entries for {}", blks.len(), addr);
        Ok(BadBlockTable { dev, addr, blks })
    }

    /// Pushes the whole table to the device; returns the number of entries it changed.
    pub fn set(&self) -> Result<usize> {
        let completion = self.dev.set_bbt(self.addr, &self.blks)?;

        debug!("bbt: {} entries updated on {}", completion.nbytes, self.addr);
        Ok(completion.nbytes)
    }

    pub fn dev(&self) -> &'a Device {
        self.dev
    }

    /// Address of the LUN the table covers.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn blks(&self) -> &[u8] {
        &self.blks
    }

    pub fn blks_mut(&mut self) -> &mut [u8] {
        &mut self.blks
    }

    pub fn nblks(&self) -> usize {
        self.blks.len()
    }

    /// Entry holding the block `addr` names, if it lies in this table's LUN.
    pub fn index_of(&self, addr: Addr) -> Option<usize> {
        let geo = self.dev.geo();
        let same_lun = addr.ch() == self.addr.ch() && addr.lun() == self.addr.lun();
        if !same_lun || addr.blk() >= geo.nblocks() || addr.pl() >= geo.nplanes() {
            return None;
        }

        Some(addr.blk() * geo.nplanes() + addr.pl())
    }

    pub fn state(&self, index: usize) -> Option<BlockState> {
        self.blks
            .get(index)
            .and_then(|raw| BlockState::try_from(*raw).ok())
    }

    pub fn state_of(&self, addr: Addr) -> Option<BlockState> {
        self.index_of(addr).and_then(|index| self.state(index))
    }

    pub fn set_state(&mut self, index: usize, state: BlockState) -> Result<()> {
        let nblks = self.blks.len();
        let entry = self
            .blks
            .get_mut(index)
            .ok_or(NvmError::OffsetOutOfRange {
                offset: index,
                capacity: nblks,
            })?;
        *entry = state as u8;
        Ok(())
    }

    /// Indices of every entry not in the good state.
    pub fn bad_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.blks
            .iter()
            .enumerate()
            .filter(|(_, raw)| **raw != BlockState::Good as u8)
            .map(|(i, _)| i)
    }
}

impl fmt::Display for BadBlockTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bbt {} nblks({}) nbad({})",
            self.addr,
            self.blks.len(),
            self.bad_indices().count()
        )
    }
}

/// Sets the state of blocks. Addresses are read at block granularity; with a
/// dual or quad plane mode in `flags` one address covers all its planes.
pub fn mark(dev: &Device, addrs: &[Addr], state: BlockState, flags: Flags) -> Result<()> {
    dev.mark(addrs, state, flags)?;

    debug!("bbt: marked {} blocks {:?}", addrs.len(), state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmuConfig;
    use crate::dev::PlaneMode;
    use crate::emu::EmuDriver;

    fn device() -> Device {
        Device::open("emu0", EmuDriver::new(&EmuConfig::default()).unwrap()).unwrap()
    }

    #[test]
    fn fresh_table_is_all_good() {
        let dev = device();
        let bbt = BadBlockTable::get(&dev, Addr::new(1, 1, 0, 0, 0, 0).unwrap()).unwrap();

        assert_eq!(bbt.nblks(), dev.geo().nplanes() * dev.geo().nblocks());
        assert_eq!(bbt.addr(), Addr::new(1, 1, 0, 0, 0, 0).unwrap());
        assert_eq!(bbt.bad_indices().count(), 0);
    }

    #[test]
    fn get_rejects_out_of_bounds_lun() {
        let dev = device();
        let lun = Addr::new(0, dev.geo().nluns(), 0, 0, 0, 0).unwrap();

        assert!(matches!(
            BadBlockTable::get(&dev, lun),
            Err(NvmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn mark_then_get_reports_bad() {
        let dev = device();
        let blk = Addr::new(0, 1, 1, 7, 0, 0).unwrap();

        mark(&dev, &[blk], BlockState::Bad, dev.flags()).unwrap();

        let bbt = BadBlockTable::get(&dev, blk).unwrap();
        let index = bbt.index_of(blk).unwrap();
        assert_eq!(index, 7 * dev.geo().nplanes() + 1);
        assert_eq!(bbt.state(index), Some(BlockState::Bad));
        // single plane mode touches only the addressed plane
        assert_eq!(bbt.state_of(blk.set(Field::Plane, 0)), Some(BlockState::Good));
        assert_eq!(bbt.bad_indices().collect::<Vec<_>>(), vec![index]);
    }

    #[test]
    fn mark_in_dual_plane_mode_covers_all_planes() {
        let mut dev = device();
        dev.set_pmode(PlaneMode::Dual).unwrap();
        let blk = Addr::new(1, 0, 0, 3, 0, 0).unwrap();

        mark(&dev, &[blk], BlockState::GrownBad, dev.flags()).unwrap();

        let bbt = BadBlockTable::get(&dev, blk).unwrap();
        for pl in 0..dev.geo().nplanes() {
            assert_eq!(bbt.state_of(blk.set(Field::Plane, pl)), Some(BlockState::GrownBad));
        }
    }

    #[test]
    fn set_pushes_edits_and_counts_changes() {
        let dev = device();
        let lun = Addr::new(1, 0, 0, 0, 0, 0).unwrap();

        let mut bbt = BadBlockTable::get(&dev, lun).unwrap();
        bbt.set_state(0, BlockState::Bad).unwrap();
        bbt.set_state(5, BlockState::GrownBad).unwrap();
        assert_eq!(bbt.set().unwrap(), 2);
        // pushing the same table again changes nothing
        assert_eq!(bbt.set().unwrap(), 0);

        let fetched = BadBlockTable::get(&dev, lun).unwrap();
        assert_eq!(fetched.blks(), bbt.blks());
        assert_eq!(fetched.state(5), Some(BlockState::GrownBad));

        let mut restored = fetched;
        restored.blks_mut().fill(BlockState::Good as u8);
        assert_eq!(restored.set().unwrap(), 2);
    }

    #[test]
    fn index_of_ignores_other_luns() {
        let dev = device();
        let mut bbt = BadBlockTable::get(&dev, Addr::new(0, 0, 0, 0, 0, 0).unwrap()).unwrap();

        assert_eq!(bbt.index_of(Addr::new(0, 1, 0, 2, 0, 0).unwrap()), None);
        assert!(bbt.set_state(bbt.nblks(), BlockState::Bad).is_err());
    }

    #[test]
    fn state_bytes_round_trip() {
        for state in [BlockState::Good, BlockState::Bad, BlockState::GrownBad] {
            assert_eq!(BlockState::try_from(state as u8), Ok(state));
        }
        assert_eq!(BlockState::try_from(0x8), Err(0x8));
    }
}
