//! Device handle and the command boundary to the transport.

use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
use num_integer::Integer;

use crate::addr::{self, Addr, AddressFormat, Bounds, Field, LbaMap};
use crate::bbt::BlockState;
use crate::buf::{self, AlignedBuf};
use crate::error::{NvmError, Result};
use crate::geo::Geometry;

bitflags! {
    /// Access mode bits carried by every command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u16 {
        const PMODE_DUAL = 0x1;
        const PMODE_QUAD = 0x2;
        const SCRBL = 0x200;
    }
}

/// Number of planes a single command addresses at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneMode {
    Single,
    Dual,
    Quad,
}

impl PlaneMode {
    pub fn flags(self) -> Flags {
        match self {
            PlaneMode::Single => Flags::empty(),
            PlaneMode::Dual => Flags::PMODE_DUAL,
            PlaneMode::Quad => Flags::PMODE_QUAD,
        }
    }

    pub fn from_flags(flags: Flags) -> Self {
        if flags.contains(Flags::PMODE_QUAD) {
            PlaneMode::Quad
        } else if flags.contains(Flags::PMODE_DUAL) {
            PlaneMode::Dual
        } else {
            PlaneMode::Single
        }
    }

    pub fn nplanes(self) -> usize {
        match self {
            PlaneMode::Single => 1,
            PlaneMode::Dual => 2,
            PlaneMode::Quad => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Erase,
    Write,
    Read,
    /// Set the state of individual blocks.
    Mark(BlockState),
    GetBbt,
    SetBbt,
}

impl Opcode {
    /// Opcode as sent on the wire.
    pub fn code(self) -> u8 {
        match self {
            Opcode::Erase => 0x90,
            Opcode::Write => 0x91,
            Opcode::Read => 0x92,
            Opcode::Mark(_) | Opcode::SetBbt => 0xF1,
            Opcode::GetBbt => 0xF2,
        }
    }
}

/// Completion record of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ret {
    /// Completion bits, one per address of the command.
    pub status: u64,
    /// Error code.
    pub result: u32,
}

impl fmt::Display for Ret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status(0x{:016x}) result(0x{:08x})", self.status, self.result)
    }
}

/// Buffer attached to a command, named from the host's point of view.
#[derive(Debug)]
pub enum Data<'a> {
    None,
    ToDevice(&'a [u8]),
    FromDevice(&'a mut [u8]),
}

/// One request handed to the driver; addresses are in device format.
#[derive(Debug)]
pub struct Command<'a> {
    pub opcode: Opcode,
    pub addrs: &'a [u64],
    pub data: Data<'a>,
    pub meta: Data<'a>,
    pub flags: Flags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// Bytes moved; for [`Opcode::SetBbt`] the number of entries changed.
    pub nbytes: usize,
    pub ret: Ret,
}

/// Transport to an Open-Channel device.
///
/// Implementations must tolerate concurrent calls if the handle is shared
/// between threads; the core never serializes on a device.
pub trait Driver: Send + Sync {
    fn geometry(&self) -> Result<Geometry>;

    fn address_format(&self) -> Result<AddressFormat>;

    /// Executes `cmd`, blocking until the device completes it. Device failures
    /// are reported as [`NvmError::Command`] with the completion record.
    fn submit(&self, cmd: Command<'_>) -> Result<Completion>;

    /// Takes ownership of a free block, optionally on a given `(channel, lun)`.
    fn acquire_block(&self, lun: Option<(usize, usize)>) -> Result<Addr>;

    /// Hands a block obtained from [`Driver::acquire_block`] back.
    fn release_block(&self, addr: Addr) -> Result<()>;
}

pub struct Device {
    name: String,
    geo: Geometry,
    fmt: AddressFormat,
    lba_map: LbaMap,
    flags: Flags,
    driver: Box<dyn Driver>,
}

impl Device {
    pub fn open(name: impl Into<String>, driver: impl Driver + 'static) -> Result<Self> {
        let name = name.into();
        let geo = driver.geometry()?;
        let fmt = driver.address_format()?;
        fmt.validate()?;

        info!("{}: geometry {}", name, geo);
        debug!("{}: address format {}", name, fmt);

        Ok(Device {
            name,
            geo,
            fmt,
            lba_map: LbaMap::new(&geo),
            flags: PlaneMode::Single.flags() | Flags::SCRBL,
            driver: Box::new(driver),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geo(&self) -> &Geometry {
        &self.geo
    }

    pub fn fmt(&self) -> &AddressFormat {
        &self.fmt
    }

    pub fn lba_map(&self) -> &LbaMap {
        &self.lba_map
    }

    /// Flags used by the block accessors for their commands.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn pmode(&self) -> PlaneMode {
        PlaneMode::from_flags(self.flags)
    }

    pub fn set_pmode(&mut self, pmode: PlaneMode) -> Result<()> {
        if pmode.nplanes() > self.geo.nplanes() {
            return Err(NvmError::PlaneMode {
                mode: pmode,
                nplanes: self.geo.nplanes(),
            });
        }

        self.flags = (self.flags - (Flags::PMODE_DUAL | Flags::PMODE_QUAD)) | pmode.flags();
        Ok(())
    }

    pub fn addr_check(&self, addr: Addr) -> Bounds {
        addr::check(addr, &self.geo)
    }

    pub fn addr_gen2dev(&self, addr: Addr) -> Result<u64> {
        self.fmt.gen2dev(addr)
    }

    pub fn addr_dev2gen(&self, raw: u64) -> Result<Addr> {
        self.fmt.dev2gen(raw)
    }

    pub fn addr_gen2lba(&self, addr: Addr) -> Result<usize> {
        self.lba_map.addr_to_lba(addr, &self.geo)
    }

    pub fn addr_lba2gen(&self, lba: usize) -> Result<Addr> {
        self.lba_map.lba_to_addr(lba, &self.geo)
    }

    pub fn buf_alloc(&self, nbytes: usize) -> Result<AlignedBuf> {
        buf::alloc(&self.geo, nbytes)
    }

    /// Erases blocks; the addresses are read at block granularity.
    pub fn erase(&self, addrs: &[Addr], flags: Flags) -> Result<Completion> {
        self.submit(Opcode::Erase, addrs, Data::None, Data::None, flags)
    }

    /// Writes `data` to sector addresses, one `sector_nbytes` slice per address.
    pub fn write(&self, addrs: &[Addr], data: &[u8], meta: Option<&[u8]>, flags: Flags) -> Result<Completion> {
        self.ensure_payload(addrs.len(), data.len(), meta.map(<[u8]>::len))?;

        let meta = meta.map_or(Data::None, Data::ToDevice);
        self.submit(Opcode::Write, addrs, Data::ToDevice(data), meta, flags)
    }

    /// Reads sector addresses into `data`, one `sector_nbytes` slice per address.
    pub fn read(
        &self,
        addrs: &[Addr],
        data: &mut [u8],
        meta: Option<&mut [u8]>,
        flags: Flags,
    ) -> Result<Completion> {
        self.ensure_payload(addrs.len(), data.len(), meta.as_ref().map(|m| m.len()))?;

        let meta = meta.map_or(Data::None, Data::FromDevice);
        self.submit(Opcode::Read, addrs, Data::FromDevice(data), meta, flags)
    }

    /// Writes `buf` at the linear byte `offset`, one command per virtual page touched.
    pub fn lba_pwrite(&self, buf: &[u8], offset: usize) -> Result<usize> {
        for (addrs, bytes) in self.lba_commands(buf.len(), offset)? {
            self.write(&addrs, &buf[bytes], None, self.flags)?;
        }

        debug!("{}: lba wrote {} bytes at {}", self.name, buf.len(), offset);
        Ok(buf.len())
    }

    /// Reads `buf.len()` bytes from the linear byte `offset`.
    pub fn lba_pread(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let count = buf.len();
        for (addrs, bytes) in self.lba_commands(count, offset)? {
            self.read(&addrs, &mut buf[bytes], None, self.flags)?;
        }

        debug!("{}: lba read {} bytes at {}", self.name, count, offset);
        Ok(count)
    }

    /// Sectors of `[offset, offset + count)` grouped by the virtual page holding them.
    fn lba_commands(&self, count: usize, offset: usize) -> Result<Vec<(Vec<Addr>, Range<usize>)>> {
        let sector_nbytes = self.geo.sector_nbytes();

        if count == 0 || !Integer::is_multiple_of(&count, &sector_nbytes) {
            return Err(NvmError::Misaligned {
                nbytes: count,
                align: sector_nbytes,
            });
        }
        if !Integer::is_multiple_of(&offset, &sector_nbytes) {
            return Err(NvmError::Misaligned {
                nbytes: offset,
                align: sector_nbytes,
            });
        }
        let capacity = self.geo.tbytes();
        offset
            .checked_add(count)
            .filter(|end| *end <= capacity)
            .ok_or(NvmError::OffsetOutOfRange { offset, capacity })?;

        let mut commands: Vec<(Vec<Addr>, Range<usize>)> = Vec::new();
        for pos in (0..count).step_by(sector_nbytes) {
            let addr = self.lba_map.lba_to_addr(offset + pos, &self.geo)?;
            let vpage = addr.set(Field::Plane, 0).set(Field::Sector, 0);

            match commands.last_mut() {
                Some((addrs, bytes)) if addrs[0].set(Field::Plane, 0).set(Field::Sector, 0) == vpage => {
                    addrs.push(addr);
                    bytes.end += sector_nbytes;
                }
                _ => commands.push((vec![addr], pos..pos + sector_nbytes)),
            }
        }
        Ok(commands)
    }

    /// Sets the state of blocks; the addresses are read at block granularity.
    pub fn mark(&self, addrs: &[Addr], state: BlockState, flags: Flags) -> Result<Completion> {
        self.submit(Opcode::Mark(state), addrs, Data::None, Data::None, flags)
    }

    pub(crate) fn get_bbt(&self, lun: Addr, blks: &mut [u8]) -> Result<Completion> {
        self.submit(Opcode::GetBbt, &[lun], Data::FromDevice(blks), Data::None, Flags::empty())
    }

    pub(crate) fn set_bbt(&self, lun: Addr, blks: &[u8]) -> Result<Completion> {
        self.submit(Opcode::SetBbt, &[lun], Data::ToDevice(blks), Data::None, Flags::empty())
    }

    pub(crate) fn acquire_block(&self, lun: Option<(usize, usize)>) -> Result<Addr> {
        if let Some((ch, lun_idx)) = lun {
            Addr::default()
                .with(Field::Channel, ch)?
                .with(Field::Lun, lun_idx)?
                .ensure_within(&self.geo)?;
        }

        let addr = self.driver.acquire_block(lun)?;
        debug!("{}: acquired block {}", self.name, addr);
        Ok(addr)
    }

    pub(crate) fn release_block(&self, addr: Addr) -> Result<()> {
        self.driver.release_block(addr)?;
        debug!("{}: released block {}", self.name, addr);
        Ok(())
    }

    /// Addresses covering the block holding `blk` on every plane, one per
    /// group of planes the current plane mode addresses together.
    pub(crate) fn block_addrs(&self, blk: Addr) -> Vec<Addr> {
        let blk = blk.set(Field::Page, 0).set(Field::Sector, 0);

        (0..self.geo.nplanes())
            .step_by(self.pmode().nplanes())
            .map(|pl| blk.set(Field::Plane, pl))
            .collect()
    }

    /// Sector addresses of one virtual page: planes outer, sectors inner.
    pub(crate) fn vpage_addrs(&self, blk: Addr, pg: usize) -> impl Iterator<Item = Addr> {
        let nsectors = self.geo.nsectors();
        let base = blk.set(Field::Page, pg);

        (0..self.geo.vpg_naddrs()).map(move |i| {
            base.set(Field::Plane, i / nsectors)
                .set(Field::Sector, i % nsectors)
        })
    }

    fn ensure_payload(&self, naddrs: usize, nbytes: usize, meta_nbytes: Option<usize>) -> Result<()> {
        let needed = naddrs * self.geo.sector_nbytes();
        if nbytes < needed {
            return Err(NvmError::BufferTooSmall { needed, actual: nbytes });
        }

        if let Some(actual) = meta_nbytes {
            let needed = naddrs * self.geo.meta_nbytes();
            if actual < needed {
                return Err(NvmError::BufferTooSmall { needed, actual });
            }
        }
        Ok(())
    }

    fn submit(&self, opcode: Opcode, addrs: &[Addr], data: Data<'_>, meta: Data<'_>, flags: Flags) -> Result<Completion> {
        if addrs.is_empty() {
            return Err(NvmError::InvalidState("command without addresses"));
        }

        let mut dev_addrs = Vec::with_capacity(addrs.len());
        for addr in addrs {
            addr.ensure_within(&self.geo)?;
            dev_addrs.push(self.fmt.gen2dev(*addr)?);
        }

        debug!("{}: {:?} naddrs({}) flags({:?})", self.name, opcode, addrs.len(), flags);
        trace!("{}: addrs {:?}", self.name, addrs);

        let cmd = Command {
            opcode,
            addrs: &dev_addrs,
            data,
            meta,
            flags,
        };

        match self.driver.submit(cmd) {
            Ok(completion) => Ok(completion),
            Err(err) => {
                warn!("{}: {:?} on {} failed: {}", self.name, opcode, addrs[0], err);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("geo", &self.geo)
            .field("fmt", &self.fmt)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmuConfig;
    use crate::emu::EmuDriver;
    use crate::vblk::VirtualBlock;

    fn device(nplanes: usize) -> Device {
        let config = EmuConfig::default().planes(nplanes);
        Device::open("emu0", EmuDriver::new(&config).unwrap()).unwrap()
    }

    #[test]
    fn plane_mode_requires_enough_planes() {
        let mut dev = device(2);
        assert_eq!(dev.pmode(), PlaneMode::Single);
        assert!(dev.flags().contains(Flags::SCRBL));

        dev.set_pmode(PlaneMode::Dual).unwrap();
        assert_eq!(dev.pmode(), PlaneMode::Dual);
        assert!(dev.flags().contains(Flags::SCRBL | Flags::PMODE_DUAL));

        assert!(matches!(
            dev.set_pmode(PlaneMode::Quad),
            Err(NvmError::PlaneMode { nplanes: 2, .. })
        ));

        dev.set_pmode(PlaneMode::Single).unwrap();
        assert_eq!(dev.flags(), Flags::SCRBL);
    }

    #[test]
    fn block_addrs_fan_out_per_plane_mode() {
        let mut dev = device(4);
        let blk = Addr::new(1, 0, 3, 5, 2, 1).unwrap();

        let addrs = dev.block_addrs(blk);
        assert_eq!(addrs.len(), 4);
        for (pl, addr) in addrs.iter().enumerate() {
            assert_eq!((addr.ch(), addr.blk(), addr.pl(), addr.pg(), addr.sec()), (1, 5, pl, 0, 0));
        }

        dev.set_pmode(PlaneMode::Dual).unwrap();
        let planes: Vec<_> = dev.block_addrs(blk).iter().map(|addr| addr.pl()).collect();
        assert_eq!(planes, vec![0, 2]);

        dev.set_pmode(PlaneMode::Quad).unwrap();
        assert_eq!(dev.block_addrs(blk), vec![Addr::new(1, 0, 0, 5, 0, 0).unwrap()]);
    }

    #[test]
    fn vpage_addrs_are_plane_major() {
        let dev = device(2);
        let blk = Addr::new(0, 1, 0, 3, 0, 0).unwrap();
        let addrs: Vec<_> = dev.vpage_addrs(blk, 2).collect();

        let nsectors = dev.geo().nsectors();
        assert_eq!(addrs.len(), 2 * nsectors);
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(addr.pl(), i / nsectors);
            assert_eq!(addr.sec(), i % nsectors);
            assert_eq!((addr.lun(), addr.blk(), addr.pg()), (1, 3, 2));
        }
    }

    #[test]
    fn out_of_bounds_addresses_never_reach_the_driver() {
        let dev = device(2);
        let bad = Addr::new(0, 0, 0, dev.geo().nblocks(), 0, 0).unwrap();

        match dev.erase(&[bad], dev.flags()) {
            Err(NvmError::OutOfBounds { bounds, .. }) => assert_eq!(bounds, Bounds::BLOCK),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn undersized_payloads_are_rejected() {
        let dev = device(2);
        let blk = Addr::new(0, 0, 0, 1, 0, 0).unwrap();
        let addrs: Vec<_> = dev.vpage_addrs(blk, 0).collect();
        let data = vec![0u8; dev.geo().vpg_nbytes() - 1];

        assert!(matches!(
            dev.write(&addrs, &data, None, dev.flags()),
            Err(NvmError::BufferTooSmall { .. })
        ));

        let data = vec![0u8; dev.geo().vpg_nbytes()];
        let meta = vec![0u8; 1];
        assert!(matches!(
            dev.write(&addrs, &data, Some(&meta[..]), dev.flags()),
            Err(NvmError::BufferTooSmall { actual: 1, .. })
        ));
    }

    #[test]
    fn lba_io_matches_virtual_block_layout() {
        let dev = device(2);
        let vpg_nbytes = dev.geo().vpg_nbytes();
        let sector_nbytes = dev.geo().sector_nbytes();
        let blk = Addr::new(1, 0, 0, 6, 0, 0).unwrap();
        let base = dev.addr_gen2lba(blk).unwrap();

        let mut data = dev.buf_alloc(2 * vpg_nbytes).unwrap();
        buf::fill(&mut data);
        dev.lba_pwrite(&data, base).unwrap();

        let mut vblk = VirtualBlock::on_device(&dev, blk).unwrap();
        let mut back = dev.buf_alloc(data.len()).unwrap();
        vblk.pread(&mut back, 0).unwrap();
        assert_eq!(&back[..], &data[..]);

        // sector aligned, straddling the page boundary
        let mut straddle = vec![0u8; vpg_nbytes];
        dev.lba_pread(&mut straddle, base + 3 * sector_nbytes).unwrap();
        assert_eq!(&straddle[..], &data[3 * sector_nbytes..3 * sector_nbytes + vpg_nbytes]);
    }

    #[test]
    fn lba_io_validates_before_submitting() {
        let dev = device(2);
        let sector_nbytes = dev.geo().sector_nbytes();
        let mut sector = vec![0u8; sector_nbytes];

        assert!(matches!(dev.lba_pread(&mut sector, 1), Err(NvmError::Misaligned { .. })));
        assert!(matches!(
            dev.lba_pwrite(&sector[..sector_nbytes - 1], 0),
            Err(NvmError::Misaligned { .. })
        ));
        assert!(matches!(
            dev.lba_pread(&mut sector, dev.geo().tbytes()),
            Err(NvmError::OffsetOutOfRange { .. })
        ));
        let huge = (usize::MAX / sector_nbytes) * sector_nbytes;
        assert!(matches!(
            dev.lba_pwrite(&sector, huge),
            Err(NvmError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn address_conversions_delegate_to_codec() {
        let dev = device(2);
        let addr = Addr::new(1, 1, 1, 2, 3, 1).unwrap();

        let raw = dev.addr_gen2dev(addr).unwrap();
        assert_eq!(dev.addr_dev2gen(raw).unwrap(), addr);

        let lba = dev.addr_gen2lba(addr).unwrap();
        assert_eq!(dev.addr_lba2gen(lba).unwrap(), addr);
        assert!(dev.addr_check(addr).is_empty());
    }
}
