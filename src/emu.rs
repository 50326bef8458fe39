use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::prelude::*;

use crate::addr::{Addr, AddressFormat, Field};
use crate::bbt::BlockState;
use crate::buf::DontCare;
use crate::config::EmuConfig;
use crate::dev::{Command, Completion, Data, Driver, Flags, Opcode, PlaneMode, Ret};
use crate::error::{NvmError, Result};
use crate::geo::Geometry;

pub const RESULT_INVALID_FIELD: u32 = 0x4002;
pub const RESULT_FAIL_WRITE: u32 = 0x40ff;
pub const RESULT_EMPTY_PAGE: u32 = 0x42ff;
pub const RESULT_FAIL_ECC: u32 = 0x4281;

type Counter = usize;

/// Shared switch for failing commands on purpose. Clones control the same driver.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    countdown: Arc<Mutex<Option<usize>>>,
}

impl Faults {
    /// Lets `n` more commands through and fails the one after.
    pub fn fail_after(&self, n: usize) {
        *lock(&self.countdown) = Some(n);
    }

    pub fn clear(&self) {
        *lock(&self.countdown) = None;
    }

    fn trip(&self) -> bool {
        let mut countdown = lock(&self.countdown);
        match *countdown {
            Some(0) => {
                *countdown = None;
                true
            }
            Some(ref mut n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One block on one plane.
#[derive(Clone)]
struct Block {
    data: Vec<u8>,
    meta: Vec<u8>,
    written: Vec<bool>,
    valid_counter: Counter,
    erase_counter: Counter,
}

impl Block {
    fn new(geo: &Geometry) -> Self {
        let nsectors = geo.npages() * geo.nsectors();
        Block {
            data: vec![0; nsectors * geo.sector_nbytes()],
            meta: vec![0; nsectors * geo.meta_nbytes()],
            written: vec![false; nsectors],
            valid_counter: 0,
            erase_counter: 0,
        }
    }

    fn erase(&mut self) {
        self.written.fill(false);
        self.valid_counter = 0;
        self.erase_counter += 1;
    }
}

struct Media {
    blocks: HashMap<Addr, Block>,
    bbt: Vec<u8>,
    free_blocks: VecDeque<Addr>,
    owned: HashSet<Addr>,
    rng: SmallRng,
}

pub struct EmuDriver {
    geo: Geometry,
    fmt: AddressFormat,
    dont_care: Option<DontCare>,
    media: Mutex<Media>,
    faults: Faults,
}

impl EmuDriver {
    pub fn new(config: &EmuConfig) -> Result<Self> {
        let geo = config.geometry()?;

        let mut free_blocks = VecDeque::with_capacity(geo.nchannels() * geo.nluns() * geo.nblocks());
        for ch in 0..geo.nchannels() {
            for lun in 0..geo.nluns() {
                for blk in 0..geo.nblocks() {
                    free_blocks.push_back(Addr::new(ch, lun, 0, blk, 0, 0)?);
                }
            }
        }

        trace!("emu: {} free blocks, seed {}", free_blocks.len(), config.seed);
        Ok(EmuDriver {
            geo,
            fmt: AddressFormat::packed(&geo),
            dont_care: config.dont_care(),
            media: Mutex::new(Media {
                blocks: HashMap::new(),
                bbt: vec![BlockState::Good as u8; geo.nchannels() * geo.nluns() * geo.lun_nblocks()],
                free_blocks,
                owned: HashSet::new(),
                rng: SmallRng::seed_from_u64(config.seed),
            }),
            faults: Faults::default(),
        })
    }

    /// Reports `fmt` instead of the packed format.
    pub fn with_format(mut self, fmt: AddressFormat) -> Self {
        self.fmt = fmt;
        self
    }

    pub fn faults(&self) -> Faults {
        self.faults.clone()
    }

    /// Times the plane-block holding `addr` has been erased.
    pub fn erase_count(&self, addr: Addr) -> Counter {
        lock(&self.media)
            .blocks
            .get(&plane_block(addr))
            .map_or(0, |block| block.erase_counter)
    }

    /// Sectors programmed since the last erase of the plane-block holding `addr`.
    pub fn valid_count(&self, addr: Addr) -> Counter {
        lock(&self.media)
            .blocks
            .get(&plane_block(addr))
            .map_or(0, |block| block.valid_counter)
    }

    pub fn nfree(&self) -> usize {
        lock(&self.media).free_blocks.len()
    }

    fn bbt_index(&self, addr: Addr) -> usize {
        let lun = addr.ch() * self.geo.nluns() + addr.lun();
        lun * self.geo.lun_nblocks() + addr.blk() * self.geo.nplanes() + addr.pl()
    }

    fn sector_index(&self, addr: Addr) -> usize {
        addr.pg() * self.geo.nsectors() + addr.sec()
    }

    /// Plane-blocks a block-granular address covers under `flags`.
    fn planes(&self, addr: Addr, flags: Flags) -> Vec<Addr> {
        let addr = plane_block(addr);
        let last = (addr.pl() + PlaneMode::from_flags(flags).nplanes()).min(self.geo.nplanes());

        (addr.pl()..last)
            .map(|pl| addr.set(Field::Plane, pl))
            .collect()
    }

    fn is_good(&self, media: &Media, addr: Addr) -> bool {
        media.bbt[self.bbt_index(addr)] == BlockState::Good as u8
    }

    fn erase(&self, media: &mut Media, addrs: &[Addr], flags: Flags) -> u64 {
        let mut status = 0;
        for (i, addr) in addrs.iter().enumerate() {
            for blk in self.planes(*addr, flags) {
                if !self.is_good(media, blk) {
                    status |= status_bit(i);
                    continue;
                }
                media
                    .blocks
                    .entry(blk)
                    .or_insert_with(|| Block::new(&self.geo))
                    .erase();
            }
        }
        status
    }

    fn write(&self, media: &mut Media, addrs: &[Addr], data: &[u8], meta: Option<&[u8]>) -> u64 {
        let sector_nbytes = self.geo.sector_nbytes();
        let meta_nbytes = self.geo.meta_nbytes();
        let mut status = 0;

        for (i, addr) in addrs.iter().enumerate() {
            if !self.is_good(media, *addr) {
                status |= status_bit(i);
                continue;
            }

            let sector = self.sector_index(*addr);
            let block = media
                .blocks
                .entry(plane_block(*addr))
                .or_insert_with(|| Block::new(&self.geo));
            if block.written[sector] {
                trace!("emu: {} programmed twice", addr);
                status |= status_bit(i);
                continue;
            }

            block.data[sector * sector_nbytes..(sector + 1) * sector_nbytes]
                .copy_from_slice(&data[i * sector_nbytes..(i + 1) * sector_nbytes]);
            if let Some(meta) = meta {
                block.meta[sector * meta_nbytes..(sector + 1) * meta_nbytes]
                    .copy_from_slice(&meta[i * meta_nbytes..(i + 1) * meta_nbytes]);
            }
            block.written[sector] = true;
            block.valid_counter += 1;
        }
        status
    }

    fn read(
        &self,
        media: &mut Media,
        addrs: &[Addr],
        data: &mut [u8],
        mut meta: Option<&mut [u8]>,
        flags: Flags,
    ) -> u64 {
        let sector_nbytes = self.geo.sector_nbytes();
        let meta_nbytes = self.geo.meta_nbytes();
        let mut status = 0;

        for (i, addr) in addrs.iter().enumerate() {
            let out = &mut data[i * sector_nbytes..(i + 1) * sector_nbytes];
            let sector = self.sector_index(*addr);

            let block = match media.blocks.get(&plane_block(*addr)) {
                Some(block) if block.written[sector] => block,
                _ => {
                    out.fill(0);
                    status |= status_bit(i);
                    continue;
                }
            };

            out.copy_from_slice(&block.data[sector * sector_nbytes..(sector + 1) * sector_nbytes]);
            if let Some(meta) = meta.as_deref_mut() {
                meta[i * meta_nbytes..(i + 1) * meta_nbytes]
                    .copy_from_slice(&block.meta[sector * meta_nbytes..(sector + 1) * meta_nbytes]);
            }

            if let (Some(DontCare { stride, nbytes }), true) = (self.dont_care, flags.contains(Flags::SCRBL)) {
                let base = i * sector_nbytes;
                for (j, byte) in out.iter_mut().enumerate() {
                    if (base + j) % stride < nbytes {
                        *byte = media.rng.gen();
                    }
                }
            }
        }
        status
    }

    fn mark(&self, media: &mut Media, addrs: &[Addr], state: BlockState, flags: Flags) {
        for addr in addrs {
            for blk in self.planes(*addr, flags) {
                let index = self.bbt_index(blk);
                media.bbt[index] = state as u8;
            }
        }
    }

    fn lun_table(&self, lun: Addr) -> std::ops::Range<usize> {
        let first = self.bbt_index(lun.set(Field::Plane, 0).set(Field::Block, 0));
        first..first + self.geo.lun_nblocks()
    }
}

impl Driver for EmuDriver {
    fn geometry(&self) -> Result<Geometry> {
        Ok(self.geo)
    }

    fn address_format(&self) -> Result<AddressFormat> {
        Ok(self.fmt)
    }

    fn submit(&self, cmd: Command<'_>) -> Result<Completion> {
        let Command {
            opcode,
            addrs,
            data,
            meta,
            flags,
        } = cmd;
        let naddrs = addrs.len();
        if naddrs == 0 {
            return Err(command_error(opcode, 0, RESULT_INVALID_FIELD));
        }

        if self.faults.trip() {
            debug!("emu: injected failure on {:?}", opcode);
            let result = match opcode {
                Opcode::Read => RESULT_FAIL_ECC,
                _ => RESULT_FAIL_WRITE,
            };
            return Err(command_error(opcode, all_bits(naddrs), result));
        }

        let mut decoded = Vec::with_capacity(naddrs);
        for (i, raw) in addrs.iter().enumerate() {
            match self.fmt.dev2gen(*raw) {
                Ok(addr) if addr.check(&self.geo).is_empty() => decoded.push(addr),
                _ => return Err(command_error(opcode, status_bit(i), RESULT_INVALID_FIELD)),
            }
        }
        let sector_nbytes = self.geo.sector_nbytes();
        let meta_nbytes = self.geo.meta_nbytes();
        let mut media = lock(&self.media);

        match (opcode, data) {
            (Opcode::Erase, Data::None) => {
                let status = self.erase(&mut media, &decoded, flags);
                check(opcode, status, RESULT_FAIL_WRITE, 0)
            }
            (Opcode::Write, Data::ToDevice(data)) => {
                let meta = match meta {
                    Data::ToDevice(meta) if meta.len() >= naddrs * meta_nbytes => Some(meta),
                    Data::None => None,
                    _ => return Err(command_error(opcode, all_bits(naddrs), RESULT_INVALID_FIELD)),
                };
                if data.len() < naddrs * sector_nbytes {
                    return Err(command_error(opcode, all_bits(naddrs), RESULT_INVALID_FIELD));
                }

                let status = self.write(&mut media, &decoded, data, meta);
                check(opcode, status, RESULT_FAIL_WRITE, naddrs * sector_nbytes)
            }
            (Opcode::Read, Data::FromDevice(data)) => {
                let meta = match meta {
                    Data::FromDevice(meta) if meta.len() >= naddrs * meta_nbytes => Some(meta),
                    Data::None => None,
                    _ => return Err(command_error(opcode, all_bits(naddrs), RESULT_INVALID_FIELD)),
                };
                if data.len() < naddrs * sector_nbytes {
                    return Err(command_error(opcode, all_bits(naddrs), RESULT_INVALID_FIELD));
                }

                let status = self.read(&mut media, &decoded, data, meta, flags);
                check(opcode, status, RESULT_EMPTY_PAGE, naddrs * sector_nbytes)
            }
            (Opcode::Mark(state), Data::None) => {
                self.mark(&mut media, &decoded, state, flags);
                Ok(Completion::default())
            }
            (Opcode::GetBbt, Data::FromDevice(blks)) if blks.len() >= self.geo.lun_nblocks() => {
                let table = self.lun_table(decoded[0]);
                let nbytes = table.len();
                blks[..nbytes].copy_from_slice(&media.bbt[table]);
                Ok(Completion {
                    nbytes,
                    ret: Ret::default(),
                })
            }
            (Opcode::SetBbt, Data::ToDevice(blks)) if blks.len() >= self.geo.lun_nblocks() => {
                let table = self.lun_table(decoded[0]);
                let mut changed = 0;
                for (entry, state) in media.bbt[table].iter_mut().zip(blks) {
                    if *entry != *state {
                        *entry = *state;
                        changed += 1;
                    }
                }
                Ok(Completion {
                    nbytes: changed,
                    ret: Ret::default(),
                })
            }
            _ => Err(command_error(opcode, all_bits(naddrs), RESULT_INVALID_FIELD)),
        }
    }

    fn acquire_block(&self, lun: Option<(usize, usize)>) -> Result<Addr> {
        let mut media = lock(&self.media);

        let position = media.free_blocks.iter().position(|blk| {
            let on_lun = lun.map_or(true, |(ch, lun)| blk.ch() == ch && blk.lun() == lun);
            on_lun
                && (0..self.geo.nplanes()).all(|pl| self.is_good(&media, blk.set(Field::Plane, pl)))
        });

        let blk = position
            .and_then(|position| media.free_blocks.remove(position))
            .ok_or(NvmError::NoFreeBlock)?;
        media.owned.insert(blk);

        trace!("emu: acquired {}, {} free", blk, media.free_blocks.len());
        Ok(blk)
    }

    fn release_block(&self, addr: Addr) -> Result<()> {
        let blk = plane_block(addr).set(Field::Plane, 0);
        let mut media = lock(&self.media);

        if !media.owned.remove(&blk) {
            return Err(NvmError::InvalidState("block is not owned"));
        }
        media.free_blocks.push_back(blk);

        trace!("emu: released {}, {} free", blk, media.free_blocks.len());
        Ok(())
    }
}

/// `addr` with page and sector cleared.
fn plane_block(addr: Addr) -> Addr {
    addr.set(Field::Page, 0).set(Field::Sector, 0)
}

fn status_bit(i: usize) -> u64 {
    if i < u64::BITS as usize {
        1 << i
    } else {
        0
    }
}

fn all_bits(naddrs: usize) -> u64 {
    (0..naddrs).fold(0, |status, i| status | status_bit(i))
}

fn command_error(opcode: Opcode, status: u64, result: u32) -> NvmError {
    NvmError::Command {
        opcode,
        ret: Ret { status, result },
    }
}

fn check(opcode: Opcode, status: u64, result: u32, nbytes: usize) -> Result<Completion> {
    if status != 0 {
        return Err(command_error(opcode, status, result));
    }

    Ok(Completion {
        nbytes,
        ret: Ret::default(),
    })
}
