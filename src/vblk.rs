use std::ops::Range;

use num_integer::Integer;

use crate::addr::{Addr, Field};
use crate::dev::Device;
use crate::error::{NvmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unbound,
    Owned,
    Released,
}

pub struct VirtualBlock<'a> {
    dev: &'a Device,
    addr: Addr,
    state: State,
    acquired: bool,
    pos_write: usize,
    pos_read: usize,
}

impl<'a> VirtualBlock<'a> {
    /// Handle not yet bound to a block; see [`VirtualBlock::get`].
    pub fn new(dev: &'a Device) -> Self {
        VirtualBlock {
            dev,
            addr: Addr::default(),
            state: State::Unbound,
            acquired: false,
            pos_write: 0,
            pos_read: 0,
        }
    }

    /// Handle on the block holding `addr`, without asking the device for ownership.
    pub fn on_device(dev: &'a Device, addr: Addr) -> Result<Self> {
        addr.ensure_within(dev.geo())?;

        let mut vblk = VirtualBlock::new(dev);
        vblk.addr = block_of(addr);
        vblk.state = State::Owned;
        Ok(vblk)
    }

    /// Acquires any free block.
    pub fn get(&mut self) -> Result<()> {
        self.acquire(None)
    }

    /// Acquires a free block on the given channel and LUN.
    pub fn gets(&mut self, ch: usize, lun: usize) -> Result<()> {
        self.acquire(Some((ch, lun)))
    }

    fn acquire(&mut self, lun: Option<(usize, usize)>) -> Result<()> {
        if self.state != State::Unbound {
            return Err(NvmError::InvalidState("virtual block is already bound"));
        }

        self.addr = block_of(self.dev.acquire_block(lun)?);
        self.state = State::Owned;
        self.acquired = true;
        Ok(())
    }

    /// Gives the block back. The handle is unusable afterwards.
    pub fn put(&mut self) -> Result<()> {
        self.ensure_owned()?;

        if self.acquired {
            self.dev.release_block(self.addr)?;
        }
        self.state = State::Released;
        self.acquired = false;
        Ok(())
    }

    /// Erases the block and rewinds both cursors. Returns the bytes erased.
    pub fn erase(&mut self) -> Result<usize> {
        self.ensure_owned()?;

        let addrs = self.dev.block_addrs(self.addr);
        self.dev.erase(&addrs, self.dev.flags())?;

        self.pos_write = 0;
        self.pos_read = 0;
        debug!("vblk: erased {}", self.addr);
        Ok(self.dev.geo().vblk_nbytes())
    }

    /// Writes all of `buf` at `offset`. The write cursor follows each page
    /// written, so a failure part way leaves it after the last good page.
    pub fn pwrite(&mut self, buf: &[u8], offset: usize) -> Result<usize> {
        self.ensure_owned()?;
        let pages = self.pages(buf.len(), offset)?;
        let vpg_nbytes = self.dev.geo().vpg_nbytes();

        for (chunk, pg) in buf.chunks_exact(vpg_nbytes).zip(pages) {
            let addrs: Vec<Addr> = self.dev.vpage_addrs(self.addr, pg).collect();
            self.dev.write(&addrs, chunk, None, self.dev.flags())?;

            self.pos_write = self.pos_write.max((pg + 1) * vpg_nbytes);
        }

        debug!("vblk: wrote {} bytes at {} of {}", buf.len(), offset, self.addr);
        Ok(buf.len())
    }

    /// Writes `buf` at the write cursor.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.pwrite(buf, self.pos_write)
    }

    /// Reads `buf.len()` bytes at `offset`; cursors are left alone.
    pub fn pread(&mut self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.read_at(buf, offset, false)
    }

    /// Reads at the read cursor and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_at(buf, self.pos_read, true)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: usize, advance: bool) -> Result<usize> {
        self.ensure_owned()?;
        let pages = self.pages(buf.len(), offset)?;
        let vpg_nbytes = self.dev.geo().vpg_nbytes();
        let count = buf.len();

        for (chunk, pg) in buf.chunks_exact_mut(vpg_nbytes).zip(pages) {
            let addrs: Vec<Addr> = self.dev.vpage_addrs(self.addr, pg).collect();
            self.dev.read(&addrs, chunk, None, self.dev.flags())?;

            if advance {
                self.pos_read = (pg + 1) * vpg_nbytes;
            }
        }

        debug!("vblk: read {} bytes at {} of {}", count, offset, self.addr);
        Ok(count)
    }

    /// Pages covered by `[offset, offset + count)`.
    fn pages(&self, count: usize, offset: usize) -> Result<Range<usize>> {
        let geo = self.dev.geo();
        let vpg_nbytes = geo.vpg_nbytes();

        if count == 0 || !Integer::is_multiple_of(&count, &vpg_nbytes) {
            return Err(NvmError::Misaligned {
                nbytes: count,
                align: vpg_nbytes,
            });
        }
        if !Integer::is_multiple_of(&offset, &vpg_nbytes) {
            return Err(NvmError::Misaligned {
                nbytes: offset,
                align: vpg_nbytes,
            });
        }
        let capacity = geo.vblk_nbytes();
        offset
            .checked_add(count)
            .filter(|end| *end <= capacity)
            .ok_or(NvmError::OffsetOutOfRange { offset, capacity })?;

        let first = offset / vpg_nbytes;
        Ok(first..first + count / vpg_nbytes)
    }

    fn ensure_owned(&self) -> Result<()> {
        match self.state {
            State::Owned => Ok(()),
            State::Unbound => Err(NvmError::InvalidState("virtual block is not bound to a block")),
            State::Released => Err(NvmError::InvalidState("virtual block was released")),
        }
    }

    pub fn dev(&self) -> &'a Device {
        self.dev
    }

    /// Address of the block, plane, page and sector zeroed.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pos_write(&self) -> usize {
        self.pos_write
    }

    pub fn pos_read(&self) -> usize {
        self.pos_read
    }
}

impl Drop for VirtualBlock<'_> {
    fn drop(&mut self) {
        if self.state == State::Owned && self.acquired {
            warn!("vblk: {} dropped without put, ownership leaks", self.addr);
        }
    }
}

fn block_of(addr: Addr) -> Addr {
    addr.set(Field::Plane, 0)
        .set(Field::Page, 0)
        .set(Field::Sector, 0)
}
