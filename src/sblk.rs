//! I/O striped over a rectangle of channels and LUNs, one page row per command.

use num_integer::Integer;

use crate::addr::{Addr, Field};
use crate::buf;
use crate::dev::Device;
use crate::error::{NvmError, Result};
use crate::geo::Geometry;

/// How writes have addressed the block since the last erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Fresh,
    Cursor,
    Offset,
}

/// The part of one row a request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RowSpan {
    pg: usize,
    /// LUN slots within the row, `0..nchannels * nluns`.
    units: std::ops::Range<usize>,
    /// Bytes of the request buffer holding those slots.
    bytes: std::ops::Range<usize>,
}

pub struct SpanningBlock<'a> {
    dev: &'a Device,
    bgn: Addr,
    end: Addr,
    geo: Geometry,
    pos_write: usize,
    pos_read: usize,
    access: Access,
}

impl<'a> SpanningBlock<'a> {
    /// Spanning block over channels `ch_bgn..=ch_end` and LUNs
    /// `lun_bgn..=lun_end`, at block `blk`.
    pub fn new(
        dev: &'a Device,
        ch_bgn: usize,
        ch_end: usize,
        lun_bgn: usize,
        lun_end: usize,
        blk: usize,
    ) -> Result<Self> {
        let bgn = Addr::default()
            .with(Field::Channel, ch_bgn)?
            .with(Field::Lun, lun_bgn)?
            .with(Field::Block, blk)?;
        let end = Addr::default()
            .with(Field::Channel, ch_end)?
            .with(Field::Lun, lun_end)?
            .with(Field::Block, blk)?;

        SpanningBlock::from_span(dev, bgn, end)
    }

    /// Spanning block between the inclusive corners `bgn` and `end`.
    pub fn from_span(dev: &'a Device, bgn: Addr, end: Addr) -> Result<Self> {
        if bgn.blk() != end.blk() {
            return Err(NvmError::InvalidSpan("corners name different blocks"));
        }
        if bgn.ch() > end.ch() || bgn.lun() > end.lun() {
            return Err(NvmError::InvalidSpan("reversed bounds"));
        }
        bgn.ensure_within(dev.geo())?;
        end.ensure_within(dev.geo())?;

        let bgn = corner(bgn);
        let end = corner(end);
        let geo = dev
            .geo()
            .span(end.ch() - bgn.ch() + 1, end.lun() - bgn.lun() + 1)?;

        debug!("sblk: {} .. {} spans {} bytes", bgn, end, geo.tbytes());
        Ok(SpanningBlock {
            dev,
            bgn,
            end,
            geo,
            pos_write: 0,
            pos_read: 0,
            access: Access::Fresh,
        })
    }

    pub fn dev(&self) -> &'a Device {
        self.dev
    }

    pub fn bgn(&self) -> Addr {
        self.bgn
    }

    pub fn end(&self) -> Addr {
        self.end
    }

    pub fn geo(&self) -> &Geometry {
        &self.geo
    }

    pub fn pos_write(&self) -> usize {
        self.pos_write
    }

    pub fn pos_read(&self) -> usize {
        self.pos_read
    }

    /// Sector addresses in one full row.
    pub fn stripe_width(&self) -> usize {
        self.nunits() * self.dev.geo().vpg_naddrs()
    }

    /// Bytes in one full row.
    pub fn stripe_nbytes(&self) -> usize {
        self.geo.vpg_nbytes()
    }

    /// LUNs in the rectangle.
    fn nunits(&self) -> usize {
        self.geo.nchannels() * self.geo.nluns()
    }

    /// Block address of the LUN in slot `unit`.
    fn unit_addr(&self, unit: usize) -> Addr {
        let (ch, lun) = num_integer::div_rem(unit, self.geo.nluns());

        self.bgn
            .set(Field::Channel, self.bgn.ch() + ch)
            .set(Field::Lun, self.bgn.lun() + lun)
    }

    /// Erases every block in the rectangle, one command per LUN, and rewinds
    /// the cursors. Returns the bytes erased.
    pub fn erase(&mut self) -> Result<usize> {
        for unit in 0..self.nunits() {
            let addrs = self.dev.block_addrs(self.unit_addr(unit));
            self.dev.erase(&addrs, self.dev.flags())?;
        }

        self.pos_write = 0;
        self.pos_read = 0;
        self.access = Access::Fresh;
        debug!("sblk: erased {} .. {}", self.bgn, self.end);
        Ok(self.geo.tbytes())
    }

    /// Writes `buf` at `offset`; the write cursor is not involved and may not
    /// be used on this block until the next erase.
    pub fn pwrite(&mut self, buf: &[u8], offset: usize) -> Result<usize> {
        self.write_rows(buf, offset, Access::Offset, |_, _| ())
    }

    /// Writes `buf` at the write cursor, advancing it row by row.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let offset = self.pos_write;
        self.write_rows(buf, offset, Access::Cursor, |sblk, end| sblk.pos_write = end)
    }

    /// Fills the rest of the current row with filler so the stripe is
    /// complete. Returns the number of bytes written, zero when the cursor
    /// already sits on a row boundary.
    pub fn pad(&mut self) -> Result<usize> {
        if self.pos_write == 0 {
            return Err(NvmError::InvalidState("pad requires a prior write"));
        }

        let stripe_nbytes = self.stripe_nbytes();
        let partial = self.pos_write % stripe_nbytes;
        if partial == 0 {
            return Ok(0);
        }

        self.pad_nbytes(stripe_nbytes - partial)
    }

    /// Fills the spanning block up to its end. Returns the number of bytes written.
    pub fn pad_block(&mut self) -> Result<usize> {
        if self.pos_write == 0 {
            return Err(NvmError::InvalidState("pad requires a prior write"));
        }

        let mut total = self.pad()?;
        if self.pos_write >= self.geo.tbytes() {
            return Ok(total);
        }

        let mut filler = buf::alloc(self.dev.geo(), self.stripe_nbytes())?;
        buf::fill(&mut filler);
        debug!("sblk: padding {} bytes at {}", self.geo.tbytes() - self.pos_write, self.pos_write);
        while self.pos_write < self.geo.tbytes() {
            total += self.write(&filler)?;
        }
        Ok(total)
    }

    fn pad_nbytes(&mut self, nbytes: usize) -> Result<usize> {
        let mut filler = buf::alloc(self.dev.geo(), nbytes)?;
        buf::fill(&mut filler);

        debug!("sblk: padding {} bytes at {}", nbytes, self.pos_write);
        self.write(&filler)
    }

    /// Reads into `buf` from `offset`; cursors are left alone.
    pub fn pread(&mut self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.read_rows(buf, offset, false)
    }

    /// Reads at the read cursor and advances it row by row.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let offset = self.pos_read;
        self.read_rows(buf, offset, true)
    }

    fn claim(&self, access: Access) -> Result<()> {
        match (self.access, access) {
            (Access::Fresh, _) => Ok(()),
            (current, wanted) if current == wanted => Ok(()),
            (Access::Cursor, _) => Err(NvmError::InvalidState(
                "offset writes on a block written through its cursor",
            )),
            _ => Err(NvmError::InvalidState(
                "cursor writes on a block written at explicit offsets",
            )),
        }
    }

    fn write_rows<F>(&mut self, buf: &[u8], offset: usize, access: Access, mut progress: F) -> Result<usize>
    where
        F: FnMut(&mut Self, usize),
    {
        let rows = self.rows(buf.len(), offset)?;
        self.claim(access)?;
        self.access = access;

        for row in rows {
            let addrs = self.row_addrs(&row);
            self.dev
                .write(&addrs, &buf[row.bytes.clone()], None, self.dev.flags())?;

            trace!("sblk: row {} units {:?} written", row.pg, row.units);
            progress(self, offset + row.bytes.end);
        }

        debug!("sblk: wrote {} bytes at {}", buf.len(), offset);
        Ok(buf.len())
    }

    fn read_rows(&mut self, buf: &mut [u8], offset: usize, advance: bool) -> Result<usize> {
        for row in self.rows(buf.len(), offset)? {
            let addrs = self.row_addrs(&row);
            self.dev
                .read(&addrs, &mut buf[row.bytes.clone()], None, self.dev.flags())?;

            if advance {
                self.pos_read = offset + row.bytes.end;
            }
        }

        debug!("sblk: read {} bytes at {}", buf.len(), offset);
        Ok(buf.len())
    }

    /// Splits `[offset, offset + count)` into the rows it touches.
    fn rows(&self, count: usize, offset: usize) -> Result<Vec<RowSpan>> {
        let unit_nbytes = self.dev.geo().vpg_nbytes();

        if count == 0 || !Integer::is_multiple_of(&count, &unit_nbytes) {
            return Err(NvmError::Misaligned {
                nbytes: count,
                align: unit_nbytes,
            });
        }
        if !Integer::is_multiple_of(&offset, &unit_nbytes) {
            return Err(NvmError::Misaligned {
                nbytes: offset,
                align: unit_nbytes,
            });
        }
        let capacity = self.geo.tbytes();
        offset
            .checked_add(count)
            .filter(|end| *end <= capacity)
            .ok_or(NvmError::OffsetOutOfRange { offset, capacity })?;

        let nunits = self.nunits();
        let first = offset / unit_nbytes;
        let last = (offset + count) / unit_nbytes;

        let mut rows = Vec::new();
        let mut unit = first;
        while unit < last {
            let pg = unit / nunits;
            let row_bgn = pg * nunits;
            let stop = last.min(row_bgn + nunits);

            rows.push(RowSpan {
                pg,
                units: unit - row_bgn..stop - row_bgn,
                bytes: (unit - first) * unit_nbytes..(stop - first) * unit_nbytes,
            });
            unit = stop;
        }
        Ok(rows)
    }

    /// Addresses of `row`: LUN slot, then plane, then sector.
    fn row_addrs(&self, row: &RowSpan) -> Vec<Addr> {
        row.units
            .clone()
            .flat_map(|unit| self.dev.vpage_addrs(self.unit_addr(unit), row.pg))
            .collect()
    }
}

fn corner(addr: Addr) -> Addr {
    addr.set(Field::Plane, 0)
        .set(Field::Page, 0)
        .set(Field::Sector, 0)
}
