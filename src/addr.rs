//! Generic physical addresses and their translations.

use std::fmt;

use bitflags::bitflags;
use num_integer::div_rem;

use crate::error::{NvmError, Result};
use crate::geo::Geometry;

pub const BLK_BITS: u32 = 16;
pub const PG_BITS: u32 = 16;
pub const SEC_BITS: u32 = 8;
pub const PL_BITS: u32 = 8;
pub const LUN_BITS: u32 = 8;
pub const CH_BITS: u32 = 7;
pub const RSVD_BITS: u32 = 1;

const BLK_OFZ: u32 = 0;
const PG_OFZ: u32 = BLK_OFZ + BLK_BITS;
const SEC_OFZ: u32 = PG_OFZ + PG_BITS;
const PL_OFZ: u32 = SEC_OFZ + SEC_BITS;
const LUN_OFZ: u32 = PL_OFZ + PL_BITS;
const CH_OFZ: u32 = LUN_OFZ + LUN_BITS;
const RSVD_OFZ: u32 = CH_OFZ + CH_BITS;

const _: () = assert!(RSVD_OFZ + RSVD_BITS == u64::BITS);

const LINE_BITS: u32 = 63;
const LINE_MASK: u64 = (1 << LINE_BITS) - 1;

/// The six geometric dimensions of a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Channel,
    Lun,
    Plane,
    Block,
    Page,
    Sector,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Channel,
        Field::Lun,
        Field::Plane,
        Field::Block,
        Field::Page,
        Field::Sector,
    ];

    /// Bit offset within the generic layout.
    pub const fn offset(self) -> u32 {
        match self {
            Field::Channel => CH_OFZ,
            Field::Lun => LUN_OFZ,
            Field::Plane => PL_OFZ,
            Field::Block => BLK_OFZ,
            Field::Page => PG_OFZ,
            Field::Sector => SEC_OFZ,
        }
    }

    /// Bit width within the generic layout.
    pub const fn width(self) -> u32 {
        match self {
            Field::Channel => CH_BITS,
            Field::Lun => LUN_BITS,
            Field::Plane => PL_BITS,
            Field::Block => BLK_BITS,
            Field::Page => PG_BITS,
            Field::Sector => SEC_BITS,
        }
    }

    pub const fn mask(self) -> u64 {
        (1 << self.width()) - 1
    }

    pub const fn bound(self) -> Bounds {
        match self {
            Field::Channel => Bounds::CHANNEL,
            Field::Lun => Bounds::LUN,
            Field::Plane => Bounds::PLANE,
            Field::Block => Bounds::BLOCK,
            Field::Page => Bounds::PAGE,
            Field::Sector => Bounds::SECTOR,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Channel => "channel",
            Field::Lun => "lun",
            Field::Plane => "plane",
            Field::Block => "block",
            Field::Page => "page",
            Field::Sector => "sector",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Dimensions in which an address exceeds a geometry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Bounds: u32 {
        const CHANNEL = 1;
        const LUN = 2;
        const PLANE = 4;
        const BLOCK = 8;
        const PAGE = 16;
        const SECTOR = 32;
    }
}

/// Geometric view of an [`Addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Geometric {
    pub ch: u8,
    pub lun: u8,
    pub pl: u8,
    pub blk: u16,
    pub pg: u16,
    pub sec: u8,
}

/// Cache-line view of an [`Addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Line {
    pub line: u64,
    pub is_cached: bool,
}

/// Generic physical address.
///
/// The 64 bits are read either geometrically or as a cache line, never both;
/// each view has its own constructor and accessor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(u64);

impl Addr {
    pub const fn from_raw(raw: u64) -> Self {
        Addr(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn new(ch: usize, lun: usize, pl: usize, blk: usize, pg: usize, sec: usize) -> Result<Self> {
        Addr::default()
            .with(Field::Channel, ch)?
            .with(Field::Lun, lun)?
            .with(Field::Plane, pl)?
            .with(Field::Block, blk)?
            .with(Field::Page, pg)?
            .with(Field::Sector, sec)
    }

    pub fn from_geometric(g: Geometric) -> Result<Self> {
        Addr::new(
            g.ch as usize,
            g.lun as usize,
            g.pl as usize,
            g.blk as usize,
            g.pg as usize,
            g.sec as usize,
        )
    }

    pub fn as_geometric(&self) -> Geometric {
        Geometric {
            ch: self.ch() as u8,
            lun: self.lun() as u8,
            pl: self.pl() as u8,
            blk: self.blk() as u16,
            pg: self.pg() as u16,
            sec: self.sec() as u8,
        }
    }

    pub fn from_line(line: u64, is_cached: bool) -> Result<Self> {
        if line > LINE_MASK {
            return Err(NvmError::LineOverflow(line));
        }

        Ok(Addr(line | (is_cached as u64) << LINE_BITS))
    }

    pub fn as_line(&self) -> Line {
        Line {
            line: self.0 & LINE_MASK,
            is_cached: self.0 >> LINE_BITS == 1,
        }
    }

    pub fn get(&self, field: Field) -> usize {
        ((self.0 >> field.offset()) & field.mask()) as usize
    }

    /// Returns a copy with `field` replaced, failing when `value` is wider than the field.
    pub fn with(self, field: Field, value: usize) -> Result<Self> {
        self.try_set(field, value as u64)
    }

    fn try_set(self, field: Field, value: u64) -> Result<Self> {
        if value > field.mask() {
            return Err(NvmError::FieldOverflow {
                field,
                value,
                width: field.width(),
            });
        }

        Ok(self.set(field, value as usize))
    }

    /// Infallible setter for indices already bounded by a validated geometry.
    pub(crate) fn set(self, field: Field, value: usize) -> Self {
        debug_assert!(value as u64 <= field.mask(), "{} value {} overflows", field, value);

        let cleared = self.0 & !(field.mask() << field.offset());
        Addr(cleared | (value as u64 & field.mask()) << field.offset())
    }

    pub fn ch(&self) -> usize {
        self.get(Field::Channel)
    }

    pub fn lun(&self) -> usize {
        self.get(Field::Lun)
    }

    pub fn pl(&self) -> usize {
        self.get(Field::Plane)
    }

    pub fn blk(&self) -> usize {
        self.get(Field::Block)
    }

    pub fn pg(&self) -> usize {
        self.get(Field::Page)
    }

    pub fn sec(&self) -> usize {
        self.get(Field::Sector)
    }

    /// Every dimension in which the address exceeds `geo`.
    pub fn check(&self, geo: &Geometry) -> Bounds {
        Field::ALL
            .into_iter()
            .filter(|field| self.get(*field) >= geo.count(*field))
            .fold(Bounds::empty(), |mask, field| mask | field.bound())
    }

    pub(crate) fn ensure_within(&self, geo: &Geometry) -> Result<()> {
        let bounds = self.check(geo);
        if bounds.is_empty() {
            Ok(())
        } else {
            Err(NvmError::OutOfBounds { addr: *self, bounds })
        }
    }
}

/// Checks `addr` against `geo`, returning the exceeded dimensions.
pub fn check(addr: Addr, geo: &Geometry) -> Bounds {
    addr.check(geo)
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(0x{:016x}){{ ch({:02}), lun({:02}), pl({}), blk({:04}), pg({:03}), sec({}) }}",
            self.0,
            self.ch(),
            self.lun(),
            self.pl(),
            self.blk(),
            self.pg(),
            self.sec()
        )
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr{}", self)
    }
}

/// Device specific placement of each address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddressFormat {
    pub ch_ofz: u8,
    pub ch_len: u8,
    pub lun_ofz: u8,
    pub lun_len: u8,
    pub pl_ofz: u8,
    pub pl_len: u8,
    pub blk_ofz: u8,
    pub blk_len: u8,
    pub pg_ofz: u8,
    pub pg_len: u8,
    pub sec_ofz: u8,
    pub sec_len: u8,
}

fn len_mask(len: u8) -> u64 {
    if len as u32 >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

/// Bits needed to index `n` elements.
fn index_bits(n: usize) -> u8 {
    (usize::BITS - n.saturating_sub(1).leading_zeros()) as u8
}

impl AddressFormat {
    /// Format identical to the generic layout.
    pub fn generic() -> Self {
        let mut fmt = AddressFormat::default();
        for field in Field::ALL {
            fmt.set_field(field, field.offset() as u8, field.width() as u8);
        }
        fmt
    }

    /// Densely packed format for `geo`, sector in the lowest bits and channel
    /// in the highest.
    pub fn packed(geo: &Geometry) -> Self {
        let mut fmt = AddressFormat::default();
        let mut ofz = 0u8;
        for field in [
            Field::Sector,
            Field::Plane,
            Field::Page,
            Field::Block,
            Field::Lun,
            Field::Channel,
        ] {
            let len = index_bits(geo.count(field));
            fmt.set_field(field, ofz, len);
            ofz += len;
        }
        fmt
    }

    /// Deserializes the flat layout: offset then length, for ch, lun, pl, blk, pg, sec.
    pub fn from_bytes(a: [u8; 12]) -> Self {
        AddressFormat {
            ch_ofz: a[0],
            ch_len: a[1],
            lun_ofz: a[2],
            lun_len: a[3],
            pl_ofz: a[4],
            pl_len: a[5],
            blk_ofz: a[6],
            blk_len: a[7],
            pg_ofz: a[8],
            pg_len: a[9],
            sec_ofz: a[10],
            sec_len: a[11],
        }
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        [
            self.ch_ofz,
            self.ch_len,
            self.lun_ofz,
            self.lun_len,
            self.pl_ofz,
            self.pl_len,
            self.blk_ofz,
            self.blk_len,
            self.pg_ofz,
            self.pg_len,
            self.sec_ofz,
            self.sec_len,
        ]
    }

    /// `(offset, length)` of `field`.
    pub fn field(&self, field: Field) -> (u8, u8) {
        match field {
            Field::Channel => (self.ch_ofz, self.ch_len),
            Field::Lun => (self.lun_ofz, self.lun_len),
            Field::Plane => (self.pl_ofz, self.pl_len),
            Field::Block => (self.blk_ofz, self.blk_len),
            Field::Page => (self.pg_ofz, self.pg_len),
            Field::Sector => (self.sec_ofz, self.sec_len),
        }
    }

    fn set_field(&mut self, field: Field, ofz: u8, len: u8) {
        let (o, l) = match field {
            Field::Channel => (&mut self.ch_ofz, &mut self.ch_len),
            Field::Lun => (&mut self.lun_ofz, &mut self.lun_len),
            Field::Plane => (&mut self.pl_ofz, &mut self.pl_len),
            Field::Block => (&mut self.blk_ofz, &mut self.blk_len),
            Field::Page => (&mut self.pg_ofz, &mut self.pg_len),
            Field::Sector => (&mut self.sec_ofz, &mut self.sec_len),
        };
        *o = ofz;
        *l = len;
    }

    /// Rejects fields reaching past bit 63 and fields sharing bits.
    pub fn validate(&self) -> Result<()> {
        let mut used = 0u64;
        for field in Field::ALL {
            let (ofz, len) = self.field(field);
            if len == 0 {
                continue;
            }
            if ofz as u32 + len as u32 > u64::BITS {
                return Err(NvmError::InvalidFormat("field extends past bit 63"));
            }
            let bits = len_mask(len) << ofz;
            if used & bits != 0 {
                return Err(NvmError::InvalidFormat("fields overlap"));
            }
            used |= bits;
        }
        Ok(())
    }

    /// Re-packs a generic address into this format.
    pub fn gen2dev(&self, addr: Addr) -> Result<u64> {
        let mut dev = 0u64;
        for field in Field::ALL {
            let (ofz, len) = self.field(field);
            let value = addr.get(field) as u64;
            if value > len_mask(len) {
                return Err(NvmError::FieldOverflow {
                    field,
                    value,
                    width: len as u32,
                });
            }
            if len == 0 {
                continue;
            }
            if ofz as u32 + len as u32 > u64::BITS {
                return Err(NvmError::InvalidFormat("field extends past bit 63"));
            }
            dev |= value << ofz;
        }
        Ok(dev)
    }

    /// Unpacks a device address into the generic layout.
    pub fn dev2gen(&self, raw: u64) -> Result<Addr> {
        let mut addr = Addr::default();
        for field in Field::ALL {
            let (ofz, len) = self.field(field);
            if len == 0 {
                continue;
            }
            if ofz as u32 + len as u32 > u64::BITS {
                return Err(NvmError::InvalidFormat("field extends past bit 63"));
            }
            addr = addr.try_set(field, (raw >> ofz) & len_mask(len))?;
        }
        Ok(addr)
    }
}

impl fmt::Display for AddressFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in Field::ALL.into_iter().enumerate() {
            let (ofz, len) = self.field(field);
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}({}, {})", field, ofz, len)?;
        }
        Ok(())
    }
}

/// Byte strides of the row-major layout
/// `channels[luns[blocks[pages[planes[sectors]]]]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LbaMap {
    pub channel_nbytes: usize,
    pub lun_nbytes: usize,
    pub plane_nbytes: usize,
    pub block_nbytes: usize,
    pub page_nbytes: usize,
    pub sector_nbytes: usize,
}

/// Coarsest to finest dimension of the linear layout.
const LBA_ORDER: [Field; 6] = [
    Field::Channel,
    Field::Lun,
    Field::Block,
    Field::Page,
    Field::Plane,
    Field::Sector,
];

impl LbaMap {
    pub fn new(geo: &Geometry) -> Self {
        let sector_nbytes = geo.sector_nbytes();
        let plane_nbytes = geo.nsectors() * sector_nbytes;
        let page_nbytes = geo.nplanes() * plane_nbytes;
        let block_nbytes = geo.npages() * page_nbytes;
        let lun_nbytes = geo.nblocks() * block_nbytes;
        let channel_nbytes = geo.nluns() * lun_nbytes;

        LbaMap {
            channel_nbytes,
            lun_nbytes,
            plane_nbytes,
            block_nbytes,
            page_nbytes,
            sector_nbytes,
        }
    }

    pub fn stride(&self, field: Field) -> usize {
        match field {
            Field::Channel => self.channel_nbytes,
            Field::Lun => self.lun_nbytes,
            Field::Plane => self.plane_nbytes,
            Field::Block => self.block_nbytes,
            Field::Page => self.page_nbytes,
            Field::Sector => self.sector_nbytes,
        }
    }

    pub fn addr_to_lba(&self, addr: Addr, geo: &Geometry) -> Result<usize> {
        addr.ensure_within(geo)?;

        Ok(LBA_ORDER
            .into_iter()
            .map(|field| addr.get(field) * self.stride(field))
            .sum())
    }

    /// Inverse of [`LbaMap::addr_to_lba`]; the sub-sector remainder is dropped.
    pub fn lba_to_addr(&self, offset: usize, geo: &Geometry) -> Result<Addr> {
        if offset >= geo.tbytes() {
            return Err(NvmError::OffsetOutOfRange {
                offset,
                capacity: geo.tbytes(),
            });
        }

        let mut rest = offset;
        let mut addr = Addr::default();
        for field in LBA_ORDER {
            let (index, rem) = div_rem(rest, self.stride(field));
            addr = addr.set(field, index);
            rest = rem;
        }
        Ok(addr)
    }
}
