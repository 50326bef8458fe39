//! Physical I/O on Open-Channel SSDs.

#[macro_use]
extern crate log;

pub mod addr;
pub mod bbt;
pub mod buf;
pub mod config;
pub mod dev;
pub mod emu;
pub mod error;
pub mod geo;
pub mod sblk;
pub mod vblk;

#[cfg(test)]
mod tests;

pub use addr::{AddressFormat, Addr, Bounds, Field, LbaMap};
pub use bbt::{BadBlockTable, BlockState};
pub use buf::AlignedBuf;
pub use dev::{Command, Completion, Data, Device, Driver, Flags, Opcode, PlaneMode, Ret};
pub use emu::EmuDriver;
pub use error::{NvmError, Result};
pub use geo::Geometry;
pub use sblk::SpanningBlock;
pub use vblk::VirtualBlock;
