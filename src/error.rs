use thiserror::Error;

use crate::addr::{Addr, Bounds, Field};
use crate::dev::{Opcode, PlaneMode, Ret};

#[derive(Error, Debug)]
pub enum NvmError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("invalid address format: {0}")]
    InvalidFormat(&'static str),

    #[error("{field} value {value} does not fit in {width} bits")]
    FieldOverflow { field: Field, value: u64, width: u32 },

    #[error("line {0:#x} does not fit in 63 bits")]
    LineOverflow(u64),

    #[error("address {addr} exceeds geometry bounds {bounds:?}")]
    OutOfBounds { addr: Addr, bounds: Bounds },

    #[error("offset {offset} is beyond capacity of {capacity} bytes")]
    OffsetOutOfRange { offset: usize, capacity: usize },

    #[error("{nbytes} bytes is not a multiple of {align}")]
    Misaligned { nbytes: usize, align: usize },

    #[error("buffer holds {actual} bytes, {needed} required")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid span: {0}")]
    InvalidSpan(&'static str),

    #[error("plane mode {mode:?} needs more than {nplanes} planes")]
    PlaneMode { mode: PlaneMode, nplanes: usize },

    #[error("no free block matches the request")]
    NoFreeBlock,

    #[error("{opcode:?} failed: {ret}")]
    Command { opcode: Opcode, ret: Ret },

    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

impl NvmError {
    /// Completion record of a failed device command.
    pub fn ret(&self) -> Option<Ret> {
        match self {
            NvmError::Command { ret, .. } => Some(*ret),
            _ => None,
        }
    }

    /// True for errors raised by the library before anything was submitted.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            NvmError::Command { .. } | NvmError::Transport(_) | NvmError::NoFreeBlock
        )
    }
}

pub type Result<T> = std::result::Result<T, NvmError>;
