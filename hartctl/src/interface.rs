//! The boundary between the run-control engine and a debug module implementation.

use serde::{Deserialize, Serialize};

use crate::registers::{HaltCause, RegisterId};
use crate::{Error, HartId};

/// One of the interchangeable low-level ways to reach target memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAccessMethod {
    /// Load/store instructions executed from the program buffer.
    ProgramBuffer,
    /// Direct system bus access, bypassing the hart.
    SystemBus,
    /// Abstract memory access commands.
    AbstractCommand,
}

/// The width of a single memory transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessWidth {
    /// 8 bit.
    U8,
    /// 16 bit.
    U16,
    /// 32 bit.
    U32,
    /// 64 bit.
    U64,
}

impl AccessWidth {
    /// All widths, narrowest first.
    pub const ALL: [AccessWidth; 4] = [
        AccessWidth::U8,
        AccessWidth::U16,
        AccessWidth::U32,
        AccessWidth::U64,
    ];

    /// The width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            AccessWidth::U8 => 1,
            AccessWidth::U16 => 2,
            AccessWidth::U32 => 4,
            AccessWidth::U64 => 8,
        }
    }

    /// The width transferring `bytes` bytes, if there is one.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|width| width.bytes() == bytes)
    }
}

/// Debug module operations the engine needs for each hart.
///
/// An implementation exists per target family; it is handed to
/// [`Session::new`](crate::Session::new) and driven exclusively by the engine.
/// Halting, resuming and stepping are split into preparation and
/// commit halves so that a group of harts can be brought into the same state
/// with as little skew as possible.
pub trait HartDebugOps {
    /// The number of harts behind this debug module.
    fn hart_count(&self) -> usize;

    /// The native register width of the hart, 32 or 64.
    fn xlen(&mut self, hart: HartId) -> Result<u32, Error>;

    /// Reads the run state of the hart.
    fn is_halted(&mut self, hart: HartId) -> Result<bool, Error>;

    /// Reads why the hart entered debug mode. Only meaningful while halted.
    fn halt_reason(&mut self, hart: HartId) -> Result<HaltCause, Error>;

    /// Prepares a halt request without issuing it yet.
    fn halt_prep(&mut self, hart: HartId) -> Result<(), Error>;

    /// Issues the halt request prepared by [`halt_prep`](Self::halt_prep).
    ///
    /// Returns once the request is issued. The engine polls
    /// [`is_halted`](Self::is_halted) to see it complete.
    fn halt_go(&mut self, hart: HartId) -> Result<(), Error>;

    /// Prepares the hart for resuming, without letting it run.
    fn resume_prep(&mut self, hart: HartId) -> Result<(), Error>;

    /// Lets a hart prepared by [`resume_prep`](Self::resume_prep) run.
    fn resume_go(&mut self, hart: HartId) -> Result<(), Error>;

    /// Executes exactly one instruction. Returns once the hart has halted again.
    fn step(&mut self, hart: HartId) -> Result<(), Error>;

    /// Reads a register of a halted hart.
    fn read_register(&mut self, hart: HartId, register: RegisterId) -> Result<u64, Error>;

    /// Writes a register of a halted hart.
    fn write_register(&mut self, hart: HartId, register: RegisterId, value: u64)
        -> Result<(), Error>;

    /// Reads `count` naturally aligned items of `width` starting at `address`.
    ///
    /// Returns [`Error::Unsupported`] when `method` or `width` is not available.
    fn read_memory(
        &mut self,
        hart: HartId,
        method: MemoryAccessMethod,
        address: u64,
        width: AccessWidth,
        count: usize,
    ) -> Result<Vec<u8>, Error>;

    /// Writes `data`, a whole number of `width` items, starting at `address`.
    fn write_memory(
        &mut self,
        hart: HartId,
        method: MemoryAccessMethod,
        address: u64,
        width: AccessWidth,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Programs `data` into flash at `offset` from the start of flash.
    fn write_flash(&mut self, hart: HartId, offset: u64, data: &[u8]) -> Result<(), Error> {
        let _ = (hart, offset, data);
        Err(Error::Unsupported("flash programming"))
    }

    /// Asserts reset on the hart.
    fn assert_reset(&mut self, hart: HartId) -> Result<(), Error> {
        let _ = hart;
        Err(Error::Unsupported("reset"))
    }

    /// Releases the hart from reset.
    fn deassert_reset(&mut self, hart: HartId) -> Result<(), Error> {
        let _ = hart;
        Err(Error::Unsupported("reset"))
    }
}
