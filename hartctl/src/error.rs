use std::time::Duration;

use crate::algorithm::RegisterDump;
use crate::registers::RegisterId;
use crate::HartId;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// No free hardware trigger on hart {hart} accepts a breakpoint or watchpoint at {address:#010x}.
    ResourceExhausted { hart: HartId, address: u64 },

    /// Hart {0} must be halted for this operation.
    NotHalted(HartId),

    /// Timed out after {elapsed:?} waiting for hart {hart} to {operation}.
    Timeout {
        hart: HartId,
        operation: &'static str,
        elapsed: Duration,
    },

    /// Algorithm on hart {hart} did not return within {timeout:?}.
    #[ignore_extra_doc_attributes]
    ///
    /// The hart was halted again and `dump` holds its registers at that point. Saved
    /// register state has not been restored unless the configuration asks for it.
    AlgorithmTimeout {
        hart: HartId,
        timeout: Duration,
        dump: RegisterDump,
    },

    /// No access width could transfer {size} bytes at {address:#010x}.
    Unaligned { address: u64, size: usize },

    /// {0} bytes is not a valid access size.
    InvalidAccessSize(usize),

    /// Verification failed on hart {hart}.
    VerifyMismatch {
        hart: HartId,
        #[source]
        source: VerifyMismatch,
    },

    /// {0} is not supported by this target.
    Unsupported(&'static str),

    /// Address translation failed on hart {hart}.
    Translation {
        hart: HartId,
        #[source]
        source: TranslationError,
    },

    /// Hart {0} does not exist.
    HartNotFound(HartId),

    /// No register is called '{0}'.
    UnknownRegister(String),

    /// Register {0} cannot be used as an algorithm argument, only general purpose registers can.
    InvalidArgumentRegister(RegisterId),

    /// No breakpoint with id {unique_id} is set on hart {hart}.
    BreakpointNotFound { hart: HartId, unique_id: u32 },

    /// No watchpoint with id {unique_id} is set on hart {hart}.
    WatchpointNotFound { hart: HartId, unique_id: u32 },

    /// No trigger on hart {hart} is owned by id {unique_id}.
    TriggerNotFound { hart: HartId, unique_id: u32 },

    /// A breakpoint of {length} bytes cannot be placed at {address:#010x}.
    InvalidBreakpoint { address: u64, length: usize },

    /// The configuration could not be parsed.
    Config(#[from] serde_yaml::Error),

    /// {0}
    Other(#[from] anyhow::Error),
}

/// Something read back from the target differs from what was expected.
#[derive(thiserror::Error, Debug, docsplay::Display, PartialEq, Eq)]
pub enum VerifyMismatch {
    /// The algorithm stopped at {actual:#010x} instead of its exit point {expected:#010x}.
    ExitPoint { expected: u64, actual: u64 },

    /// Memory at {address:#010x} reads back as {actual:02x?} after writing {expected:02x?}.
    Memory {
        address: u64,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
}

/// The reasons a virtual address cannot be translated.
#[derive(thiserror::Error, Debug, docsplay::Display, PartialEq, Eq)]
pub enum TranslationError {
    /// Address translation is not active for the current privilege level.
    Inactive,

    /// satp selects paging mode {0}, which is not supported.
    UnsupportedMode(u64),

    /// {address:#x} is not a canonical address for a {va_bits} bit address space.
    NotSignExtended { address: u64, va_bits: u32 },

    /// Page table entry {pte:#x} at {pte_address:#x} (level {level}) is invalid.
    InvalidEntry {
        level: usize,
        pte_address: u64,
        pte: u64,
    },

    /// The page table walk for {0:#x} ended without reaching a leaf entry.
    NoLeaf(u64),
}
