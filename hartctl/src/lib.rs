//! # Run control for multi-hart RISC-V targets
//!
//! `hartctl` sits between a debugger front end and the debug module of a
//! RISC-V target. It keeps track of every hart behind the debug module and
//! offers the operations a debugger needs on top of the raw debug module
//! accesses:
//!
//! - halting, resuming and stepping single harts or whole SMP groups, with
//!   the harts of a group moved through each phase together,
//! - hardware breakpoints and watchpoints on the trigger module, with
//!   software breakpoints as the fallback,
//! - memory access over whichever access method and width the target supports,
//! - translation of virtual addresses by walking the hart's page tables,
//! - running code on a halted hart, such as the built-in checksum routine.
//!
//! The debug module itself is reached through the [`HartDebugOps`] trait,
//! which a target family implements.
//!
//! ## Setting a breakpoint and waiting for it
//!
//! ```no_run
//! # use hartctl::{BreakpointKind, DebugReason, Error, HartDebugOps, ResumeAt, Session};
//! # fn example(debug_module: impl HartDebugOps) -> Result<(), Error> {
//! let config = hartctl::EngineConfig::from_yaml("smp: { harts: [0, 1] }")?;
//! let mut session = Session::new(debug_module, config)?;
//!
//! // Halts hart 0 and hart 1.
//! session.halt(0)?;
//!
//! let mut hart = session.hart(0)?;
//! hart.add_breakpoint(0x8000_0100, 4, BreakpointKind::Hardware)?;
//!
//! session.resume(0, ResumeAt::Current, false)?;
//!
//! loop {
//!     session.poll()?;
//!     if session.hart(0)?.debug_reason() == DebugReason::Breakpoint {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
mod assembly;
mod breakpoints;
pub mod config;
mod error;
mod hart;
pub mod interface;
mod memory;
#[cfg(any(test, feature = "test"))]
pub mod mock;
mod register_cache;
pub mod registers;
mod run_control;
mod session;
pub mod translate;
mod triggers;

/// Index of a hart behind the debug module.
pub type HartId = usize;

pub use crate::algorithm::{ParamDirection, RegisterDump, RegisterParam};
pub use crate::breakpoints::{Breakpoint, BreakpointKind, DataCondition, WatchKind, Watchpoint};
pub use crate::config::EngineConfig;
pub use crate::error::{Error, TranslationError, VerifyMismatch};
pub use crate::hart::{DebugReason, Hart, HartStatus, PollOutcome};
pub use crate::interface::{AccessWidth, HartDebugOps, MemoryAccessMethod};
pub use crate::registers::{HaltCause, RegisterId};
pub use crate::run_control::ResumeAt;
pub use crate::session::{HartEvent, Session};
