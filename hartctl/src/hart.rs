//! Per-hart state and the handle through which a single hart is controlled.

use crate::breakpoints::{Breakpoint, BreakpointKind, Watchpoint};
use crate::interface::HartDebugOps;
use crate::register_cache::RegisterCache;
use crate::registers::{Dcsr, HaltCause, Misa, RegisterId, DCSR, MISA, PC, ZERO};
use crate::session::{HartEvent, SessionContext};
use crate::triggers::TriggerUnits;
use crate::{Error, HartId};

/// The run state of a hart as last observed by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HartStatus {
    /// The hart is executing user code.
    Running,
    /// The hart is in debug mode.
    Halted,
    /// The hart is executing code on behalf of the debugger, e.g. an algorithm.
    DebugRunning,
    /// The hart is held in reset.
    Reset,
    /// Nothing is known yet. This is the case before the first poll.
    Unknown,
}

impl HartStatus {
    /// Returns `true` if the hart is running, for the user or the debugger.
    pub fn is_running(&self) -> bool {
        matches!(self, HartStatus::Running | HartStatus::DebugRunning)
    }
}

/// Why a hart last entered debug mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugReason {
    /// The hart is not halted.
    NotHalted,
    /// A software or hardware breakpoint was hit.
    Breakpoint,
    /// A watchpoint fired.
    Watchpoint,
    /// A single step completed.
    SingleStep,
    /// The debugger requested the halt.
    DebugRequest,
    /// The hart halted, but the reason could not be determined.
    Undefined,
}

/// The result of polling a hart.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The hart is in the state the engine expected.
    Unchanged,
    /// The hart halted since the last poll.
    Halted,
    /// The hart started running since the last poll.
    Running,
}

/// Everything the engine remembers about one hart between operations.
#[derive(Debug)]
pub struct HartState {
    pub(crate) id: HartId,
    pub(crate) status: HartStatus,
    pub(crate) debug_reason: DebugReason,
    /// Set by the first phase of a batched halt or resume, cleared by the last.
    pub(crate) prepped: bool,
    pub(crate) registers: RegisterCache,
    pub(crate) triggers: TriggerUnits,
    pub(crate) breakpoints: Vec<Breakpoint>,
    pub(crate) watchpoints: Vec<Watchpoint>,
    pub(crate) last_trigger_hit: Option<u32>,
    pub(crate) ebreak_enabled: bool,
    xlen: Option<u32>,
    misa: Option<Misa>,
}

impl HartState {
    pub(crate) fn new(id: HartId) -> Self {
        Self {
            id,
            status: HartStatus::Unknown,
            debug_reason: DebugReason::NotHalted,
            prepped: false,
            registers: RegisterCache::new(),
            triggers: TriggerUnits::default(),
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            last_trigger_hit: None,
            ebreak_enabled: false,
            xlen: None,
            misa: None,
        }
    }
}

/// A handle to one hart of a [`Session`](crate::Session).
///
/// Obtained from [`Session::hart`](crate::Session::hart). Operations on a
/// single hart live here; operations which must keep a group of harts
/// consistent live on the session.
pub struct Hart<'s, D> {
    pub(crate) interface: &'s mut D,
    pub(crate) state: &'s mut HartState,
    pub(crate) context: &'s mut SessionContext,
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    /// The id of this hart.
    pub fn id(&self) -> HartId {
        self.state.id
    }

    /// The run state as last observed.
    pub fn status(&self) -> HartStatus {
        self.state.status
    }

    /// Why the hart last halted.
    pub fn debug_reason(&self) -> DebugReason {
        self.state.debug_reason
    }

    /// The id of the breakpoint or watchpoint whose trigger caused the last halt.
    pub fn last_trigger_hit(&self) -> Option<u32> {
        self.state.last_trigger_hit
    }

    /// The native register width.
    pub fn xlen(&mut self) -> Result<u32, Error> {
        if let Some(xlen) = self.state.xlen {
            return Ok(xlen);
        }

        let xlen = self.interface.xlen(self.state.id)?;
        self.state.xlen = Some(xlen);
        Ok(xlen)
    }

    pub(crate) fn misa(&mut self) -> Result<Misa, Error> {
        if let Some(misa) = self.state.misa {
            return Ok(misa);
        }

        let misa = Misa(self.read_register(MISA)?);
        self.state.misa = Some(misa);
        Ok(misa)
    }

    pub(crate) fn ensure_halted(&self) -> Result<(), Error> {
        if self.state.status == HartStatus::Halted {
            Ok(())
        } else {
            Err(Error::NotHalted(self.state.id))
        }
    }

    /// Reads a register, from the shadow cache where possible.
    ///
    /// The hart has to be halted.
    pub fn read_register(&mut self, register: RegisterId) -> Result<u64, Error> {
        self.ensure_halted()?;

        if register.is_cacheable(false) {
            if let Some(value) = self.state.registers.value_of(register) {
                return Ok(value);
            }
        }

        let value = self.interface.read_register(self.state.id, register)?;
        tracing::trace!("hart {}: read {} = {:#x}", self.state.id, register, value);

        if register.is_cacheable(false) {
            self.state.registers.store(register, value);
        }

        Ok(value)
    }

    /// Writes a register.
    ///
    /// Writes to the general purpose registers and the program counter are
    /// held in the shadow cache until the hart is resumed or stepped. Writing
    /// the trigger registers directly makes the engine treat the trigger
    /// hardware as manually configured.
    pub fn write_register(&mut self, register: RegisterId, value: u64) -> Result<(), Error> {
        if register.is_trigger_register() {
            tracing::debug!(
                "hart {}: {} written directly, trigger bookkeeping invalidated",
                self.state.id,
                register
            );
            self.state.triggers.mark_manually_configured();
        }

        self.write_register_internal(register, value)
    }

    pub(crate) fn write_register_internal(
        &mut self,
        register: RegisterId,
        value: u64,
    ) -> Result<(), Error> {
        self.ensure_halted()?;

        if register == ZERO {
            return Ok(());
        }

        if register.is_cacheable(true) {
            self.state.registers.store_dirty(register, value);
            return Ok(());
        }

        tracing::trace!("hart {}: write {} = {:#x}", self.state.id, register, value);
        self.interface
            .write_register(self.state.id, register, value)?;

        // WARL registers have to be read back before the cached value can be trusted.
        self.state.registers.remove(register);

        Ok(())
    }

    /// The program counter.
    pub fn read_pc(&mut self) -> Result<u64, Error> {
        self.read_register(PC)
    }

    /// Sets the program counter.
    pub fn write_pc(&mut self, value: u64) -> Result<(), Error> {
        self.write_register_internal(PC, value)
    }

    /// Writes every dirty register back to the hart.
    pub fn flush_registers(&mut self) -> Result<(), Error> {
        for (register, value) in self.state.registers.dirty_entries() {
            tracing::trace!(
                "hart {}: write back {} = {:#x}",
                self.state.id,
                register,
                value
            );
            self.interface
                .write_register(self.state.id, register, value)?;
            self.state.registers.mark_clean(register);
        }

        Ok(())
    }

    pub(crate) fn invalidate_register_cache(&mut self) {
        if self.state.registers.is_dirty() {
            tracing::warn!(
                "hart {}: dropping registers which were never written back: {:?}",
                self.state.id,
                self.state.registers.dirty_entries()
            );
        }

        self.state.registers.clear();
    }

    /// Makes `ebreak` enter debug mode in every implemented privilege mode.
    pub(crate) fn enable_ebreak(&mut self) -> Result<(), Error> {
        if self.state.ebreak_enabled {
            return Ok(());
        }

        let misa = self.misa()?;
        let mut dcsr = Dcsr(self.read_register(DCSR)?);
        dcsr.set_ebreakm(true);
        dcsr.set_ebreaks(misa.has_extension('S'));
        dcsr.set_ebreaku(misa.has_extension('U'));
        self.write_register_internal(DCSR, dcsr.0)?;

        self.state.ebreak_enabled = true;
        Ok(())
    }

    pub(crate) fn emit(&mut self, event: HartEvent) {
        self.context.events.emit(self.state.id, event);
    }

    /// Checks whether the hart changed its run state behind the engine's back.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn poll(&mut self) -> Result<PollOutcome, Error> {
        let halted = self.interface.is_halted(self.state.id)?;

        match (halted, self.state.status) {
            (true, HartStatus::Halted) => Ok(PollOutcome::Unchanged),
            (true, previous) => {
                tracing::debug!("hart {} halted (was {:?})", self.state.id, previous);

                self.state.status = HartStatus::Halted;
                self.invalidate_register_cache();

                let cause = self.interface.halt_reason(self.state.id)?;
                self.set_debug_reason(cause)?;

                if previous == HartStatus::DebugRunning {
                    self.emit(HartEvent::DebugHalted);
                } else {
                    self.emit(HartEvent::Halted);
                }

                Ok(PollOutcome::Halted)
            }
            (false, HartStatus::Running | HartStatus::DebugRunning) => Ok(PollOutcome::Unchanged),
            (false, previous) => {
                tracing::debug!("hart {} running (was {:?})", self.state.id, previous);

                self.state.status = HartStatus::Running;
                self.state.debug_reason = DebugReason::NotHalted;
                self.invalidate_register_cache();

                Ok(PollOutcome::Running)
            }
        }
    }

    /// Derives the debug reason from the hardware halt cause.
    pub(crate) fn set_debug_reason(&mut self, cause: HaltCause) -> Result<(), Error> {
        self.state.last_trigger_hit = None;

        let reason = match cause {
            HaltCause::Ebreak => DebugReason::Breakpoint,
            HaltCause::Trigger => {
                let hit = self.take_trigger_hit()?;
                self.state.last_trigger_hit = hit;

                match hit {
                    Some(id) if self.state.breakpoints.iter().any(|bp| bp.unique_id == id) => {
                        DebugReason::Breakpoint
                    }
                    Some(_) => DebugReason::Watchpoint,
                    // Without a hit bit a hardware breakpoint at the halt address is the best guess.
                    None => {
                        let pc = self.read_pc()?;
                        let at_breakpoint = self.state.breakpoints.iter().any(|bp| {
                            bp.is_set && bp.kind == BreakpointKind::Hardware && bp.address == pc
                        });

                        if at_breakpoint {
                            DebugReason::Breakpoint
                        } else {
                            DebugReason::Watchpoint
                        }
                    }
                }
            }
            HaltCause::HaltRequest | HaltCause::ResetHaltRequest | HaltCause::Group => {
                DebugReason::DebugRequest
            }
            HaltCause::Step => DebugReason::SingleStep,
        };

        tracing::debug!(
            "hart {}: halt cause {:?}, debug reason {:?}",
            self.state.id,
            cause,
            reason
        );
        self.state.debug_reason = reason;

        Ok(())
    }
}
