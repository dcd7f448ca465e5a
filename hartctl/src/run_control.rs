//! Halting, resuming and stepping a single hart.
//!
//! Halt and resume are split into phases so that a session can drive a
//! whole group of harts through each phase before moving on to the next.

use std::time::{Duration, Instant};

use crate::config::InterruptMaskPolicy;
use crate::hart::{DebugReason, HartStatus};
use crate::interface::HartDebugOps;
use crate::registers::{Mstatus, MSTATUS};
use crate::session::HartEvent;
use crate::{Error, Hart};

/// Where a hart continues execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResumeAt {
    /// At the current program counter.
    Current,
    /// At the given address.
    Address(u64),
}

/// Keeps the first error of a multi step operation, logging the rest.
pub(crate) fn keep_first(result: &mut Result<(), Error>, next: Result<(), Error>) {
    if let Err(error) = next {
        if result.is_ok() {
            *result = Err(error);
        } else {
            tracing::warn!("additional failure: {}", error);
        }
    }
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    /// First halt phase. Harts which are already halted are left alone, all
    /// others get their halt request prepared.
    pub(crate) fn halt_prep(&mut self) -> Result<(), Error> {
        let id = self.state.id;

        if self.interface.is_halted(id)? {
            tracing::debug!("hart {} is already halted", id);

            if self.state.status != HartStatus::Halted {
                self.state.status = HartStatus::Halted;
                self.invalidate_register_cache();
            }

            if self.state.debug_reason == DebugReason::NotHalted {
                let cause = self.interface.halt_reason(id)?;
                self.set_debug_reason(cause)?;
            }

            return Ok(());
        }

        self.interface.halt_prep(id)?;
        self.state.prepped = true;

        Ok(())
    }

    /// Second halt phase, issues the prepared request.
    pub(crate) fn halt_go(&mut self) -> Result<(), Error> {
        if !self.state.prepped {
            return Ok(());
        }

        if let Err(error) = self.interface.halt_go(self.state.id) {
            self.state.prepped = false;
            return Err(error);
        }

        Ok(())
    }

    /// Checks whether a hart with an issued halt request got there.
    pub(crate) fn halt_complete(&mut self) -> Result<bool, Error> {
        if !self.interface.is_halted(self.state.id)? {
            return Ok(false);
        }

        self.mark_halted(DebugReason::DebugRequest);
        Ok(true)
    }

    /// Records a halt the engine requested, `fallback` being the debug
    /// reason unless one is already known.
    pub(crate) fn mark_halted(&mut self, fallback: DebugReason) {
        self.state.status = HartStatus::Halted;
        self.invalidate_register_cache();

        if self.state.debug_reason == DebugReason::NotHalted {
            self.state.debug_reason = fallback;
        }
    }

    /// Last halt phase, announces the halt.
    pub(crate) fn halt_finish(&mut self) {
        self.state.prepped = false;

        if self.state.status == HartStatus::Halted {
            self.emit(HartEvent::Halted);
        }
    }

    /// Halts this hart alone and waits for it.
    pub(crate) fn halt_and_wait(&mut self, timeout: Duration) -> Result<(), Error> {
        self.halt_prep()?;
        self.halt_go()?;

        let poll_interval = self.context.config.poll_interval();
        let start = Instant::now();
        let mut result = Ok(());

        while self.state.prepped && !self.halt_complete()? {
            if start.elapsed() >= timeout {
                tracing::warn!("hart {} did not halt in time", self.state.id);
                self.mark_halted(DebugReason::Undefined);
                result = Err(Error::Timeout {
                    hart: self.state.id,
                    operation: "halt",
                    elapsed: start.elapsed(),
                });
                break;
            }
            std::thread::sleep(poll_interval);
        }

        self.halt_finish();
        result
    }

    /// First resume phase.
    ///
    /// Sets the program counter, steps off a watchpoint which would fire
    /// again right away, and commits dirty registers.
    pub(crate) fn resume_prep(&mut self, at: ResumeAt) -> Result<(), Error> {
        self.ensure_halted()?;

        if let ResumeAt::Address(address) = at {
            self.write_pc(address)?;
        }

        if self.state.debug_reason == DebugReason::Watchpoint {
            tracing::debug!("hart {}: stepping off the watchpoint", self.state.id);

            let disabled = self.disable_triggers()?;
            let mut result = self.step_once();
            keep_first(&mut result, self.enable_triggers(disabled));
            result?;
        }

        self.flush_registers()?;
        self.interface.resume_prep(self.state.id)?;
        self.state.prepped = true;

        Ok(())
    }

    /// Second resume phase, lets the hart run.
    pub(crate) fn resume_go(&mut self) -> Result<(), Error> {
        if !self.state.prepped {
            return Ok(());
        }

        if let Err(error) = self.interface.resume_go(self.state.id) {
            self.state.prepped = false;
            return Err(error);
        }

        Ok(())
    }

    /// Last resume phase, records the new state and announces it.
    pub(crate) fn resume_finish(&mut self, debug_execution: bool) {
        if !self.state.prepped {
            return;
        }
        self.state.prepped = false;

        self.invalidate_register_cache();
        self.state.debug_reason = DebugReason::NotHalted;

        if debug_execution {
            self.state.status = HartStatus::DebugRunning;
            self.emit(HartEvent::DebugResumed);
        } else {
            self.state.status = HartStatus::Running;
            self.emit(HartEvent::Resumed);
        }
    }

    /// Resumes this hart alone.
    pub(crate) fn resume_alone(&mut self, at: ResumeAt, debug_execution: bool) -> Result<(), Error> {
        let mut result = self.resume_prep(at);
        if result.is_ok() {
            result = self.resume_go();
        }
        self.resume_finish(debug_execution);
        result
    }

    /// Executes one instruction with the hardware, nothing else.
    fn step_once(&mut self) -> Result<(), Error> {
        self.flush_registers()?;
        self.interface.step(self.state.id)?;
        self.invalidate_register_cache();
        Ok(())
    }

    /// Clears every interrupt enable in `mstatus`, returning the previous value.
    pub(crate) fn mask_interrupts(&mut self) -> Result<u64, Error> {
        let mstatus = self.read_register(MSTATUS)?;
        self.write_register_internal(MSTATUS, Mstatus(mstatus).interrupts_masked().0)?;
        Ok(mstatus)
    }

    /// Executes a single instruction.
    ///
    /// Triggers are taken out of service for the step and a breakpoint at the
    /// step address is lifted, so the step cannot halt on the spot. Whatever
    /// happens, both are put back before returning; the first failure is
    /// reported.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn step(&mut self, at: ResumeAt, handle_breakpoints: bool) -> Result<(), Error> {
        self.ensure_halted()?;

        if let ResumeAt::Address(address) = at {
            self.write_pc(address)?;
        }

        let mut lifted_breakpoint = None;
        if handle_breakpoints {
            let pc = self.read_pc()?;
            if let Some(unique_id) = self.breakpoint_at(pc) {
                self.unset_breakpoint(unique_id)?;
                lifted_breakpoint = Some(unique_id);
            }
        }

        let mut result = Ok(());
        let disabled = match self.disable_triggers() {
            Ok(disabled) => Some(disabled),
            Err(error) => {
                result = Err(error);
                None
            }
        };

        if result.is_ok() {
            let saved_mstatus = match self.context.config.step_interrupts {
                InterruptMaskPolicy::StepOnly => match self.mask_interrupts() {
                    Ok(mstatus) => Some(mstatus),
                    Err(error) => {
                        result = Err(error);
                        None
                    }
                },
                InterruptMaskPolicy::Off => None,
            };

            if result.is_ok() {
                result = self.step_once();
            }

            if let Some(mstatus) = saved_mstatus {
                keep_first(&mut result, self.write_register_internal(MSTATUS, mstatus));
            }
        }

        if let Some(disabled) = disabled {
            keep_first(&mut result, self.enable_triggers(disabled));
        }

        if let Some(unique_id) = lifted_breakpoint {
            keep_first(&mut result, self.set_breakpoint(unique_id));
        }

        result?;

        self.state.status = HartStatus::Halted;
        self.state.debug_reason = DebugReason::SingleStep;
        self.emit(HartEvent::Resumed);
        self.emit(HartEvent::Halted);

        Ok(())
    }
}
