//! Breakpoints and watchpoints.
//!
//! Both are identified by a session wide unique id. Hardware breakpoints and
//! watchpoints occupy trigger slots, software breakpoints replace the
//! instruction at their address with `ebreak` or `c.ebreak`.

use crate::assembly::{C_EBREAK, EBREAK};
use crate::interface::HartDebugOps;
use crate::triggers::TriggerRequest;
use crate::{Error, Hart};

/// How a breakpoint is implemented.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// A trigger slot compares the fetch address.
    Hardware,
    /// The instruction is replaced by a breakpoint instruction.
    Software,
}

/// A code breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Session wide id.
    pub unique_id: u32,
    /// The instruction address.
    pub address: u64,
    /// The instruction length, 2 or 4.
    pub length: usize,
    /// How the breakpoint was placed, after the placement policy.
    pub kind: BreakpointKind,
    /// Whether the breakpoint is armed on the hart.
    pub is_set: bool,
    /// The instruction bytes replaced by a software breakpoint.
    pub original_instruction: Vec<u8>,
}

/// The accesses a watchpoint fires on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchKind {
    /// Loads.
    Read,
    /// Stores.
    Write,
    /// Loads and stores.
    Access,
}

/// Restricts a watchpoint to accesses of a particular value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataCondition {
    /// The value to compare against.
    pub value: u64,
    /// The bits of `value` which are compared.
    ///
    /// Trigger hardware can only compare every bit of the access, so any other
    /// mask is reported as unsupported.
    pub mask: u64,
}

/// A data watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    /// Session wide id.
    pub unique_id: u32,
    /// The watched address.
    pub address: u64,
    /// The watched length in bytes.
    pub length: usize,
    /// The accesses the watchpoint fires on.
    pub kind: WatchKind,
    /// Optional data value condition.
    pub condition: Option<DataCondition>,
    /// Whether the watchpoint is armed on the hart.
    pub is_set: bool,
}

impl Watchpoint {
    fn trigger_request(&self) -> Result<TriggerRequest, Error> {
        let data_value = match self.condition {
            None => None,
            Some(DataCondition { mask: 0, .. }) => None,
            Some(DataCondition { value, mask }) => {
                let full = if self.length >= 8 {
                    u64::MAX
                } else {
                    (1u64 << (self.length * 8)) - 1
                };

                if mask & full != full {
                    return Err(Error::Unsupported("partially masked watchpoint values"));
                }

                Some(value & full)
            }
        };

        Ok(TriggerRequest {
            unique_id: self.unique_id,
            address: self.address,
            length: self.length as u64,
            execute: false,
            read: matches!(self.kind, WatchKind::Read | WatchKind::Access),
            write: matches!(self.kind, WatchKind::Write | WatchKind::Access),
            data_value,
        })
    }
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    /// The breakpoints of this hart.
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.state.breakpoints
    }

    /// The watchpoints of this hart.
    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.state.watchpoints
    }

    /// Places a breakpoint and returns its id.
    ///
    /// The configured policy may turn a hardware request into a software
    /// breakpoint. Nothing is recorded if the breakpoint cannot be placed.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn add_breakpoint(
        &mut self,
        address: u64,
        length: usize,
        kind: BreakpointKind,
    ) -> Result<u32, Error> {
        self.ensure_halted()?;

        let kind = self.placement_for(kind);
        let mut breakpoint = Breakpoint {
            unique_id: self.context.allocate_id(),
            address,
            length,
            kind,
            is_set: false,
            original_instruction: Vec::new(),
        };

        match kind {
            BreakpointKind::Software => {
                breakpoint.original_instruction = self.insert_software_breakpoint(address, length)?;
            }
            BreakpointKind::Hardware => {
                self.add_trigger(&TriggerRequest {
                    unique_id: breakpoint.unique_id,
                    address,
                    length: length as u64,
                    execute: true,
                    read: false,
                    write: false,
                    data_value: None,
                })?;
            }
        }

        tracing::debug!(
            "{:?} breakpoint {} set at {:#010x}",
            kind,
            breakpoint.unique_id,
            address
        );

        breakpoint.is_set = true;
        let unique_id = breakpoint.unique_id;
        self.state.breakpoints.push(breakpoint);

        Ok(unique_id)
    }

    fn placement_for(&self, requested: BreakpointKind) -> BreakpointKind {
        let policy = &self.context.config.breakpoints;

        if requested == BreakpointKind::Software || policy.force_software {
            return BreakpointKind::Software;
        }

        if let Some(threshold) = policy.hardware_downgrade_threshold {
            let active = self
                .state
                .breakpoints
                .iter()
                .filter(|bp| bp.is_set && bp.kind == BreakpointKind::Hardware)
                .count();

            if active >= threshold {
                tracing::debug!(
                    "{} hardware breakpoints active, placing a software breakpoint instead",
                    active
                );
                return BreakpointKind::Software;
            }
        }

        BreakpointKind::Hardware
    }

    fn insert_software_breakpoint(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        if !matches!(length, 2 | 4) || address % 2 != 0 {
            return Err(Error::InvalidBreakpoint { address, length });
        }

        self.enable_ebreak()?;

        let original = self.read_by_any_size(address, length)?;

        let trap = match length {
            4 => EBREAK.to_le_bytes().to_vec(),
            _ => C_EBREAK.to_le_bytes().to_vec(),
        };
        self.write_by_any_size(address, &trap)?;

        Ok(original)
    }

    /// Removes a breakpoint, restoring the original instruction of a software breakpoint.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn remove_breakpoint(&mut self, unique_id: u32) -> Result<(), Error> {
        self.unset_breakpoint(unique_id)?;
        self.state
            .breakpoints
            .retain(|breakpoint| breakpoint.unique_id != unique_id);

        Ok(())
    }

    /// Disarms a breakpoint but keeps its record.
    pub(crate) fn unset_breakpoint(&mut self, unique_id: u32) -> Result<(), Error> {
        let Some(index) = self
            .state
            .breakpoints
            .iter()
            .position(|breakpoint| breakpoint.unique_id == unique_id)
        else {
            return Err(Error::BreakpointNotFound {
                hart: self.state.id,
                unique_id,
            });
        };

        let breakpoint = self.state.breakpoints[index].clone();
        if !breakpoint.is_set {
            return Ok(());
        }

        match breakpoint.kind {
            BreakpointKind::Software => {
                self.write_by_any_size(breakpoint.address, &breakpoint.original_instruction)?;
            }
            BreakpointKind::Hardware => self.remove_trigger(unique_id)?,
        }

        self.state.breakpoints[index].is_set = false;
        Ok(())
    }

    /// Arms a breakpoint which was disarmed by [`unset_breakpoint`](Self::unset_breakpoint).
    pub(crate) fn set_breakpoint(&mut self, unique_id: u32) -> Result<(), Error> {
        let Some(index) = self
            .state
            .breakpoints
            .iter()
            .position(|breakpoint| breakpoint.unique_id == unique_id)
        else {
            return Err(Error::BreakpointNotFound {
                hart: self.state.id,
                unique_id,
            });
        };

        let breakpoint = self.state.breakpoints[index].clone();
        if breakpoint.is_set {
            return Ok(());
        }

        match breakpoint.kind {
            BreakpointKind::Software => {
                let original =
                    self.insert_software_breakpoint(breakpoint.address, breakpoint.length)?;
                self.state.breakpoints[index].original_instruction = original;
            }
            BreakpointKind::Hardware => self.add_trigger(&TriggerRequest {
                unique_id,
                address: breakpoint.address,
                length: breakpoint.length as u64,
                execute: true,
                read: false,
                write: false,
                data_value: None,
            })?,
        }

        self.state.breakpoints[index].is_set = true;
        Ok(())
    }

    /// The armed breakpoint at `address`, if any.
    pub(crate) fn breakpoint_at(&self, address: u64) -> Option<u32> {
        self.state
            .breakpoints
            .iter()
            .find(|breakpoint| breakpoint.is_set && breakpoint.address == address)
            .map(|breakpoint| breakpoint.unique_id)
    }

    /// Places a watchpoint and returns its id.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn add_watchpoint(
        &mut self,
        address: u64,
        length: usize,
        kind: WatchKind,
        condition: Option<DataCondition>,
    ) -> Result<u32, Error> {
        self.ensure_halted()?;

        let mut watchpoint = Watchpoint {
            unique_id: self.context.allocate_id(),
            address,
            length,
            kind,
            condition,
            is_set: false,
        };

        self.add_trigger(&watchpoint.trigger_request()?)?;

        tracing::debug!(
            "watchpoint {} set at {:#010x} ({} bytes, {:?})",
            watchpoint.unique_id,
            address,
            length,
            kind
        );

        watchpoint.is_set = true;
        let unique_id = watchpoint.unique_id;
        self.state.watchpoints.push(watchpoint);

        Ok(unique_id)
    }

    /// Removes a watchpoint.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn remove_watchpoint(&mut self, unique_id: u32) -> Result<(), Error> {
        self.unset_watchpoint(unique_id)?;
        self.state
            .watchpoints
            .retain(|watchpoint| watchpoint.unique_id != unique_id);

        Ok(())
    }

    fn watchpoint_index(&self, unique_id: u32) -> Result<usize, Error> {
        self.state
            .watchpoints
            .iter()
            .position(|watchpoint| watchpoint.unique_id == unique_id)
            .ok_or(Error::WatchpointNotFound {
                hart: self.state.id,
                unique_id,
            })
    }

    pub(crate) fn unset_watchpoint(&mut self, unique_id: u32) -> Result<(), Error> {
        let index = self.watchpoint_index(unique_id)?;
        if !self.state.watchpoints[index].is_set {
            return Ok(());
        }

        self.remove_trigger(unique_id)?;
        self.state.watchpoints[index].is_set = false;

        Ok(())
    }

    pub(crate) fn set_watchpoint(&mut self, unique_id: u32) -> Result<(), Error> {
        let index = self.watchpoint_index(unique_id)?;
        if self.state.watchpoints[index].is_set {
            return Ok(());
        }

        let request = self.state.watchpoints[index].trigger_request()?;
        self.add_trigger(&request)?;
        self.state.watchpoints[index].is_set = true;

        Ok(())
    }
}
