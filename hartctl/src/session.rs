//! The session owns the debug module and the state of every hart behind it.

use std::fmt;
use std::time::Instant;

use crate::config::{EngineConfig, ResumeOrder};
use crate::hart::{DebugReason, HartState, HartStatus, PollOutcome};
use crate::interface::HartDebugOps;
use crate::run_control::{keep_first, ResumeAt};
use crate::{Error, Hart, HartId};

/// A change of hart state the engine announces.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HartEvent {
    /// The hart halted.
    Halted,
    /// The hart halted after running on behalf of the debugger.
    DebugHalted,
    /// The hart resumed.
    Resumed,
    /// The hart resumed to run code on behalf of the debugger.
    DebugResumed,
    /// Reset was asserted.
    ResetAsserted,
    /// Reset was released.
    ResetDeasserted,
}

type EventHandler = Box<dyn FnMut(HartId, HartEvent)>;

/// Delivers hart events to the registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<EventHandler>,
}

impl EventDispatcher {
    pub(crate) fn emit(&mut self, hart: HartId, event: HartEvent) {
        tracing::trace!("hart {}: {:?}", hart, event);
        for handler in &mut self.handlers {
            handler(hart, event);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Session wide state shared by all hart handles.
#[derive(Debug)]
pub struct SessionContext {
    pub(crate) config: EngineConfig,
    pub(crate) events: EventDispatcher,
    next_unique_id: u32,
}

impl SessionContext {
    /// Ids for breakpoints and watchpoints, unique across all harts.
    pub(crate) fn allocate_id(&mut self) -> u32 {
        let id = self.next_unique_id;
        self.next_unique_id += 1;
        id
    }
}

/// The phases of a batched operation on a group of harts.
///
/// Every hart of the group completes a phase before any hart enters the
/// next one, which keeps the skew between the harts small.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Prep,
    Go,
    Finish,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::Prep, Phase::Go, Phase::Finish];
}

/// The run-control engine for all harts behind one debug module.
///
/// ```no_run
/// # use hartctl::{EngineConfig, Error, HartDebugOps, ResumeAt, Session};
/// # fn attach(debug_module: impl HartDebugOps) -> Result<(), Error> {
/// let mut session = Session::new(debug_module, EngineConfig::default())?;
///
/// session.halt(0)?;
/// let pc = session.hart(0)?.read_pc()?;
/// session.resume(0, ResumeAt::Current, false)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Session<D> {
    interface: D,
    harts: Vec<HartState>,
    context: SessionContext,
}

impl<D: HartDebugOps> Session<D> {
    /// Creates a session and learns the current state of every hart.
    pub fn new(interface: D, config: EngineConfig) -> Result<Self, Error> {
        let count = interface.hart_count();

        if let Some(smp) = &config.smp {
            if let Some(&missing) = smp.harts.iter().find(|&&hart| hart >= count) {
                return Err(Error::HartNotFound(missing));
            }
        }

        let mut session = Self {
            interface,
            harts: (0..count).map(HartState::new).collect(),
            context: SessionContext {
                config,
                events: EventDispatcher::default(),
                next_unique_id: 1,
            },
        };

        for hart in 0..count {
            session.hart_unchecked(hart).poll()?;
        }

        tracing::debug!("session with {} harts", count);
        Ok(session)
    }

    /// The debug module.
    pub fn interface(&self) -> &D {
        &self.interface
    }

    /// The debug module, mutably.
    pub fn interface_mut(&mut self) -> &mut D {
        &mut self.interface
    }

    /// The configuration the session runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    /// The number of harts.
    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    /// Registers a handler which is called for every [`HartEvent`].
    pub fn on_event(&mut self, handler: impl FnMut(HartId, HartEvent) + 'static) {
        self.context.events.handlers.push(Box::new(handler));
    }

    /// A handle to a single hart.
    pub fn hart(&mut self, hart: HartId) -> Result<Hart<'_, D>, Error> {
        if hart >= self.harts.len() {
            return Err(Error::HartNotFound(hart));
        }

        Ok(self.hart_unchecked(hart))
    }

    fn hart_unchecked(&mut self, hart: HartId) -> Hart<'_, D> {
        Hart {
            interface: &mut self.interface,
            state: &mut self.harts[hart],
            context: &mut self.context,
        }
    }

    /// The harts run-controlled together with `hart`, in ascending order.
    fn group_of(&self, hart: HartId) -> Result<Vec<HartId>, Error> {
        if hart >= self.harts.len() {
            return Err(Error::HartNotFound(hart));
        }

        match &self.context.config.smp {
            Some(smp) if smp.harts.contains(&hart) => {
                let mut group = smp.harts.clone();
                group.sort_unstable();
                group.dedup();
                Ok(group)
            }
            _ => Ok(vec![hart]),
        }
    }

    /// Halts `hart` and every hart of its group.
    ///
    /// Failures on one hart do not stop the others; the first one is reported.
    #[tracing::instrument(skip(self))]
    pub fn halt(&mut self, hart: HartId) -> Result<(), Error> {
        let group = self.group_of(hart)?;
        self.halt_group(&group)
    }

    fn halt_group(&mut self, group: &[HartId]) -> Result<(), Error> {
        let mut result = Ok(());

        for phase in Phase::ALL {
            tracing::trace!("halt {:?} on harts {:?}", phase, group);

            match phase {
                Phase::Prep => {
                    for &id in group {
                        keep_first(&mut result, self.hart_unchecked(id).halt_prep());
                    }
                }
                Phase::Go => {
                    for &id in group {
                        keep_first(&mut result, self.hart_unchecked(id).halt_go());
                    }
                    keep_first(&mut result, self.wait_for_halt(group));
                }
                Phase::Finish => {
                    for &id in group {
                        self.hart_unchecked(id).halt_finish();
                    }
                }
            }
        }

        result
    }

    /// Waits for every hart with an issued halt request to halt.
    ///
    /// Harts still running at the deadline are recorded as halted for an
    /// unknown reason.
    fn wait_for_halt(&mut self, group: &[HartId]) -> Result<(), Error> {
        let timeout = self.context.config.command_timeout();
        let poll_interval = self.context.config.poll_interval();
        let start = Instant::now();

        let mut pending: Vec<HartId> = group
            .iter()
            .copied()
            .filter(|&id| self.harts[id].prepped)
            .collect();
        let mut result = Ok(());

        loop {
            let mut still_pending = Vec::new();
            for id in pending {
                match self.hart_unchecked(id).halt_complete() {
                    Ok(true) => {}
                    Ok(false) => still_pending.push(id),
                    Err(error) => keep_first(&mut result, Err(error)),
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                return result;
            }

            if start.elapsed() >= timeout {
                for &id in &pending {
                    tracing::warn!("hart {} did not halt within {:?}", id, timeout);
                    self.hart_unchecked(id).mark_halted(DebugReason::Undefined);
                }

                keep_first(
                    &mut result,
                    Err(Error::Timeout {
                        hart: pending[0],
                        operation: "halt",
                        elapsed: start.elapsed(),
                    }),
                );
                return result;
            }

            std::thread::sleep(poll_interval);
        }
    }

    /// Resumes `hart` and every hart of its group.
    ///
    /// Harts which are not halted are skipped. `debug_execution` marks the
    /// harts as running on behalf of the debugger.
    #[tracing::instrument(skip(self))]
    pub fn resume(
        &mut self,
        hart: HartId,
        at: ResumeAt,
        debug_execution: bool,
    ) -> Result<(), Error> {
        let mut group = self.group_of(hart)?;
        if self.context.config.resume_order == ResumeOrder::Reversed {
            group.reverse();
        }

        let mut result = Ok(());

        for phase in Phase::ALL {
            tracing::trace!("resume {:?} on harts {:?}", phase, group);

            for &id in &group {
                let mut hart = self.hart_unchecked(id);
                match phase {
                    Phase::Prep if hart.status() != HartStatus::Halted => {
                        tracing::debug!("hart {} is not halted, not resuming it", id);
                    }
                    Phase::Prep => keep_first(&mut result, hart.resume_prep(at)),
                    Phase::Go => keep_first(&mut result, hart.resume_go()),
                    Phase::Finish => hart.resume_finish(debug_execution),
                }
            }
        }

        result
    }

    /// Single steps one hart. Other harts of its group stay halted.
    pub fn step(
        &mut self,
        hart: HartId,
        at: ResumeAt,
        handle_breakpoints: bool,
    ) -> Result<(), Error> {
        self.hart(hart)?.step(at, handle_breakpoints)
    }

    /// Polls every hart for state changes.
    ///
    /// When a hart of the group halted on its own, the rest of the group is
    /// halted too.
    pub fn poll(&mut self) -> Result<(), Error> {
        let mut result = Ok(());
        let mut newly_halted = Vec::new();

        for id in 0..self.harts.len() {
            match self.hart_unchecked(id).poll() {
                Ok(PollOutcome::Halted) => newly_halted.push(id),
                Ok(_) => {}
                Err(error) => keep_first(&mut result, Err(error)),
            }
        }

        let Some(smp) = self.context.config.smp.clone() else {
            return result;
        };

        if let Some(&member) = newly_halted.iter().find(|id| smp.harts.contains(id)) {
            let group = self.group_of(member)?;
            let running: Vec<HartId> = group
                .into_iter()
                .filter(|&id| self.harts[id].status.is_running())
                .collect();

            if !running.is_empty() {
                tracing::debug!("halting the rest of the group: {:?}", running);
                keep_first(&mut result, self.halt_group(&running));
            }
        }

        result
    }

    /// Puts a hart into reset.
    pub fn assert_reset(&mut self, hart: HartId) -> Result<(), Error> {
        let mut hart = self.hart(hart)?;
        let id = hart.id();

        if hart.status() == HartStatus::Halted && hart.state.registers.is_dirty() {
            hart.flush_registers()?;
        }

        hart.interface.assert_reset(id)?;

        hart.state.registers.clear();
        hart.state.status = HartStatus::Reset;
        hart.state.debug_reason = DebugReason::NotHalted;
        hart.emit(HartEvent::ResetAsserted);

        Ok(())
    }

    /// Releases a hart from reset.
    ///
    /// Reset clears the trigger hardware and `dcsr`, so hardware breakpoints
    /// and watchpoints are recorded as disarmed.
    pub fn deassert_reset(&mut self, hart: HartId) -> Result<(), Error> {
        let mut hart = self.hart(hart)?;
        let id = hart.id();

        hart.interface.deassert_reset(id)?;

        hart.state.triggers.reset();
        hart.state.ebreak_enabled = false;
        for breakpoint in &mut hart.state.breakpoints {
            if breakpoint.kind == crate::BreakpointKind::Hardware {
                breakpoint.is_set = false;
            }
        }
        for watchpoint in &mut hart.state.watchpoints {
            watchpoint.is_set = false;
        }

        hart.state.status = HartStatus::Unknown;
        hart.emit(HartEvent::ResetDeasserted);
        hart.poll()?;

        Ok(())
    }

    /// Writes back every dirty register. Call before dropping the session.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        let mut result = Ok(());

        for id in 0..self.harts.len() {
            if self.harts[id].registers.is_dirty() {
                keep_first(&mut result, self.hart_unchecked(id).flush_registers());
            }
        }

        result
    }
}
