//! Running code on a halted hart on behalf of the debugger.

use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_MPEG_2};

use crate::assembly::{crc32_routine, CRC32_EXIT_OFFSET};
use crate::error::VerifyMismatch;
use crate::hart::{HartStatus, PollOutcome};
use crate::interface::HartDebugOps;
use crate::registers::{RegisterId, MSTATUS};
use crate::run_control::{keep_first, ResumeAt};
use crate::{Error, Hart};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Registers captured when an algorithm has to be stopped by force.
const DUMP_REGISTERS: [&str; 35] = [
    "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a0", "a1", "a2", "a3", "a4", "a5", "a6",
    "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
    "pc", "mstatus", "mepc", "mcause",
];

/// Which way a register parameter is passed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamDirection {
    /// Written before the algorithm runs.
    Input,
    /// Read back after the algorithm returns.
    Output,
    /// Both.
    InputOutput,
}

impl ParamDirection {
    fn is_input(self) -> bool {
        matches!(self, ParamDirection::Input | ParamDirection::InputOutput)
    }

    fn is_output(self) -> bool {
        matches!(self, ParamDirection::Output | ParamDirection::InputOutput)
    }
}

/// A register passed to or returned from an algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterParam {
    /// Register name, e.g. `a0` or `x10`.
    pub name: String,
    pub direction: ParamDirection,
    /// The value to pass in, replaced by the returned value for outputs.
    pub value: u64,
}

impl RegisterParam {
    pub fn input(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            direction: ParamDirection::Input,
            value,
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ParamDirection::Output,
            value: 0,
        }
    }

    pub fn in_out(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            direction: ParamDirection::InputOutput,
            value,
        }
    }
}

/// Register values of a hart captured for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterDump {
    values: Vec<(&'static str, u64)>,
}

impl RegisterDump {
    /// The captured value of the register called `name`.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values
            .iter()
            .find(|(register, _)| *register == name)
            .map(|(_, value)| *value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, u64)> {
        self.values.iter()
    }
}

/// State to put back once an algorithm is done.
struct SavedState {
    pc: u64,
    registers: Vec<(RegisterId, u64)>,
    mstatus: Option<u64>,
}

fn parameter_register(name: &str) -> Result<RegisterId, Error> {
    let register =
        RegisterId::from_name(name).ok_or_else(|| Error::UnknownRegister(name.to_string()))?;

    if !register.is_gpr() {
        return Err(Error::InvalidArgumentRegister(register));
    }

    Ok(register)
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    /// Runs the code at `entry` until it halts or `timeout` expires.
    ///
    /// Input parameters are written before the hart is resumed, output
    /// parameters are read back into `params` afterwards. Every register the
    /// call touches is restored, so apart from the outputs the hart looks as
    /// if nothing happened. If `exit` is given, the hart must halt there.
    ///
    /// On timeout the hart is halted by force and its registers are returned
    /// in [`Error::AlgorithmTimeout`]. The saved state is only restored in
    /// that case if the configuration asks for it.
    #[tracing::instrument(skip(self, params), fields(hart = self.state.id))]
    pub fn run_algorithm(
        &mut self,
        entry: u64,
        exit: Option<u64>,
        params: &mut [RegisterParam],
        timeout: Duration,
    ) -> Result<(), Error> {
        self.ensure_halted()?;

        let registers = params
            .iter()
            .map(|param| parameter_register(&param.name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut saved = SavedState {
            pc: self.read_pc()?,
            registers: Vec::with_capacity(registers.len()),
            mstatus: None,
        };
        for &register in &registers {
            if saved.registers.iter().all(|(r, _)| *r != register) {
                saved.registers.push((register, self.read_register(register)?));
            }
        }

        if let Err(error) = self.start_algorithm(entry, params, &registers, &mut saved) {
            return Err(self.abandon_algorithm(error, &saved));
        }

        match self.wait_for_algorithm(timeout) {
            Ok(true) => {}
            Ok(false) => return Err(self.algorithm_timed_out(timeout, &saved)),
            Err(error) => return Err(self.abandon_algorithm(error, &saved)),
        }

        let pc = self.read_pc()?;
        let mut result = match exit {
            Some(expected) if expected != pc => {
                tracing::warn!(
                    "hart {}: algorithm stopped at {:#010x}, expected {:#010x}",
                    self.state.id,
                    pc,
                    expected
                );
                Err(Error::VerifyMismatch {
                    hart: self.state.id,
                    source: VerifyMismatch::ExitPoint {
                        expected,
                        actual: pc,
                    },
                })
            }
            _ => Ok(()),
        };

        if result.is_ok() {
            for (param, &register) in params.iter_mut().zip(&registers) {
                if param.direction.is_output() {
                    match self.read_register(register) {
                        Ok(value) => param.value = value,
                        Err(error) => {
                            result = Err(error);
                            break;
                        }
                    }
                }
            }
        }

        keep_first(&mut result, self.restore_state(&saved));
        result
    }

    fn start_algorithm(
        &mut self,
        entry: u64,
        params: &[RegisterParam],
        registers: &[RegisterId],
        saved: &mut SavedState,
    ) -> Result<(), Error> {
        for (param, &register) in params.iter().zip(registers) {
            if param.direction.is_input() {
                self.write_register_internal(register, param.value)?;
            }
        }

        self.enable_ebreak()?;

        if self.context.config.algorithm.mask_interrupts {
            saved.mstatus = Some(self.mask_interrupts()?);
        }

        tracing::debug!("hart {}: running algorithm at {:#010x}", self.state.id, entry);
        self.resume_alone(ResumeAt::Address(entry), true)
    }

    /// Returns `false` if the algorithm is still running after `timeout`.
    fn wait_for_algorithm(&mut self, timeout: Duration) -> Result<bool, Error> {
        let poll_interval = self.context.config.poll_interval();
        let start = Instant::now();

        loop {
            if self.poll()? == PollOutcome::Halted {
                tracing::debug!(
                    "hart {}: algorithm returned after {:?}",
                    self.state.id,
                    start.elapsed()
                );
                return Ok(true);
            }

            if start.elapsed() >= timeout {
                return Ok(false);
            }

            std::thread::sleep(poll_interval);
        }
    }

    /// Puts the saved state back after a failure, if the hart is still halted.
    fn abandon_algorithm(&mut self, error: Error, saved: &SavedState) -> Error {
        if self.state.status == HartStatus::Halted {
            if let Err(restore_error) = self.restore_state(saved) {
                tracing::warn!(
                    "hart {}: restoring registers failed: {}",
                    self.state.id,
                    restore_error
                );
            }
        }

        error
    }

    fn algorithm_timed_out(&mut self, timeout: Duration, saved: &SavedState) -> Error {
        let hart = self.state.id;
        let halt_timeout = self.context.config.command_timeout();

        if let Err(error) = self.halt_and_wait(halt_timeout) {
            tracing::warn!("hart {}: could not halt the algorithm: {}", hart, error);
        }

        let dump = self.dump_registers();
        tracing::error!("hart {}: algorithm timed out after {:?}", hart, timeout);
        for (name, value) in dump.iter() {
            tracing::error!("  {:>8} = {:#018x}", name, value);
        }

        if self.context.config.algorithm.restore_after_timeout {
            if let Err(error) = self.restore_state(saved) {
                tracing::warn!("hart {}: restoring after timeout failed: {}", hart, error);
            }
        }

        Error::AlgorithmTimeout {
            hart,
            timeout,
            dump,
        }
    }

    fn dump_registers(&mut self) -> RegisterDump {
        let mut dump = RegisterDump::default();

        for name in DUMP_REGISTERS {
            let Some(register) = RegisterId::from_name(name) else {
                continue;
            };

            match self.read_register(register) {
                Ok(value) => dump.values.push((name, value)),
                Err(error) => tracing::debug!("{} not readable: {}", name, error),
            }
        }

        dump
    }

    fn restore_state(&mut self, saved: &SavedState) -> Result<(), Error> {
        if let Some(mstatus) = saved.mstatus {
            self.write_register_internal(MSTATUS, mstatus)?;
        }

        for &(register, value) in &saved.registers {
            self.write_register_internal(register, value)?;
        }
        self.write_pc(saved.pc)?;

        self.flush_registers()
    }

    /// Computes the CRC-32/MPEG-2 checksum of `count` bytes at `address`.
    ///
    /// Large ranges are checksummed by a routine running on the hart when a
    /// working area is configured; everything else is read and checksummed
    /// on the host. The host also takes over when the routine fails, except
    /// on a timeout, which leaves the hart stopped inside the routine and is
    /// reported as [`Error::AlgorithmTimeout`].
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn checksum_memory(&mut self, address: u64, count: u64) -> Result<u32, Error> {
        self.ensure_halted()?;

        if self.checksum_on_target_possible(address, count)? {
            match self.checksum_on_target(address, count) {
                Ok(checksum) => return Ok(checksum),
                Err(error @ Error::AlgorithmTimeout { .. }) => return Err(error),
                Err(error) => {
                    tracing::warn!("checksum routine failed, checksumming on the host: {}", error)
                }
            }
        }

        let data = self.read_memory(address, count as usize)?;

        Ok(CRC32.checksum(&data))
    }

    fn checksum_on_target_possible(&mut self, address: u64, count: u64) -> Result<bool, Error> {
        let Some(area) = self.context.config.algorithm.working_area else {
            return Ok(false);
        };

        let code_size = crc32_routine(self.xlen()?).len() as u64 * 4;

        Ok(area.size >= code_size && !area.overlaps(address, count) && count >= code_size * 4)
    }

    fn checksum_on_target(&mut self, address: u64, count: u64) -> Result<u32, Error> {
        let Some(area) = self.context.config.algorithm.working_area else {
            return Err(Error::Unsupported("checksum without a working area"));
        };

        let code: Vec<u8> = crc32_routine(self.xlen()?)
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect();
        let original = self.read_block(area.address, code.len())?;
        self.write_block(area.address, &code)?;

        let mut params = [
            RegisterParam::in_out("a0", address),
            RegisterParam::input("a1", count),
            RegisterParam::output("t0"),
            RegisterParam::output("t1"),
            RegisterParam::output("t2"),
            RegisterParam::output("t3"),
        ];
        let timeout = self.context.config.algorithm.checksum_timeout(count);

        let mut result = self.run_algorithm(
            area.address,
            Some(area.address + CRC32_EXIT_OFFSET),
            &mut params,
            timeout,
        );
        keep_first(&mut result, self.write_block(area.address, &original));
        result?;

        Ok(params[0].value as u32)
    }
}
