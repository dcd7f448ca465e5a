//! A simulated debug module for tests and dry runs.
//!
//! Each hart interprets the RV32I/RV64I subset the engine's own routines
//! use, plus word loads and stores, straight out of a sparse memory shared
//! by all harts. Triggers implement `mcontrol`, `mcontrol6` and the legacy
//! layout, including chaining, hit bits, the equal/NAPOT/GE/LT match types
//! and WARL readback.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::assembly::{C_EBREAK, EBREAK};
use crate::interface::{AccessWidth, HartDebugOps, MemoryAccessMethod};
use crate::registers::{
    Dcsr, HaltCause, RegisterId, DCSR, DPC, MISA, TDATA1, TDATA2, TDATA3, TINFO, TSELECT,
};
use crate::{Error, HartId};

/// Instructions executed per resume before a hart is considered to run on forever.
const RUN_BUDGET: usize = 1_000_000;

/// `misa` of an RV32IMAC hart with supervisor and user mode.
pub const MISA_RV32IMACSU: u64 = 0x4014_1105;
/// `misa` of an RV64IMAC hart with supervisor and user mode.
pub const MISA_RV64IMACSU: u64 = 0x8000_0000_0014_1105;

/// `jal x0, 0`, jumps to itself.
pub const SPIN: u32 = 0x0000_006f;
/// `addi x0, x0, 0`.
pub const NOP: u32 = 0x0000_0013;

/// A debug module operation, as recorded in [`MockDebugModule::log`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MockOperation {
    HaltPrep,
    HaltGo,
    ResumePrep,
    ResumeGo,
    Step,
}

/// One trigger slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTrigger {
    pub tdata1: u64,
    pub tdata2: u64,
    /// Supported types as a `tinfo` bit mask.
    pub supported: u64,
    /// `tdata1` bits below `dmode` which keep what is written.
    pub writable: u64,
    /// Accepted `match` values of `mcontrol` and `mcontrol6` as a bit mask.
    /// Writes selecting any other are dropped.
    pub match_types: u64,
}

impl MockTrigger {
    /// A slot of type `kind` accepting any configuration.
    pub fn new(kind: u64, xlen: u32) -> Self {
        Self {
            tdata1: kind << (xlen - 4),
            tdata2: 0,
            supported: 1 << kind,
            writable: (1 << (xlen - 5)) - 1,
            // equal, napot, ge, lt
            match_types: 0b1111,
        }
    }

    fn kind(&self, xlen: u32) -> u64 {
        (self.tdata1 >> (xlen - 4)) & 0xf
    }

    fn primary_kind(&self) -> u64 {
        (0..16).find(|kind| self.supported & (1 << kind) != 0).unwrap_or(0)
    }

    fn write_tdata1(&mut self, value: u64, xlen: u32) {
        let kind = (value >> (xlen - 4)) & 0xf;

        if kind == 0 {
            self.tdata1 = self.primary_kind() << (xlen - 4);
            return;
        }

        if self.supported & (1 << kind) == 0 {
            return;
        }

        let match_type = (value >> 7) & 0xf;
        if matches!(kind, 2 | 6) && self.match_types & (1 << match_type) == 0 {
            return;
        }

        let type_and_dmode = 0x1f << (xlen - 5);
        self.tdata1 = value & (self.writable | type_and_dmode);
    }

    fn chain(&self, xlen: u32) -> bool {
        matches!(self.kind(xlen), 2 | 6) && self.tdata1 & (1 << 11) != 0
    }

    fn hit_bit(&self, xlen: u32) -> Option<u64> {
        match self.kind(xlen) {
            2 => Some(1 << 20),
            6 => Some(1 << 22),
            _ => None,
        }
    }

    fn matches(&self, xlen: u32, access: Access, address: u64, value: Option<u64>) -> bool {
        let (execute, store, load, select) = match self.kind(xlen) {
            1 => (1 << 0, 1 << 1, 1 << 2, None),
            2 => (1 << 2, 1 << 1, 1 << 0, Some(1 << 19)),
            6 => (1 << 2, 1 << 1, 1 << 0, Some(1 << 21)),
            _ => return false,
        };

        let enable = match access {
            Access::Execute => execute,
            Access::Store => store,
            Access::Load => load,
        };
        if self.tdata1 & enable == 0 {
            return false;
        }

        let compared = match select {
            Some(select) if self.tdata1 & select != 0 => match value {
                Some(value) => value,
                None => return false,
            },
            _ => address,
        };

        if select.is_none() {
            return compared == self.tdata2;
        }

        match (self.tdata1 >> 7) & 0xf {
            0 => compared == self.tdata2,
            1 => {
                let size = 1u64
                    .checked_shl(self.tdata2.trailing_ones() + 1)
                    .unwrap_or(0);
                let base = !size.wrapping_sub(1);
                compared & base == self.tdata2 & base
            }
            2 => compared >= self.tdata2,
            3 => compared < self.tdata2,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Access {
    Execute,
    Load,
    Store,
}

/// Why execution stopped.
enum Stop {
    Halt(HaltCause),
    Spin,
}

/// A simulated hart.
#[derive(Debug, Clone)]
pub struct MockHart {
    pub xlen: u32,
    pub halted: bool,
    pub in_reset: bool,
    /// Time from an issued halt request until the hart reports halted.
    /// `Duration::MAX` makes the hart ignore halt requests.
    pub halt_latency: Duration,
    /// Halt right out of reset.
    pub halt_after_reset: bool,
    pub reset_vector: u64,
    /// Registers by abstract register number. `dpc` is the program counter.
    pub registers: HashMap<u16, u64>,
    pub triggers: Vec<MockTrigger>,
    /// Whether `tinfo` is implemented.
    pub tinfo: bool,
    /// Instructions executed by single steps.
    pub steps: usize,
    /// Instructions a resume executes before the hart is left running.
    pub run_budget: usize,
    tselect: usize,
    halt_requested_at: Option<Instant>,
}

impl MockHart {
    /// A halted hart with four `mcontrol` triggers.
    pub fn new(xlen: u32) -> Self {
        let misa = if xlen == 32 {
            MISA_RV32IMACSU
        } else {
            MISA_RV64IMACSU
        };

        let mut hart = Self {
            xlen,
            halted: true,
            in_reset: false,
            halt_latency: Duration::ZERO,
            halt_after_reset: false,
            reset_vector: 0,
            registers: HashMap::from([(MISA.0, misa)]),
            triggers: (0..4).map(|_| MockTrigger::new(2, xlen)).collect(),
            tinfo: true,
            steps: 0,
            run_budget: RUN_BUDGET,
            tselect: 0,
            halt_requested_at: None,
        };
        hart.enter_debug(HaltCause::HaltRequest);
        hart
    }

    pub fn pc(&self) -> u64 {
        self.register(DPC)
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.set_register(DPC, pc);
    }

    pub fn register(&self, register: RegisterId) -> u64 {
        self.registers.get(&register.0).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, register: RegisterId, value: u64) {
        if register == RegisterId::gpr(0) {
            return;
        }

        self.registers.insert(register.0, value & self.mask());
    }

    /// Lets the hart enter debug mode on its own, as if `cause` happened.
    pub fn enter_debug(&mut self, cause: HaltCause) {
        self.halted = true;
        self.halt_requested_at = None;

        let mut dcsr = Dcsr(self.register(DCSR));
        dcsr.set_cause(cause as u8);
        dcsr.set_prv(3);
        self.registers.insert(DCSR.0, dcsr.0);
    }

    fn mask(&self) -> u64 {
        if self.xlen == 32 {
            0xffff_ffff
        } else {
            u64::MAX
        }
    }

    fn signed(&self, value: u64) -> i64 {
        if self.xlen == 32 {
            value as u32 as i32 as i64
        } else {
            value as i64
        }
    }

    fn x(&self, index: u32) -> u64 {
        self.register(RegisterId::gpr(index as u8))
    }

    fn set_x(&mut self, index: u32, value: u64) {
        self.set_register(RegisterId::gpr(index as u8), value);
    }

    /// Checks all triggers against an access, setting the hit bits of a
    /// matching trigger or chain.
    fn trigger_fires(&mut self, access: Access, address: u64, value: Option<u64>) -> bool {
        let xlen = self.xlen;
        let mut index = 0;

        while index < self.triggers.len() {
            let first = index;
            let mut all_match = true;

            loop {
                all_match &= self.triggers[index].matches(xlen, access, address, value);
                if !self.triggers[index].chain(xlen) || index + 1 >= self.triggers.len() {
                    break;
                }
                index += 1;
            }

            if all_match {
                for trigger in &mut self.triggers[first..=index] {
                    if let Some(hit) = trigger.hit_bit(xlen) {
                        trigger.tdata1 |= hit;
                    }
                }
                return true;
            }

            index += 1;
        }

        false
    }

    /// Executes the instruction at the program counter.
    fn execute_one(&mut self, memory: &mut MockMemory) -> Option<Stop> {
        let pc = self.pc();

        if self.trigger_fires(Access::Execute, pc, None) {
            return Some(Stop::Halt(HaltCause::Trigger));
        }

        if memory.read_u16(pc) == C_EBREAK {
            return Some(Stop::Halt(HaltCause::Ebreak));
        }

        let instruction = memory.read_u32(pc);
        if instruction == EBREAK {
            return Some(Stop::Halt(HaltCause::Ebreak));
        }

        let opcode = instruction & 0x7f;
        let rd = (instruction >> 7) & 0x1f;
        let funct3 = (instruction >> 12) & 0x7;
        let rs1 = (instruction >> 15) & 0x1f;
        let rs2 = (instruction >> 20) & 0x1f;
        let i_immediate = ((instruction as i32) >> 20) as i64;

        let mut next = pc.wrapping_add(4);

        match (opcode, funct3) {
            // addi
            (0x13, 0) => self.set_x(rd, self.x(rs1).wrapping_add(i_immediate as u64)),
            // slli
            (0x13, 1) => self.set_x(rd, self.x(rs1) << (rs2 & (self.xlen - 1))),
            // slliw
            (0x1b, 1) if self.xlen == 64 => {
                self.set_x(rd, ((self.x(rs1) as u32) << rs2) as i32 as i64 as u64)
            }
            // xor
            (0x33, 4) => self.set_x(rd, self.x(rs1) ^ self.x(rs2)),
            // lbu, lw
            (0x03, 4 | 2) => {
                let address = self.x(rs1).wrapping_add(i_immediate as u64) & self.mask();
                if self.trigger_fires(Access::Load, address, None) {
                    return Some(Stop::Halt(HaltCause::Trigger));
                }
                let value = match funct3 {
                    4 => memory.read_u8(address) as u64,
                    _ => memory.read_u32(address) as i32 as i64 as u64,
                };
                self.set_x(rd, value);
            }
            // sb, sw
            (0x23, 0 | 2) => {
                let immediate = (((instruction as i32) >> 25) << 5) as i64 | rd as i64;
                let address = self.x(rs1).wrapping_add(immediate as u64) & self.mask();
                let size = if funct3 == 0 { 1 } else { 4 };
                let value = self.x(rs2) & ((1u64 << (size * 8)) - 1);

                if self.trigger_fires(Access::Store, address, Some(value)) {
                    return Some(Stop::Halt(HaltCause::Trigger));
                }
                memory.write(address, &value.to_le_bytes()[..size]);
            }
            // lui
            (0x37, _) => self.set_x(rd, (instruction & 0xffff_f000) as i32 as i64 as u64),
            // beq, bne, bge
            (0x63, 0 | 1 | 5) => {
                let offset = (((instruction as i32) >> 31) << 12) as i64
                    | (((instruction >> 7) & 1) << 11) as i64
                    | (((instruction >> 25) & 0x3f) << 5) as i64
                    | (((instruction >> 8) & 0xf) << 1) as i64;

                let (a, b) = (self.x(rs1), self.x(rs2));
                let taken = match funct3 {
                    0 => a == b,
                    1 => a != b,
                    _ => self.signed(a) >= self.signed(b),
                };
                if taken {
                    next = pc.wrapping_add(offset as u64);
                }
            }
            // jal
            (0x6f, _) => {
                let offset = (((instruction as i32) >> 31) << 20) as i64
                    | (((instruction >> 12) & 0xff) << 12) as i64
                    | (((instruction >> 20) & 1) << 11) as i64
                    | (((instruction >> 21) & 0x3ff) << 1) as i64;

                if offset == 0 {
                    return Some(Stop::Spin);
                }
                self.set_x(rd, next);
                next = pc.wrapping_add(offset as u64);
            }
            // Anything else would trap, which is never taken in these tests.
            _ => return Some(Stop::Spin),
        }

        self.set_pc(next & self.mask());
        None
    }

    /// Runs until the hart halts or is found spinning.
    fn run(&mut self, memory: &mut MockMemory) {
        self.halted = false;

        for _ in 0..self.run_budget {
            match self.execute_one(memory) {
                None => {}
                Some(Stop::Halt(cause)) => {
                    self.enter_debug(cause);
                    return;
                }
                Some(Stop::Spin) => return,
            }
        }
    }

    fn step(&mut self, memory: &mut MockMemory) {
        self.steps += 1;

        match self.execute_one(memory) {
            Some(Stop::Halt(cause)) => self.enter_debug(cause),
            _ => self.enter_debug(HaltCause::Step),
        }
    }

    fn reset(&mut self) {
        let xlen = self.xlen;
        for trigger in &mut self.triggers {
            trigger.write_tdata1(0, xlen);
            trigger.tdata2 = 0;
        }
        self.tselect = 0;
        self.registers.remove(&DCSR.0);
        self.set_pc(self.reset_vector);
    }
}

/// Byte addressed memory where unwritten bytes read as zero.
#[derive(Debug, Clone, Default)]
pub struct MockMemory {
    bytes: HashMap<u64, u8>,
}

impl MockMemory {
    pub fn read(&self, address: u64, length: usize) -> Vec<u8> {
        (0..length as u64)
            .map(|offset| self.read_u8(address + offset))
            .collect()
    }

    pub fn write(&mut self, address: u64, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.bytes.insert(address + offset as u64, *byte);
        }
    }

    pub fn read_u8(&self, address: u64) -> u8 {
        self.bytes.get(&address).copied().unwrap_or(0)
    }

    pub fn read_u16(&self, address: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(address), self.read_u8(address + 1)])
    }

    pub fn read_u32(&self, address: u64) -> u32 {
        u32::from_le_bytes([
            self.read_u8(address),
            self.read_u8(address + 1),
            self.read_u8(address + 2),
            self.read_u8(address + 3),
        ])
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    /// Writes consecutive instruction words starting at `address`.
    pub fn write_program(&mut self, address: u64, program: &[u32]) {
        for (index, word) in program.iter().enumerate() {
            self.write_u32(address + index as u64 * 4, *word);
        }
    }
}

/// A debug module with a number of simulated harts behind it.
#[derive(Debug)]
pub struct MockDebugModule {
    pub harts: Vec<MockHart>,
    pub memory: MockMemory,
    /// Access methods which work. The others report [`Error::Unsupported`].
    pub methods: Vec<MemoryAccessMethod>,
    /// Access widths which work.
    pub widths: Vec<AccessWidth>,
    /// Data handed to [`HartDebugOps::write_flash`], with its flash offset.
    pub flash_writes: Vec<(u64, Vec<u8>)>,
    /// Run-control operations in the order they were issued.
    pub log: Vec<(Instant, HartId, MockOperation)>,
    /// Every successful memory access: method, address and width.
    pub accesses: Vec<(MemoryAccessMethod, u64, AccessWidth)>,
}

impl MockDebugModule {
    /// `count` halted harts of the given register width.
    pub fn new(count: usize, xlen: u32) -> Self {
        Self {
            harts: (0..count).map(|_| MockHart::new(xlen)).collect(),
            memory: MockMemory::default(),
            methods: vec![
                MemoryAccessMethod::ProgramBuffer,
                MemoryAccessMethod::SystemBus,
                MemoryAccessMethod::AbstractCommand,
            ],
            widths: AccessWidth::ALL.to_vec(),
            flash_writes: Vec::new(),
            log: Vec::new(),
            accesses: Vec::new(),
        }
    }

    /// The recorded operations of one kind, in order.
    pub fn operations(&self, operation: MockOperation) -> Vec<(Instant, HartId)> {
        self.log
            .iter()
            .filter(|(_, _, logged)| *logged == operation)
            .map(|(time, hart, _)| (*time, *hart))
            .collect()
    }

    fn hart(&mut self, hart: HartId) -> Result<&mut MockHart, Error> {
        self.harts.get_mut(hart).ok_or(Error::HartNotFound(hart))
    }

    fn halted_hart(&mut self, hart: HartId) -> Result<&mut MockHart, Error> {
        let state = self.hart(hart)?;
        if !state.halted {
            return Err(Error::NotHalted(hart));
        }
        Ok(state)
    }

    fn record(&mut self, hart: HartId, operation: MockOperation) {
        self.log.push((Instant::now(), hart, operation));
    }

    fn check_access(
        &mut self,
        hart: HartId,
        method: MemoryAccessMethod,
        address: u64,
        width: AccessWidth,
    ) -> Result<(), Error> {
        if !self.methods.contains(&method) {
            return Err(Error::Unsupported("memory access method"));
        }
        if !self.widths.contains(&width) {
            return Err(Error::Unsupported("access width"));
        }
        if method == MemoryAccessMethod::ProgramBuffer {
            self.halted_hart(hart)?;
        }
        if address % width.bytes() as u64 != 0 {
            return Err(Error::Unaligned {
                address,
                size: width.bytes(),
            });
        }

        self.accesses.push((method, address, width));
        Ok(())
    }
}

impl HartDebugOps for MockDebugModule {
    fn hart_count(&self) -> usize {
        self.harts.len()
    }

    fn xlen(&mut self, hart: HartId) -> Result<u32, Error> {
        Ok(self.hart(hart)?.xlen)
    }

    fn is_halted(&mut self, hart: HartId) -> Result<bool, Error> {
        let state = self.hart(hart)?;

        if let Some(requested) = state.halt_requested_at {
            if !state.halted && requested.elapsed() >= state.halt_latency {
                state.enter_debug(HaltCause::HaltRequest);
            }
        }

        Ok(state.halted)
    }

    fn halt_reason(&mut self, hart: HartId) -> Result<HaltCause, Error> {
        let state = self.halted_hart(hart)?;

        Dcsr(state.register(DCSR))
            .halt_cause()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("reserved dcsr.cause")))
    }

    fn halt_prep(&mut self, hart: HartId) -> Result<(), Error> {
        self.hart(hart)?;
        self.record(hart, MockOperation::HaltPrep);
        Ok(())
    }

    fn halt_go(&mut self, hart: HartId) -> Result<(), Error> {
        let state = self.hart(hart)?;
        if !state.halted && !state.in_reset {
            state.halt_requested_at = Some(Instant::now());
        }
        self.record(hart, MockOperation::HaltGo);
        Ok(())
    }

    fn resume_prep(&mut self, hart: HartId) -> Result<(), Error> {
        self.halted_hart(hart)?;
        self.record(hart, MockOperation::ResumePrep);
        Ok(())
    }

    fn resume_go(&mut self, hart: HartId) -> Result<(), Error> {
        let state = self.harts.get_mut(hart).ok_or(Error::HartNotFound(hart))?;
        if !state.halted {
            return Err(Error::NotHalted(hart));
        }

        state.run(&mut self.memory);
        self.record(hart, MockOperation::ResumeGo);
        Ok(())
    }

    fn step(&mut self, hart: HartId) -> Result<(), Error> {
        let state = self.harts.get_mut(hart).ok_or(Error::HartNotFound(hart))?;
        if !state.halted {
            return Err(Error::NotHalted(hart));
        }

        state.step(&mut self.memory);
        self.record(hart, MockOperation::Step);
        Ok(())
    }

    fn read_register(&mut self, hart: HartId, register: RegisterId) -> Result<u64, Error> {
        let state = self.halted_hart(hart)?;
        let xlen = state.xlen;

        let value = match register {
            TSELECT => state.tselect as u64,
            TDATA1 => state
                .triggers
                .get(state.tselect)
                .map_or(0, |trigger| trigger.tdata1),
            TDATA2 => state
                .triggers
                .get(state.tselect)
                .map_or(0, |trigger| trigger.tdata2),
            TDATA3 => 0,
            TINFO if state.tinfo => state
                .triggers
                .get(state.tselect)
                .map_or(1, |trigger| trigger.supported),
            TINFO => return Err(Error::Unsupported("tinfo")),
            _ => state.register(register),
        };

        Ok(value & if xlen == 32 { 0xffff_ffff } else { u64::MAX })
    }

    fn write_register(
        &mut self,
        hart: HartId,
        register: RegisterId,
        value: u64,
    ) -> Result<(), Error> {
        let state = self.halted_hart(hart)?;
        let xlen = state.xlen;
        let selected = state.tselect;

        match register {
            // Out of range selections are dropped, which is how the slot count is found.
            TSELECT => {
                if (value as usize) < state.triggers.len() {
                    state.tselect = value as usize;
                }
            }
            TDATA1 => {
                if let Some(trigger) = state.triggers.get_mut(selected) {
                    trigger.write_tdata1(value, xlen);
                }
            }
            TDATA2 => {
                if let Some(trigger) = state.triggers.get_mut(selected) {
                    trigger.tdata2 = value;
                }
            }
            TDATA3 | TINFO | MISA => {}
            _ => state.set_register(register, value),
        }

        Ok(())
    }

    fn read_memory(
        &mut self,
        hart: HartId,
        method: MemoryAccessMethod,
        address: u64,
        width: AccessWidth,
        count: usize,
    ) -> Result<Vec<u8>, Error> {
        self.check_access(hart, method, address, width)?;
        Ok(self.memory.read(address, count * width.bytes()))
    }

    fn write_memory(
        &mut self,
        hart: HartId,
        method: MemoryAccessMethod,
        address: u64,
        width: AccessWidth,
        data: &[u8],
    ) -> Result<(), Error> {
        self.check_access(hart, method, address, width)?;
        if data.len() % width.bytes() != 0 {
            return Err(Error::InvalidAccessSize(data.len()));
        }

        self.memory.write(address, data);
        Ok(())
    }

    fn write_flash(&mut self, hart: HartId, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.hart(hart)?;
        self.flash_writes.push((offset, data.to_vec()));
        Ok(())
    }

    fn assert_reset(&mut self, hart: HartId) -> Result<(), Error> {
        let state = self.hart(hart)?;
        state.in_reset = true;
        state.halted = false;
        state.halt_requested_at = None;
        Ok(())
    }

    fn deassert_reset(&mut self, hart: HartId) -> Result<(), Error> {
        let state = self.hart(hart)?;
        state.in_reset = false;
        state.reset();

        if state.halt_after_reset {
            state.enter_debug(HaltCause::ResetHaltRequest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn interpreter_runs_to_ebreak() {
        let mut memory = MockMemory::default();
        // addi a0, a0, 1; ebreak
        memory.write_program(0x100, &[0x0015_0513, EBREAK]);

        let mut hart = MockHart::new(32);
        hart.set_pc(0x100);
        hart.set_x(10, 41);
        hart.run(&mut memory);

        assert!(hart.halted);
        assert_eq!(hart.pc(), 0x104);
        assert_eq!(hart.x(10), 42);
        assert_eq!(
            Dcsr(hart.register(DCSR)).halt_cause(),
            Some(HaltCause::Ebreak)
        );
    }

    #[test]
    fn spinning_hart_keeps_running() {
        let mut memory = MockMemory::default();
        memory.write_program(0x200, &[NOP, SPIN]);

        let mut hart = MockHart::new(32);
        hart.set_pc(0x200);
        hart.run(&mut memory);

        assert!(!hart.halted);
        assert_eq!(hart.pc(), 0x204);
    }

    #[test]
    fn napot_and_range_matches() {
        let mut trigger = MockTrigger::new(2, 32);
        // store, match napot over 0x2000..0x2008
        trigger.tdata1 = 2 << 28 | 1 << 7 | 0b010;
        trigger.tdata2 = 0x2003;

        assert!(trigger.matches(32, Access::Store, 0x2000, Some(0)));
        assert!(trigger.matches(32, Access::Store, 0x2007, Some(0)));
        assert!(!trigger.matches(32, Access::Store, 0x2008, Some(0)));
        assert!(!trigger.matches(32, Access::Load, 0x2000, None));

        // match lt
        trigger.tdata1 = 2 << 28 | 3 << 7 | 0b010;
        assert!(trigger.matches(32, Access::Store, 0x2002, Some(0)));
        assert!(!trigger.matches(32, Access::Store, 0x2003, Some(0)));
    }

    #[test]
    fn unsupported_match_type_is_dropped() {
        let mut trigger = MockTrigger::new(2, 32);
        trigger.match_types = 0b0001;
        let before = trigger.tdata1;

        trigger.write_tdata1(2 << 28 | 1 << 7 | 0b010, 32);
        assert_eq!(trigger.tdata1, before);

        trigger.write_tdata1(2 << 28 | 0b010, 32);
        assert_eq!(trigger.tdata1, 2 << 28 | 0b010);
    }

    #[test]
    fn slliw_sign_extends() {
        let mut memory = MockMemory::default();
        // slliw t0, t0, 1; ebreak
        memory.write_program(0x100, &[0x0012_929b, EBREAK]);

        let mut hart = MockHart::new(64);
        hart.set_pc(0x100);
        hart.set_x(5, 0x4000_0001);
        hart.run(&mut memory);

        assert_eq!(hart.x(5), 0xffff_ffff_8000_0002);
    }

    #[test]
    fn unsupported_tdata1_type_is_dropped() {
        let mut trigger = MockTrigger::new(2, 32);
        let before = trigger.tdata1;

        trigger.write_tdata1(6 << 28 | 0x4, 32);

        assert_eq!(trigger.tdata1, before);
    }

    #[test]
    fn store_trigger_halts_before_the_store() {
        let mut memory = MockMemory::default();
        // sw a1, 0(a0)
        memory.write_program(0x100, &[0x00b5_2023, SPIN]);

        let mut hart = MockHart::new(32);
        hart.triggers[0].tdata1 = 2 << 28 | 1 << 27 | 0x1042;
        hart.triggers[0].tdata2 = 0x2000;
        hart.set_pc(0x100);
        hart.set_x(10, 0x2000);
        hart.set_x(11, 0xdead);
        hart.run(&mut memory);

        assert!(hart.halted);
        assert_eq!(hart.pc(), 0x100);
        assert_eq!(memory.read_u32(0x2000), 0);
        assert_ne!(hart.triggers[0].tdata1 & 1 << 20, 0);
    }
}
