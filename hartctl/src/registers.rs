//! RISC-V register numbering and the debug-relevant CSR layouts.
//!
//! Registers are addressed by their abstract command register number:
//! CSRs live at `0x0000..=0x0fff`, the integer registers at `0x1000..=0x101f`.

use std::fmt;

use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

/// The abstract command number of a hart register.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(pub u16);

impl RegisterId {
    /// The id of general purpose register `x{index}`.
    pub const fn gpr(index: u8) -> Self {
        RegisterId(0x1000 + index as u16)
    }

    /// The id of the CSR at `address`.
    pub const fn csr(address: u16) -> Self {
        RegisterId(address)
    }

    /// Returns the index of the general purpose register, if this is one.
    pub fn gpr_index(self) -> Option<u8> {
        (0x1000..=0x101f)
            .contains(&self.0)
            .then(|| (self.0 - 0x1000) as u8)
    }

    /// Returns `true` for `x0` through `x31`.
    pub fn is_gpr(self) -> bool {
        self.gpr_index().is_some()
    }

    /// Returns `true` for the registers which select or configure triggers.
    pub fn is_trigger_register(self) -> bool {
        matches!(self, TSELECT | TDATA1 | TDATA2 | TDATA3)
    }

    /// Whether the value of this register may be kept in the shadow cache.
    ///
    /// For a `write`, only registers which read back exactly what was written
    /// qualify. WARL CSRs may be cached once read from the hart, but a written
    /// value must be read back before it can be trusted.
    pub fn is_cacheable(self, write: bool) -> bool {
        if self.is_gpr() || self == DPC {
            return true;
        }

        if write {
            return false;
        }

        matches!(self, MISA | DCSR | MSTATUS | MEPC | MCAUSE | SATP)
    }

    /// Looks up a register by its architectural or ABI name.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(index) = name.strip_prefix('x').and_then(|n| n.parse::<u8>().ok()) {
            return (index < 32).then(|| Self::gpr(index));
        }

        if let Some(index) = GPR_ABI_NAMES.iter().position(|abi| *abi == name) {
            return Some(Self::gpr(index as u8));
        }

        match name {
            "fp" => Some(S0),
            "pc" => Some(PC),
            _ => CSR_NAMES
                .iter()
                .find(|(csr_name, _)| *csr_name == name)
                .map(|(_, id)| *id),
        }
    }

    /// The ABI name of a general purpose register, or the name of a known CSR.
    pub fn name(self) -> Option<&'static str> {
        if let Some(index) = self.gpr_index() {
            return Some(GPR_ABI_NAMES[index as usize]);
        }

        CSR_NAMES
            .iter()
            .find(|(_, id)| *id == self)
            .map(|(name, _)| *name)
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "csr {:#05x}", self.0),
        }
    }
}

static GPR_ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

static CSR_NAMES: &[(&str, RegisterId)] = &[
    ("satp", SATP),
    ("mstatus", MSTATUS),
    ("misa", MISA),
    ("mepc", MEPC),
    ("mcause", MCAUSE),
    ("tselect", TSELECT),
    ("tdata1", TDATA1),
    ("tdata2", TDATA2),
    ("tdata3", TDATA3),
    ("tinfo", TINFO),
    ("dcsr", DCSR),
    ("dpc", DPC),
];

/// The zero register.
pub const ZERO: RegisterId = RegisterId::gpr(0);
/// Return address.
pub const RA: RegisterId = RegisterId::gpr(1);
/// Stack pointer.
pub const SP: RegisterId = RegisterId::gpr(2);
/// Frame pointer, also known as `s0`.
pub const S0: RegisterId = RegisterId::gpr(8);
/// First argument and return value register.
pub const A0: RegisterId = RegisterId::gpr(10);
/// Second argument register.
pub const A1: RegisterId = RegisterId::gpr(11);

/// Supervisor address translation and protection.
pub const SATP: RegisterId = RegisterId::csr(0x180);
/// Machine status.
pub const MSTATUS: RegisterId = RegisterId::csr(0x300);
/// Machine ISA, lists the implemented extensions.
pub const MISA: RegisterId = RegisterId::csr(0x301);
/// Machine exception program counter.
pub const MEPC: RegisterId = RegisterId::csr(0x341);
/// Machine trap cause.
pub const MCAUSE: RegisterId = RegisterId::csr(0x342);
/// Trigger select.
pub const TSELECT: RegisterId = RegisterId::csr(0x7a0);
/// First trigger data register, holds the trigger configuration.
pub const TDATA1: RegisterId = RegisterId::csr(0x7a1);
/// Second trigger data register, holds the compare value.
pub const TDATA2: RegisterId = RegisterId::csr(0x7a2);
/// Third trigger data register.
pub const TDATA3: RegisterId = RegisterId::csr(0x7a3);
/// Trigger info, lists the trigger types the selected slot supports.
pub const TINFO: RegisterId = RegisterId::csr(0x7a4);
/// Debug control and status.
pub const DCSR: RegisterId = RegisterId::csr(0x7b0);
/// Debug program counter.
pub const DPC: RegisterId = RegisterId::csr(0x7b1);
/// While halted, the program counter of the hart is `dpc`.
pub const PC: RegisterId = DPC;

/// Privilege level encoding used by `dcsr.prv` and `mstatus.mpp`.
pub const PRIV_MACHINE: u64 = 3;

bitfield! {
    /// Debug control and status register.
    #[derive(Copy, Clone)]
    pub struct Dcsr(u64);
    impl Debug;

    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub u8, cause, set_cause: 8, 6;
    pub step, set_step: 2;
    pub u8, prv, set_prv: 1, 0;
}

impl Dcsr {
    /// The decoded `cause` field, `None` for reserved values.
    pub fn halt_cause(&self) -> Option<HaltCause> {
        HaltCause::from_u8(self.cause())
    }
}

/// The `dcsr.cause` values, telling why the hart entered debug mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum HaltCause {
    /// An `ebreak` instruction was executed.
    Ebreak = 1,
    /// A trigger with the debug mode action fired.
    Trigger = 2,
    /// The debugger requested a halt.
    HaltRequest = 3,
    /// A single step completed.
    Step = 4,
    /// The hart was held in debug mode out of reset.
    ResetHaltRequest = 5,
    /// Another hart of the halt group halted.
    Group = 6,
}

bitfield! {
    /// Machine status register, the fields the engine touches.
    #[derive(Copy, Clone)]
    pub struct Mstatus(u64);
    impl Debug;

    pub mprv, set_mprv: 17;
    pub u8, mpp, set_mpp: 12, 11;
    pub mie, set_mie: 3;
    pub hie, set_hie: 2;
    pub sie, set_sie: 1;
    pub uie, set_uie: 0;
}

impl Mstatus {
    /// Returns the register with every interrupt enable cleared.
    pub fn interrupts_masked(self) -> Self {
        let mut masked = self;
        masked.set_mie(false);
        masked.set_hie(false);
        masked.set_sie(false);
        masked.set_uie(false);
        masked
    }
}

/// The extensions in `misa` which matter for trigger privilege filters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Misa(pub u64);

impl Misa {
    /// Whether the extension with the given letter is implemented.
    pub fn has_extension(self, letter: char) -> bool {
        let bit = (letter.to_ascii_uppercase() as u8).wrapping_sub(b'A');
        bit < 26 && self.0 & (1 << bit) != 0
    }
}
