//! Encoders for the handful of RV32I/RV64I instructions the engine emits.

#![allow(clippy::unusual_byte_groupings)]

/// RISCV breakpoint instruction
pub const EBREAK: u32 = 0b000000000001_00000_000_00000_1110011;

/// Compressed breakpoint instruction
pub const C_EBREAK: u16 = 0b100_1_00000_00000_10;

const OP_IMM: u8 = 0b001_0011;
const OP_IMM_32: u8 = 0b001_1011;
const OP: u8 = 0b011_0011;
const LOAD: u8 = 0b000_0011;
const BRANCH: u32 = 0b110_0011;

/// Assemble an `addi` instruction.
pub fn addi(destination: u8, source: u8, immediate: i16) -> u32 {
    i_type_instruction(OP_IMM, source, 0b000, destination, immediate)
}

/// Assemble a `slli` instruction.
pub fn slli(destination: u8, source: u8, shift: u8) -> u32 {
    assert!(shift < 32);

    i_type_instruction(OP_IMM, source, 0b001, destination, shift as i16)
}

/// Assemble a `slliw` instruction (RV64 only).
pub fn slliw(destination: u8, source: u8, shift: u8) -> u32 {
    assert!(shift < 32);

    i_type_instruction(OP_IMM_32, source, 0b001, destination, shift as i16)
}

/// Assemble a `lbu` instruction.
pub fn lbu(destination: u8, base: u8, offset: i16) -> u32 {
    i_type_instruction(LOAD, base, 0b100, destination, offset)
}

/// Assemble a `xor` instruction.
pub fn xor(destination: u8, rs1: u8, rs2: u8) -> u32 {
    r_type_instruction(OP, 0, rs2, rs1, 0b100, destination)
}

/// Assemble a `lui` instruction. `upper` is the 20 bit immediate.
pub fn lui(destination: u8, upper: u32) -> u32 {
    assert!(destination <= 0x1f);
    assert!(upper <= 0xfffff);

    upper << 12 | (destination as u32) << 7 | 0b011_0111
}

/// Assemble a `beq` instruction, `offset` is relative to this instruction.
pub fn beq(rs1: u8, rs2: u8, offset: i16) -> u32 {
    b_type_instruction(0b000, rs1, rs2, offset)
}

/// Assemble a `bne` instruction.
pub fn bne(rs1: u8, rs2: u8, offset: i16) -> u32 {
    b_type_instruction(0b001, rs1, rs2, offset)
}

/// Assemble a `bge` instruction.
pub fn bge(rs1: u8, rs2: u8, offset: i16) -> u32 {
    b_type_instruction(0b101, rs1, rs2, offset)
}

/// Assemble a `jal` instruction.
pub fn jal(destination: u8, offset: i32) -> u32 {
    assert!(destination <= 0x1f);
    assert!(offset % 2 == 0 && (-(1 << 20)..(1 << 20)).contains(&offset));

    let imm = offset as u32;

    (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xff) << 12
        | (destination as u32) << 7
        | 0b110_1111
}

const T0: u8 = 5;
const T1: u8 = 6;
const T2: u8 = 7;
const T3: u8 = 28;
const A0: u8 = 10;
const A1: u8 = 11;

/// Offset of the final `ebreak` in [`crc32_routine`].
pub const CRC32_EXIT_OFFSET: u64 = 76;

/// A CRC-32/MPEG-2 routine for a hart with the given register width.
///
/// Takes the buffer address in `a0` and its length in `a1`, returns the
/// checksum in the low 32 bits of `a0` and stops on an `ebreak`. Clobbers
/// `t0` to `t3`.
///
/// The CRC is kept sign extended, so on RV64 the shifts are `slliw` and
/// bit 31 can be tested with `bge` either way.
pub fn crc32_routine(xlen: u32) -> Vec<u32> {
    let shift = if xlen == 32 { slli } else { slliw };

    vec![
        addi(T0, 0, -1),
        // Polynomial 0x04c11db7, lui rounds for the negative low part.
        lui(T1, 0x04c12),
        addi(T1, T1, -585),
        // next_byte:
        beq(A1, 0, 60),
        lbu(T2, A0, 0),
        shift(T2, T2, 24),
        xor(T0, T0, T2),
        addi(T3, 0, 8),
        // next_bit:
        bge(T0, 0, 16),
        shift(T0, T0, 1),
        xor(T0, T0, T1),
        jal(0, 8),
        shift(T0, T0, 1),
        addi(T3, T3, -1),
        bne(T3, 0, -24),
        addi(A0, A0, 1),
        addi(A1, A1, -1),
        jal(0, -56),
        // done:
        addi(A0, T0, 0),
        EBREAK,
    ]
}

/// Assemble an I-type instruction, as specified in the RISCV ISA
///
/// This function panics if any of the values would have to be truncated.
fn i_type_instruction(opcode: u8, rs1: u8, funct3: u8, rd: u8, imm: i16) -> u32 {
    assert!(opcode <= 0x7f); // [06:00]
    assert!(rd <= 0x1f); // [11:07]
    assert!(funct3 <= 0x7); // [14:12]
    assert!(rs1 <= 0x1f); // [19:15]
    assert!((-2048..2048).contains(&imm)); // [31:20]

    ((imm as u32) & 0xfff) << 20
        | (rs1 as u32) << 15
        | (funct3 as u32) << 12
        | (rd as u32) << 7
        | opcode as u32
}

fn r_type_instruction(opcode: u8, funct7: u8, rs2: u8, rs1: u8, funct3: u8, rd: u8) -> u32 {
    assert!(funct7 <= 0x7f);
    assert!(rs2 <= 0x1f && rs1 <= 0x1f && rd <= 0x1f);
    assert!(funct3 <= 0x7);

    (funct7 as u32) << 25
        | (rs2 as u32) << 20
        | (rs1 as u32) << 15
        | (funct3 as u32) << 12
        | (rd as u32) << 7
        | opcode as u32
}

fn b_type_instruction(funct3: u32, rs1: u8, rs2: u8, offset: i16) -> u32 {
    assert!(rs1 <= 0x1f && rs2 <= 0x1f);
    assert!(offset % 2 == 0 && (-4096..4096).contains(&offset));

    let imm = (offset as u32) & 0x1fff;

    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3f) << 25
        | (rs2 as u32) << 20
        | (rs1 as u32) << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | BRANCH
}
