// SPDX-FileCopyrightText: 2024 Nomadic Labs <contact@nomadic-labs.com>
//
// SPDX-License-Identifier: MIT

use crate::machine_state::{
    csregisters::CSRegister,
    registers::{FRegister, XRegister},
};

/// Length in bytes an instruction occupies in memory.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u64)]
pub enum InstrWidth {
    Compressed = 2,
    Uncompressed = 4,
}

/// Static rounding mode encoded in a floating-point instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RoundingMode {
    /// Round to nearest, ties to even
    RNE,
    /// Round towards zero
    RTZ,
    /// Round down
    RDN,
    /// Round up
    RUP,
    /// Round to nearest, ties to max magnitude
    RMM,
}

/// The `rm` field of a floating-point instruction: either a static rounding
/// mode, or deferral to `fcsr.frm`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InstrRoundingMode {
    Dynamic,
    Static(RoundingMode),
}

impl InstrRoundingMode {
    /// Parse the 3-bit `rm` field; `None` for reserved encodings.
    pub fn from_rm(rm: u32) -> Option<Self> {
        let mode = match rm {
            0b000 => Self::Static(RoundingMode::RNE),
            0b001 => Self::Static(RoundingMode::RTZ),
            0b010 => Self::Static(RoundingMode::RDN),
            0b011 => Self::Static(RoundingMode::RUP),
            0b100 => Self::Static(RoundingMode::RMM),
            0b111 => Self::Dynamic,
            _ => return None,
        };
        Some(mode)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RTypeArgs {
    pub rd: XRegister,
    pub rs1: XRegister,
    pub rs2: XRegister,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ITypeArgs {
    pub rd: XRegister,
    pub rs1: XRegister,
    pub imm: i64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SBTypeArgs {
    pub rs1: XRegister,
    pub rs2: XRegister,
    pub imm: i64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct UJTypeArgs {
    pub rd: XRegister,
    pub imm: i64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct AmoArgs {
    pub rd: XRegister,
    pub rs1: XRegister,
    pub rs2: XRegister,
    pub aq: bool,
    pub rl: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FenceSet {
    pub i: bool,
    pub o: bool,
    pub r: bool,
    pub w: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FenceArgs {
    pub pred: FenceSet,
    pub succ: FenceSet,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CsrArgs {
    pub rd: XRegister,
    pub rs1: XRegister,
    pub csr: CSRegister,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CsriArgs {
    pub rd: XRegister,
    pub imm: i64,
    pub csr: CSRegister,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FLoadArgs {
    pub rd: FRegister,
    pub rs1: XRegister,
    pub imm: i64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FStoreArgs {
    pub rs1: XRegister,
    pub rs2: FRegister,
    pub imm: i64,
}

/// Register-register FP operation with no rounding (sign injection,
/// min/max).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FRArgs {
    pub rd: FRegister,
    pub rs1: FRegister,
    pub rs2: FRegister,
}

/// Register-register FP arithmetic with a rounding mode.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FArithArgs {
    pub rd: FRegister,
    pub rs1: FRegister,
    pub rs2: FRegister,
    pub rm: InstrRoundingMode,
}

/// Single-operand FP arithmetic with a rounding mode (square root,
/// FP-to-FP conversion).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FArith1Args {
    pub rd: FRegister,
    pub rs1: FRegister,
    pub rm: InstrRoundingMode,
}

/// Fused multiply-add family.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FFmaArgs {
    pub rd: FRegister,
    pub rs1: FRegister,
    pub rs2: FRegister,
    pub rs3: FRegister,
    pub rm: InstrRoundingMode,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FCmpArgs {
    pub rd: XRegister,
    pub rs1: FRegister,
    pub rs2: FRegister,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FRegToXRegArgs {
    pub rd: XRegister,
    pub rs1: FRegister,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct XRegToFRegArgs {
    pub rd: FRegister,
    pub rs1: XRegister,
}

/// FP to integer conversion.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FCvtToIntArgs {
    pub rd: XRegister,
    pub rs1: FRegister,
    pub rm: InstrRoundingMode,
}

/// Integer to FP conversion.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FCvtFromIntArgs {
    pub rd: FRegister,
    pub rs1: XRegister,
    pub rm: InstrRoundingMode,
}

/// RISC-V parsed instructions. Along with legal instructions, potentially
/// illegal instructions are parsed as `Unknown` or `UnknownCompressed`.
/// These instructions are successfully parsed, but must not be interpreted.
///
/// Compressed instructions are expanded to their 32-bit counterparts at
/// parse time; the original width travels separately so the interpreter can
/// advance `pc` by the right amount.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Instr {
    // RV64I R-type instructions
    Add(RTypeArgs),
    Sub(RTypeArgs),
    Xor(RTypeArgs),
    Or(RTypeArgs),
    And(RTypeArgs),
    Sll(RTypeArgs),
    Srl(RTypeArgs),
    Sra(RTypeArgs),
    Slt(RTypeArgs),
    Sltu(RTypeArgs),
    Addw(RTypeArgs),
    Subw(RTypeArgs),
    Sllw(RTypeArgs),
    Srlw(RTypeArgs),
    Sraw(RTypeArgs),

    // RV64I I-type instructions
    Addi(ITypeArgs),
    Addiw(ITypeArgs),
    Xori(ITypeArgs),
    Ori(ITypeArgs),
    Andi(ITypeArgs),
    Slli(ITypeArgs),
    Srli(ITypeArgs),
    Srai(ITypeArgs),
    Slliw(ITypeArgs),
    Srliw(ITypeArgs),
    Sraiw(ITypeArgs),
    Slti(ITypeArgs),
    Sltiu(ITypeArgs),
    Lb(ITypeArgs),
    Lh(ITypeArgs),
    Lw(ITypeArgs),
    Lbu(ITypeArgs),
    Lhu(ITypeArgs),
    Lwu(ITypeArgs),
    Ld(ITypeArgs),

    // RV64I S-type instructions
    Sb(SBTypeArgs),
    Sh(SBTypeArgs),
    Sw(SBTypeArgs),
    Sd(SBTypeArgs),

    // RV64I B-type instructions
    Beq(SBTypeArgs),
    Bne(SBTypeArgs),
    Blt(SBTypeArgs),
    Bge(SBTypeArgs),
    Bltu(SBTypeArgs),
    Bgeu(SBTypeArgs),

    // RV64I U-type instructions
    Lui(UJTypeArgs),
    Auipc(UJTypeArgs),

    // RV64I jump instructions
    Jal(UJTypeArgs),
    Jalr(ITypeArgs),

    // Zifencei and fences
    Fence(FenceArgs),
    FenceTso(FenceArgs),
    FenceI,

    // System
    Ecall,
    Ebreak,
    Sret,
    Mret,
    Wfi,
    SFenceVma { vaddr: XRegister, asid: XRegister },

    // RV64M
    Mul(RTypeArgs),
    Mulh(RTypeArgs),
    Mulhsu(RTypeArgs),
    Mulhu(RTypeArgs),
    Div(RTypeArgs),
    Divu(RTypeArgs),
    Rem(RTypeArgs),
    Remu(RTypeArgs),
    Mulw(RTypeArgs),
    Divw(RTypeArgs),
    Divuw(RTypeArgs),
    Remw(RTypeArgs),
    Remuw(RTypeArgs),

    // RV64A
    Lrw(AmoArgs),
    Scw(AmoArgs),
    Amoswapw(AmoArgs),
    Amoaddw(AmoArgs),
    Amoxorw(AmoArgs),
    Amoandw(AmoArgs),
    Amoorw(AmoArgs),
    Amominw(AmoArgs),
    Amomaxw(AmoArgs),
    Amominuw(AmoArgs),
    Amomaxuw(AmoArgs),
    Lrd(AmoArgs),
    Scd(AmoArgs),
    Amoswapd(AmoArgs),
    Amoaddd(AmoArgs),
    Amoxord(AmoArgs),
    Amoandd(AmoArgs),
    Amoord(AmoArgs),
    Amomind(AmoArgs),
    Amomaxd(AmoArgs),
    Amominud(AmoArgs),
    Amomaxud(AmoArgs),

    // Zicsr
    Csrrw(CsrArgs),
    Csrrs(CsrArgs),
    Csrrc(CsrArgs),
    Csrrwi(CsriArgs),
    Csrrsi(CsriArgs),
    Csrrci(CsriArgs),

    // RV64F/D loads and stores
    Flw(FLoadArgs),
    Fld(FLoadArgs),
    Fsw(FStoreArgs),
    Fsd(FStoreArgs),

    // RV64F arithmetic
    Fadds(FArithArgs),
    Fsubs(FArithArgs),
    Fmuls(FArithArgs),
    Fdivs(FArithArgs),
    Fsqrts(FArith1Args),
    Fmadds(FFmaArgs),
    Fmsubs(FFmaArgs),
    Fnmsubs(FFmaArgs),
    Fnmadds(FFmaArgs),
    Fsgnjs(FRArgs),
    Fsgnjns(FRArgs),
    Fsgnjxs(FRArgs),
    Fmins(FRArgs),
    Fmaxs(FRArgs),
    Feqs(FCmpArgs),
    Flts(FCmpArgs),
    Fles(FCmpArgs),
    FclassS(FRegToXRegArgs),
    FmvXW(FRegToXRegArgs),
    FmvWX(XRegToFRegArgs),
    FcvtWS(FCvtToIntArgs),
    FcvtWUS(FCvtToIntArgs),
    FcvtLS(FCvtToIntArgs),
    FcvtLUS(FCvtToIntArgs),
    FcvtSW(FCvtFromIntArgs),
    FcvtSWU(FCvtFromIntArgs),
    FcvtSL(FCvtFromIntArgs),
    FcvtSLU(FCvtFromIntArgs),

    // RV64D arithmetic
    Faddd(FArithArgs),
    Fsubd(FArithArgs),
    Fmuld(FArithArgs),
    Fdivd(FArithArgs),
    Fsqrtd(FArith1Args),
    Fmaddd(FFmaArgs),
    Fmsubd(FFmaArgs),
    Fnmsubd(FFmaArgs),
    Fnmaddd(FFmaArgs),
    Fsgnjd(FRArgs),
    Fsgnjnd(FRArgs),
    Fsgnjxd(FRArgs),
    Fmind(FRArgs),
    Fmaxd(FRArgs),
    Feqd(FCmpArgs),
    Fltd(FCmpArgs),
    Fled(FCmpArgs),
    FclassD(FRegToXRegArgs),
    FmvXD(FRegToXRegArgs),
    FmvDX(XRegToFRegArgs),
    FcvtWD(FCvtToIntArgs),
    FcvtWUD(FCvtToIntArgs),
    FcvtLD(FCvtToIntArgs),
    FcvtLUD(FCvtToIntArgs),
    FcvtDW(FCvtFromIntArgs),
    FcvtDWU(FCvtFromIntArgs),
    FcvtDL(FCvtFromIntArgs),
    FcvtDLU(FCvtFromIntArgs),
    FcvtSD(FArith1Args),
    FcvtDS(FArith1Args),

    Unknown { instr: u32 },
    UnknownCompressed { instr: u16 },
}
