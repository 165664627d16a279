// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Core-logic implementation of the F/D instructions.
//!
//! All arithmetic is delegated to the soft-float collaborator
//! (`rustc_apfloat`); host floating point is never consulted, which keeps
//! results bit-exact across platforms. Single-precision values are
//! NaN-boxed in the 64-bit register file, and NaN results are canonicalised
//! the way RISC-V requires.
//!
//! `rustc_apfloat` offers no square root, so FSQRT is computed by an exact
//! integer square root of the scaled significand, rounded per the requested
//! mode.

use crate::{
    machine_state::{
        csregisters::{fflags, xstatus},
        registers::{FRegister, XRegister},
        MachineState,
    },
    parser::instruction::{
        FArith1Args, FArithArgs, FCmpArgs, FCvtFromIntArgs, FCvtToIntArgs, FFmaArgs, FRArgs,
        FRegToXRegArgs, InstrRoundingMode, RoundingMode, XRegToFRegArgs,
    },
    traps::Exception,
};
use rustc_apfloat::{
    ieee::{Double, Single},
    Float, FloatConvert, Round, Status,
};
use std::cmp::Ordering;

const F32_SIGN_BIT: u64 = 1 << 31;
const F64_SIGN_BIT: u64 = 1 << 63;
const F32_CANONICAL_NAN: u64 = 0x7FC0_0000;
const F64_CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;
const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

fn status_to_fflags(status: Status) -> u64 {
    let mut flags = 0;
    if status.intersects(Status::INVALID_OP) {
        flags |= fflags::NV;
    }
    if status.intersects(Status::DIV_BY_ZERO) {
        flags |= fflags::DZ;
    }
    if status.intersects(Status::OVERFLOW) {
        flags |= fflags::OF;
    }
    if status.intersects(Status::UNDERFLOW) {
        flags |= fflags::UF;
    }
    if status.intersects(Status::INEXACT) {
        flags |= fflags::NX;
    }
    flags
}

fn round_mode(mode: RoundingMode) -> Round {
    match mode {
        RoundingMode::RNE => Round::NearestTiesToEven,
        RoundingMode::RTZ => Round::TowardZero,
        RoundingMode::RDN => Round::TowardNegative,
        RoundingMode::RUP => Round::TowardPositive,
        RoundingMode::RMM => Round::NearestTiesToAway,
    }
}

impl MachineState {
    /// FP instructions are illegal while `mstatus.FS` is off.
    fn ensure_fp_on(&self) -> Result<(), Exception> {
        if xstatus::get_FS(self.csregisters.mstatus) == xstatus::ExtensionValue::Off {
            return Err(Exception::IllegalInstruction(0));
        }
        Ok(())
    }

    /// Record that the FP state has been written.
    fn mark_fs_dirty(&mut self) {
        let mstatus = xstatus::set_FS(self.csregisters.mstatus, xstatus::ExtensionValue::Dirty);
        self.csregisters.mstatus = xstatus::set_SD(mstatus, true);
    }

    /// Resolve the instruction's rounding-mode field, falling back to
    /// `fcsr.frm`. Reserved dynamic modes are illegal.
    fn rounding(&self, rm: InstrRoundingMode) -> Result<Round, Exception> {
        match rm {
            InstrRoundingMode::Static(mode) => Ok(round_mode(mode)),
            InstrRoundingMode::Dynamic => match self.csregisters.frm() {
                0b000 => Ok(Round::NearestTiesToEven),
                0b001 => Ok(Round::TowardZero),
                0b010 => Ok(Round::TowardNegative),
                0b011 => Ok(Round::TowardPositive),
                0b100 => Ok(Round::NearestTiesToAway),
                _ => Err(Exception::IllegalInstruction(0)),
            },
        }
    }

    /// Accumulate exception flags from a soft-float operation.
    fn note_status(&mut self, status: Status) {
        let flags = status_to_fflags(status);
        if flags != 0 {
            self.csregisters.set_fflags(flags);
            self.mark_fs_dirty();
        }
    }

    fn note_fflags(&mut self, flags: u64) {
        if flags != 0 {
            self.csregisters.set_fflags(flags);
            self.mark_fs_dirty();
        }
    }

    /// Raw single-precision bits of `reg`, collapsing improperly boxed
    /// values to the canonical NaN.
    fn read_f32_bits(&self, reg: FRegister) -> u64 {
        let raw = self.fregisters.read(reg);
        if raw & NAN_BOX == NAN_BOX {
            raw & 0xFFFF_FFFF
        } else {
            F32_CANONICAL_NAN
        }
    }

    fn read_f32(&self, reg: FRegister) -> Single {
        Single::from_bits(self.read_f32_bits(reg) as u128)
    }

    fn write_f32_bits(&mut self, reg: FRegister, bits: u64) {
        self.fregisters.write(reg, NAN_BOX | (bits & 0xFFFF_FFFF));
        self.mark_fs_dirty();
    }

    /// Write an operation result, canonicalising NaNs.
    fn write_f32(&mut self, reg: FRegister, value: Single) {
        let bits = if value.is_nan() {
            F32_CANONICAL_NAN
        } else {
            value.to_bits() as u64
        };
        self.write_f32_bits(reg, bits);
    }

    fn read_f64_bits(&self, reg: FRegister) -> u64 {
        self.fregisters.read(reg)
    }

    fn read_f64(&self, reg: FRegister) -> Double {
        Double::from_bits(self.read_f64_bits(reg) as u128)
    }

    fn write_f64_bits(&mut self, reg: FRegister, bits: u64) {
        self.fregisters.write(reg, bits);
        self.mark_fs_dirty();
    }

    fn write_f64(&mut self, reg: FRegister, value: Double) {
        let bits = if value.is_nan() {
            F64_CANONICAL_NAN
        } else {
            value.to_bits() as u64
        };
        self.write_f64_bits(reg, bits);
    }

    /// `FLW` I-type instruction
    pub fn run_flw(&mut self, imm: i64, rs1: XRegister, rd: FRegister) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u32 = self.load(address)?;
        self.write_f32_bits(rd, value as u64);
        Ok(())
    }

    /// `FLD` I-type instruction
    pub fn run_fld(&mut self, imm: i64, rs1: XRegister, rd: FRegister) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u64 = self.load(address)?;
        self.write_f64_bits(rd, value);
        Ok(())
    }

    /// `FSW` S-type instruction
    pub fn run_fsw(&mut self, imm: i64, rs1: XRegister, rs2: FRegister) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        self.store(address, self.fregisters.read(rs2) as u32)
    }

    /// `FSD` S-type instruction
    pub fn run_fsd(&mut self, imm: i64, rs1: XRegister, rs2: FRegister) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        self.store(address, self.fregisters.read(rs2))
    }
}

macro_rules! impl_fp_arith {
    ($name:ident, $read:ident, $write:ident, $op:ident) => {
        impl MachineState {
            #[doc = concat!("Binary arithmetic instruction (", stringify!($name), ")")]
            pub fn $name(&mut self, args: FArithArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let round = self.rounding(args.rm)?;
                let lhs = self.$read(args.rs1);
                let rhs = self.$read(args.rs2);
                let result = lhs.$op(rhs, round);
                self.note_status(result.status);
                self.$write(args.rd, result.value);
                Ok(())
            }
        }
    };
}

impl_fp_arith!(run_fadd_s, read_f32, write_f32, add_r);
impl_fp_arith!(run_fsub_s, read_f32, write_f32, sub_r);
impl_fp_arith!(run_fmul_s, read_f32, write_f32, mul_r);
impl_fp_arith!(run_fdiv_s, read_f32, write_f32, div_r);
impl_fp_arith!(run_fadd_d, read_f64, write_f64, add_r);
impl_fp_arith!(run_fsub_d, read_f64, write_f64, sub_r);
impl_fp_arith!(run_fmul_d, read_f64, write_f64, mul_r);
impl_fp_arith!(run_fdiv_d, read_f64, write_f64, div_r);

macro_rules! impl_fp_fma {
    ($name:ident, $read:ident, $write:ident, $neg_product:expr, $neg_addend:expr) => {
        impl MachineState {
            #[doc = concat!("Fused multiply-add instruction (", stringify!($name), ")")]
            pub fn $name(&mut self, args: FFmaArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let round = self.rounding(args.rm)?;
                let mut a = self.$read(args.rs1);
                let b = self.$read(args.rs2);
                let mut c = self.$read(args.rs3);
                if $neg_product {
                    a = -a;
                }
                if $neg_addend {
                    c = -c;
                }
                let result = a.mul_add_r(b, c, round);
                self.note_status(result.status);
                self.$write(args.rd, result.value);
                Ok(())
            }
        }
    };
}

impl_fp_fma!(run_fmadd_s, read_f32, write_f32, false, false);
impl_fp_fma!(run_fmsub_s, read_f32, write_f32, false, true);
impl_fp_fma!(run_fnmsub_s, read_f32, write_f32, true, false);
impl_fp_fma!(run_fnmadd_s, read_f32, write_f32, true, true);
impl_fp_fma!(run_fmadd_d, read_f64, write_f64, false, false);
impl_fp_fma!(run_fmsub_d, read_f64, write_f64, false, true);
impl_fp_fma!(run_fnmsub_d, read_f64, write_f64, true, false);
impl_fp_fma!(run_fnmadd_d, read_f64, write_f64, true, true);

/// RISC-V minimum: propagate the non-NaN operand, order -0.0 before +0.0.
fn fp_min<F: Float>(lhs: F, rhs: F) -> Option<F> {
    match (lhs.is_nan(), rhs.is_nan()) {
        (true, true) => None,
        (true, false) => Some(rhs),
        (false, true) => Some(lhs),
        (false, false) => match lhs.partial_cmp(&rhs) {
            Some(Ordering::Less) => Some(lhs),
            Some(Ordering::Greater) => Some(rhs),
            // Equal covers ±0; prefer the negative zero.
            _ => Some(if lhs.is_negative() { lhs } else { rhs }),
        },
    }
}

fn fp_max<F: Float>(lhs: F, rhs: F) -> Option<F> {
    match (lhs.is_nan(), rhs.is_nan()) {
        (true, true) => None,
        (true, false) => Some(rhs),
        (false, true) => Some(lhs),
        (false, false) => match lhs.partial_cmp(&rhs) {
            Some(Ordering::Greater) => Some(lhs),
            Some(Ordering::Less) => Some(rhs),
            _ => Some(if lhs.is_negative() { rhs } else { lhs }),
        },
    }
}

macro_rules! impl_fp_min_max {
    ($name:ident, $read:ident, $write:ident, $pick:ident) => {
        impl MachineState {
            #[doc = concat!("Minimum/maximum instruction (", stringify!($name), ")")]
            pub fn $name(&mut self, args: FRArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let lhs = self.$read(args.rs1);
                let rhs = self.$read(args.rs2);
                if lhs.is_signaling() || rhs.is_signaling() {
                    self.note_fflags(fflags::NV);
                }
                match $pick(lhs, rhs) {
                    Some(value) => self.$write(args.rd, value),
                    None => self.$write(args.rd, Float::qnan(None)),
                }
                Ok(())
            }
        }
    };
}

impl_fp_min_max!(run_fmin_s, read_f32, write_f32, fp_min);
impl_fp_min_max!(run_fmax_s, read_f32, write_f32, fp_max);
impl_fp_min_max!(run_fmin_d, read_f64, write_f64, fp_min);
impl_fp_min_max!(run_fmax_d, read_f64, write_f64, fp_max);

macro_rules! impl_fp_cmp {
    ($name:ident, $read:ident, $expect:pat, $signaling_only:expr) => {
        impl MachineState {
            #[doc = concat!("Comparison instruction (", stringify!($name), ")")]
            pub fn $name(&mut self, args: FCmpArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let lhs = self.$read(args.rs1);
                let rhs = self.$read(args.rs2);

                // FEQ is a quiet comparison: only signaling NaNs raise NV.
                // FLT/FLE signal on any NaN operand.
                let invalid = if $signaling_only {
                    lhs.is_signaling() || rhs.is_signaling()
                } else {
                    lhs.is_nan() || rhs.is_nan()
                };
                if invalid {
                    self.note_fflags(fflags::NV);
                }

                let result = matches!(lhs.partial_cmp(&rhs), Some($expect)) as u64;
                self.xregisters.write(args.rd, result);
                Ok(())
            }
        }
    };
}

impl_fp_cmp!(run_feq_s, read_f32, Ordering::Equal, true);
impl_fp_cmp!(run_flt_s, read_f32, Ordering::Less, false);
impl_fp_cmp!(run_fle_s, read_f32, Ordering::Less | Ordering::Equal, false);
impl_fp_cmp!(run_feq_d, read_f64, Ordering::Equal, true);
impl_fp_cmp!(run_flt_d, read_f64, Ordering::Less, false);
impl_fp_cmp!(run_fle_d, read_f64, Ordering::Less | Ordering::Equal, false);

/// 10-bit classification mask shared by `FCLASS.S` and `FCLASS.D`.
fn fp_class<F: Float>(value: F) -> u64 {
    let is_neg = value.is_negative();
    match value {
        _ if value.is_neg_infinity() => 1,
        _ if is_neg && value.is_normal() => 1 << 1,
        _ if is_neg && value.is_denormal() => 1 << 2,
        _ if value.is_neg_zero() => 1 << 3,
        _ if value.is_pos_zero() => 1 << 4,
        _ if value.is_denormal() => 1 << 5,
        _ if value.is_normal() => 1 << 6,
        _ if value.is_pos_infinity() => 1 << 7,
        _ if value.is_signaling() => 1 << 8,
        _ => 1 << 9,
    }
}

macro_rules! impl_fp_sign_class_mv {
    (
        $sgnj:ident, $sgnjn:ident, $sgnjx:ident, $class:ident, $mv_to_x:ident, $mv_from_x:ident,
        $read_bits:ident, $write_bits:ident, $read:ident, $sign_bit:expr, $to_x:expr
    ) => {
        impl MachineState {
            /// Sign-injection instruction
            pub fn $sgnj(&mut self, args: FRArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let lhs = self.$read_bits(args.rs1);
                let rhs = self.$read_bits(args.rs2);
                self.$write_bits(args.rd, (lhs & !$sign_bit) | (rhs & $sign_bit));
                Ok(())
            }

            /// Negated sign-injection instruction
            pub fn $sgnjn(&mut self, args: FRArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let lhs = self.$read_bits(args.rs1);
                let rhs = self.$read_bits(args.rs2);
                self.$write_bits(args.rd, (lhs & !$sign_bit) | (!rhs & $sign_bit));
                Ok(())
            }

            /// Xored sign-injection instruction
            pub fn $sgnjx(&mut self, args: FRArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let lhs = self.$read_bits(args.rs1);
                let rhs = self.$read_bits(args.rs2);
                self.$write_bits(args.rd, lhs ^ (rhs & $sign_bit));
                Ok(())
            }

            /// Classification instruction
            pub fn $class(&mut self, args: FRegToXRegArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let value = self.$read(args.rs1);
                self.xregisters.write(args.rd, fp_class(value));
                Ok(())
            }

            /// Raw move to the integer register file
            pub fn $mv_to_x(&mut self, args: FRegToXRegArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let raw = self.fregisters.read(args.rs1);
                self.xregisters.write(args.rd, $to_x(raw));
                Ok(())
            }

            /// Raw move from the integer register file
            pub fn $mv_from_x(&mut self, args: XRegToFRegArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let raw = self.xregisters.read(args.rs1);
                self.$write_bits(args.rd, raw);
                Ok(())
            }
        }
    };
}

impl_fp_sign_class_mv!(
    run_fsgnj_s,
    run_fsgnjn_s,
    run_fsgnjx_s,
    run_fclass_s,
    run_fmv_x_w,
    run_fmv_w_x,
    read_f32_bits,
    write_f32_bits,
    read_f32,
    F32_SIGN_BIT,
    |raw: u64| raw as u32 as i32 as u64
);

impl_fp_sign_class_mv!(
    run_fsgnj_d,
    run_fsgnjn_d,
    run_fsgnjx_d,
    run_fclass_d,
    run_fmv_x_d,
    run_fmv_d_x,
    read_f64_bits,
    write_f64_bits,
    read_f64,
    F64_SIGN_BIT,
    |raw: u64| raw
);

/// Convert a float to a signed integer of `width` bits, with the RISC-V
/// saturation rules. Returns the (sign-extended) result and exception
/// flags.
fn fp_to_signed<F: Float>(value: F, width: usize, round: Round) -> (i64, u64) {
    let max = (1i128 << (width - 1)) - 1;
    let min = -(1i128 << (width - 1));

    if value.is_nan() {
        return (max as i64, fflags::NV);
    }

    let mut is_exact = false;
    let result = value.to_i128_r(width, round, &mut is_exact);
    if result.status.intersects(Status::INVALID_OP) {
        let saturated = if value.is_negative() { min } else { max };
        return (saturated as i64, fflags::NV);
    }
    (result.value as i64, status_to_fflags(result.status))
}

/// Convert a float to an unsigned integer of `width` bits.
fn fp_to_unsigned<F: Float>(value: F, width: usize, round: Round) -> (u64, u64) {
    let max = if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };

    if value.is_nan() {
        return (max as u64, fflags::NV);
    }

    let mut is_exact = false;
    let result = value.to_u128_r(width, round, &mut is_exact);
    if result.status.intersects(Status::INVALID_OP) {
        let saturated = if value.is_negative() { 0 } else { max };
        return (saturated as u64, fflags::NV);
    }
    (result.value as u64, status_to_fflags(result.status))
}

macro_rules! impl_fp_cvt_to_int {
    ($name:ident, $read:ident, $convert:expr, $finish:expr) => {
        impl MachineState {
            #[doc = concat!("Float-to-integer conversion (", stringify!($name), ")")]
            pub fn $name(&mut self, args: FCvtToIntArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let round = self.rounding(args.rm)?;
                let value = self.$read(args.rs1);
                let (result, flags) = $convert(value, round);
                self.note_fflags(flags);
                self.xregisters.write(args.rd, $finish(result));
                Ok(())
            }
        }
    };
}

impl_fp_cvt_to_int!(
    run_fcvt_w_s,
    read_f32,
    |v, r| fp_to_signed(v, 32, r),
    |x: i64| x as i32 as u64
);
impl_fp_cvt_to_int!(
    run_fcvt_wu_s,
    read_f32,
    |v, r| fp_to_unsigned(v, 32, r),
    |x: u64| x as u32 as i32 as u64
);
impl_fp_cvt_to_int!(
    run_fcvt_l_s,
    read_f32,
    |v, r| fp_to_signed(v, 64, r),
    |x: i64| x as u64
);
impl_fp_cvt_to_int!(
    run_fcvt_lu_s,
    read_f32,
    |v, r| fp_to_unsigned(v, 64, r),
    |x: u64| x
);
impl_fp_cvt_to_int!(
    run_fcvt_w_d,
    read_f64,
    |v, r| fp_to_signed(v, 32, r),
    |x: i64| x as i32 as u64
);
impl_fp_cvt_to_int!(
    run_fcvt_wu_d,
    read_f64,
    |v, r| fp_to_unsigned(v, 32, r),
    |x: u64| x as u32 as i32 as u64
);
impl_fp_cvt_to_int!(
    run_fcvt_l_d,
    read_f64,
    |v, r| fp_to_signed(v, 64, r),
    |x: i64| x as u64
);
impl_fp_cvt_to_int!(
    run_fcvt_lu_d,
    read_f64,
    |v, r| fp_to_unsigned(v, 64, r),
    |x: u64| x
);

macro_rules! impl_fp_cvt_from_int {
    ($name:ident, $write:ident, $float:ty, $prepare:expr, $from:ident) => {
        impl MachineState {
            #[doc = concat!("Integer-to-float conversion (", stringify!($name), ")")]
            pub fn $name(&mut self, args: FCvtFromIntArgs) -> Result<(), Exception> {
                self.ensure_fp_on()?;
                let round = self.rounding(args.rm)?;
                let input = $prepare(self.xregisters.read(args.rs1));
                let result = <$float>::$from(input, round);
                self.note_status(result.status);
                self.$write(args.rd, result.value);
                Ok(())
            }
        }
    };
}

impl_fp_cvt_from_int!(run_fcvt_s_w, write_f32, Single, |x: u64| x as i32 as i128, from_i128_r);
impl_fp_cvt_from_int!(run_fcvt_s_wu, write_f32, Single, |x: u64| x as u32 as u128, from_u128_r);
impl_fp_cvt_from_int!(run_fcvt_s_l, write_f32, Single, |x: u64| x as i64 as i128, from_i128_r);
impl_fp_cvt_from_int!(run_fcvt_s_lu, write_f32, Single, |x: u64| x as u128, from_u128_r);
impl_fp_cvt_from_int!(run_fcvt_d_w, write_f64, Double, |x: u64| x as i32 as i128, from_i128_r);
impl_fp_cvt_from_int!(run_fcvt_d_wu, write_f64, Double, |x: u64| x as u32 as u128, from_u128_r);
impl_fp_cvt_from_int!(run_fcvt_d_l, write_f64, Double, |x: u64| x as i64 as i128, from_i128_r);
impl_fp_cvt_from_int!(run_fcvt_d_lu, write_f64, Double, |x: u64| x as u128, from_u128_r);

impl MachineState {
    /// `FCVT.S.D`: narrow a double to single precision.
    pub fn run_fcvt_s_d(&mut self, args: FArith1Args) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let round = self.rounding(args.rm)?;
        let value = self.read_f64(args.rs1);
        let mut loses_info = false;
        let result: rustc_apfloat::StatusAnd<Single> = value.convert_r(round, &mut loses_info);
        self.note_status(result.status);
        self.write_f32(args.rd, result.value);
        Ok(())
    }

    /// `FCVT.D.S`: widen a single to double precision. Always exact.
    pub fn run_fcvt_d_s(&mut self, args: FArith1Args) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        // The rounding mode is irrelevant for a widening conversion.
        let _ = self.rounding(args.rm)?;
        let value = self.read_f32(args.rs1);
        let mut loses_info = false;
        let result: rustc_apfloat::StatusAnd<Double> =
            value.convert_r(Round::NearestTiesToEven, &mut loses_info);
        self.note_status(result.status);
        self.write_f64(args.rd, result.value);
        Ok(())
    }

    /// `FSQRT.S`
    pub fn run_fsqrt_s(&mut self, args: FArith1Args) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let round = self.rounding(args.rm)?;
        let (bits, flags) = ieee_sqrt(self.read_f32_bits(args.rs1), 8, 23, round);
        self.note_fflags(flags);
        self.write_f32_bits(args.rd, bits);
        Ok(())
    }

    /// `FSQRT.D`
    pub fn run_fsqrt_d(&mut self, args: FArith1Args) -> Result<(), Exception> {
        self.ensure_fp_on()?;
        let round = self.rounding(args.rm)?;
        let (bits, flags) = ieee_sqrt(self.read_f64_bits(args.rs1), 11, 52, round);
        self.note_fflags(flags);
        self.write_f64_bits(args.rd, bits);
        Ok(())
    }
}

const fn ieee_canonical_nan(exp_bits: u32, frac_bits: u32) -> u64 {
    let exp_mask = ((1u64 << exp_bits) - 1) << frac_bits;
    exp_mask | (1 << (frac_bits - 1))
}

fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }
    let mut x = 1u128 << (n.ilog2() / 2 + 1);
    loop {
        let y = (x + n / x) >> 1;
        if y >= x {
            break;
        }
        x = y;
    }
    while x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x
}

/// Correctly rounded square root on raw IEEE-754 bits.
///
/// The significand is scaled to an even exponent and an exact integer
/// square root taken with 34 guard bits; the remainder decides inexactness
/// and the rounding direction. A square root of a binary float can never
/// fall exactly halfway between two representable values, so the
/// round-to-nearest cases need no tie-breaking. The result of a square
/// root is always a normal number, so no overflow or subnormal handling is
/// required either.
fn ieee_sqrt(bits: u64, exp_bits: u32, frac_bits: u32, round: Round) -> (u64, u64) {
    let sign = (bits >> (exp_bits + frac_bits)) & 1;
    let exp_field = (bits >> frac_bits) & ((1 << exp_bits) - 1);
    let frac = bits & ((1u64 << frac_bits) - 1);
    let exp_max = (1u64 << exp_bits) - 1;
    let qnan = ieee_canonical_nan(exp_bits, frac_bits);
    let bias = (1i64 << (exp_bits - 1)) - 1;

    if exp_field == exp_max {
        if frac != 0 {
            // NaN input: quiet propagates silently, signaling raises NV.
            let signaling = frac & (1 << (frac_bits - 1)) == 0;
            return (qnan, if signaling { fflags::NV } else { 0 });
        }
        if sign == 1 {
            return (qnan, fflags::NV);
        }
        return (bits, 0);
    }
    if exp_field == 0 && frac == 0 {
        // sqrt(±0) = ±0
        return (bits, 0);
    }
    if sign == 1 {
        return (qnan, fflags::NV);
    }

    // Normalise to m * 2^e with 2^frac_bits <= m < 2^(frac_bits + 1)
    let (mut m, mut e): (u64, i64) = if exp_field == 0 {
        let shift = frac.leading_zeros() - (63 - frac_bits);
        (frac << shift, 1 - bias - frac_bits as i64 - shift as i64)
    } else {
        (
            frac | (1 << frac_bits),
            exp_field as i64 - bias - frac_bits as i64,
        )
    };

    if e & 1 != 0 {
        m <<= 1;
        e -= 1;
    }

    // root = floor(sqrt(m) * 2^34); rem > 0 marks a strictly larger target.
    const GUARD: u32 = 34;
    let scaled = (m as u128) << (2 * GUARD);
    let root = isqrt(scaled);
    let rem = scaled - root * root;

    let precision = frac_bits + 1;
    let root_bits = 128 - root.leading_zeros();
    let spare = root_bits - precision;
    let mut quotient = (root >> spare) as u64;
    let rest = root & ((1u128 << spare) - 1);
    let inexact = rem != 0 || rest != 0;

    let round_up = match round {
        Round::TowardZero | Round::TowardNegative => false,
        Round::TowardPositive => inexact,
        Round::NearestTiesToEven | Round::NearestTiesToAway => {
            let half = 1u128 << (spare - 1);
            rest > half || (rest == half && rem != 0)
        }
    };

    let mut exponent = e / 2 - GUARD as i64 + spare as i64;
    if round_up {
        quotient += 1;
        if quotient == 1 << precision {
            quotient >>= 1;
            exponent += 1;
        }
    }

    let biased = exponent + (precision as i64 - 1) + bias;
    let out = ((biased as u64) << frac_bits) | (quotient & ((1 << frac_bits) - 1));
    (out, if inexact { fflags::NX } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers::{a0, a1, f0, f1, f2, f3, FRegister};

    fn fp_state() -> MachineState {
        let mut state = MachineState::new();
        state.csregisters.mstatus =
            xstatus::set_FS(state.csregisters.mstatus, xstatus::ExtensionValue::Initial);
        state
    }

    fn write_f64_const(state: &mut MachineState, reg: FRegister, value: f64) {
        state.fregisters.write(reg, value.to_bits());
    }

    #[test]
    fn test_fp_off_is_illegal() {
        let mut state = MachineState::new();
        let args = FArithArgs {
            rd: f0,
            rs1: f1,
            rs2: f2,
            rm: InstrRoundingMode::Dynamic,
        };
        assert_eq!(
            state.run_fadd_d(args),
            Err(Exception::IllegalInstruction(0))
        );
    }

    #[test]
    fn test_fadd_d() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, 1.5);
        write_f64_const(&mut state, f2, 2.25);
        state
            .run_fadd_d(FArithArgs {
                rd: f0,
                rs1: f1,
                rs2: f2,
                rm: InstrRoundingMode::Dynamic,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f0), 3.75_f64.to_bits());
        // Exact sum: no flags.
        assert_eq!(state.csregisters.fcsr & fflags::MASK, 0);
        // FS went dirty nonetheless.
        assert_eq!(
            xstatus::get_FS(state.csregisters.mstatus),
            xstatus::ExtensionValue::Dirty
        );
    }

    #[test]
    fn test_nan_boxing() {
        let mut state = fp_state();
        // An improperly boxed single reads as the canonical NaN.
        state.fregisters.write(f1, 0x0000_0001_3F80_0000);
        assert!(state.read_f32(f1).is_nan());

        // A properly boxed 1.0f32.
        state.fregisters.write(f1, NAN_BOX | 0x3F80_0000);
        assert_eq!(state.read_f32(f1).to_bits() as u64, 0x3F80_0000);
    }

    #[test]
    fn test_division_by_zero_flag() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, 1.0);
        write_f64_const(&mut state, f2, 0.0);
        state
            .run_fdiv_d(FArithArgs {
                rd: f0,
                rs1: f1,
                rs2: f2,
                rm: InstrRoundingMode::Dynamic,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f0), f64::INFINITY.to_bits());
        assert_ne!(state.csregisters.fcsr & fflags::DZ, 0);
    }

    #[test]
    fn test_min_max_zero_signs() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, 0.0);
        write_f64_const(&mut state, f2, -0.0);
        state
            .run_fmin_d(FRArgs {
                rd: f0,
                rs1: f1,
                rs2: f2,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f0), (-0.0_f64).to_bits());

        state
            .run_fmax_d(FRArgs {
                rd: f3,
                rs1: f1,
                rs2: f2,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f3), 0.0_f64.to_bits());
    }

    #[test]
    fn test_compare_nan_semantics() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, f64::NAN);
        write_f64_const(&mut state, f2, 1.0);

        state
            .run_feq_d(FCmpArgs {
                rd: a0,
                rs1: f1,
                rs2: f2,
            })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 0);
        // Quiet NaN through FEQ: no NV.
        assert_eq!(state.csregisters.fcsr & fflags::NV, 0);

        state
            .run_flt_d(FCmpArgs {
                rd: a0,
                rs1: f1,
                rs2: f2,
            })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 0);
        assert_ne!(state.csregisters.fcsr & fflags::NV, 0);
    }

    #[test]
    fn test_fcvt_saturation() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, 1e20);
        state
            .run_fcvt_w_d(FCvtToIntArgs {
                rd: a0,
                rs1: f1,
                rm: InstrRoundingMode::Static(RoundingMode::RTZ),
            })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), i32::MAX as u64);
        assert_ne!(state.csregisters.fcsr & fflags::NV, 0);

        write_f64_const(&mut state, f1, -3.7);
        state
            .run_fcvt_w_d(FCvtToIntArgs {
                rd: a0,
                rs1: f1,
                rm: InstrRoundingMode::Static(RoundingMode::RTZ),
            })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), -3_i64 as u64);

        write_f64_const(&mut state, f1, -1.0);
        state
            .run_fcvt_wu_d(FCvtToIntArgs {
                rd: a0,
                rs1: f1,
                rm: InstrRoundingMode::Static(RoundingMode::RTZ),
            })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 0);
    }

    #[test]
    fn test_fcvt_round_trip() {
        let mut state = fp_state();
        state.xregisters.write(a1, (-42_i64) as u64);
        state
            .run_fcvt_d_l(FCvtFromIntArgs {
                rd: f1,
                rs1: a1,
                rm: InstrRoundingMode::Dynamic,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f1), (-42.0_f64).to_bits());
    }

    #[test]
    fn test_sqrt_exact_and_inexact() {
        // sqrt(4.0) = 2.0, exact.
        let (bits, flags) = ieee_sqrt(4.0_f64.to_bits(), 11, 52, Round::NearestTiesToEven);
        assert_eq!(bits, 2.0_f64.to_bits());
        assert_eq!(flags, 0);

        // sqrt(2.0): the well-known correctly rounded value, inexact.
        let (bits, flags) = ieee_sqrt(2.0_f64.to_bits(), 11, 52, Round::NearestTiesToEven);
        assert_eq!(bits, 0x3FF6_A09E_667F_3BCD);
        assert_eq!(flags, fflags::NX);

        // Toward-zero must not round up.
        let (down, _) = ieee_sqrt(2.0_f64.to_bits(), 11, 52, Round::TowardZero);
        assert_eq!(down, 0x3FF6_A09E_667F_3BCC);

        // Negative input: canonical NaN + NV.
        let (bits, flags) = ieee_sqrt((-1.0_f64).to_bits(), 11, 52, Round::NearestTiesToEven);
        assert_eq!(bits, F64_CANONICAL_NAN);
        assert_eq!(flags, fflags::NV);

        // Single precision: sqrt(2.0f32).
        let (bits, _) = ieee_sqrt(
            2.0_f32.to_bits() as u64,
            8,
            23,
            Round::NearestTiesToEven,
        );
        assert_eq!(bits as u32, std::f32::consts::SQRT_2.to_bits());
    }

    #[test]
    fn test_sqrt_subnormal() {
        // Smallest positive subnormal double: 2^-1074; sqrt = 2^-537, normal.
        let (bits, flags) = ieee_sqrt(1, 11, 52, Round::NearestTiesToEven);
        let expected = f64::powi(2.0, -537).to_bits();
        assert_eq!(bits, expected);
        assert_eq!(flags, 0);
    }

    #[test]
    fn test_fsgnj() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, 1.5);
        write_f64_const(&mut state, f2, -7.0);
        state
            .run_fsgnj_d(FRArgs {
                rd: f0,
                rs1: f1,
                rs2: f2,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f0), (-1.5_f64).to_bits());

        state
            .run_fsgnjx_d(FRArgs {
                rd: f0,
                rs1: f1,
                rs2: f2,
            })
            .unwrap();
        assert_eq!(state.fregisters.read(f0), (-1.5_f64).to_bits());
    }

    #[test]
    fn test_fclass() {
        let mut state = fp_state();
        write_f64_const(&mut state, f1, f64::NEG_INFINITY);
        state
            .run_fclass_d(FRegToXRegArgs { rd: a0, rs1: f1 })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 1);

        write_f64_const(&mut state, f1, -0.0);
        state
            .run_fclass_d(FRegToXRegArgs { rd: a0, rs1: f1 })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 1 << 3);

        write_f64_const(&mut state, f1, 42.0);
        state
            .run_fclass_d(FRegToXRegArgs { rd: a0, rs1: f1 })
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 1 << 6);
    }
}
