// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Module containing helpers for `mstatus` and `sstatus` registers.
//!
//! The `sstatus` register is a subset of the `mstatus` register.
//! This mechanism is described as "shadow" CSRs in RISC-V spec.

// Allow unused setters & getters
#![allow(dead_code)]
// Allow non snake case for setters & getters
#![allow(non_snake_case)]

use crate::{
    bits::Bits64,
    create_field,
    machine_state::{csregisters::CSRRepr, mode::Mode},
};

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum MPPValue {
    User = 0b00,
    Supervisor = 0b01,
    Machine = 0b11,
}

impl From<MPPValue> for Mode {
    fn from(other: MPPValue) -> Mode {
        match other {
            MPPValue::User => Mode::User,
            MPPValue::Supervisor => Mode::Supervisor,
            MPPValue::Machine => Mode::Machine,
        }
    }
}

impl From<Mode> for MPPValue {
    fn from(other: Mode) -> MPPValue {
        match other {
            Mode::User => MPPValue::User,
            Mode::Supervisor => MPPValue::Supervisor,
            Mode::Machine => MPPValue::Machine,
        }
    }
}

impl Bits64 for MPPValue {
    const WIDTH: usize = 2;

    fn from_bits(value: u64) -> Self {
        match value & 0b11 {
            0b00 => MPPValue::User,
            0b01 => MPPValue::Supervisor,
            0b11 => MPPValue::Machine,
            // WARL field, invalid value `10` is considered User
            0b10 => MPPValue::User,
            _ => unreachable!(),
        }
    }

    fn to_bits(&self) -> u64 {
        *self as u8 as u64
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum SPPValue {
    User = 0b0,
    Supervisor = 0b1,
}

impl From<SPPValue> for Mode {
    fn from(other: SPPValue) -> Mode {
        match other {
            SPPValue::User => Mode::User,
            SPPValue::Supervisor => Mode::Supervisor,
        }
    }
}

impl Bits64 for SPPValue {
    const WIDTH: usize = 1;

    fn from_bits(value: u64) -> Self {
        match value & 1 {
            0b0 => SPPValue::User,
            0b1 => SPPValue::Supervisor,
            _ => unreachable!(),
        }
    }

    fn to_bits(&self) -> u64 {
        *self as u8 as u64
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum XLenValue {
    MXL32 = 0b01,
    MXL64 = 0b10,
    MXL128 = 0b11,
}

impl Bits64 for XLenValue {
    const WIDTH: usize = 2;

    fn to_bits(&self) -> u64 {
        *self as u8 as u64
    }

    fn from_bits(value: u64) -> Self {
        match value & 0b11 {
            0b01 => XLenValue::MXL32,
            0b10 => XLenValue::MXL64,
            0b11 => XLenValue::MXL128,
            // WARL field, invalid value considered 64 bits
            0b00 => XLenValue::MXL64,
            _ => unreachable!(),
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum ExtensionValue {
    Off = 0b00,
    Initial = 0b01,
    Clean = 0b10,
    Dirty = 0b11,
}

impl Bits64 for ExtensionValue {
    const WIDTH: usize = 2;

    fn from_bits(value: u64) -> Self {
        match value & 0b11 {
            0b00 => ExtensionValue::Off,
            0b01 => ExtensionValue::Initial,
            0b10 => ExtensionValue::Clean,
            0b11 => ExtensionValue::Dirty,
            _ => unreachable!(),
        }
    }

    fn to_bits(&self) -> u64 {
        *self as u8 as u64
    }
}

// MSTATUS & SSTATUS fields
create_field!(SD, bool, 63, 1);
create_field!(MBE, bool, 37, 1);
create_field!(SBE, bool, 36, 1);
create_field!(SXL, XLenValue, 34, 2);
create_field!(UXL, XLenValue, 32, 2);
create_field!(TSR, bool, 22, 1);
create_field!(TW, bool, 21, 1);
create_field!(TVM, bool, 20, 1);
create_field!(MXR, bool, 19, 1);
create_field!(SUM, bool, 18, 1);
create_field!(MPRV, bool, 17, 1);
create_field!(XS, ExtensionValue, 15, 2);
create_field!(FS, ExtensionValue, 13, 2);
create_field!(MPP, MPPValue, 11, 2);
create_field!(VS, ExtensionValue, 9, 2);
create_field!(SPP, SPPValue, 8, 1);
create_field!(MPIE, bool, 7, 1);
create_field!(UBE, bool, 6, 1);
create_field!(SPIE, bool, 5, 1);
create_field!(MIE, bool, 3, 1);
create_field!(SIE, bool, 1, 1);

pub const SSTATUS_FIELDS_MASK: CSRRepr = SD.mask()
    | UXL.mask()
    | MXR.mask()
    | SUM.mask()
    | XS.mask()
    | FS.mask()
    | VS.mask()
    | SPP.mask()
    | UBE.mask()
    | SPIE.mask()
    | SIE.mask();

pub const MSTATUS_FIELDS_MASK: CSRRepr = SSTATUS_FIELDS_MASK
    | MBE.mask()
    | SBE.mask()
    | SXL.mask()
    | TSR.mask()
    | TW.mask()
    | TVM.mask()
    | MPRV.mask()
    | MPP.mask()
    | MPIE.mask()
    | MIE.mask();

pub fn apply_warl_mstatus(mstatus: CSRRepr) -> CSRRepr {
    let mstatus = apply_warl_sstatus(mstatus);

    // set SXL as 64 (our implementation fixes MXL, SXL, UXL as 64)
    let mstatus = set_SXL(mstatus, XLenValue::MXL64);

    // reset MPP in case new value is invalid
    let mpp = get_MPP(mstatus);
    set_MPP(mstatus, mpp)
}

pub fn apply_warl_sstatus(mut mstatus: CSRRepr) -> CSRRepr {
    use ExtensionValue::Dirty;

    // set sd = (FS==11) OR (XS==11) OR (VS=11)
    let xs = get_XS(mstatus);
    let vs = get_VS(mstatus);
    let mut fs = get_FS(mstatus);

    if fs != ExtensionValue::Off {
        fs = Dirty;
        mstatus = set_FS(mstatus, Dirty);
    }

    let mstatus = set_SD(mstatus, xs == Dirty || fs == Dirty || vs == Dirty);

    // set UXL as 64 (our implementation fixes MXL, SXL, UXL as 64)
    set_UXL(mstatus, XLenValue::MXL64)
}

pub fn sstatus_from_mstatus(mstatus: u64) -> u64 {
    mstatus & SSTATUS_FIELDS_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fields() {
        let field = bool::from_bits(0xF0F0_0000_AAAA_0001);
        assert!(field);

        let field = bool::from_bits(0x0002);
        assert!(!field);

        let field = ExtensionValue::from_bits(0b1111_0010);
        assert_eq!(field, ExtensionValue::Clean);
        assert_eq!(field.to_bits(), 0b10);

        let field = XLenValue::from_bits(0b01);
        assert_eq!(field, XLenValue::MXL32);
        assert_eq!(field.to_bits(), 0b01);

        let field = MPPValue::from_bits(0b1010);
        assert_eq!(field, MPPValue::User);
        assert_eq!(field.to_bits(), 0b00);

        let field = SPPValue::from_bits(0b111);
        assert_eq!(field, SPPValue::Supervisor);
        assert_eq!(field.to_bits(), 0b1);
    }

    #[test]
    fn test_trap_entry_fields() {
        // Emulate a trap into M-mode from S-mode: MPIE <= MIE, MIE <= 0,
        // MPP <= S, as the interpreter does it.
        let mstatus = apply_warl_mstatus(set_MIE(0, true));
        let mstatus = set_MPIE(mstatus, get_MIE(mstatus));
        let mstatus = set_MIE(mstatus, false);
        let mstatus = set_MPP(mstatus, MPPValue::Supervisor);

        assert!(get_MPIE(mstatus));
        assert!(!get_MIE(mstatus));
        assert_eq!(get_MPP(mstatus), MPPValue::Supervisor);
        assert_eq!(get_SXL(mstatus), XLenValue::MXL64);
        assert_eq!(get_UXL(mstatus), XLenValue::MXL64);
    }
}
