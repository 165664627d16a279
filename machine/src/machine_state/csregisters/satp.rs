// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

// Allow unused setters & getters & constants
#![allow(dead_code)]
// Allow non snake case for setters & getters & constants
#![allow(non_snake_case)]

use super::CSRValue;
use crate::{bits::Bits64, create_field};

// allowed `MODE` for `satp` register.
// Section 4.1.11
/// `satp.MODE = satp[63:60]`
pub const SATP_MODE_OFFSET: u64 = 60;
pub const MODE_BARE: CSRValue = 0;
pub const MODE_SV39: CSRValue = 8;
pub const MODE_SV48: CSRValue = 9;
pub const MODE_SV57: CSRValue = 10;

/// Default value is BARE mode, (all fields of SATP are zero.)
pub const DEFAULT_VALUE: CSRValue = MODE_BARE << SATP_MODE_OFFSET;

/// Which flavour of the address virtualization is used.
///
/// `SvXY` represents a virtualization where the virtual address is `XY` bits
/// wide.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SvLength {
    Sv39,
    Sv48,
    Sv57,
}

impl SvLength {
    /// Number of virtual page number fields in a virtual address.
    pub const fn levels(&self) -> usize {
        match self {
            SvLength::Sv39 => 3,
            SvLength::Sv48 => 4,
            SvLength::Sv57 => 5,
        }
    }
}

/// `MODE` field of the `satp` register. See table 5.4
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TranslationAlgorithm {
    Bare,
    Sv(SvLength),
}

impl TranslationAlgorithm {
    pub const fn enc(&self) -> CSRValue {
        match self {
            Self::Bare => MODE_BARE,
            Self::Sv(SvLength::Sv39) => MODE_SV39,
            Self::Sv(SvLength::Sv48) => MODE_SV48,
            Self::Sv(SvLength::Sv57) => MODE_SV57,
        }
    }
}

impl Bits64 for Option<TranslationAlgorithm> {
    const WIDTH: usize = 4;

    fn from_bits(value: u64) -> Self {
        use SvLength::*;
        use TranslationAlgorithm::*;

        match value & 0b1111 {
            MODE_BARE => Some(Bare),
            MODE_SV39 => Some(Sv(Sv39)),
            MODE_SV48 => Some(Sv(Sv48)),
            MODE_SV57 => Some(Sv(Sv57)),
            _ => None,
        }
    }

    fn to_bits(&self) -> u64 {
        match self {
            None => 0,
            Some(algorithm) => algorithm.enc(),
        }
    }
}

create_field!(MODE, Option<TranslationAlgorithm>, SATP_MODE_OFFSET, 4);
create_field!(ASID, u64, 44, 16);
create_field!(PPN, u64, 0, 44);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satp_fields() {
        let satp = 8 << 60 | 0xD07 << 44 | 0xABC_DEAD_0BAD_u64;
        assert_eq!(get_MODE(satp), Some(TranslationAlgorithm::Sv(SvLength::Sv39)));
        assert_eq!(get_ASID(satp), 0xD07);
        assert_eq!(get_PPN(satp), 0xABC_DEAD_0BAD);

        let satp = set_MODE(satp, Some(TranslationAlgorithm::Bare));
        assert_eq!(get_MODE(satp), Some(TranslationAlgorithm::Bare));
        // Only the mode changed.
        assert_eq!(get_ASID(satp), 0xD07);
    }

    #[test]
    fn test_invalid_modes() {
        for mode in [1_u64, 2, 3, 4, 5, 6, 7, 11, 12, 13, 14, 15] {
            assert_eq!(get_MODE(mode << SATP_MODE_OFFSET), None);
        }
    }
}
