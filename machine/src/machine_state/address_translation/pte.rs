// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Implementation of `Sv39`/`Sv48`/`Sv57` Page Table Entries (PTE).
//!
//! See sections 5.4, 5.5, 5.6

// Allow non snake case for setters & getters & constants
#![allow(non_snake_case)]

use crate::{
    bits::Bits64,
    create_field,
    machine_state::csregisters::satp::SvLength,
};
use std::ops::RangeInclusive;
use twiddle::Twiddle;

/// Structure representing the raw bits of the PPN field of a PTE.
///
/// E.g. `PPN[0] = raw_bits[8:0]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PPNField {
    raw_bits: u64,
}

/// Bit range of `PPN[index]` within the PPN field, for the given
/// virtualization standard. ([`Twiddle`] expects reversed bit ranges.)
fn get_raw_ppn_i_range(sv_length: &SvLength, index: usize) -> Option<RangeInclusive<usize>> {
    use SvLength::*;
    let bit_range = match (index, sv_length) {
        (0, Sv39 | Sv48 | Sv57) => 0..=8,
        (1, Sv39 | Sv48 | Sv57) => 9..=17,
        (2, Sv39) => 18..=43,
        (2, Sv48 | Sv57) => 18..=26,
        (3, Sv48) => 27..=43,
        (3, Sv57) => 27..=35,
        (4, Sv57) => 36..=43,
        _ => return None,
    };

    Some(*bit_range.end()..=*bit_range.start())
}

impl PPNField {
    /// Obtain `PPN[index]` from the PPN field of a page table entry.
    pub fn get_ppn_i(&self, sv_length: &SvLength, index: usize) -> Option<u64> {
        let bit_range = get_raw_ppn_i_range(sv_length, index)?;
        Some(self.raw_bits.bits(bit_range))
    }

    /// The whole physical page number.
    pub fn value(&self) -> u64 {
        self.raw_bits
    }
}

impl Bits64 for PPNField {
    const WIDTH: usize = 44;

    fn from_bits(value: u64) -> Self {
        PPNField { raw_bits: value }
    }

    fn to_bits(&self) -> u64 {
        self.raw_bits
    }
}

create_field!(FLAG_V, bool, 0, 1);
create_field!(FLAG_R, bool, 1, 1);
create_field!(FLAG_W, bool, 2, 1);
create_field!(FLAG_X, bool, 3, 1);
create_field!(FLAG_U, bool, 4, 1);
create_field!(FLAG_G, bool, 5, 1);
create_field!(FLAG_A, bool, 6, 1);
create_field!(FLAG_D, bool, 7, 1);
// 8 - 9 bits RSW field is reserved by the spec
create_field!(PPN, PPNField, 10, 44);
// 54 - 60 bits are reserved
// 61 - 62 bits PBMT field, Svpbmt is not implemented
// bit 63 is the Svnapot N bit, also not implemented

/// Bits of a PTE that must be zero for the entry to be valid. Reserved and
/// unimplemented-extension bits are treated as illegal when set.
pub const RESERVED_BITS: u64 = !((1 << 54) - 1) | (0b11 << 8);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    #[test]
    pub fn test_pte_fields() {
        proptest!(|(
            flag_r in 0_u64..2,
            flag_x in 0_u64..2,
            flag_w in 0_u64..2,
            flag_d in 0_u64..2,
            flag_u in 0_u64..2,
            flag_g in 0_u64..2,
            flag_a in 0_u64..2,
            flag_v in 0_u64..2,
            ppn_0 in 0_u64..(1 << 9),
            ppn_1 in 0_u64..(1 << 9),
            ppn_2 in 0_u64..(1 << 9),
            ppn_3 in 0_u64..(1 << 9),
            ppn_4 in 0_u64..(1 << 8),
        )| {
            let ppn_parts = ppn_0 | ppn_1 << 9 | ppn_2 << 18 | ppn_3 << 27 | ppn_4 << 36;
            let flags = flag_v | flag_r << 1 | flag_w << 2 | flag_x << 3
                | flag_u << 4 | flag_g << 5 | flag_a << 6 | flag_d << 7;
            let pte = flags | ppn_parts << 10;

            // Sv39: PPN[2] spans the upper bits
            let ppn = get_PPN(pte);
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv39, 5), None);
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv39, 0), Some(ppn_0));
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv39, 1), Some(ppn_1));
            prop_assert_eq!(
                ppn.get_ppn_i(&SvLength::Sv39, 2),
                Some(ppn_2 | ppn_3 << 9 | ppn_4 << 18)
            );

            // Sv48
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv48, 0), Some(ppn_0));
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv48, 2), Some(ppn_2));
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv48, 3), Some(ppn_3 | ppn_4 << 9));

            // Sv57
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv57, 3), Some(ppn_3));
            prop_assert_eq!(ppn.get_ppn_i(&SvLength::Sv57, 4), Some(ppn_4));

            // Flags
            prop_assert_eq!(get_FLAG_R(pte), flag_r != 0);
            prop_assert_eq!(get_FLAG_X(pte), flag_x != 0);
            prop_assert_eq!(get_FLAG_W(pte), flag_w != 0);
            prop_assert_eq!(get_FLAG_D(pte), flag_d != 0);
            prop_assert_eq!(get_FLAG_U(pte), flag_u != 0);
            prop_assert_eq!(get_FLAG_G(pte), flag_g != 0);
            prop_assert_eq!(get_FLAG_A(pte), flag_a != 0);
            prop_assert_eq!(get_FLAG_V(pte), flag_v != 0);
        })
    }
}
