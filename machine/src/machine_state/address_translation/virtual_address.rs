// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Implementation of `Sv39`/`Sv48`/`Sv57` virtual addresses.
//!
//! See sections 5.4, 5.5, 5.6

#![allow(non_snake_case)]

use super::PAGE_OFFSET_WIDTH;
use crate::machine_state::csregisters::satp::SvLength;
use std::ops::RangeInclusive;
use twiddle::Twiddle;

/// Bit range of `VPN[index]` within a virtual address, ignoring the page
/// offset field. ([`Twiddle`] expects reversed bit ranges.)
fn get_raw_vpn_i_range(sv_length: &SvLength, index: usize) -> Option<RangeInclusive<usize>> {
    use SvLength::*;
    let bit_range = match (index, sv_length) {
        (0, Sv39 | Sv48 | Sv57) => 0..=8,
        (1, Sv39 | Sv48 | Sv57) => 9..=17,
        (2, Sv39 | Sv48 | Sv57) => 18..=26,
        (3, Sv48 | Sv57) => 27..=35,
        (4, Sv57) => 36..=44,
        _ => return None,
    };

    Some(*bit_range.end()..=*bit_range.start())
}

/// Obtain `VPN[index]` from a virtual address under the given standard.
pub fn get_VPN_IDX(v_addr: u64, sv_length: &SvLength, index: usize) -> Option<u64> {
    let bit_range = get_raw_vpn_i_range(sv_length, index)?;
    let (start, end) = (
        bit_range.start() + PAGE_OFFSET_WIDTH,
        bit_range.end() + PAGE_OFFSET_WIDTH,
    );

    Some(v_addr.bits(start..=end))
}

/// Width of the virtual addresses under the given standard.
pub const fn width(sv_length: &SvLength) -> usize {
    match sv_length {
        SvLength::Sv39 => 39,
        SvLength::Sv48 => 48,
        SvLength::Sv57 => 57,
    }
}

/// Virtual addresses must be canonical: bits above the translated width
/// must all equal the most-significant translated bit. Section 5.4.1
pub fn is_canonical(v_addr: u64, sv_length: &SvLength) -> bool {
    let width = width(sv_length);
    let shifted = (v_addr as i64) >> (width - 1);
    shifted == 0 || shifted == -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::proptest;

    #[test]
    pub fn test_virtual_address() {
        proptest!(|(
            vpn_0 in 0_u64..(1 << 9),
            vpn_1 in 0_u64..(1 << 9),
            vpn_2 in 0_u64..(1 << 9),
            vpn_3 in 0_u64..(1 << 9),
            vpn_4 in 0_u64..(1 << 8),
            offset in 0_u64..(1 << 12),
        )| {
            let vpn_parts = vpn_0 | vpn_1 << 9 | vpn_2 << 18 | vpn_3 << 27 | vpn_4 << 36;
            let vaddr = offset | vpn_parts << 12;

            let run_tests = |sv_length, args: Vec<(usize, Option<u64>)>| {
                for (idx, res) in args {
                    assert_eq!(get_VPN_IDX(vaddr, sv_length, idx), res);
                }
            };

            run_tests(&SvLength::Sv39, vec![
                (5, None),
                (0, Some(vpn_0)),
                (1, Some(vpn_1)),
                (2, Some(vpn_2)),
            ]);

            run_tests(&SvLength::Sv48, vec![
                (0, Some(vpn_0)),
                (1, Some(vpn_1)),
                (2, Some(vpn_2)),
                (3, Some(vpn_3)),
            ]);

            run_tests(&SvLength::Sv57, vec![
                (0, Some(vpn_0)),
                (1, Some(vpn_1)),
                (2, Some(vpn_2)),
                (3, Some(vpn_3)),
                (4, Some(vpn_4)),
            ]);
        })
    }

    #[test]
    fn test_canonical() {
        // All VPN bits zero: canonical.
        assert!(is_canonical(0x0000_0000_1000, &SvLength::Sv39));
        // Sign-extended upper half: canonical.
        assert!(is_canonical(0xFFFF_FFC0_0000_0000, &SvLength::Sv39));
        // Bit 38 set without sign extension: not canonical.
        assert!(!is_canonical(0x0000_0040_0000_0000, &SvLength::Sv39));
        // The same address is fine under Sv48.
        assert!(is_canonical(0x0000_0040_0000_0000, &SvLength::Sv48));
    }
}
