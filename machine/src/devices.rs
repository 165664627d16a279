// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Memory-mapped device state machines.
//!
//! Devices are dispatched by their [crate::pma::DeviceKind] tag. Reads and
//! writes return `None` when the device refuses the access (wrong size or
//! alignment), which the memory path turns into an access fault. The peek
//! entry points materialise device pages deterministically so Merkle
//! hashing of device ranges is well defined.

pub mod clint;
pub mod htif;
