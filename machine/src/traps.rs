// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Architectural traps.
//!
//! Exceptions and interrupts are delivered to the guest per the privileged
//! spec; they are never surfaced through the host API. Engine-level failures
//! live in [crate::MachineError] instead.

/// RISC-V exceptions (also known as synchronous exceptions)
///
/// The payload carries the value that must be written to `mtval`/`stval`
/// when the trap is taken.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error, strum::Display, Debug)]
pub enum Exception {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint,
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAccessFault(u64),
    StoreAddressMisaligned(u64),
    EnvCallFromUMode,
    EnvCallFromSMode,
    EnvCallFromMMode,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),
}

impl Exception {
    /// Exception code as written to `mcause`/`scause`. Table 3.6
    pub const fn code(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned(_) => 0,
            Exception::InstructionAccessFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAddressMisaligned(_) => 6,
            Exception::StoreAccessFault(_) => 7,
            Exception::EnvCallFromUMode => 8,
            Exception::EnvCallFromSMode => 9,
            Exception::EnvCallFromMMode => 11,
            Exception::InstructionPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StorePageFault(_) => 15,
        }
    }

    /// Value for the trap-value register of the target mode.
    pub const fn trap_value(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned(addr)
            | Exception::InstructionAccessFault(addr)
            | Exception::IllegalInstruction(addr)
            | Exception::LoadAddressMisaligned(addr)
            | Exception::LoadAccessFault(addr)
            | Exception::StoreAddressMisaligned(addr)
            | Exception::StoreAccessFault(addr)
            | Exception::InstructionPageFault(addr)
            | Exception::LoadPageFault(addr)
            | Exception::StorePageFault(addr) => *addr,
            Exception::Breakpoint
            | Exception::EnvCallFromUMode
            | Exception::EnvCallFromSMode
            | Exception::EnvCallFromMMode => 0,
        }
    }
}

/// RISC-V interrupts (also known as asynchronous exceptions)
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error, strum::Display, Debug)]
pub enum Interrupt {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

/// Interrupt bit set on `mcause`/`scause` for asynchronous causes.
pub const CAUSE_INTERRUPT_BIT: u64 = 1 << 63;

impl Interrupt {
    /// Interrupt code as written to `mcause`/`scause` (without
    /// [CAUSE_INTERRUPT_BIT]).
    pub const fn code(&self) -> u64 {
        match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
        }
    }

    /// Corresponding bit in `mip`/`mie`.
    pub const fn mask(&self) -> u64 {
        1 << self.code()
    }

    /// All interrupts, from highest to lowest delivery priority.
    pub const PRIORITY: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];
}
