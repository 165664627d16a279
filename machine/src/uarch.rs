// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! The microarchitecture machine.
//!
//! A small independent RV64I hart whose program, run to completion,
//! implements exactly one big-machine step. Every piece of its state, and
//! every piece of big-machine state it touches, lives at a committed
//! word address, so a single uarch instruction can be logged as a sequence
//! of typed accesses and replayed by a verifier holding nothing but the
//! log and a pair of root hashes.
//!
//! The executor is generic over [UarchAccess]: the same code drives the
//! machine directly, drives it while recording an access log, and replays
//! a log with no machine at all.

use crate::{
    machine_state::MachineState,
    parser::{instruction::Instr, parse_uncompressed_instruction},
    pma::UARCH_RAM_START,
    shadow,
    MachineError,
};

/// Number of uarch integer registers
pub const UARCH_X_REG_COUNT: usize = 32;

/// The uarch reset vector: execution restarts at the base of uarch RAM.
pub const UARCH_RESET_PC: u64 = UARCH_RAM_START;

/// Architectural state of the microarchitecture hart
#[derive(Debug)]
pub struct UarchState {
    x: [u64; UARCH_X_REG_COUNT],
    pub pc: u64,
    pub cycle: u64,
    pub halt: bool,
}

impl UarchState {
    pub fn new() -> Self {
        Self {
            x: [0; UARCH_X_REG_COUNT],
            pc: UARCH_RESET_PC,
            cycle: 0,
            halt: false,
        }
    }

    /// Read a uarch register; `x0` is hardwired to zero.
    pub fn read_x(&self, index: usize) -> u64 {
        if index == 0 {
            0
        } else {
            self.x[index & 0b11111]
        }
    }

    /// Write a uarch register; writes to `x0` are discarded.
    pub fn write_x(&mut self, index: usize, value: u64) {
        if index != 0 {
            self.x[index & 0b11111] = value;
        }
    }

    /// Reset registers to their boot values. The RAM image is restored
    /// separately.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for UarchState {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the uarch interpreter stopped
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UarchBreakReason {
    ReachedTargetCycle,
    Halted,
}

/// Access seam between the uarch executor and committed machine state.
///
/// Everything the executor touches goes through here as aligned 64-bit
/// words at committed physical addresses.
pub(crate) trait UarchAccess {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError>;

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError>;
}

/// Direct, unlogged access to the machine state.
pub(crate) struct DirectAccess<'a> {
    pub state: &'a mut MachineState,
}

impl UarchAccess for DirectAccess<'_> {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError> {
        self.state.read_word(paddr)
    }

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError> {
        self.state.write_word(paddr, value)
    }
}

fn bad_program(pc: u64, message: &str) -> MachineError {
    MachineError::StateInconsistent(format!("uarch program at pc {pc:#x}: {message}"))
}

/// The committed value a raw word write settles on, or `None` when the
/// write is discarded. Shared between the executor, the logger and the
/// replayer so all three agree on post-write state.
fn canonical_committed(paddr: u64, value: u64) -> Option<u64> {
    if paddr == shadow::x_address(0) || paddr == shadow::uarch_x_address(0) {
        return None;
    }
    if paddr == shadow::uarch_halt_address() {
        return Some((value != 0) as u64);
    }
    if paddr == shadow::MachineCsr::iflags.address() {
        return Some(MachineState::canonical_iflags(value));
    }
    Some(value)
}

fn write_canonical(
    access: &mut impl UarchAccess,
    paddr: u64,
    value: u64,
) -> Result<(), MachineError> {
    match canonical_committed(paddr, value) {
        None => Ok(()),
        Some(value) => access.write_word(paddr, value),
    }
}

fn read_x(access: &mut impl UarchAccess, reg: crate::machine_state::registers::XRegister) -> Result<u64, MachineError> {
    access.read_word(shadow::uarch_x_address(reg.index()))
}

fn write_x(
    access: &mut impl UarchAccess,
    reg: crate::machine_state::registers::XRegister,
    value: u64,
) -> Result<(), MachineError> {
    write_canonical(access, shadow::uarch_x_address(reg.index()), value)
}

/// Load `1 << log2_size` bytes at `addr` by reading the containing word.
fn load_sized(
    access: &mut impl UarchAccess,
    addr: u64,
    log2_size: u64,
) -> Result<u64, MachineError> {
    let size = 1u64 << log2_size;
    if addr % size != 0 {
        return Err(MachineError::StateInconsistent(format!(
            "misaligned uarch access of {size} bytes at {addr:#x}"
        )));
    }
    let word = access.read_word(addr & !7)?;
    let shift = (addr & 7) * 8;
    let mask = if size == 8 { u64::MAX } else { (1 << (size * 8)) - 1 };
    Ok((word >> shift) & mask)
}

/// Store `1 << log2_size` bytes at `addr` by merging into the containing
/// word.
fn store_sized(
    access: &mut impl UarchAccess,
    addr: u64,
    log2_size: u64,
    value: u64,
) -> Result<(), MachineError> {
    let size = 1u64 << log2_size;
    if addr % size != 0 {
        return Err(MachineError::StateInconsistent(format!(
            "misaligned uarch access of {size} bytes at {addr:#x}"
        )));
    }
    if size == 8 {
        return write_canonical(access, addr, value);
    }
    let word_addr = addr & !7;
    let shift = (addr & 7) * 8;
    let mask = ((1u64 << (size * 8)) - 1) << shift;
    let word = access.read_word(word_addr)?;
    let merged = (word & !mask) | ((value << shift) & mask);
    write_canonical(access, word_addr, merged)
}

/// Run one uarch cycle through `access`. Returns true when the machine was
/// already halted (in which case nothing else is touched).
pub(crate) fn uarch_step(access: &mut impl UarchAccess) -> Result<bool, MachineError> {
    if access.read_word(shadow::uarch_halt_address())? != 0 {
        return Ok(true);
    }

    let cycle = access.read_word(shadow::uarch_cycle_address())?;
    let pc = access.read_word(shadow::uarch_pc_address())?;

    if pc % 4 != 0 {
        return Err(bad_program(pc, "misaligned program counter"));
    }
    let word = access.read_word(pc & !7)?;
    let raw = if pc & 4 == 0 {
        word as u32
    } else {
        (word >> 32) as u32
    };

    let instr = parse_uncompressed_instruction(raw);
    let next_pc = execute(access, pc, instr)?;

    write_canonical(access, shadow::uarch_pc_address(), next_pc)?;
    write_canonical(
        access,
        shadow::uarch_cycle_address(),
        cycle.wrapping_add(1),
    )?;
    Ok(false)
}

/// Execute one RV64I instruction, returning the next program counter.
/// The uarch has no traps: anything outside its tiny ISA marks the
/// program, and therefore the machine state, as inconsistent.
fn execute(
    access: &mut impl UarchAccess,
    pc: u64,
    instr: Instr,
) -> Result<u64, MachineError> {
    use Instr::*;

    let next = pc.wrapping_add(4);
    match instr {
        Add(a) => {
            let v = read_x(access, a.rs1)?.wrapping_add(read_x(access, a.rs2)?);
            write_x(access, a.rd, v)?;
        }
        Sub(a) => {
            let v = read_x(access, a.rs1)?.wrapping_sub(read_x(access, a.rs2)?);
            write_x(access, a.rd, v)?;
        }
        Xor(a) => {
            let v = read_x(access, a.rs1)? ^ read_x(access, a.rs2)?;
            write_x(access, a.rd, v)?;
        }
        Or(a) => {
            let v = read_x(access, a.rs1)? | read_x(access, a.rs2)?;
            write_x(access, a.rd, v)?;
        }
        And(a) => {
            let v = read_x(access, a.rs1)? & read_x(access, a.rs2)?;
            write_x(access, a.rd, v)?;
        }
        Sll(a) => {
            let v = read_x(access, a.rs1)? << (read_x(access, a.rs2)? & 0x3F);
            write_x(access, a.rd, v)?;
        }
        Srl(a) => {
            let v = read_x(access, a.rs1)? >> (read_x(access, a.rs2)? & 0x3F);
            write_x(access, a.rd, v)?;
        }
        Sra(a) => {
            let v = (read_x(access, a.rs1)? as i64) >> (read_x(access, a.rs2)? & 0x3F);
            write_x(access, a.rd, v as u64)?;
        }
        Slt(a) => {
            let v = (read_x(access, a.rs1)? as i64) < (read_x(access, a.rs2)? as i64);
            write_x(access, a.rd, v as u64)?;
        }
        Sltu(a) => {
            let v = read_x(access, a.rs1)? < read_x(access, a.rs2)?;
            write_x(access, a.rd, v as u64)?;
        }
        Addw(a) => {
            let v = read_x(access, a.rs1)?.wrapping_add(read_x(access, a.rs2)?);
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Subw(a) => {
            let v = read_x(access, a.rs1)?.wrapping_sub(read_x(access, a.rs2)?);
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Sllw(a) => {
            let v = (read_x(access, a.rs1)? as u32) << (read_x(access, a.rs2)? & 0x1F);
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Srlw(a) => {
            let v = (read_x(access, a.rs1)? as u32) >> (read_x(access, a.rs2)? & 0x1F);
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Sraw(a) => {
            let v = (read_x(access, a.rs1)? as i32) >> (read_x(access, a.rs2)? & 0x1F);
            write_x(access, a.rd, v as u64)?;
        }

        Addi(a) => {
            let v = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            write_x(access, a.rd, v)?;
        }
        Addiw(a) => {
            let v = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Xori(a) => {
            let v = read_x(access, a.rs1)? ^ a.imm as u64;
            write_x(access, a.rd, v)?;
        }
        Ori(a) => {
            let v = read_x(access, a.rs1)? | a.imm as u64;
            write_x(access, a.rd, v)?;
        }
        Andi(a) => {
            let v = read_x(access, a.rs1)? & a.imm as u64;
            write_x(access, a.rd, v)?;
        }
        Slli(a) => {
            let v = read_x(access, a.rs1)? << a.imm;
            write_x(access, a.rd, v)?;
        }
        Srli(a) => {
            let v = read_x(access, a.rs1)? >> a.imm;
            write_x(access, a.rd, v)?;
        }
        Srai(a) => {
            let v = (read_x(access, a.rs1)? as i64) >> (a.imm & 0x3F);
            write_x(access, a.rd, v as u64)?;
        }
        Slliw(a) => {
            let v = (read_x(access, a.rs1)? as u32) << a.imm;
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Srliw(a) => {
            let v = (read_x(access, a.rs1)? as u32) >> a.imm;
            write_x(access, a.rd, v as i32 as u64)?;
        }
        Sraiw(a) => {
            let v = (read_x(access, a.rs1)? as i32) >> (a.imm & 0x1F);
            write_x(access, a.rd, v as u64)?;
        }
        Slti(a) => {
            let v = (read_x(access, a.rs1)? as i64) < a.imm;
            write_x(access, a.rd, v as u64)?;
        }
        Sltiu(a) => {
            let v = read_x(access, a.rs1)? < a.imm as u64;
            write_x(access, a.rd, v as u64)?;
        }

        Lui(a) => write_x(access, a.rd, a.imm as u64)?,
        Auipc(a) => write_x(access, a.rd, pc.wrapping_add(a.imm as u64))?,

        Lb(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 0)?;
            write_x(access, a.rd, v as u8 as i8 as u64)?;
        }
        Lh(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 1)?;
            write_x(access, a.rd, v as u16 as i16 as u64)?;
        }
        Lw(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 2)?;
            write_x(access, a.rd, v as u32 as i32 as u64)?;
        }
        Ld(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 3)?;
            write_x(access, a.rd, v)?;
        }
        Lbu(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 0)?;
            write_x(access, a.rd, v)?;
        }
        Lhu(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 1)?;
            write_x(access, a.rd, v)?;
        }
        Lwu(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = load_sized(access, addr, 2)?;
            write_x(access, a.rd, v)?;
        }

        Sb(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = read_x(access, a.rs2)?;
            store_sized(access, addr, 0, v & 0xFF)?;
        }
        Sh(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = read_x(access, a.rs2)?;
            store_sized(access, addr, 1, v & 0xFFFF)?;
        }
        Sw(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = read_x(access, a.rs2)?;
            store_sized(access, addr, 2, v & 0xFFFF_FFFF)?;
        }
        Sd(a) => {
            let addr = read_x(access, a.rs1)?.wrapping_add(a.imm as u64);
            let v = read_x(access, a.rs2)?;
            store_sized(access, addr, 3, v)?;
        }

        Beq(a) => {
            if read_x(access, a.rs1)? == read_x(access, a.rs2)? {
                return Ok(pc.wrapping_add(a.imm as u64));
            }
        }
        Bne(a) => {
            if read_x(access, a.rs1)? != read_x(access, a.rs2)? {
                return Ok(pc.wrapping_add(a.imm as u64));
            }
        }
        Blt(a) => {
            if (read_x(access, a.rs1)? as i64) < (read_x(access, a.rs2)? as i64) {
                return Ok(pc.wrapping_add(a.imm as u64));
            }
        }
        Bge(a) => {
            if (read_x(access, a.rs1)? as i64) >= (read_x(access, a.rs2)? as i64) {
                return Ok(pc.wrapping_add(a.imm as u64));
            }
        }
        Bltu(a) => {
            if read_x(access, a.rs1)? < read_x(access, a.rs2)? {
                return Ok(pc.wrapping_add(a.imm as u64));
            }
        }
        Bgeu(a) => {
            if read_x(access, a.rs1)? >= read_x(access, a.rs2)? {
                return Ok(pc.wrapping_add(a.imm as u64));
            }
        }

        Jal(a) => {
            write_x(access, a.rd, next)?;
            return Ok(pc.wrapping_add(a.imm as u64));
        }
        Jalr(a) => {
            let target = read_x(access, a.rs1)?.wrapping_add(a.imm as u64) & !1;
            write_x(access, a.rd, next)?;
            return Ok(target);
        }

        Fence(_) | FenceTso(_) | FenceI => {}

        _ => return Err(bad_program(pc, "unsupported instruction")),
    }

    Ok(next)
}

/// Accesses beyond the word-granular [UarchAccess] contract that only the
/// logged reset needs.
pub(crate) trait LoggedAccessExt: UarchAccess {
    fn write_page(&mut self, paddr: u64, content: &[u8]) -> Result<(), MachineError>;
}

/// Write the boot values of the uarch registers through `access`. Shared
/// between the reset logger and its replaying verifier so both agree on
/// the exact access sequence.
pub(crate) fn uarch_reset_registers(
    access: &mut impl UarchAccess,
) -> Result<(), MachineError> {
    for index in 1..UARCH_X_REG_COUNT {
        access.write_word(shadow::uarch_x_address(index), 0)?;
    }
    access.write_word(shadow::uarch_pc_address(), UARCH_RESET_PC)?;
    access.write_word(shadow::uarch_cycle_address(), 0)?;
    access.write_word(shadow::uarch_halt_address(), 0)?;
    Ok(())
}

/// Run the uarch until it halts or `cycle_end` is reached.
pub(crate) fn run_uarch(
    state: &mut MachineState,
    cycle_end: u64,
) -> Result<UarchBreakReason, MachineError> {
    while state.uarch.cycle < cycle_end {
        let mut access = DirectAccess {
            state: &mut *state,
        };
        if uarch_step(&mut access)? {
            return Ok(UarchBreakReason::Halted);
        }
        if state.uarch.halt {
            return Ok(UarchBreakReason::Halted);
        }
    }
    Ok(UarchBreakReason::ReachedTargetCycle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        machine_state::registers::{x1, x2},
        pma::{PmaDid, PmaEntry, PmaFlags, UARCH_SHADOW_LENGTH, UARCH_SHADOW_START},
    };

    fn uarch_state(program: &[u32]) -> MachineState {
        let mut state = MachineState::new();
        let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        state
            .pmas
            .register(
                PmaEntry::new_memory(
                    UARCH_RAM_START,
                    0x1000,
                    PmaFlags::ram(),
                    PmaDid::UarchRam,
                    Some(&image),
                )
                .unwrap(),
            )
            .unwrap();
        state
            .pmas
            .register(PmaEntry::device(
                UARCH_SHADOW_START,
                UARCH_SHADOW_LENGTH,
                crate::pma::DeviceKind::UarchShadow,
                PmaDid::UarchShadow,
            ))
            .unwrap();
        state
    }

    #[test]
    fn test_simple_program() {
        // addi x1, x0, 5 ; addi x2, x1, 7
        let mut state = uarch_state(&[0x0050_0093, 0x0070_8113]);

        let reason = run_uarch(&mut state, 2).unwrap();
        assert_eq!(reason, UarchBreakReason::ReachedTargetCycle);
        assert_eq!(state.uarch.read_x(x1.index()), 5);
        assert_eq!(state.uarch.read_x(x2.index()), 12);
        assert_eq!(state.uarch.cycle, 2);
        assert_eq!(state.uarch.pc, UARCH_RESET_PC + 8);
    }

    #[test]
    fn test_halt_via_shadow_store() {
        // addi x1, x0, 1 ; sd x1, 0(x2) with x2 preloaded with the
        // halt-flag shadow address
        let mut state = uarch_state(&[
            0x0010_0093, // addi x1, x0, 1
            0x0011_3023, // sd x1, 0(x2)
        ]);
        state.uarch.write_x(2, shadow::uarch_halt_address());

        let reason = run_uarch(&mut state, 10).unwrap();
        assert_eq!(reason, UarchBreakReason::Halted);
        assert!(state.uarch.halt);
        // The halting store happened on cycle 2; the halted check stops the
        // machine before cycle 3.
        assert_eq!(state.uarch.cycle, 2);
    }

    #[test]
    fn test_x0_writes_are_discarded() {
        // addi x0, x0, 42
        let mut state = uarch_state(&[0x02A0_0013]);
        run_uarch(&mut state, 1).unwrap();
        assert_eq!(state.uarch.read_x(0), 0);
    }

    #[test]
    fn test_unsupported_instruction_is_an_engine_error() {
        // An atomic instruction is outside the uarch ISA.
        let mut state = uarch_state(&[0x1005_2537]); // lui is fine
        state.write_word(UARCH_RAM_START, 0x0000_302F).unwrap(); // amoadd.w-ish
        assert!(run_uarch(&mut state, 1).is_err());
    }

    #[test]
    fn test_canonical_halt_write() {
        assert_eq!(
            canonical_committed(shadow::uarch_halt_address(), 5),
            Some(1)
        );
        assert_eq!(canonical_committed(shadow::uarch_x_address(0), 7), None);
        assert_eq!(canonical_committed(UARCH_RAM_START, 7), Some(7));
    }
}
