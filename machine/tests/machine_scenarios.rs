// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! End-to-end scenarios driving the machine through its public API.

use merkle_machine::{
    config::MachineConfig,
    merkle::hash_data,
    pma::{HTIF_START, RAM_START},
    BreakReason, Machine, MachineCsr,
};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Console sink the tests can inspect.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

// lui t0, 0x40008 ; t0 = HTIF base
const LUI_T0_HTIF: u32 = 0x4000_82B7;
// addi t1, zero, 1
const ADDI_T1_1: u32 = 0x0010_0313;
// sd t1, 0(t0)
const SD_T1_T0: u32 = 0x0062_B023;
// jal zero, 0 (spin)
const SPIN: u32 = 0x0000_006F;

fn machine_with_rom(rom: &[u32]) -> Machine {
    let mut config = MachineConfig::default();
    config.ram.length = 0x10000;
    config.rom.image = assemble(rom);
    Machine::new(config).unwrap()
}

#[test]
fn test_halt_via_htif() {
    // The ROM writes tohost = (0 << 56) | (0 << 48) | 1 and would spin
    // forever if the halt were not taken.
    let mut machine = machine_with_rom(&[LUI_T0_HTIF, ADDI_T1_1, SD_T1_T0, SPIN]);

    let reason = machine.run(u64::MAX);
    assert_eq!(reason, BreakReason::Halted);
    assert!(machine.read_iflags_h());
    // The halt payload stays readable.
    assert_eq!(machine.read_htif_tohost(), 1);
    // Re-running a halted machine returns immediately.
    assert_eq!(machine.run(u64::MAX), BreakReason::Halted);
}

#[test]
fn test_putchar() {
    // tohost = (1 << 56) | (1 << 48) | 'A', then halt.
    let mut machine = machine_with_rom(&[
        LUI_T0_HTIF,
        0x1010_0313, // addi t1, zero, 0x101
        0x0303_1313, // slli t1, t1, 48
        0x0413_0313, // addi t1, t1, 0x41
        SD_T1_T0,    // putchar
        0x0010_0393, // addi t2, zero, 1
        0x0072_B023, // sd t2, 0(t0) -- halt
    ]);
    let sink = Sink::default();
    machine.set_console_sink(Box::new(sink.clone()));

    let reason = machine.run(u64::MAX);
    assert_eq!(reason, BreakReason::Halted);
    assert_eq!(*sink.0.lock().unwrap(), b"A");
    // The putchar was acknowledged before the halt command overwrote
    // tohost.
    assert_eq!(machine.read_htif_fromhost(), (1 << 56) | (1 << 48));
}

#[test]
fn test_timer_interrupt() {
    // With mtimecmp = 10 the timer fires at mcycle = 1000. The hart spins
    // at the ROM base with machine timer interrupts enabled.
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    // pc = 0x1000 spins; the trap handler at 0x1008 spins too.
    config.rom.image = assemble(&[SPIN, SPIN, SPIN]);
    config.processor.mtvec = 0x1008;
    config.processor.mie = 1 << 7; // MTIE
    config.processor.mstatus = 1 << 3; // MIE
    config.clint.mtimecmp = 10;
    let mut machine = Machine::new(config).unwrap();

    let reason = machine.run(2000);
    assert_eq!(reason, BreakReason::ReachedTargetMcycle);

    assert_eq!(machine.read_csr(MachineCsr::mcause), 0x8000_0000_0000_0007);
    assert_eq!(machine.read_csr(MachineCsr::mepc), 0x1000);
    assert_eq!(machine.read_pc(), 0x1008);
}

#[test]
fn test_lr_sc_success_then_fail() {
    let mut config = MachineConfig::default();
    config.ram.length = 0x2000;
    config.processor.pc = RAM_START;
    // lui sign-extends on RV64, so t0 = 0x8000_0000 is built with a
    // logical shift pair instead.
    config.ram.image = assemble(&[
        0x8000_02B7, // lui t0, 0x80000
        0x0202_9293, // slli t0, t0, 32
        0x0202_D293, // srli t0, t0, 32 -> t0 = 0x8000_0000
        0x1002_B32F, // lr.d t1, (t0)
        0x1862_B3AF, // sc.d t2, t1, (t0) -- succeeds
        0x1862_BE2F, // sc.d t3, t1, (t0) -- fails
        0x4000_8EB7, // lui t4, 0x40008
        0x0010_0F13, // addi t5, zero, 1
        0x01EE_B023, // sd t5, 0(t4) -- halt
    ]);
    let mut machine = Machine::new(config).unwrap();

    let reason = machine.run(u64::MAX);
    assert_eq!(reason, BreakReason::Halted);

    // SC.D wrote 0 on success, 1 on the retry without a reservation.
    assert_eq!(machine.read_x(7), 0, "first sc.d must succeed");
    assert_eq!(machine.read_x(28), 1, "second sc.d must fail");
}

#[test]
fn test_proof_round_trip() {
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    config.ram.image = 0x0123_4567_89AB_CDEF_u64.to_le_bytes().to_vec();
    let mut machine = Machine::new(config).unwrap();

    let proof = machine.get_proof(RAM_START, 3).unwrap();
    assert_eq!(
        proof.target_hash,
        hash_data(&0x0123_4567_89AB_CDEF_u64.to_le_bytes(), 3)
    );
    assert_eq!(proof.root_hash, machine.root_hash().unwrap());
    assert!(proof.verify());
}

#[test]
fn test_determinism() {
    let mut config = MachineConfig::default();
    config.ram.length = 0x4000;
    config.rom.image = assemble(&[
        0x0010_0313, // addi t1, zero, 1
        0x0063_0333, // add t1, t1, t1
        SPIN,
    ]);

    let mut a = Machine::new(config.clone()).unwrap();
    let mut b = Machine::new(config).unwrap();

    for target in [1, 2, 3, 100] {
        a.run(target);
        b.run(target);
        assert_eq!(
            a.root_hash().unwrap(),
            b.root_hash().unwrap(),
            "machines diverged at mcycle target {target}"
        );
    }
}

#[test]
fn test_registers_are_addressable() {
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    let mut machine = Machine::new(config).unwrap();

    machine.write_x(5, 0xABCD);
    assert_eq!(machine.read_x(5), 0xABCD);
    assert_eq!(
        machine
            .read_word(merkle_machine::shadow::x_address(5))
            .unwrap(),
        0xABCD
    );

    // x0 stays hardwired.
    machine.write_x(0, 7);
    assert_eq!(machine.read_x(0), 0);

    machine.write_f(3, 0x1234);
    assert_eq!(machine.read_f(3), 0x1234);
}

#[test]
fn test_wfi_skips_to_timer() {
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    config.rom.image = assemble(&[
        0x1050_0073, // wfi
        SPIN,
    ]);
    config.processor.mie = 1 << 7;
    config.processor.mstatus = 1 << 3;
    config.processor.mtvec = 0x1004;
    config.clint.mtimecmp = 50; // fires at mcycle 5000
    let mut machine = Machine::new(config).unwrap();

    let reason = machine.run(10_000);
    assert_eq!(reason, BreakReason::ReachedTargetMcycle);
    // The idle skip jumped the clock to the deadline rather than
    // simulating 5000 empty cycles one by one, and the trap was taken.
    assert_eq!(machine.read_csr(MachineCsr::mcause), 0x8000_0000_0000_0007);
    assert!(machine.read_mcycle() >= 5000);
}

#[test]
fn test_replace_memory_range() {
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    config.flash_drives.push(merkle_machine::config::FlashDriveConfig {
        start: 0x9000_0000,
        length: 0x1000,
        shared: false,
        image: vec![1, 2, 3],
    });
    let mut machine = Machine::new(config).unwrap();
    assert_eq!(machine.read_memory(0x9000_0000, 3).unwrap(), vec![1, 2, 3]);

    let before = machine.root_hash().unwrap();
    machine
        .replace_memory_range(0x9000_0000, 0x1000, Some(&[9, 9]))
        .unwrap();
    assert_eq!(machine.read_memory(0x9000_0000, 3).unwrap(), vec![9, 9, 0]);
    assert_ne!(machine.root_hash().unwrap(), before);

    // Only an exact (start, length) match may be replaced.
    assert!(machine.replace_memory_range(0x9000_0000, 0x2000, None).is_err());
    assert!(machine
        .replace_memory_range(HTIF_START, 0x1000, None)
        .is_err());
}

#[test]
fn test_console_input_reaches_guest_only_when_enabled() {
    // Reproducible mode: the queue is never consulted.
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    config.rom.image = assemble(&[SPIN]);
    let mut machine = Machine::new(config).unwrap();
    machine.push_console_input(b"x");
    machine.run(1000);
    assert_eq!(machine.read_htif_fromhost(), 0);

    // Interactive mode: the rate-limited poll delivers a byte after
    // enough outer-loop iterations.
    let mut config = MachineConfig::default();
    config.ram.length = 0x1000;
    config.rom.image = assemble(&[SPIN]);
    config.htif.console_getchar = true;
    let mut machine = Machine::new(config).unwrap();
    machine.push_console_input(b"x");
    for i in 1..=20 {
        machine.run(i * 10);
    }
    assert_eq!(machine.read_htif_fromhost(), (1 << 56) | b'x' as u64);
}
