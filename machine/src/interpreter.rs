// SPDX-FileCopyrightText: 2024 Nomadic Labs <contact@nomadic-labs.com>
// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Instruction fetch/decode/execute loop.
//!
//! The inner loop retires one instruction at a time: interrupts are
//! checked, the instruction at `pc` is fetched through the code TLB,
//! decoded, executed, and the counters advanced. Architectural faults are
//! delivered as traps to the guest; they never surface to the host API.

pub(crate) mod float;
mod rv64a;
mod rv64i;
mod rv64m;
mod rv64priv;
mod rv64zicsr;

use crate::{
    machine_state::{csregisters::xstatus, mode::Mode, MachineState},
    parser::{
        instruction::{Instr, InstrWidth},
        parse,
    },
    rtc,
    traps::{Exception, Interrupt, CAUSE_INTERRUPT_BIT},
};

/// Effect an instruction has on the program counter.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProgramCounterUpdate {
    /// Jump to an absolute address
    Set(u64),
    /// Proceed to the next instruction
    Next(InstrWidth),
}

use ProgramCounterUpdate::{Next, Set};

/// Why the interpreter loop stopped.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BreakReason {
    /// The machine halted permanently (HTIF halt)
    Halted,
    /// The guest yielded through the HTIF yield device, manual command
    YieldedManually,
    /// The guest yielded through the HTIF yield device, automatic command
    YieldedAutomatically,
    /// `mcycle` reached the requested target
    ReachedTargetMcycle,
}

impl MachineState {
    /// Highest-priority interrupt that is pending, enabled, and deliverable
    /// in the current mode.
    pub(crate) fn pending_interrupt(&self) -> Option<Interrupt> {
        let pending = self.csregisters.mip & self.csregisters.mie;
        if pending == 0 {
            return None;
        }

        let mideleg = self.csregisters.mideleg;
        let mstatus = self.csregisters.mstatus;

        let m_enabled = match self.mode {
            Mode::Machine => xstatus::get_MIE(mstatus),
            _ => true,
        };
        let s_enabled = match self.mode {
            Mode::Machine => false,
            Mode::Supervisor => xstatus::get_SIE(mstatus),
            Mode::User => true,
        };

        let mut deliverable = 0;
        if m_enabled {
            deliverable |= pending & !mideleg;
        }
        if s_enabled {
            deliverable |= pending & mideleg;
        }

        Interrupt::PRIORITY
            .into_iter()
            .find(|interrupt| deliverable & interrupt.mask() != 0)
    }

    /// Deliver a trap per the privileged spec: select the target mode from
    /// the delegation registers, stash pc/cause/tval, stack the interrupt
    /// enable, and redirect to the trap vector.
    fn take_trap(&mut self, is_interrupt: bool, code: u64, trap_value: u64) {
        // A trap tears down any LR reservation.
        self.reservation_clear();

        let deleg = if is_interrupt {
            self.csregisters.mideleg
        } else {
            self.csregisters.medeleg
        };
        let to_supervisor = self.mode != Mode::Machine && deleg & (1 << code) != 0;

        let cause = if is_interrupt {
            CAUSE_INTERRUPT_BIT | code
        } else {
            code
        };

        if to_supervisor {
            self.csregisters.sepc = self.pc;
            self.csregisters.scause = cause;
            self.csregisters.stval = trap_value;

            let mstatus = self.csregisters.mstatus;
            let mstatus = xstatus::set_SPIE(mstatus, xstatus::get_SIE(mstatus));
            let mstatus = xstatus::set_SIE(mstatus, false);
            let mstatus = xstatus::set_SPP(
                mstatus,
                match self.mode {
                    Mode::Supervisor => xstatus::SPPValue::Supervisor,
                    _ => xstatus::SPPValue::User,
                },
            );
            self.csregisters.mstatus = mstatus;
            self.mode = Mode::Supervisor;
            // The mode change invalidates cached translations.
            self.tlb.flush();
            self.pc = trap_vector(self.csregisters.stvec, is_interrupt, code);
        } else {
            self.csregisters.mepc = self.pc;
            self.csregisters.mcause = cause;
            self.csregisters.mtval = trap_value;

            let mstatus = self.csregisters.mstatus;
            let mstatus = xstatus::set_MPIE(mstatus, xstatus::get_MIE(mstatus));
            let mstatus = xstatus::set_MIE(mstatus, false);
            let mstatus = xstatus::set_MPP(mstatus, self.mode.into());
            self.csregisters.mstatus = mstatus;
            self.mode = Mode::Machine;
            self.tlb.flush();
            self.pc = trap_vector(self.csregisters.mtvec, is_interrupt, code);
        }
    }

    fn take_exception(&mut self, exception: Exception) {
        self.take_trap(false, exception.code(), exception.trap_value());
    }

    fn take_interrupt(&mut self, interrupt: Interrupt) {
        self.iflags.i = false;
        self.take_trap(true, interrupt.code(), 0);
    }

    /// Fetch, decode and execute the instruction at `pc`.
    fn step_instr(&mut self) -> Result<ProgramCounterUpdate, Exception> {
        let pc = self.pc;
        if pc & 1 != 0 {
            return Err(Exception::InstructionAddressMisaligned(pc));
        }

        let first = self.fetch_u16(pc)?;
        let (instr, width) = parse(first, || self.fetch_u16(pc.wrapping_add(2)))?;
        self.run_instr(instr, width)
    }

    /// Retire a single instruction: execute, update pc, bump the counters.
    /// A raised exception is delivered as a trap and still consumes a cycle
    /// without retiring.
    pub(crate) fn step(&mut self) {
        match self.step_instr() {
            Ok(update) => {
                match update {
                    Set(address) => self.pc = address,
                    Next(width) => self.pc = self.pc.wrapping_add(width as u64),
                }
                self.csregisters.minstret = self.csregisters.minstret.wrapping_add(1);
            }
            Err(exception) => self.take_exception(exception),
        }
        self.csregisters.mcycle = self.csregisters.mcycle.wrapping_add(1);
    }

    /// Run the machine until `mcycle` reaches `mcycle_end`, the machine
    /// halts, or the guest yields.
    pub fn run(&mut self, mcycle_end: u64) -> BreakReason {
        // The externally-interrupted flag is transient: a new run clears it.
        self.iflags.x = false;
        self.set_brk();

        loop {
            if self.iflags.h {
                return BreakReason::Halted;
            }
            if self.iflags.y {
                return BreakReason::YieldedManually;
            }
            if self.iflags.x {
                return BreakReason::YieldedAutomatically;
            }
            if self.csregisters.mcycle >= mcycle_end {
                return BreakReason::ReachedTargetMcycle;
            }

            self.poll_clint_timer();
            self.htif_interact();

            if let Some(interrupt) = self.pending_interrupt() {
                self.take_interrupt(interrupt);
            }

            if self.iflags.i {
                // Waiting for an interrupt: jump the clock forward to the
                // next event instead of idling cycle by cycle.
                let timer_cycle = rtc::time_to_cycle(self.clint.mtimecmp);
                self.csregisters.mcycle = if timer_cycle > self.csregisters.mcycle {
                    timer_cycle.min(mcycle_end)
                } else {
                    mcycle_end
                };
                continue;
            }

            // Run the inner loop up to the next point of interest: the cycle
            // target or the timer deadline, whichever comes first.
            let timer_cycle = rtc::time_to_cycle(self.clint.mtimecmp);
            let bound = if timer_cycle > self.csregisters.mcycle {
                timer_cycle.min(mcycle_end)
            } else {
                mcycle_end
            };

            while self.csregisters.mcycle < bound {
                self.step();
                if self.brk || self.iflags.i {
                    break;
                }
            }
        }
    }

    /// Execute a parsed instruction.
    pub(crate) fn run_instr(
        &mut self,
        instr: Instr,
        width: InstrWidth,
    ) -> Result<ProgramCounterUpdate, Exception> {
        use Instr::*;

        let next = Ok(Next(width));
        let xregs = &mut self.xregisters;

        match instr {
            // RV64I R-type
            Add(args) => {
                xregs.run_add(args.rs1, args.rs2, args.rd);
                next
            }
            Sub(args) => {
                xregs.run_sub(args.rs1, args.rs2, args.rd);
                next
            }
            Xor(args) => {
                xregs.run_xor(args.rs1, args.rs2, args.rd);
                next
            }
            Or(args) => {
                xregs.run_or(args.rs1, args.rs2, args.rd);
                next
            }
            And(args) => {
                xregs.run_and(args.rs1, args.rs2, args.rd);
                next
            }
            Sll(args) => {
                xregs.run_sll(args.rs1, args.rs2, args.rd);
                next
            }
            Srl(args) => {
                xregs.run_srl(args.rs1, args.rs2, args.rd);
                next
            }
            Sra(args) => {
                xregs.run_sra(args.rs1, args.rs2, args.rd);
                next
            }
            Slt(args) => {
                xregs.run_slt(args.rs1, args.rs2, args.rd);
                next
            }
            Sltu(args) => {
                xregs.run_sltu(args.rs1, args.rs2, args.rd);
                next
            }
            Addw(args) => {
                xregs.run_addw(args.rs1, args.rs2, args.rd);
                next
            }
            Subw(args) => {
                xregs.run_subw(args.rs1, args.rs2, args.rd);
                next
            }
            Sllw(args) => {
                xregs.run_sllw(args.rs1, args.rs2, args.rd);
                next
            }
            Srlw(args) => {
                xregs.run_srlw(args.rs1, args.rs2, args.rd);
                next
            }
            Sraw(args) => {
                xregs.run_sraw(args.rs1, args.rs2, args.rd);
                next
            }

            // RV64I I-type
            Addi(args) => {
                xregs.run_addi(args.imm, args.rs1, args.rd);
                next
            }
            Addiw(args) => {
                xregs.run_addiw(args.imm, args.rs1, args.rd);
                next
            }
            Xori(args) => {
                xregs.run_xori(args.imm, args.rs1, args.rd);
                next
            }
            Ori(args) => {
                xregs.run_ori(args.imm, args.rs1, args.rd);
                next
            }
            Andi(args) => {
                xregs.run_andi(args.imm, args.rs1, args.rd);
                next
            }
            Slli(args) => {
                xregs.run_slli(args.imm, args.rs1, args.rd);
                next
            }
            Srli(args) => {
                xregs.run_srli(args.imm, args.rs1, args.rd);
                next
            }
            Srai(args) => {
                xregs.run_srai(args.imm, args.rs1, args.rd);
                next
            }
            Slliw(args) => {
                xregs.run_slliw(args.imm, args.rs1, args.rd);
                next
            }
            Srliw(args) => {
                xregs.run_srliw(args.imm, args.rs1, args.rd);
                next
            }
            Sraiw(args) => {
                xregs.run_sraiw(args.imm, args.rs1, args.rd);
                next
            }
            Slti(args) => {
                xregs.run_slti(args.imm, args.rs1, args.rd);
                next
            }
            Sltiu(args) => {
                xregs.run_sltiu(args.imm, args.rs1, args.rd);
                next
            }
            Lui(args) => {
                xregs.run_lui(args.imm, args.rd);
                next
            }

            // Loads and stores
            Lb(args) => {
                self.run_lb(args.imm, args.rs1, args.rd)?;
                next
            }
            Lh(args) => {
                self.run_lh(args.imm, args.rs1, args.rd)?;
                next
            }
            Lw(args) => {
                self.run_lw(args.imm, args.rs1, args.rd)?;
                next
            }
            Ld(args) => {
                self.run_ld(args.imm, args.rs1, args.rd)?;
                next
            }
            Lbu(args) => {
                self.run_lbu(args.imm, args.rs1, args.rd)?;
                next
            }
            Lhu(args) => {
                self.run_lhu(args.imm, args.rs1, args.rd)?;
                next
            }
            Lwu(args) => {
                self.run_lwu(args.imm, args.rs1, args.rd)?;
                next
            }
            Sb(args) => {
                self.run_sb(args.imm, args.rs1, args.rs2)?;
                next
            }
            Sh(args) => {
                self.run_sh(args.imm, args.rs1, args.rs2)?;
                next
            }
            Sw(args) => {
                self.run_sw(args.imm, args.rs1, args.rs2)?;
                next
            }
            Sd(args) => {
                self.run_sd(args.imm, args.rs1, args.rs2)?;
                next
            }

            // Branches and jumps
            Beq(args) => Ok(self.run_beq(args.imm, args.rs1, args.rs2, width)),
            Bne(args) => Ok(self.run_bne(args.imm, args.rs1, args.rs2, width)),
            Blt(args) => Ok(self.run_blt(args.imm, args.rs1, args.rs2, width)),
            Bge(args) => Ok(self.run_bge(args.imm, args.rs1, args.rs2, width)),
            Bltu(args) => Ok(self.run_bltu(args.imm, args.rs1, args.rs2, width)),
            Bgeu(args) => Ok(self.run_bgeu(args.imm, args.rs1, args.rs2, width)),
            Auipc(args) => {
                self.run_auipc(args.imm, args.rd);
                next
            }
            Jal(args) => Ok(Set(self.run_jal(args.imm, args.rd, width))),
            Jalr(args) => Ok(Set(self.run_jalr(args.imm, args.rs1, args.rd, width))),

            // Fences
            Fence(args) => {
                self.run_fence(args.pred, args.succ);
                next
            }
            FenceTso(args) => {
                self.run_fence(args.pred, args.succ);
                next
            }
            FenceI => {
                self.run_fence_i();
                next
            }

            // System
            Ecall => Err(self.run_ecall()),
            Ebreak => Err(Exception::Breakpoint),
            Sret => self.run_sret().map(Set),
            Mret => self.run_mret().map(Set),
            Wfi => {
                self.run_wfi()?;
                next
            }
            SFenceVma { vaddr, asid } => {
                self.run_sfence_vma(vaddr, asid)?;
                next
            }

            // RV64M
            Mul(args) => {
                xregs.run_mul(args.rs1, args.rs2, args.rd);
                next
            }
            Mulh(args) => {
                xregs.run_mulh(args.rs1, args.rs2, args.rd);
                next
            }
            Mulhsu(args) => {
                xregs.run_mulhsu(args.rs1, args.rs2, args.rd);
                next
            }
            Mulhu(args) => {
                xregs.run_mulhu(args.rs1, args.rs2, args.rd);
                next
            }
            Div(args) => {
                xregs.run_div(args.rs1, args.rs2, args.rd);
                next
            }
            Divu(args) => {
                xregs.run_divu(args.rs1, args.rs2, args.rd);
                next
            }
            Rem(args) => {
                xregs.run_rem(args.rs1, args.rs2, args.rd);
                next
            }
            Remu(args) => {
                xregs.run_remu(args.rs1, args.rs2, args.rd);
                next
            }
            Mulw(args) => {
                xregs.run_mulw(args.rs1, args.rs2, args.rd);
                next
            }
            Divw(args) => {
                xregs.run_divw(args.rs1, args.rs2, args.rd);
                next
            }
            Divuw(args) => {
                xregs.run_divuw(args.rs1, args.rs2, args.rd);
                next
            }
            Remw(args) => {
                xregs.run_remw(args.rs1, args.rs2, args.rd);
                next
            }
            Remuw(args) => {
                xregs.run_remuw(args.rs1, args.rs2, args.rd);
                next
            }

            // RV64A
            Lrw(args) => {
                self.run_lrw(args.rs1, args.rd)?;
                next
            }
            Scw(args) => {
                self.run_scw(args.rs1, args.rs2, args.rd)?;
                next
            }
            Lrd(args) => {
                self.run_lrd(args.rs1, args.rd)?;
                next
            }
            Scd(args) => {
                self.run_scd(args.rs1, args.rs2, args.rd)?;
                next
            }
            Amoswapw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, |_, b| b)?;
                next
            }
            Amoaddw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, i32::wrapping_add)?;
                next
            }
            Amoxorw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, |a, b| a ^ b)?;
                next
            }
            Amoandw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, |a, b| a & b)?;
                next
            }
            Amoorw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, |a, b| a | b)?;
                next
            }
            Amominw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, i32::min)?;
                next
            }
            Amomaxw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, i32::max)?;
                next
            }
            Amominuw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, |a, b| {
                    (a as u32).min(b as u32) as i32
                })?;
                next
            }
            Amomaxuw(args) => {
                self.run_amo_w(args.rs1, args.rs2, args.rd, |a, b| {
                    (a as u32).max(b as u32) as i32
                })?;
                next
            }
            Amoswapd(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, |_, b| b)?;
                next
            }
            Amoaddd(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, u64::wrapping_add)?;
                next
            }
            Amoxord(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, |a, b| a ^ b)?;
                next
            }
            Amoandd(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, |a, b| a & b)?;
                next
            }
            Amoord(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, |a, b| a | b)?;
                next
            }
            Amomind(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, |a, b| {
                    (a as i64).min(b as i64) as u64
                })?;
                next
            }
            Amomaxd(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, |a, b| {
                    (a as i64).max(b as i64) as u64
                })?;
                next
            }
            Amominud(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, u64::min)?;
                next
            }
            Amomaxud(args) => {
                self.run_amo_d(args.rs1, args.rs2, args.rd, u64::max)?;
                next
            }

            // Zicsr
            Csrrw(args) => {
                self.run_csrrw(args.csr, args.rs1, args.rd)?;
                next
            }
            Csrrs(args) => {
                self.run_csrrs(args.csr, args.rs1, args.rd)?;
                next
            }
            Csrrc(args) => {
                self.run_csrrc(args.csr, args.rs1, args.rd)?;
                next
            }
            Csrrwi(args) => {
                self.run_csrrwi(args.csr, args.imm as u64, args.rd)?;
                next
            }
            Csrrsi(args) => {
                self.run_csrrsi(args.csr, args.imm as u64, args.rd)?;
                next
            }
            Csrrci(args) => {
                self.run_csrrci(args.csr, args.imm as u64, args.rd)?;
                next
            }

            // RV64F/D
            Flw(args) => {
                self.run_flw(args.imm, args.rs1, args.rd)?;
                next
            }
            Fld(args) => {
                self.run_fld(args.imm, args.rs1, args.rd)?;
                next
            }
            Fsw(args) => {
                self.run_fsw(args.imm, args.rs1, args.rs2)?;
                next
            }
            Fsd(args) => {
                self.run_fsd(args.imm, args.rs1, args.rs2)?;
                next
            }
            Fadds(args) => {
                self.run_fadd_s(args)?;
                next
            }
            Fsubs(args) => {
                self.run_fsub_s(args)?;
                next
            }
            Fmuls(args) => {
                self.run_fmul_s(args)?;
                next
            }
            Fdivs(args) => {
                self.run_fdiv_s(args)?;
                next
            }
            Fsqrts(args) => {
                self.run_fsqrt_s(args)?;
                next
            }
            Fmadds(args) => {
                self.run_fmadd_s(args)?;
                next
            }
            Fmsubs(args) => {
                self.run_fmsub_s(args)?;
                next
            }
            Fnmsubs(args) => {
                self.run_fnmsub_s(args)?;
                next
            }
            Fnmadds(args) => {
                self.run_fnmadd_s(args)?;
                next
            }
            Fsgnjs(args) => {
                self.run_fsgnj_s(args)?;
                next
            }
            Fsgnjns(args) => {
                self.run_fsgnjn_s(args)?;
                next
            }
            Fsgnjxs(args) => {
                self.run_fsgnjx_s(args)?;
                next
            }
            Fmins(args) => {
                self.run_fmin_s(args)?;
                next
            }
            Fmaxs(args) => {
                self.run_fmax_s(args)?;
                next
            }
            Feqs(args) => {
                self.run_feq_s(args)?;
                next
            }
            Flts(args) => {
                self.run_flt_s(args)?;
                next
            }
            Fles(args) => {
                self.run_fle_s(args)?;
                next
            }
            FclassS(args) => {
                self.run_fclass_s(args)?;
                next
            }
            FmvXW(args) => {
                self.run_fmv_x_w(args)?;
                next
            }
            FmvWX(args) => {
                self.run_fmv_w_x(args)?;
                next
            }
            FcvtWS(args) => {
                self.run_fcvt_w_s(args)?;
                next
            }
            FcvtWUS(args) => {
                self.run_fcvt_wu_s(args)?;
                next
            }
            FcvtLS(args) => {
                self.run_fcvt_l_s(args)?;
                next
            }
            FcvtLUS(args) => {
                self.run_fcvt_lu_s(args)?;
                next
            }
            FcvtSW(args) => {
                self.run_fcvt_s_w(args)?;
                next
            }
            FcvtSWU(args) => {
                self.run_fcvt_s_wu(args)?;
                next
            }
            FcvtSL(args) => {
                self.run_fcvt_s_l(args)?;
                next
            }
            FcvtSLU(args) => {
                self.run_fcvt_s_lu(args)?;
                next
            }
            Faddd(args) => {
                self.run_fadd_d(args)?;
                next
            }
            Fsubd(args) => {
                self.run_fsub_d(args)?;
                next
            }
            Fmuld(args) => {
                self.run_fmul_d(args)?;
                next
            }
            Fdivd(args) => {
                self.run_fdiv_d(args)?;
                next
            }
            Fsqrtd(args) => {
                self.run_fsqrt_d(args)?;
                next
            }
            Fmaddd(args) => {
                self.run_fmadd_d(args)?;
                next
            }
            Fmsubd(args) => {
                self.run_fmsub_d(args)?;
                next
            }
            Fnmsubd(args) => {
                self.run_fnmsub_d(args)?;
                next
            }
            Fnmaddd(args) => {
                self.run_fnmadd_d(args)?;
                next
            }
            Fsgnjd(args) => {
                self.run_fsgnj_d(args)?;
                next
            }
            Fsgnjnd(args) => {
                self.run_fsgnjn_d(args)?;
                next
            }
            Fsgnjxd(args) => {
                self.run_fsgnjx_d(args)?;
                next
            }
            Fmind(args) => {
                self.run_fmin_d(args)?;
                next
            }
            Fmaxd(args) => {
                self.run_fmax_d(args)?;
                next
            }
            Feqd(args) => {
                self.run_feq_d(args)?;
                next
            }
            Fltd(args) => {
                self.run_flt_d(args)?;
                next
            }
            Fled(args) => {
                self.run_fle_d(args)?;
                next
            }
            FclassD(args) => {
                self.run_fclass_d(args)?;
                next
            }
            FmvXD(args) => {
                self.run_fmv_x_d(args)?;
                next
            }
            FmvDX(args) => {
                self.run_fmv_d_x(args)?;
                next
            }
            FcvtWD(args) => {
                self.run_fcvt_w_d(args)?;
                next
            }
            FcvtWUD(args) => {
                self.run_fcvt_wu_d(args)?;
                next
            }
            FcvtLD(args) => {
                self.run_fcvt_l_d(args)?;
                next
            }
            FcvtLUD(args) => {
                self.run_fcvt_lu_d(args)?;
                next
            }
            FcvtDW(args) => {
                self.run_fcvt_d_w(args)?;
                next
            }
            FcvtDWU(args) => {
                self.run_fcvt_d_wu(args)?;
                next
            }
            FcvtDL(args) => {
                self.run_fcvt_d_l(args)?;
                next
            }
            FcvtDLU(args) => {
                self.run_fcvt_d_lu(args)?;
                next
            }
            FcvtSD(args) => {
                self.run_fcvt_s_d(args)?;
                next
            }
            FcvtDS(args) => {
                self.run_fcvt_d_s(args)?;
                next
            }

            Unknown { instr } => Err(Exception::IllegalInstruction(instr as u64)),
            UnknownCompressed { instr } => Err(Exception::IllegalInstruction(instr as u64)),
        }
    }
}

/// Compute the trap target address from an `xtvec` register. In vectored
/// mode, asynchronous causes index into the vector table.
fn trap_vector(xtvec: u64, is_interrupt: bool, code: u64) -> u64 {
    let base = xtvec & !0b11;
    let vectored = xtvec & 0b11 == 1;
    if vectored && is_interrupt {
        base + 4 * code
    } else {
        base
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        machine_state::registers::{a0, a1},
        pma::{PmaDid, PmaEntry, PmaFlags, RAM_START},
    };

    pub(crate) fn state_with_ram(length: u64) -> MachineState {
        let mut state = MachineState::new();
        state
            .pmas
            .register(
                PmaEntry::new_memory(RAM_START, length, PmaFlags::ram(), PmaDid::Memory, None)
                    .unwrap(),
            )
            .unwrap();
        state.pc = RAM_START;
        state
    }

    fn write_program(state: &mut MachineState, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            state
                .store::<u32>(RAM_START + 4 * i as u64, *word)
                .unwrap();
        }
    }

    #[test]
    fn test_counters_advance() {
        let mut state = state_with_ram(0x1000);
        // addi a0, zero, 7
        write_program(&mut state, &[0x0070_0513]);
        state.step();
        assert_eq!(state.xregisters.read(a0), 7);
        assert_eq!(state.csregisters.mcycle, 1);
        assert_eq!(state.csregisters.minstret, 1);
        assert_eq!(state.pc, RAM_START + 4);
    }

    #[test]
    fn test_illegal_instruction_traps_without_retiring() {
        let mut state = state_with_ram(0x1000);
        state.csregisters.mtvec = RAM_START + 0x100;
        write_program(&mut state, &[0xFFFF_FFFF]);

        state.step();

        assert_eq!(state.csregisters.mcause, 2);
        assert_eq!(state.csregisters.mepc, RAM_START);
        assert_eq!(state.pc, RAM_START + 0x100);
        assert_eq!(state.csregisters.mcycle, 1);
        assert_eq!(state.csregisters.minstret, 0);
    }

    #[test]
    fn test_ecall_cause_tracks_mode() {
        let mut state = state_with_ram(0x1000);
        state.csregisters.mtvec = RAM_START + 0x100;
        // ecall
        write_program(&mut state, &[0x0000_0073]);
        state.step();
        assert_eq!(state.csregisters.mcause, 11);

        state.pc = RAM_START;
        state.mode = Mode::User;
        state.step();
        assert_eq!(state.csregisters.mcause, 8);
        // The trap entered machine mode.
        assert_eq!(state.mode, Mode::Machine);
    }

    #[test]
    fn test_branch_and_link() {
        let mut state = state_with_ram(0x1000);
        state.xregisters.write(a0, 1);
        state.xregisters.write(a1, 1);
        // beq a0, a1, +8 ; (skipped) ; addi a0, zero, 3
        write_program(
            &mut state,
            &[0x00B5_0463, 0xFFFF_FFFF, 0x0030_0513],
        );
        state.step();
        assert_eq!(state.pc, RAM_START + 8);
        state.step();
        assert_eq!(state.xregisters.read(a0), 3);
    }

    #[test]
    fn test_vectored_interrupt_dispatch() {
        assert_eq!(trap_vector(0x1000, false, 7), 0x1000);
        assert_eq!(trap_vector(0x1001, false, 7), 0x1000);
        assert_eq!(trap_vector(0x1001, true, 7), 0x1000 + 4 * 7);
        assert_eq!(trap_vector(0x1000, true, 7), 0x1000);
    }
}
