// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! AVR (AVRe+/megaAVR) instruction execution.
//!
//! The program counter is a flash *word* address throughout, including in
//! errors and stop reasons. Return addresses are pushed low byte first, so
//! they read big-endian in memory.

use crate::bus::{MemoryLayout, EIND, RAMPZ, SPH, SPL, SREG};
use crate::decoder::{decode, is_two_word, Instruction, Pointer, PtrMode};
use crate::snapshot::CpuSnapshot;
use crate::{Bus, SimResult, SimulationError};
use bitflags::bitflags;

/// Added to the interrupt response time when the core wakes from `SLEEP`.
pub const WAKE_UP_CYCLES: u32 = 4;

bitflags! {
    /// Status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sreg: u8 {
        const C = 1 << 0;
        const Z = 1 << 1;
        const N = 1 << 2;
        const V = 1 << 3;
        const S = 1 << 4;
        const H = 1 << 5;
        const T = 1 << 6;
        const I = 1 << 7;
    }
}

/// What a single dispatch of the core did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction retired, possibly followed by an interrupt entry.
    Executed {
        pc: u32,
        opcode: u16,
        cycles: u32,
        interrupt: Option<u8>,
    },
    /// A sleeping core was woken by an interrupt and entered its vector.
    Woken { vector: u8, cycles: u32 },
    /// The core is asleep and nothing woke it.
    Sleeping,
    /// `BREAK` retired while break stops are enabled.
    Break { pc: u32, cycles: u32 },
    /// Jump-to-self with interrupts disabled. Nothing was executed.
    InfiniteLoop { pc: u32 },
}

enum Flow {
    Next(u32),
    Break,
    InfiniteLoop,
}

/// Layout facts the core needs at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreLayout {
    pub flash_words: u32,
    pub sram_start: u16,
    pub ramend: u16,
    pub pc_22bit: bool,
    pub has_rampz: bool,
    pub has_eind: bool,
}

impl From<&MemoryLayout> for CoreLayout {
    fn from(layout: &MemoryLayout) -> Self {
        Self {
            flash_words: (layout.flash_size / 2) as u32,
            sram_start: layout.sram_start,
            ramend: layout.ramend(),
            pc_22bit: layout.pc_22bit(),
            has_rampz: layout.has_rampz(),
            has_eind: layout.has_eind(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AvrCore {
    pub regs: [u8; 32],
    pub sreg: Sreg,
    pub pc: u32,
    pub sp: u16,
    pub rampz: u8,
    pub eind: u8,
    pub sleeping: bool,
    /// Extra cycles charged when the current sleep ends.
    pub wake_latency: u32,
    /// Stop on `BREAK` instead of treating it as `NOP`.
    pub stop_on_break: bool,
    /// Report jump-to-self loops, and turn them into sleep when `I` is set.
    pub detect_infinite_loop: bool,
    irq_inhibit: bool,
    current_pc: u32,
    layout: CoreLayout,
}

impl AvrCore {
    pub fn new(layout: CoreLayout) -> Self {
        let mut core = Self {
            regs: [0; 32],
            sreg: Sreg::empty(),
            pc: 0,
            sp: layout.ramend,
            rampz: 0,
            eind: 0,
            sleeping: false,
            wake_latency: 0,
            stop_on_break: true,
            detect_infinite_loop: true,
            irq_inhibit: false,
            current_pc: 0,
            layout,
        };
        core.reset();
        core
    }

    pub fn layout(&self) -> &CoreLayout {
        &self.layout
    }

    pub fn reset(&mut self) {
        self.regs = [0; 32];
        self.sreg = Sreg::empty();
        self.pc = 0;
        self.sp = self.layout.ramend;
        self.rampz = 0;
        self.eind = 0;
        self.sleeping = false;
        self.wake_latency = 0;
        self.irq_inhibit = false;
        self.current_pc = 0;
    }

    fn reg(&self, r: u8) -> u8 {
        self.regs[r as usize]
    }

    fn set_reg(&mut self, r: u8, value: u8) {
        self.regs[r as usize] = value;
    }

    /// Little-endian register pair starting at `r`.
    pub fn word(&self, r: usize) -> u16 {
        u16::from_le_bytes([self.regs[r], self.regs[r + 1]])
    }

    pub fn set_word(&mut self, r: usize, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.regs[r] = lo;
        self.regs[r + 1] = hi;
    }

    fn flag(&self, f: Sreg) -> bool {
        self.sreg.contains(f)
    }

    /// Reads the data space, serving core registers locally.
    pub fn read_data<B: Bus + ?Sized>(&self, bus: &mut B, addr: u16) -> SimResult<u8> {
        match addr {
            0x00..=0x1F => Ok(self.regs[addr as usize]),
            SREG => Ok(self.sreg.bits()),
            SPL => Ok(self.sp as u8),
            SPH => Ok((self.sp >> 8) as u8),
            RAMPZ if self.layout.has_rampz => Ok(self.rampz),
            EIND if self.layout.has_eind => Ok(self.eind),
            _ => bus.read_u8(addr),
        }
    }

    pub fn write_data<B: Bus + ?Sized>(&mut self, bus: &mut B, addr: u16, value: u8) -> SimResult<()> {
        match addr {
            0x00..=0x1F => self.regs[addr as usize] = value,
            SREG => self.sreg = Sreg::from_bits_retain(value),
            SPL => self.sp = (self.sp & 0xFF00) | value as u16,
            SPH => self.sp = (self.sp & 0x00FF) | ((value as u16) << 8),
            RAMPZ if self.layout.has_rampz => self.rampz = value,
            EIND if self.layout.has_eind => self.eind = value,
            _ => return bus.write_u8(addr, value),
        }
        Ok(())
    }

    fn push<B: Bus + ?Sized>(&mut self, bus: &mut B, value: u8) -> SimResult<()> {
        if self.sp < self.layout.sram_start || self.sp > self.layout.ramend {
            return Err(self.stack_fault());
        }
        bus.write_u8(self.sp, value)?;
        self.sp = self.sp.wrapping_sub(1);
        Ok(())
    }

    fn pop<B: Bus + ?Sized>(&mut self, bus: &mut B) -> SimResult<u8> {
        if self.sp >= self.layout.ramend || self.sp < self.layout.sram_start.wrapping_sub(1) {
            return Err(self.stack_fault());
        }
        self.sp = self.sp.wrapping_add(1);
        bus.read_u8(self.sp)
    }

    fn stack_fault(&self) -> SimulationError {
        SimulationError::StackFault {
            pc: self.current_pc,
            sp: self.sp,
        }
    }

    fn push_pc<B: Bus + ?Sized>(&mut self, bus: &mut B, pc: u32) -> SimResult<()> {
        self.push(bus, pc as u8)?;
        self.push(bus, (pc >> 8) as u8)?;
        if self.layout.pc_22bit {
            self.push(bus, (pc >> 16) as u8)?;
        }
        Ok(())
    }

    fn pop_pc<B: Bus + ?Sized>(&mut self, bus: &mut B) -> SimResult<u32> {
        let mut pc = 0u32;
        if self.layout.pc_22bit {
            pc |= (self.pop(bus)? as u32 & 0x3F) << 16;
        }
        pc |= (self.pop(bus)? as u32) << 8;
        pc |= self.pop(bus)? as u32;
        Ok(pc)
    }

    fn call_cycles(&self, base: u32) -> u32 {
        if self.layout.pc_22bit {
            base + 1
        } else {
            base
        }
    }

    fn wrap_pc(&self, target: i64) -> u32 {
        target.rem_euclid(self.layout.flash_words as i64) as u32
    }

    /// Pushes the return address and jumps to `vector`.
    fn enter_interrupt<B: Bus + ?Sized>(&mut self, bus: &mut B, vector: u8) -> SimResult<u32> {
        self.current_pc = self.pc;
        self.push_pc(bus, self.pc)?;
        let target = bus.acknowledge_interrupt(vector, &mut self.sreg)?;
        tracing::trace!("Entering vector {} from pc {:#x}", vector, self.pc);
        self.pc = target;
        Ok(self.call_cycles(4))
    }

    /// Leaves sleep, returning the wake-up cycles owed.
    fn wake(&mut self) -> u32 {
        self.sleeping = false;
        std::mem::take(&mut self.wake_latency)
    }

    /// Dispatches the core once: one instruction, or a sleep check.
    pub fn step<B: Bus + ?Sized>(&mut self, bus: &mut B) -> SimResult<StepOutcome> {
        if self.sleeping {
            return match bus.pending_interrupt(self.flag(Sreg::I)) {
                Some(vector) => {
                    let latency = self.wake();
                    tracing::debug!("Woken by vector {}", vector);
                    let cycles = latency + self.enter_interrupt(bus, vector)?;
                    Ok(StepOutcome::Woken { vector, cycles })
                }
                None => Ok(StepOutcome::Sleeping),
            };
        }

        let pc = self.pc;
        self.current_pc = pc;
        let opcode = bus.fetch(pc)?;
        let next = if is_two_word(opcode) {
            bus.fetch(self.wrap_pc(pc as i64 + 1))?
        } else {
            0
        };
        let instruction = decode(opcode, next);
        tracing::trace!("PC={:#x}, Op={:#06x}, Instr={:?}", pc, opcode, instruction);

        self.irq_inhibit = false;
        let mut cycles = match self.execute(bus, instruction, opcode)? {
            Flow::Next(cycles) => cycles,
            Flow::Break => return Ok(StepOutcome::Break { pc, cycles: 1 }),
            Flow::InfiniteLoop => return Ok(StepOutcome::InfiniteLoop { pc }),
        };

        let mut interrupt = None;
        if !self.irq_inhibit {
            if let Some(vector) = bus.pending_interrupt(self.flag(Sreg::I)) {
                if self.sleeping {
                    cycles += self.wake();
                }
                cycles += self.enter_interrupt(bus, vector)?;
                interrupt = Some(vector);
            }
        }

        Ok(StepOutcome::Executed {
            pc,
            opcode,
            cycles,
            interrupt,
        })
    }

    fn set_nzs(&mut self, r: u8) {
        let n = r & 0x80 != 0;
        self.sreg.set(Sreg::N, n);
        self.sreg.set(Sreg::Z, r == 0);
        self.sreg.set(Sreg::S, n ^ self.flag(Sreg::V));
    }

    fn logic(&mut self, r: u8) -> u8 {
        self.sreg.remove(Sreg::V);
        self.set_nzs(r);
        r
    }

    fn add(&mut self, a: u8, b: u8, carry: bool) -> u8 {
        let r = a.wrapping_add(b).wrapping_add(carry as u8);
        let c = (a & b) | (b & !r) | (!r & a);
        self.sreg.set(Sreg::H, c & 0x08 != 0);
        self.sreg.set(Sreg::C, c & 0x80 != 0);
        self.sreg
            .set(Sreg::V, ((a & b & !r) | (!a & !b & r)) & 0x80 != 0);
        self.set_nzs(r);
        r
    }

    /// Subtract with borrow. With `keep_z`, Z can only be cleared (SBC, CPC).
    fn sub(&mut self, a: u8, b: u8, carry: bool, keep_z: bool) -> u8 {
        let r = a.wrapping_sub(b).wrapping_sub(carry as u8);
        let c = (!a & b) | (b & r) | (r & !a);
        self.sreg.set(Sreg::H, c & 0x08 != 0);
        self.sreg.set(Sreg::C, c & 0x80 != 0);
        self.sreg
            .set(Sreg::V, ((a & !b & !r) | (!a & b & r)) & 0x80 != 0);
        let z = r == 0 && (!keep_z || self.flag(Sreg::Z));
        self.set_nzs(r);
        self.sreg.set(Sreg::Z, z);
        r
    }

    fn shift_flags(&mut self, r: u8, carry: bool) {
        self.sreg.set(Sreg::C, carry);
        let n = r & 0x80 != 0;
        self.sreg.set(Sreg::V, n ^ carry);
        self.set_nzs(r);
    }

    fn product(&mut self, p: u16, fractional: bool) {
        self.sreg.set(Sreg::C, p & 0x8000 != 0);
        let r = if fractional { p << 1 } else { p };
        self.sreg.set(Sreg::Z, r == 0);
        self.set_word(0, r);
    }

    fn pointer(&self, ptr: Pointer) -> u16 {
        self.word(ptr.base())
    }

    /// Effective address for LD/ST, applying pre-decrement/post-increment.
    fn indirect(&mut self, ptr: Pointer, mode: PtrMode) -> u16 {
        let p = self.pointer(ptr);
        match mode {
            PtrMode::Plain => p,
            PtrMode::PostInc => {
                self.set_word(ptr.base(), p.wrapping_add(1));
                p
            }
            PtrMode::PreDec => {
                let p = p.wrapping_sub(1);
                self.set_word(ptr.base(), p);
                p
            }
        }
    }

    /// Skips the instruction at `self.pc` and returns its length in words.
    fn skip<B: Bus + ?Sized>(&mut self, bus: &mut B) -> SimResult<u32> {
        let op = bus.fetch(self.pc)?;
        let words = if is_two_word(op) { 2 } else { 1 };
        self.pc = self.wrap_pc(self.pc as i64 + words as i64);
        Ok(words)
    }

    fn execute<B: Bus + ?Sized>(
        &mut self,
        bus: &mut B,
        instruction: Instruction,
        opcode: u16,
    ) -> SimResult<Flow> {
        let pc = self.pc;
        self.pc = self.wrap_pc(pc as i64 + instruction.words() as i64);
        let io = |a: u8| a as u16 + 0x20;

        let cycles = match instruction {
            Instruction::Nop | Instruction::Wdr => 1,
            Instruction::Movw { d, r } => {
                let v = self.word(r as usize);
                self.set_word(d as usize, v);
                1
            }
            Instruction::Mul { d, r } => {
                self.product(self.reg(d) as u16 * self.reg(r) as u16, false);
                2
            }
            Instruction::Muls { d, r } => {
                let p = (self.reg(d) as i8 as i16) * (self.reg(r) as i8 as i16);
                self.product(p as u16, false);
                2
            }
            Instruction::Mulsu { d, r } => {
                let p = (self.reg(d) as i8 as i16) * (self.reg(r) as i16);
                self.product(p as u16, false);
                2
            }
            Instruction::Fmul { d, r } => {
                self.product(self.reg(d) as u16 * self.reg(r) as u16, true);
                2
            }
            Instruction::Fmuls { d, r } => {
                let p = (self.reg(d) as i8 as i16).wrapping_mul(self.reg(r) as i8 as i16);
                self.product(p as u16, true);
                2
            }
            Instruction::Fmulsu { d, r } => {
                let p = (self.reg(d) as i8 as i16) * (self.reg(r) as i16);
                self.product(p as u16, true);
                2
            }

            Instruction::Add { d, r } => {
                let v = self.add(self.reg(d), self.reg(r), false);
                self.set_reg(d, v);
                1
            }
            Instruction::Adc { d, r } => {
                let v = self.add(self.reg(d), self.reg(r), self.flag(Sreg::C));
                self.set_reg(d, v);
                1
            }
            Instruction::Sub { d, r } => {
                let v = self.sub(self.reg(d), self.reg(r), false, false);
                self.set_reg(d, v);
                1
            }
            Instruction::Subi { d, k } => {
                let v = self.sub(self.reg(d), k, false, false);
                self.set_reg(d, v);
                1
            }
            Instruction::Sbc { d, r } => {
                let v = self.sub(self.reg(d), self.reg(r), self.flag(Sreg::C), true);
                self.set_reg(d, v);
                1
            }
            Instruction::Sbci { d, k } => {
                let v = self.sub(self.reg(d), k, self.flag(Sreg::C), true);
                self.set_reg(d, v);
                1
            }
            Instruction::Cp { d, r } => {
                self.sub(self.reg(d), self.reg(r), false, false);
                1
            }
            Instruction::Cpi { d, k } => {
                self.sub(self.reg(d), k, false, false);
                1
            }
            Instruction::Cpc { d, r } => {
                self.sub(self.reg(d), self.reg(r), self.flag(Sreg::C), true);
                1
            }
            Instruction::Cpse { d, r } => {
                if self.reg(d) == self.reg(r) {
                    1 + self.skip(bus)?
                } else {
                    1
                }
            }
            Instruction::And { d, r } => {
                let v = self.logic(self.reg(d) & self.reg(r));
                self.set_reg(d, v);
                1
            }
            Instruction::Andi { d, k } => {
                let v = self.logic(self.reg(d) & k);
                self.set_reg(d, v);
                1
            }
            Instruction::Or { d, r } => {
                let v = self.logic(self.reg(d) | self.reg(r));
                self.set_reg(d, v);
                1
            }
            Instruction::Ori { d, k } => {
                let v = self.logic(self.reg(d) | k);
                self.set_reg(d, v);
                1
            }
            Instruction::Eor { d, r } => {
                let v = self.logic(self.reg(d) ^ self.reg(r));
                self.set_reg(d, v);
                1
            }
            Instruction::Mov { d, r } => {
                self.set_reg(d, self.reg(r));
                1
            }
            Instruction::Ldi { d, k } => {
                self.set_reg(d, k);
                1
            }

            Instruction::Com { d } => {
                let v = self.logic(!self.reg(d));
                self.sreg.insert(Sreg::C);
                self.set_reg(d, v);
                1
            }
            Instruction::Neg { d } => {
                let v = self.sub(0, self.reg(d), false, false);
                self.set_reg(d, v);
                1
            }
            Instruction::Swap { d } => {
                let v = self.reg(d);
                self.set_reg(d, v.rotate_left(4));
                1
            }
            Instruction::Inc { d } => {
                let v = self.reg(d);
                let r = v.wrapping_add(1);
                self.sreg.set(Sreg::V, v == 0x7F);
                self.set_nzs(r);
                self.set_reg(d, r);
                1
            }
            Instruction::Dec { d } => {
                let v = self.reg(d);
                let r = v.wrapping_sub(1);
                self.sreg.set(Sreg::V, v == 0x80);
                self.set_nzs(r);
                self.set_reg(d, r);
                1
            }
            Instruction::Asr { d } => {
                let v = self.reg(d);
                let r = ((v as i8) >> 1) as u8;
                self.shift_flags(r, v & 1 != 0);
                self.set_reg(d, r);
                1
            }
            Instruction::Lsr { d } => {
                let v = self.reg(d);
                let r = v >> 1;
                self.shift_flags(r, v & 1 != 0);
                self.set_reg(d, r);
                1
            }
            Instruction::Ror { d } => {
                let v = self.reg(d);
                let r = (v >> 1) | ((self.flag(Sreg::C) as u8) << 7);
                self.shift_flags(r, v & 1 != 0);
                self.set_reg(d, r);
                1
            }

            Instruction::Adiw { d, k } => {
                let w = self.word(d as usize);
                let r = w.wrapping_add(k as u16);
                let (w15, r15) = (w & 0x8000 != 0, r & 0x8000 != 0);
                self.sreg.set(Sreg::V, !w15 && r15);
                self.sreg.set(Sreg::C, !r15 && w15);
                self.sreg.set(Sreg::N, r15);
                self.sreg.set(Sreg::Z, r == 0);
                self.sreg.set(Sreg::S, r15 ^ (!w15 && r15));
                self.set_word(d as usize, r);
                2
            }
            Instruction::Sbiw { d, k } => {
                let w = self.word(d as usize);
                let r = w.wrapping_sub(k as u16);
                let (w15, r15) = (w & 0x8000 != 0, r & 0x8000 != 0);
                let v = w15 && !r15;
                self.sreg.set(Sreg::V, v);
                self.sreg.set(Sreg::C, r15 && !w15);
                self.sreg.set(Sreg::N, r15);
                self.sreg.set(Sreg::Z, r == 0);
                self.sreg.set(Sreg::S, r15 ^ v);
                self.set_word(d as usize, r);
                2
            }

            Instruction::Bset { s } => {
                let f = Sreg::from_bits_retain(1 << s);
                if f == Sreg::I {
                    self.irq_inhibit = true;
                }
                self.sreg.insert(f);
                1
            }
            Instruction::Bclr { s } => {
                self.sreg.remove(Sreg::from_bits_retain(1 << s));
                1
            }
            Instruction::Bld { d, b } => {
                let mask = 1u8 << b;
                let v = if self.flag(Sreg::T) {
                    self.reg(d) | mask
                } else {
                    self.reg(d) & !mask
                };
                self.set_reg(d, v);
                1
            }
            Instruction::Bst { d, b } => {
                self.sreg.set(Sreg::T, self.reg(d) & (1 << b) != 0);
                1
            }
            Instruction::Sbrc { r, b } => {
                if self.reg(r) & (1 << b) == 0 {
                    1 + self.skip(bus)?
                } else {
                    1
                }
            }
            Instruction::Sbrs { r, b } => {
                if self.reg(r) & (1 << b) != 0 {
                    1 + self.skip(bus)?
                } else {
                    1
                }
            }

            Instruction::In { d, a } => {
                let v = self.read_data(bus, io(a))?;
                self.set_reg(d, v);
                1
            }
            Instruction::Out { a, r } => {
                self.write_data(bus, io(a), self.reg(r))?;
                1
            }
            Instruction::Cbi { a, b } => {
                let v = self.read_data(bus, io(a))?;
                self.write_data(bus, io(a), v & !(1 << b))?;
                2
            }
            Instruction::Sbi { a, b } => {
                let v = self.read_data(bus, io(a))?;
                self.write_data(bus, io(a), v | (1 << b))?;
                2
            }
            Instruction::Sbic { a, b } => {
                if self.read_data(bus, io(a))? & (1 << b) == 0 {
                    1 + self.skip(bus)?
                } else {
                    1
                }
            }
            Instruction::Sbis { a, b } => {
                if self.read_data(bus, io(a))? & (1 << b) != 0 {
                    1 + self.skip(bus)?
                } else {
                    1
                }
            }

            Instruction::Ld { d, ptr, mode } => {
                let addr = self.indirect(ptr, mode);
                let v = self.read_data(bus, addr)?;
                self.set_reg(d, v);
                2
            }
            Instruction::St { r, ptr, mode } => {
                let v = self.reg(r);
                let addr = self.indirect(ptr, mode);
                self.write_data(bus, addr, v)?;
                2
            }
            Instruction::Ldd { d, ptr, q } => {
                let addr = self.pointer(ptr).wrapping_add(q as u16);
                let v = self.read_data(bus, addr)?;
                self.set_reg(d, v);
                2
            }
            Instruction::Std { r, ptr, q } => {
                let addr = self.pointer(ptr).wrapping_add(q as u16);
                self.write_data(bus, addr, self.reg(r))?;
                2
            }
            Instruction::Lds { d, k } => {
                let v = self.read_data(bus, k)?;
                self.set_reg(d, v);
                2
            }
            Instruction::Sts { k, r } => {
                self.write_data(bus, k, self.reg(r))?;
                2
            }
            Instruction::Lpm { d, post_inc } => {
                let z = self.pointer(Pointer::Z);
                let v = bus.read_program(z as u32)?;
                self.set_reg(d, v);
                if post_inc {
                    self.set_word(Pointer::Z.base(), z.wrapping_add(1));
                }
                3
            }
            Instruction::Elpm { d, post_inc } => {
                if !self.layout.has_rampz {
                    self.pc = pc;
                    return Err(self.decode_error(opcode));
                }
                let addr = ((self.rampz as u32) << 16) | self.pointer(Pointer::Z) as u32;
                let v = bus.read_program(addr)?;
                self.set_reg(d, v);
                if post_inc {
                    let next = addr.wrapping_add(1);
                    self.set_word(Pointer::Z.base(), next as u16);
                    self.rampz = (next >> 16) as u8;
                }
                3
            }
            Instruction::Spm => {
                let z = self.pointer(Pointer::Z) as u32;
                let addr = if self.layout.has_rampz {
                    ((self.rampz as u32) << 16) | z
                } else {
                    z
                };
                bus.write_program(addr, self.word(0))?;
                1
            }
            Instruction::Push { r } => {
                self.push(bus, self.reg(r))?;
                2
            }
            Instruction::Pop { d } => {
                let v = self.pop(bus)?;
                self.set_reg(d, v);
                2
            }

            Instruction::Rjmp { k } => {
                if k == -1 && self.detect_infinite_loop {
                    if !self.flag(Sreg::I) {
                        self.pc = pc;
                        return Ok(Flow::InfiniteLoop);
                    }
                    // Idle loop waiting for an interrupt.
                    self.sleeping = true;
                }
                self.pc = self.wrap_pc(pc as i64 + 1 + k as i64);
                2
            }
            Instruction::Jmp { k } => {
                if k == pc && self.detect_infinite_loop {
                    if !self.flag(Sreg::I) {
                        self.pc = pc;
                        return Ok(Flow::InfiniteLoop);
                    }
                    self.sleeping = true;
                }
                self.pc = self.wrap_pc(k as i64);
                3
            }
            Instruction::Ijmp => {
                self.pc = self.wrap_pc(self.pointer(Pointer::Z) as i64);
                2
            }
            Instruction::Eijmp => {
                if !self.layout.has_eind {
                    self.pc = pc;
                    return Err(self.decode_error(opcode));
                }
                let target = ((self.eind as u32) << 16) | self.pointer(Pointer::Z) as u32;
                self.pc = self.wrap_pc(target as i64);
                2
            }
            Instruction::Rcall { k } => {
                self.push_pc(bus, pc + 1)?;
                self.pc = self.wrap_pc(pc as i64 + 1 + k as i64);
                self.call_cycles(3)
            }
            Instruction::Call { k } => {
                self.push_pc(bus, pc + 2)?;
                self.pc = self.wrap_pc(k as i64);
                self.call_cycles(4)
            }
            Instruction::Icall => {
                self.push_pc(bus, pc + 1)?;
                self.pc = self.wrap_pc(self.pointer(Pointer::Z) as i64);
                self.call_cycles(3)
            }
            Instruction::Eicall => {
                if !self.layout.has_eind {
                    self.pc = pc;
                    return Err(self.decode_error(opcode));
                }
                self.push_pc(bus, pc + 1)?;
                let target = ((self.eind as u32) << 16) | self.pointer(Pointer::Z) as u32;
                self.pc = self.wrap_pc(target as i64);
                4
            }
            Instruction::Ret => {
                let target = self.pop_pc(bus)?;
                self.pc = self.wrap_pc(target as i64);
                self.call_cycles(4)
            }
            Instruction::Reti => {
                let target = self.pop_pc(bus)?;
                self.pc = self.wrap_pc(target as i64);
                self.sreg.insert(Sreg::I);
                self.irq_inhibit = true;
                bus.return_from_interrupt();
                self.call_cycles(4)
            }
            Instruction::Brbs { s, k } => {
                if self.sreg.bits() & (1 << s) != 0 {
                    self.pc = self.wrap_pc(pc as i64 + 1 + k as i64);
                    2
                } else {
                    1
                }
            }
            Instruction::Brbc { s, k } => {
                if self.sreg.bits() & (1 << s) == 0 {
                    self.pc = self.wrap_pc(pc as i64 + 1 + k as i64);
                    2
                } else {
                    1
                }
            }

            Instruction::Sleep => {
                tracing::debug!("SLEEP at pc {:#x}", pc);
                self.sleeping = true;
                self.wake_latency = WAKE_UP_CYCLES;
                1
            }
            Instruction::Break => {
                if self.stop_on_break {
                    return Ok(Flow::Break);
                }
                1
            }
            Instruction::Unknown(_) => {
                self.pc = pc;
                return Err(self.decode_error(opcode));
            }
        };
        Ok(Flow::Next(cycles))
    }

    fn decode_error(&self, opcode: u16) -> SimulationError {
        SimulationError::DecodeError {
            pc: self.current_pc,
            opcode,
        }
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            registers: self.regs,
            sreg: self.sreg.bits(),
            pc: self.pc,
            sp: self.sp,
            rampz: self.rampz,
            eind: self.eind,
            sleeping: self.sleeping,
            wake_latency: self.wake_latency,
        }
    }

    pub fn restore(&mut self, snap: &CpuSnapshot) {
        self.regs = snap.registers;
        self.sreg = Sreg::from_bits_retain(snap.sreg);
        self.pc = snap.pc;
        self.sp = snap.sp;
        self.rampz = snap.rampz;
        self.eind = snap.eind;
        self.sleeping = snap.sleeping;
        self.wake_latency = snap.wake_latency;
        self.irq_inhibit = false;
    }
}
