// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#[cfg(test)]
mod tests {
    use crate::cpu::Sreg;
    use crate::firmware::{Area, Firmware, FirmwareError};
    use crate::metrics::PerformanceMetrics;
    use crate::peripherals::tick_timer::TickTimer;
    use crate::signals::{SignalData, SignalFilter, SignalKind, SignalSource};
    use crate::{Machine, SimulationConfig, SimulationError, StopReason};
    use labwired_avr_config::{McuDescriptor, StopKind};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    // Hand assembler for the handful of encodings used below.
    fn ldi(d: u16, k: u16) -> u16 {
        0xE000 | ((k & 0xF0) << 4) | ((d - 16) << 4) | (k & 0x0F)
    }

    fn add(d: u16, r: u16) -> u16 {
        0x0C00 | ((r & 0x10) << 5) | (d << 4) | (r & 0x0F)
    }

    fn out(a: u16, r: u16) -> u16 {
        0xB800 | ((a & 0x30) << 5) | (r << 4) | (a & 0x0F)
    }

    fn rjmp(k: i16) -> u16 {
        0xC000 | (k as u16 & 0x0FFF)
    }

    fn rcall(k: i16) -> u16 {
        0xD000 | (k as u16 & 0x0FFF)
    }

    fn brne(k: i8) -> u16 {
        0xF401 | ((k as u16 & 0x7F) << 3)
    }

    fn push(r: u16) -> u16 {
        0x920F | (r << 4)
    }

    fn pop(d: u16) -> u16 {
        0x900F | (d << 4)
    }

    fn dec(d: u16) -> u16 {
        0x940A | (d << 4)
    }

    fn inc(d: u16) -> u16 {
        0x9403 | (d << 4)
    }

    fn cpi(d: u16, k: u16) -> u16 {
        0x3000 | ((k & 0xF0) << 4) | ((d - 16) << 4) | (k & 0x0F)
    }

    // Two-register format: CP, CPC, SUB, SBC, CPSE, MUL.
    fn rr(op: u16, d: u16, r: u16) -> u16 {
        op | ((r & 0x10) << 5) | (d << 4) | (r & 0x0F)
    }

    // One-register format: COM, NEG, ASR, LSR, ROR.
    fn rd(op: u16, d: u16) -> u16 {
        op | (d << 4)
    }

    // MULS, MULSU and the FMUL family on r16..r23.
    fn mul_hi(op: u16, d: u16, r: u16) -> u16 {
        op | ((d - 16) << 4) | (r - 16)
    }

    fn adiw(op: u16, d: u16, k: u16) -> u16 {
        op | ((k & 0x30) << 2) | (((d - 24) / 2) << 4) | (k & 0x0F)
    }

    fn displaced(op: u16, r: u16, q: u16) -> u16 {
        op | ((q & 0x20) << 8) | ((q & 0x18) << 7) | (r << 4) | (q & 0x07)
    }

    fn in_(d: u16, a: u16) -> u16 {
        0xB000 | ((a & 0x30) << 5) | (d << 4) | (a & 0x0F)
    }

    const CP: u16 = 0x1400;
    const CPC: u16 = 0x0400;
    const SUB: u16 = 0x1800;
    const SBC: u16 = 0x0800;
    const CPSE: u16 = 0x1000;
    const MUL: u16 = 0x9C00;
    const COM: u16 = 0x9400;
    const NEG: u16 = 0x9401;
    const ASR: u16 = 0x9405;
    const LSR: u16 = 0x9406;
    const ROR: u16 = 0x9407;
    const MULS: u16 = 0x0200;
    const MULSU: u16 = 0x0300;
    const FMUL: u16 = 0x0308;
    const FMULS: u16 = 0x0380;
    const FMULSU: u16 = 0x0388;
    const ADIW: u16 = 0x9600;
    const SBIW: u16 = 0x9700;
    const STD_Y: u16 = 0x8208;
    const LDD_Y: u16 = 0x8008;
    const JMP: u16 = 0x940C;
    const SEC: u16 = 0x9408;

    const NOP: u16 = 0x0000;
    const SEI: u16 = 0x9478;
    const SLEEP: u16 = 0x9588;
    const BREAK: u16 = 0x9598;
    const RET: u16 = 0x9508;
    const RETI: u16 = 0x9518;

    fn firmware(program: &[u16]) -> Firmware {
        let bytes = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut builder = Firmware::builder();
        builder.add_block(Area::Flash, 0, bytes);
        builder.build().unwrap()
    }

    fn machine_with(program: &[u16]) -> Machine {
        let mut machine = Machine::new(&McuDescriptor::atmega328p()).unwrap();
        machine.load_firmware(&firmware(program)).unwrap();
        machine
    }

    #[test]
    fn test_add_overflow_flags() {
        let mut machine = machine_with(&[ldi(16, 0x7F), ldi(17, 0x01), add(16, 17), BREAK]);

        assert_eq!(machine.run(None), StopReason::Break { pc: 3 });
        assert_eq!(machine.cpu.regs[16], 0x80);
        let sreg = machine.cpu.sreg;
        assert!(sreg.contains(Sreg::V | Sreg::N | Sreg::H));
        assert!(!sreg.intersects(Sreg::S | Sreg::Z | Sreg::C));
        assert_eq!(machine.cycle(), 4);
    }

    #[test]
    fn test_countdown_loop_cycles() {
        // ldi r16, 3 / 1: dec r16 / brne 1b / break
        let mut machine = machine_with(&[ldi(16, 3), dec(16), brne(-2), BREAK]);

        assert_eq!(machine.run(None), StopReason::Break { pc: 3 });
        assert_eq!(machine.cpu.regs[16], 0);
        assert!(machine.cpu.sreg.contains(Sreg::Z));
        // 1 + 2 * (1 + 2) + (1 + 1) + 1
        assert_eq!(machine.cycle(), 10);
    }

    #[test]
    fn test_call_and_stack() {
        let mut machine = machine_with(&[
            rcall(2),
            BREAK,
            NOP,
            ldi(16, 0x55),
            push(16),
            pop(17),
            RET,
        ]);

        assert_eq!(machine.run(None), StopReason::Break { pc: 1 });
        assert_eq!(machine.cpu.regs[17], 0x55);
        assert_eq!(machine.cpu.sp, 0x8FF);
        // Return address 1 was pushed low byte first.
        assert_eq!(machine.inspect_data(0x8FE, 2).unwrap(), vec![0x00, 0x01]);
        assert_eq!(machine.cycle(), 3 + 1 + 2 + 2 + 4 + 1);
    }

    #[test]
    fn test_pop_on_empty_stack_faults() {
        let mut machine = machine_with(&[pop(16)]);

        let reason = machine.run(None);
        assert_eq!(
            reason,
            StopReason::Fault {
                pc: 0,
                error: SimulationError::StackFault { pc: 0, sp: 0x8FF }
            }
        );
        assert_eq!(reason.kind(), StopKind::StackFault);
    }

    #[test]
    fn test_erased_flash_is_a_decode_fault() {
        let mut machine = machine_with(&[NOP]);

        let reason = machine.run(None);
        assert_eq!(
            reason,
            StopReason::Fault {
                pc: 1,
                error: SimulationError::DecodeError {
                    pc: 1,
                    opcode: 0xFFFF
                }
            }
        );
        assert_eq!(reason.kind(), StopKind::DecodeError);
        assert_eq!(machine.cpu.pc, 1);
    }

    #[test]
    fn test_load_past_ramend_faults() {
        // ldi r30, 0x00 / ldi r31, 0x09 / ld r16, Z
        let mut machine = machine_with(&[ldi(30, 0x00), ldi(31, 0x09), 0x8100]);

        let reason = machine.run(None);
        assert_eq!(
            reason,
            StopReason::Fault {
                pc: 2,
                error: SimulationError::MemoryViolation(0x900)
            }
        );
        assert_eq!(reason.kind(), StopKind::MemoryViolation);
    }

    #[test]
    fn test_jump_to_self_with_interrupts_disabled() {
        let mut machine = machine_with(&[rjmp(-1)]);

        assert_eq!(machine.run(None), StopReason::InfiniteLoop { pc: 0 });
        assert_eq!(machine.cycle(), 0);
        assert_eq!(machine.cpu.pc, 0);
    }

    #[test]
    fn test_idle_loop_without_wake_source_is_sleep() {
        let mut machine = machine_with(&[SEI, rjmp(-1)]);

        assert_eq!(machine.run(None), StopReason::Sleep { pc: 1 });
        assert!(machine.cpu.sleeping);
        assert_eq!(machine.cycle(), 3);
    }

    #[test]
    fn test_sleep_with_interrupts_disabled() {
        let mut machine = machine_with(&[SLEEP]);

        assert_eq!(machine.run(None), StopReason::Sleep { pc: 1 });
        assert_eq!(machine.cycle(), 1);
    }

    #[test]
    fn test_break_as_nop() {
        let mut machine = machine_with(&[BREAK, rjmp(-1)]).with_config(SimulationConfig {
            stop_on_break: false,
            ..Default::default()
        });

        assert_eq!(machine.run(None), StopReason::InfiniteLoop { pc: 1 });
    }

    #[test]
    fn test_console_output() {
        let program = [
            ldi(16, b'H' as u16),
            out(0x1E, 16),
            ldi(16, b'i' as u16),
            out(0x1E, 16),
            ldi(16, b'\n' as u16),
            out(0x1E, 16),
            BREAK,
        ];
        let mut machine = Machine::new(&McuDescriptor::atmega328p()).unwrap();
        machine
            .load_firmware(&firmware(&program).with_console_register(0x3E))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        machine
            .signals()
            .subscribe_fn(SignalFilter::kind(SignalKind::ConsoleLine), move |sig| {
                if let SignalData::Text(line) = &sig.data {
                    s.lock().unwrap().push(line.clone());
                }
            });

        assert_eq!(machine.run(None), StopReason::Break { pc: 6 });
        assert_eq!(machine.console().unwrap().lines(), &["Hi".to_string()]);
        assert_eq!(*seen.lock().unwrap(), vec!["Hi".to_string()]);
    }

    // Vector 1 at word 2 drives a tick timer ISR that breaks on its third run.
    fn timer_program() -> Vec<u16> {
        vec![
            rjmp(3), // 0: reset -> main
            NOP,
            rjmp(9), // 2: vector 1 -> isr
            NOP,
            ldi(16, 100), // 4: main
            out(0x21, 16), // PERIOD_L
            ldi(16, 0x03),
            out(0x20, 16), // CTRL = EN | IE
            SEI,
            SLEEP, // 9
            rjmp(-2),
            NOP,
            inc(20), // 12: isr
            cpi(20, 3),
            brne(1),
            BREAK, // 15
            RETI,
        ]
    }

    fn timer_machine() -> Machine {
        let mut machine = machine_with(&timer_program());
        let timer = TickTimer::new(0x40, 1);
        let io = timer.io_addresses();
        machine.register_device(Box::new(timer), &io, &[1]).unwrap();
        machine
    }

    #[test]
    fn test_timer_wakes_sleeping_core() {
        let mut machine = timer_machine();
        let acks = Arc::new(Mutex::new(Vec::new()));
        let a = acks.clone();
        machine.signals().subscribe_fn(
            SignalFilter::new(SignalSource::Interrupts, SignalKind::Acknowledged),
            move |sig| a.lock().unwrap().push(sig.cycle),
        );

        assert_eq!(machine.run(None), StopReason::Break { pc: 15 });
        assert_eq!(machine.cpu.regs[20], 3);
        // Enabled at cycle 5 with a period of 100.
        assert_eq!(*acks.lock().unwrap(), vec![105, 205, 305]);
        // 4 wake-up, 4 entry, rjmp 2, inc 1, cpi 1, brne 1, break 1
        assert_eq!(machine.cycle(), 319);
    }

    #[test]
    fn test_run_is_deterministic() {
        let mut a = timer_machine();
        let mut b = timer_machine();
        assert_eq!(a.run(None), b.run(None));
        assert_eq!(a.cycle(), b.cycle());
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_cycle_limit_and_step() {
        let mut machine = machine_with(&[NOP, rjmp(-2)]);

        assert_eq!(machine.run(Some(100)), StopReason::CycleLimit);
        assert!((100..103).contains(&machine.cycle()));

        let before = machine.cycle();
        assert_eq!(machine.step(5), StopReason::CycleLimit);
        assert!(machine.cycle() >= before + 5);
    }

    #[test]
    fn test_sleep_fast_forward_respects_cycle_limit() {
        let mut machine = timer_machine();
        assert_eq!(machine.run(Some(50)), StopReason::CycleLimit);
        assert_eq!(machine.cycle(), 50);
        assert!(machine.cpu.sleeping);
    }

    #[test]
    fn test_deferred_callback_requests_stop() {
        let mut machine = machine_with(&[NOP, rjmp(-2)]);
        machine.defer(10, |m| {
            m.request_stop();
            Ok(())
        });

        assert_eq!(machine.run(None), StopReason::Requested);
        assert_eq!(machine.cycle(), 10);
    }

    #[test]
    fn test_reset_keeps_time_and_deferred_work() {
        let mut machine = machine_with(&[NOP, rjmp(-2)]);
        machine.run(Some(30));
        let t = machine.defer(20, |_| Ok(()));
        machine.bus.sram.write_u8(0x10, 0x5A).unwrap();
        machine.reset();

        assert!(machine.cycle() >= 30);
        assert_eq!(machine.cpu.pc, 0);
        assert!(machine.cancel_deferred(t));
        assert_eq!(machine.inspect_data(0x110, 1).unwrap(), vec![0x5A]);
    }

    #[test]
    fn test_deregister_cancels_wake() {
        let mut machine = machine_with(&[NOP]);
        let timer = TickTimer::new(0x40, 1);
        let io = timer.io_addresses();
        let id = machine.register_device(Box::new(timer), &io, &[1]).unwrap();
        machine.schedule_device(id, 50).unwrap();

        let dev = machine.deregister_device(id).unwrap();
        assert_eq!(dev.name(), "tick_timer");
        assert_eq!(machine.scheduler.device_wake(id), None);
        assert!(machine.schedule_device(id, 60).is_err());
    }

    #[test]
    fn test_firmware_without_flash_is_rejected() {
        let mut builder = Firmware::builder();
        builder.add_block(Area::Eeprom, 0, vec![1, 2]);
        let fw = builder.build().unwrap();

        let mut machine = Machine::new(&McuDescriptor::atmega328p()).unwrap();
        assert_eq!(
            machine.load_firmware(&fw),
            Err(SimulationError::Firmware(FirmwareError::MissingArea(Area::Flash)))
        );
    }

    #[test]
    fn test_load_nvm_areas() {
        let mut builder = Firmware::builder();
        builder
            .add_block(Area::Flash, 0, vec![0x00, 0x00])
            .add_block(Area::Eeprom, 4, vec![0xAA, 0xBB])
            .add_block(Area::Fuses, 0, vec![0x62, 0xD9, 0xFF]);
        let fw = builder.build().unwrap();

        let mut machine = Machine::new(&McuDescriptor::atmega328p()).unwrap();
        machine.load_firmware(&fw).unwrap();

        assert_eq!(machine.inspect(Area::Eeprom, 3, 4).unwrap(), vec![0xFF, 0xAA, 0xBB, 0xFF]);
        assert_eq!(machine.inspect(Area::Fuses, 0, 3).unwrap(), vec![0x62, 0xD9, 0xFF]);
        assert!(machine.bus.fuses.is_locked());
        assert_eq!(machine.inspect(Area::Flash, 2, 2).unwrap(), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut machine = machine_with(&[ldi(16, 0x7F), ldi(17, 0x01), add(16, 17), BREAK]);
        machine.run(None);
        let snap = machine.snapshot();

        machine.cpu.regs[16] = 0;
        machine.cpu.pc = 0;
        machine.bus.sram.write_u8(0, 0x42).unwrap();
        machine.restore(&snap).unwrap();

        assert_eq!(machine.cpu.regs[16], 0x80);
        assert_eq!(machine.cpu.pc, 4);
        assert_eq!(machine.inspect_data(0x100, 1).unwrap(), vec![0]);
        assert_eq!(machine.snapshot().cpu, snap.cpu);
    }

    #[test]
    fn test_metrics_count_steps() {
        let mut machine = machine_with(&[ldi(16, 3), dec(16), brne(-2), BREAK]);
        let metrics = Arc::new(PerformanceMetrics::new());
        machine
            .signals()
            .subscribe(PerformanceMetrics::filter(), metrics.clone());

        machine.run(None);
        // ldi + 3 * (dec + brne)
        assert_eq!(metrics.get_instructions(), 7);
        assert_eq!(metrics.get_cycles(), 9);
    }

    #[test]
    fn test_inspect_data_core_registers() {
        let mut machine = machine_with(&[ldi(16, 0x12), SEI, BREAK]);
        machine.run(None);

        assert_eq!(machine.inspect_data(0x10, 1).unwrap(), vec![0x12]);
        assert_eq!(machine.inspect_data(0x5D, 3).unwrap(), vec![0xFF, 0x08, 0x80]);
        assert!(machine.inspect_data(0x900, 1).is_err());
    }

    struct Golden {
        name: &'static str,
        /// Single-cycle instructions preparing the operands.
        setup: Vec<u16>,
        code: Vec<u16>,
        /// Flash words placed after the closing `BREAK`.
        data: Vec<u16>,
        regs: Vec<(usize, u8)>,
        sreg: Sreg,
        /// Cycles taken by `code` alone.
        cycles: u64,
    }

    fn golden(
        name: &'static str,
        setup: Vec<u16>,
        code: Vec<u16>,
        regs: Vec<(usize, u8)>,
        sreg: Sreg,
        cycles: u64,
    ) -> Golden {
        Golden {
            name,
            setup,
            code,
            data: Vec::new(),
            regs,
            sreg,
            cycles,
        }
    }

    fn golden_cases() -> Vec<Golden> {
        vec![
            golden(
                "sub borrow",
                vec![ldi(16, 0x10), ldi(17, 0x20)],
                vec![rr(SUB, 16, 17)],
                vec![(16, 0xF0)],
                Sreg::C | Sreg::N | Sreg::S,
                1,
            ),
            golden(
                "sbc zero result keeps z clear",
                vec![ldi(16, 0x01), ldi(17, 0x00), SEC],
                vec![rr(SBC, 16, 17)],
                vec![(16, 0x00)],
                Sreg::empty(),
                1,
            ),
            golden(
                "cp cpc equal words",
                vec![ldi(18, 0x34), ldi(19, 0x12), ldi(20, 0x34), ldi(21, 0x12)],
                vec![rr(CP, 18, 20), rr(CPC, 19, 21)],
                vec![],
                Sreg::Z,
                2,
            ),
            golden(
                "cp cpc low bytes differ",
                vec![ldi(18, 0x35), ldi(19, 0x12), ldi(20, 0x34), ldi(21, 0x12)],
                vec![rr(CP, 18, 20), rr(CPC, 19, 21)],
                vec![],
                Sreg::empty(),
                2,
            ),
            golden(
                "neg 0x80",
                vec![ldi(16, 0x80)],
                vec![rd(NEG, 16)],
                vec![(16, 0x80)],
                Sreg::C | Sreg::N | Sreg::V,
                1,
            ),
            golden(
                "com",
                vec![ldi(16, 0x5A)],
                vec![rd(COM, 16)],
                vec![(16, 0xA5)],
                Sreg::C | Sreg::N | Sreg::S,
                1,
            ),
            golden(
                "asr keeps sign",
                vec![ldi(16, 0x81)],
                vec![rd(ASR, 16)],
                vec![(16, 0xC0)],
                Sreg::C | Sreg::N | Sreg::S,
                1,
            ),
            golden(
                "lsr to zero",
                vec![ldi(16, 0x01)],
                vec![rd(LSR, 16)],
                vec![(16, 0x00)],
                Sreg::C | Sreg::Z | Sreg::V | Sreg::S,
                1,
            ),
            golden(
                "ror shifts carry in",
                vec![ldi(16, 0x02), SEC],
                vec![rd(ROR, 16)],
                vec![(16, 0x81)],
                Sreg::N | Sreg::V,
                1,
            ),
            golden(
                "adiw signed overflow",
                vec![ldi(24, 0xFF), ldi(25, 0x7F)],
                vec![adiw(ADIW, 24, 1)],
                vec![(24, 0x00), (25, 0x80)],
                Sreg::N | Sreg::V,
                2,
            ),
            golden(
                "sbiw borrow",
                vec![ldi(26, 0x00), ldi(27, 0x00)],
                vec![adiw(SBIW, 26, 1)],
                vec![(26, 0xFF), (27, 0xFF)],
                Sreg::C | Sreg::N | Sreg::S,
                2,
            ),
            golden(
                "mul",
                vec![ldi(16, 0xFF), ldi(17, 0xFF)],
                vec![rr(MUL, 16, 17)],
                vec![(0, 0x01), (1, 0xFE)],
                Sreg::C,
                2,
            ),
            golden(
                "muls",
                vec![ldi(16, 0xFF), ldi(17, 0x02)],
                vec![mul_hi(MULS, 16, 17)],
                vec![(0, 0xFE), (1, 0xFF)],
                Sreg::C,
                2,
            ),
            golden(
                "mulsu",
                vec![ldi(16, 0xFF), ldi(17, 0x02)],
                vec![mul_hi(MULSU, 16, 17)],
                vec![(0, 0xFE), (1, 0xFF)],
                Sreg::C,
                2,
            ),
            golden(
                "fmul",
                vec![ldi(16, 0x40), ldi(17, 0x40)],
                vec![mul_hi(FMUL, 16, 17)],
                vec![(0, 0x00), (1, 0x20)],
                Sreg::empty(),
                2,
            ),
            golden(
                "fmuls minus one squared",
                vec![ldi(16, 0x80), ldi(17, 0x80)],
                vec![mul_hi(FMULS, 16, 17)],
                vec![(0, 0x00), (1, 0x80)],
                Sreg::empty(),
                2,
            ),
            golden(
                "fmulsu",
                vec![ldi(16, 0x80), ldi(17, 0xFF)],
                vec![mul_hi(FMULSU, 16, 17)],
                vec![(0, 0x00), (1, 0x01)],
                Sreg::C,
                2,
            ),
            golden(
                "cpse skips jmp",
                vec![ldi(16, 0x05), ldi(17, 0x05)],
                vec![rr(CPSE, 16, 17), JMP, 0x0000],
                vec![],
                Sreg::empty(),
                3,
            ),
            golden(
                "sbrs skips lds",
                vec![ldi(16, 0x80)],
                vec![0xFF07, 0x9110, 0x0100],
                vec![(17, 0x00)],
                Sreg::empty(),
                3,
            ),
            golden(
                "std ldd y+5",
                vec![ldi(28, 0x00), ldi(29, 0x01), ldi(16, 0xA5)],
                vec![displaced(STD_Y, 16, 5), displaced(LDD_Y, 17, 5)],
                vec![(17, 0xA5)],
                Sreg::empty(),
                4,
            ),
            Golden {
                data: vec![0xBEEF],
                // Z points at the word after BREAK (word 5, byte 10).
                ..golden(
                    "lpm z+",
                    vec![ldi(30, 10), ldi(31, 0)],
                    vec![rd(0x9005, 16), rd(0x9005, 17)],
                    vec![(16, 0xEF), (17, 0xBE), (30, 12), (31, 0)],
                    Sreg::empty(),
                    6,
                )
            },
            golden(
                "in out sreg and sp",
                vec![ldi(16, 0x83), ldi(18, 0x34)],
                vec![out(0x3F, 16), in_(17, 0x3F), out(0x3D, 18), in_(19, 0x3E), in_(20, 0x3D)],
                vec![(17, 0x83), (19, 0x08), (20, 0x34)],
                Sreg::I | Sreg::Z | Sreg::C,
                5,
            ),
        ]
    }

    #[test]
    fn test_instruction_golden_vectors() {
        for case in golden_cases() {
            let mut program = case.setup.clone();
            program.extend(&case.code);
            program.push(BREAK);
            program.extend(&case.data);
            let mut machine = machine_with(&program);

            let end = (case.setup.len() + case.code.len()) as u32;
            assert_eq!(machine.run(Some(1000)), StopReason::Break { pc: end }, "{}", case.name);
            for &(r, value) in &case.regs {
                assert_eq!(machine.cpu.regs[r], value, "{}: r{}", case.name, r);
            }
            assert_eq!(machine.cpu.sreg, case.sreg, "{}", case.name);
            assert_eq!(
                machine.cycle(),
                case.setup.len() as u64 + case.cycles + 1,
                "{}",
                case.name
            );
        }
    }

    #[test]
    fn test_std_writes_sram() {
        let mut machine = machine_with(&[
            ldi(28, 0x00),
            ldi(29, 0x01),
            ldi(16, 0xA5),
            displaced(STD_Y, 16, 5),
            BREAK,
        ]);
        machine.run(None);
        assert_eq!(machine.inspect_data(0x105, 1).unwrap(), vec![0xA5]);
    }

    fn atmega2560() -> McuDescriptor {
        McuDescriptor {
            name: "atmega2560".to_string(),
            flash: "256KiB".to_string(),
            sram: "8KiB".to_string(),
            sram_start: 0x200,
            ..McuDescriptor::atmega328p()
        }
    }

    #[test]
    fn test_elpm_post_increment_carries_into_rampz() {
        let program = [ldi(30, 0xFF), ldi(31, 0xFF), rd(0x9007, 16), BREAK];
        let mut builder = Firmware::builder();
        builder
            .add_block(
                Area::Flash,
                0,
                program.iter().flat_map(|w| w.to_le_bytes()).collect(),
            )
            .add_block(Area::Flash, 0xFFFE, vec![0x00, 0x5A]);
        let mut machine = Machine::new(&atmega2560()).unwrap();
        machine.load_firmware(&builder.build().unwrap()).unwrap();

        assert_eq!(machine.run(None), StopReason::Break { pc: 3 });
        assert_eq!(machine.cpu.regs[16], 0x5A);
        assert_eq!(machine.cpu.word(30), 0x0000);
        assert_eq!(machine.cpu.rampz, 1);
        assert_eq!(machine.cycle(), 2 + 3 + 1);
    }

    #[test]
    fn test_elpm_without_rampz_is_a_decode_fault() {
        let mut machine = machine_with(&[rd(0x9007, 16)]);
        assert_eq!(
            machine.run(None),
            StopReason::Fault {
                pc: 0,
                error: SimulationError::DecodeError {
                    pc: 0,
                    opcode: 0x9107
                }
            }
        );
    }

    // Period-1 timer keeps vector 1 pending at every RETI.
    #[test]
    fn test_reti_runs_one_instruction_before_pending_interrupt() {
        let program = [
            rjmp(3), // 0: reset -> main
            NOP,
            rjmp(9), // 2: vector 1 -> isr
            NOP,
            ldi(16, 1), // 4: main
            out(0x21, 16), // PERIOD_L
            ldi(16, 0x03),
            out(0x20, 16), // CTRL = EN | IE
            SEI,
            inc(21), // 9
            rjmp(-2),
            NOP,
            inc(20), // 12: isr
            cpi(20, 3),
            brne(1),
            BREAK, // 15
            RETI,
        ];
        let mut machine = machine_with(&program);
        let timer = TickTimer::new(0x40, 1);
        let io = timer.io_addresses();
        machine.register_device(Box::new(timer), &io, &[1]).unwrap();

        assert_eq!(machine.run(Some(10_000)), StopReason::Break { pc: 15 });
        assert_eq!(machine.cpu.regs[20], 3);
        // SEI lets `inc r21` through, the first RETI lets `rjmp` through and
        // the second lets `inc r21` through again.
        assert_eq!(machine.cpu.regs[21], 2);
        assert!(!machine.cpu.sreg.contains(Sreg::I));
    }

    #[test]
    fn test_wake_from_sleep_adds_latency() {
        let mut machine = timer_machine();
        let woken = Arc::new(Mutex::new(Vec::new()));
        let w = woken.clone();
        machine.signals().subscribe_fn(
            SignalFilter::new(SignalSource::Core, SignalKind::Wake),
            move |sig| w.lock().unwrap().push(sig.cycle),
        );

        assert_eq!(machine.run(Some(110)), StopReason::CycleLimit);
        assert_eq!(*woken.lock().unwrap(), vec![105]);
        // Woken at 105, then 4 wake-up and 4 entry cycles.
        assert_eq!(machine.cycle(), 113);
        assert_eq!(machine.cpu.pc, 2);
    }

    #[test]
    fn test_two_word_instruction_at_end_of_flash_wraps() {
        let low: Vec<u16> = vec![0x0004, NOP, NOP, NOP, BREAK];
        let mut builder = Firmware::builder();
        builder
            .add_block(Area::Flash, 0, low.iter().flat_map(|w| w.to_le_bytes()).collect())
            .add_block(Area::Flash, 0x7FFE, JMP.to_le_bytes().to_vec());
        let mut machine = Machine::new(&McuDescriptor::atmega328p()).unwrap();
        machine.load_firmware(&builder.build().unwrap()).unwrap();
        machine.cpu.pc = 0x3FFF;

        // jmp 4, its target word read from word 0
        assert_eq!(machine.run(None), StopReason::Break { pc: 4 });
        assert_eq!(machine.cycle(), 3 + 1);
    }

    #[test]
    fn test_unbounded_step_does_not_overflow() {
        let mut machine = machine_with(&[NOP, BREAK]);
        assert_eq!(machine.step(u64::MAX), StopReason::Break { pc: 1 });

        let mut machine = machine_with(&[NOP, NOP, BREAK]);
        assert_eq!(machine.run(Some(1)), StopReason::CycleLimit);
        assert_eq!(machine.run(Some(u64::MAX)), StopReason::Break { pc: 2 });
    }

    #[test]
    fn test_inspect_data_past_full_data_space() {
        let mcu = McuDescriptor {
            sram: "65024".to_string(),
            sram_start: 0x200,
            ..McuDescriptor::atmega328p()
        };
        let machine = Machine::new(&mcu).unwrap();

        assert_eq!(machine.inspect_data(0, 0x1_0000).unwrap().len(), 0x1_0000);
        assert_eq!(
            machine.inspect_data(0, 0x1_0001),
            Err(SimulationError::MemoryViolation(0x1_0000))
        );
    }

    #[test]
    fn test_real_time_run_follows_clock() {
        let mcu = McuDescriptor {
            frequency: Some(10_000),
            ..McuDescriptor::atmega328p()
        };
        let mut machine = Machine::new(&mcu).unwrap().with_config(SimulationConfig {
            real_time: true,
            ..Default::default()
        });
        machine.load_firmware(&firmware(&[NOP, rjmp(-2)])).unwrap();
        assert_eq!(machine.frequency(), Some(10_000));

        let start = Instant::now();
        assert_eq!(machine.run(Some(500)), StopReason::CycleLimit);
        // 500 cycles at 10 kHz
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_firmware_frequency_overrides_mcu() {
        let mut machine = Machine::new(&McuDescriptor::atmega328p()).unwrap();
        assert_eq!(machine.frequency(), Some(16_000_000));
        machine
            .load_firmware(&firmware(&[BREAK]).with_frequency(8_000_000))
            .unwrap();
        assert_eq!(machine.frequency(), Some(8_000_000));
    }
}
