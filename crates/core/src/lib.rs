// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod cpu;
pub mod decoder;
pub mod device;
pub mod firmware;
pub mod interrupt;
pub mod memory;
pub mod metrics;
pub mod peripherals;
pub mod scheduler;
pub mod signals;
pub mod snapshot;

use crate::bus::{MemoryLayout, SystemBus, SPH, SPL, SREG};
use crate::cpu::{AvrCore, CoreLayout, Sreg, StepOutcome};
use crate::device::{Device, DeviceId};
use crate::firmware::{Area, Firmware, FirmwareError};
use crate::memory::MemoryError;
use crate::scheduler::{CycleScheduler, Deferred, Due, Pacer, TimerId};
use crate::signals::{Signal, SignalBus, SignalData, SignalKind, SignalSource};
use crate::snapshot::MachineSnapshot;
use labwired_avr_config::{McuDescriptor, StopKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest uninterrupted wait while pacing, so stop requests stay responsive.
const PACING_SLICE: Duration = Duration::from_millis(10);

mod tests;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u32),
    #[error("Instruction decoding error at {pc:#x}: opcode {opcode:#06x}")]
    DecodeError { pc: u32, opcode: u16 },
    #[error("Stack fault at {pc:#x}: SP={sp:#06x}")]
    StackFault { pc: u32, sp: u16 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Setup mistakes, detected when a device or MCU is configured.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid interrupt vector {0}")]
    InvalidVector(u8),
    #[error("Vector {vector} is already owned by {owner}")]
    VectorInUse { vector: u8, owner: DeviceId },
    #[error("Vector {vector} is not owned by {device}")]
    VectorNotOwned { vector: u8, device: DeviceId },
    #[error("Vector {0} is listed twice")]
    DuplicateVector(u8),
    #[error("I/O address {addr:#x} is already owned by {owner}")]
    IoAddressInUse { addr: u16, owner: DeviceId },
    #[error("I/O address {0:#x} is listed twice")]
    DuplicateIoAddress(u16),
    #[error("I/O address {0:#x} is implemented by the core")]
    ReservedIoAddress(u16),
    #[error("Address {0:#x} is outside of the I/O space")]
    IoAddressOutOfRange(u16),
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("Invalid {region} capacity: {reason}")]
    InvalidCapacity { region: String, reason: String },
}

/// Memory and interrupt access as seen by the CPU core.
pub trait Bus {
    /// Data-space read above the core registers.
    fn read_u8(&mut self, addr: u16) -> SimResult<u8>;
    fn write_u8(&mut self, addr: u16, value: u8) -> SimResult<()>;
    /// Instruction word at a flash word address.
    fn fetch(&self, word_addr: u32) -> SimResult<u16>;
    /// Program-memory byte for LPM/ELPM.
    fn read_program(&self, addr: u32) -> SimResult<u8>;
    /// Self-programming of one flash word (SPM).
    fn write_program(&mut self, addr: u32, word: u16) -> SimResult<()>;
    fn pending_interrupt(&self, global_enable: bool) -> Option<u8>;
    /// Commits to entering `vector`; returns its word address.
    fn acknowledge_interrupt(&mut self, vector: u8, sreg: &mut Sreg) -> SimResult<u32>;
    fn return_from_interrupt(&mut self);

    fn read_u16(&mut self, addr: u16) -> SimResult<u16> {
        let lo = self.read_u8(addr)? as u16;
        let hi = self.read_u8(addr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn write_u16(&mut self, addr: u16, value: u16) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr.wrapping_add(1), (value >> 8) as u8)?;
        Ok(())
    }
}

/// Runtime knobs of a simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Stop on jump-to-self or sleep while interrupts are disabled.
    pub detect_infinite_loop: bool,
    /// Stop on `BREAK`; otherwise it executes as `NOP`.
    pub stop_on_break: bool,
    /// Publish a `Step` signal for every retired instruction.
    pub emit_step_signals: bool,
    /// Hold runs back to the MCU clock frequency instead of running flat out.
    pub real_time: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            detect_infinite_loop: true,
            stop_on_break: true,
            emit_step_signals: true,
            real_time: false,
        }
    }
}

/// Why a run returned. `pc` values are flash word addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    CycleLimit,
    Requested,
    Sleep { pc: u32 },
    InfiniteLoop { pc: u32 },
    Break { pc: u32 },
    Fault { pc: u32, error: SimulationError },
}

impl StopReason {
    pub fn is_fault(&self) -> bool {
        matches!(self, StopReason::Fault { .. })
    }

    pub fn kind(&self) -> StopKind {
        match self {
            StopReason::CycleLimit => StopKind::CycleLimit,
            StopReason::Requested => StopKind::Requested,
            StopReason::Sleep { .. } => StopKind::Sleep,
            StopReason::InfiniteLoop { .. } => StopKind::InfiniteLoop,
            StopReason::Break { .. } => StopKind::Break,
            StopReason::Fault { error, .. } => match error {
                SimulationError::MemoryViolation(_) | SimulationError::Memory(_) => {
                    StopKind::MemoryViolation
                }
                SimulationError::DecodeError { .. } => StopKind::DecodeError,
                SimulationError::StackFault { .. } => StopKind::StackFault,
                _ => StopKind::Fault,
            },
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::CycleLimit => write!(f, "cycle limit reached"),
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::Sleep { pc } => write!(f, "sleeping with no wake source at {:#x}", pc),
            StopReason::InfiniteLoop { pc } => write!(f, "infinite loop at {:#x}", pc),
            StopReason::Break { pc } => write!(f, "break at {:#x}", pc),
            StopReason::Fault { pc, error } => write!(f, "fault at {:#x}: {}", pc, error),
        }
    }
}

/// One simulated MCU: core, buses, devices and the clock that drives them.
pub struct Machine {
    pub cpu: AvrCore,
    pub bus: SystemBus,
    pub scheduler: CycleScheduler,
    pub config: SimulationConfig,
    signals: Arc<SignalBus>,
    stop: Arc<AtomicBool>,
    horizon: Option<u64>,
    console: Option<DeviceId>,
    frequency: Option<u64>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("cpu", &self.cpu)
            .field("cycle", &self.scheduler.cycle())
            .field("config", &self.config)
            .field("frequency", &self.frequency)
            .finish()
    }
}

impl Machine {
    pub fn new(mcu: &McuDescriptor) -> SimResult<Self> {
        let layout = MemoryLayout::from_descriptor(mcu)?;
        tracing::debug!("Creating {} machine: {:?}", mcu.name, layout);
        let mut machine = Self::with_layout(layout);
        machine.frequency = mcu.frequency;
        Ok(machine)
    }

    pub fn with_layout(layout: MemoryLayout) -> Self {
        let signals = Arc::new(SignalBus::new());
        let cpu = AvrCore::new(CoreLayout::from(&layout));
        let bus = SystemBus::new(layout, signals.clone());
        let mut machine = Self {
            cpu,
            bus,
            scheduler: CycleScheduler::new(),
            config: SimulationConfig::default(),
            signals,
            stop: Arc::new(AtomicBool::new(false)),
            horizon: None,
            console: None,
            frequency: None,
        };
        machine.apply_config();
        machine
    }

    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self.apply_config();
        self
    }

    fn apply_config(&mut self) {
        self.cpu.stop_on_break = self.config.stop_on_break;
        self.cpu.detect_infinite_loop = self.config.detect_infinite_loop;
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn cycle(&self) -> u64 {
        self.scheduler.cycle()
    }

    /// Clock frequency in Hz used for real-time pacing.
    pub fn frequency(&self) -> Option<u64> {
        self.frequency
    }

    pub fn set_frequency(&mut self, hz: Option<u64>) {
        self.frequency = hz;
    }

    /// Flag that stops a run at the next tick boundary. Safe to set from
    /// another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn emit(&self, source: SignalSource, kind: SignalKind, data: SignalData) {
        self.signals.emit(Signal {
            source,
            kind,
            cycle: self.scheduler.cycle(),
            data,
        });
    }

    pub fn register_device(
        &mut self,
        dev: Box<dyn Device>,
        io: &[u16],
        vectors: &[u8],
    ) -> SimResult<DeviceId> {
        self.bus.sync_cycle(self.scheduler.cycle());
        Ok(self.bus.attach(dev, io, vectors)?)
    }

    pub fn deregister_device(&mut self, id: DeviceId) -> SimResult<Box<dyn Device>> {
        let dev = self.bus.detach(id)?;
        self.scheduler.cancel_device(id);
        if self.console == Some(id) {
            self.console = None;
        }
        Ok(dev)
    }

    /// Typed access to a registered device.
    pub fn device<T: 'static>(&self, id: DeviceId) -> Option<&T> {
        self.bus
            .io
            .device(id)?
            .dev
            .as_any()?
            .downcast_ref::<T>()
    }

    pub fn device_mut<T: 'static>(&mut self, id: DeviceId) -> Option<&mut T> {
        self.bus
            .io
            .device_mut(id)?
            .dev
            .as_any_mut()?
            .downcast_mut::<T>()
    }

    /// Asks the scheduler to advance `id` at absolute cycle `at`.
    pub fn schedule_device(&mut self, id: DeviceId, at: u64) -> SimResult<()> {
        if self.bus.io.device(id).is_none() {
            return Err(ConfigError::UnknownDevice(id).into());
        }
        self.scheduler.schedule_device(id, at);
        Ok(())
    }

    /// Runs `callback` at the first tick boundary `delay` cycles from now.
    pub fn defer<F>(&mut self, delay: u64, callback: F) -> TimerId
    where
        F: FnOnce(&mut Machine) -> SimResult<()> + Send + 'static,
    {
        let callback: Deferred = Box::new(callback);
        self.scheduler.defer(delay, callback)
    }

    pub fn cancel_deferred(&mut self, id: TimerId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Installs the console pseudo-device on a data-space I/O address.
    pub fn attach_console(&mut self, addr: u16) -> SimResult<DeviceId> {
        let id = self.register_device(
            Box::new(peripherals::console::Console::new(addr)),
            &[addr],
            &[],
        )?;
        self.console = Some(id);
        Ok(id)
    }

    pub fn console(&self) -> Option<&peripherals::console::Console> {
        self.device(self.console?)
    }

    /// Programs every area the firmware carries, then resets.
    ///
    /// A failed load leaves the target region partially written.
    pub fn load_firmware(&mut self, firmware: &Firmware) -> SimResult<()> {
        if !firmware.has_memory(Area::Flash) {
            return Err(FirmwareError::MissingArea(Area::Flash).into());
        }

        for area in Area::ALL {
            if !firmware.has_memory(area) {
                continue;
            }
            let region = self.bus.region_mut(area);
            if region.size() == 0 {
                tracing::warn!("Firmware has {} content but the MCU has no {} memory", area, area);
                continue;
            }
            region.unlock();
            region.erase()?;
            firmware.load_memory(area, region)?;
            tracing::debug!(
                "Loaded {} bytes into {} ({} blocks)",
                firmware.memory_size(area),
                area,
                firmware.blocks(area).len()
            );
        }
        self.bus.fuses.lock();
        self.bus.lock.lock();
        self.bus.signature.lock();

        tracing::info!(
            "Firmware loaded: data {} bytes, bss {} bytes",
            firmware.datasize(),
            firmware.bsssize()
        );

        if let Some(hz) = firmware.frequency() {
            self.frequency = Some(hz);
        }

        if let Some(addr) = firmware.console_register() {
            if self.console.is_none() {
                self.attach_console(addr)?;
            }
        }

        self.reset();
        Ok(())
    }

    /// Resets the core, the I/O space and every device. Time keeps running
    /// and SRAM keeps its content, as it does across a hardware reset.
    pub fn reset(&mut self) {
        let now = self.scheduler.cycle();
        self.cpu.reset();
        self.bus.reset(now);
        self.scheduler.clear_devices();
        self.stop.store(false, Ordering::SeqCst);
        tracing::debug!("Reset at cycle {}", now);
        self.emit(SignalSource::Core, SignalKind::Reset, SignalData::None);
    }

    fn fault(&self, pc: u32, error: SimulationError) -> StopReason {
        tracing::error!("Simulation fault at {:#x}: {}", pc, error);
        self.emit(
            SignalSource::Core,
            SignalKind::Fault,
            SignalData::Text(error.to_string()),
        );
        StopReason::Fault { pc, error }
    }

    /// One scheduler iteration: the CPU, then every device that is due.
    pub fn tick(&mut self) -> Option<StopReason> {
        if self.stop.swap(false, Ordering::SeqCst) {
            return Some(StopReason::Requested);
        }

        let now = self.scheduler.cycle();
        self.bus.sync_cycle(now);
        let pc = self.cpu.pc;
        let was_sleeping = self.cpu.sleeping;

        let outcome = match self.cpu.step(&mut self.bus) {
            Ok(outcome) => outcome,
            Err(error) => return Some(self.fault(pc, error)),
        };

        match outcome {
            StepOutcome::Executed {
                pc, opcode, cycles, ..
            } => {
                if self.config.emit_step_signals {
                    self.signals.emit(Signal {
                        source: SignalSource::Core,
                        kind: SignalKind::Step,
                        cycle: now,
                        data: SignalData::Step { pc, opcode, cycles },
                    });
                }
                self.scheduler.advance(cycles as u64);
                if self.cpu.sleeping && !was_sleeping {
                    self.emit(SignalSource::Core, SignalKind::Sleep, SignalData::Value(pc));
                }
            }
            StepOutcome::Woken { vector, cycles } => {
                self.emit(SignalSource::Core, SignalKind::Wake, SignalData::Vector(vector));
                self.scheduler.advance(cycles as u64);
            }
            StepOutcome::Sleeping => {
                let pc = self.cpu.pc;
                if !self.cpu.sreg.contains(Sreg::I) && self.config.detect_infinite_loop {
                    tracing::info!("Sleeping with interrupts disabled at {:#x}", pc);
                    return Some(StopReason::Sleep { pc });
                }
                match (self.scheduler.next_due(), self.horizon) {
                    (None, _) => {
                        tracing::info!("Sleeping with nothing left to wake the core at {:#x}", pc);
                        return Some(StopReason::Sleep { pc });
                    }
                    (Some(due), Some(limit)) if due > limit => self.scheduler.advance_to(limit),
                    (Some(due), _) => self.scheduler.advance_to(due),
                }
            }
            StepOutcome::Break { pc, cycles } => {
                self.scheduler.advance(cycles as u64);
                self.emit(SignalSource::Core, SignalKind::Break, SignalData::Value(pc));
                return Some(StopReason::Break { pc });
            }
            StepOutcome::InfiniteLoop { pc } => {
                tracing::info!("Infinite loop with interrupts disabled at {:#x}", pc);
                return Some(StopReason::InfiniteLoop { pc });
            }
        }

        if let Err(error) = self.service_devices() {
            return Some(self.fault(self.cpu.pc, error));
        }
        None
    }

    fn apply_wake_requests(&mut self) {
        for (id, at) in self.bus.take_wake_requests() {
            if self.bus.io.device(id).is_some() {
                self.scheduler.schedule_device(id, at);
            }
        }
    }

    fn service_devices(&mut self) -> SimResult<()> {
        self.apply_wake_requests();
        for due in self.scheduler.take_due() {
            match due {
                Due::Device(id) => {
                    if self.bus.io.device(id).is_none() {
                        continue;
                    }
                    let now = self.scheduler.cycle();
                    self.bus.sync_cycle(now);
                    if let Some(delay) = self.bus.advance_device(id, now)? {
                        self.scheduler.schedule_device(id, now + delay.max(1));
                    }
                    self.emit(
                        SignalSource::Scheduler,
                        SignalKind::DeviceAdvanced,
                        SignalData::Value(id.0),
                    );
                }
                Due::Deferred(_, callback) => callback(self)?,
            }
        }
        self.apply_wake_requests();
        Ok(())
    }

    fn pacer(&self) -> Option<Pacer> {
        if !self.config.real_time {
            return None;
        }
        match self.frequency {
            Some(hz) if hz > 0 => Some(Pacer::new(hz, self.scheduler.cycle())),
            _ => {
                tracing::warn!("Real-time mode needs a clock frequency; running unpaced");
                None
            }
        }
    }

    /// Sleeps for `wait`, waking early if a stop is requested.
    fn hold(&self, wait: Duration) {
        let mut remaining = wait;
        while !remaining.is_zero() && !self.stop.load(Ordering::SeqCst) {
            let slice = remaining.min(PACING_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }

    fn run_until(&mut self, limit: Option<u64>) -> StopReason {
        self.horizon = limit;
        let mut pacer = self.pacer();
        let reason = loop {
            if limit.is_some_and(|l| self.scheduler.cycle() >= l) {
                break StopReason::CycleLimit;
            }
            if let Some(reason) = self.tick() {
                break reason;
            }
            if let Some(wait) = pacer.as_mut().and_then(|p| p.lead(self.scheduler.cycle())) {
                self.hold(wait);
            }
        };
        self.horizon = None;
        tracing::debug!("Stopped at cycle {}: {}", self.scheduler.cycle(), reason);
        self.emit(
            SignalSource::Scheduler,
            SignalKind::Stopped,
            SignalData::Text(reason.to_string()),
        );
        reason
    }

    /// Runs for at most `cycles` more cycles.
    pub fn step(&mut self, cycles: u64) -> StopReason {
        let limit = self.scheduler.cycle().saturating_add(cycles);
        self.run_until(Some(limit))
    }

    /// Runs until a stop condition, or `max_cycles` more cycles if given.
    pub fn run(&mut self, max_cycles: Option<u64>) -> StopReason {
        let limit = max_cycles.map(|m| self.scheduler.cycle().saturating_add(m));
        self.run_until(limit)
    }

    /// Copy of `len` bytes of an NVM area.
    pub fn inspect(&self, area: Area, base: u32, len: usize) -> SimResult<Vec<u8>> {
        Ok(self.bus.region(area).block(base, len)?.to_vec())
    }

    /// Copy of data-space content, without triggering device side effects.
    pub fn inspect_data(&self, addr: u16, len: usize) -> SimResult<Vec<u8>> {
        (0..len)
            .map(|i| {
                let a = u16::try_from(i)
                    .ok()
                    .and_then(|i| addr.checked_add(i))
                    .ok_or(SimulationError::MemoryViolation((addr as usize + i) as u32))?;
                let value = match a {
                    0x00..=0x1F => Some(self.cpu.regs[a as usize]),
                    SREG => Some(self.cpu.sreg.bits()),
                    SPL => Some(self.cpu.sp as u8),
                    SPH => Some((self.cpu.sp >> 8) as u8),
                    _ => self.bus.peek(a),
                };
                value.ok_or(SimulationError::MemoryViolation(a as u32))
            })
            .collect()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let memories = Area::ALL
            .iter()
            .map(|&a| (a.name().to_string(), self.bus.region(a).as_slice().to_vec()))
            .chain(std::iter::once((
                self.bus.sram.name().to_string(),
                self.bus.sram.as_slice().to_vec(),
            )))
            .collect();
        let devices = self
            .bus
            .io
            .devices()
            .map(|(id, slot)| (format!("{}:{}", id.0, slot.name), slot.dev.snapshot()))
            .collect::<BTreeMap<_, _>>();
        MachineSnapshot {
            cycle: self.scheduler.cycle(),
            cpu: self.cpu.snapshot(),
            memories,
            io: self.bus.io.registers().to_vec(),
            devices,
        }
    }

    /// Puts the CPU, memories and plain I/O registers back. Time is not
    /// rewound and device state is left alone.
    pub fn restore(&mut self, snap: &MachineSnapshot) -> SimResult<()> {
        for (name, bytes) in &snap.memories {
            let region = if name == self.bus.sram.name() {
                &mut self.bus.sram
            } else {
                match Area::ALL.iter().find(|a| a.name() == name.as_str()) {
                    Some(&area) => self.bus.region_mut(area),
                    None => {
                        tracing::warn!("Snapshot has unknown memory '{}'", name);
                        continue;
                    }
                }
            };
            region.restore(bytes)?;
        }
        self.bus.io.restore_registers(&snap.io);
        self.cpu.restore(&snap.cpu);
        Ok(())
    }
}
