// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::cpu::Sreg;
use crate::device::{Device, DeviceContext, DeviceId};
use crate::firmware::Area;
use crate::interrupt::InterruptController;
use crate::memory::MemoryRegion;
use crate::signals::{Signal, SignalBus, SignalData, SignalKind, SignalSource};
use crate::{Bus, ConfigError, SimResult, SimulationError};
use labwired_avr_config::{parse_size, McuDescriptor};
use std::collections::BTreeMap;
use std::sync::Arc;

/// First data-space address of the I/O register file.
pub const IO_START: u16 = 0x20;
pub const RAMPZ: u16 = 0x5B;
pub const EIND: u16 = 0x5C;
pub const SPL: u16 = 0x5D;
pub const SPH: u16 = 0x5E;
pub const SREG: u16 = 0x5F;

/// Sizes and data-space layout of one MCU, resolved from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub flash_size: usize,
    pub sram_start: u16,
    pub sram_size: usize,
    pub eeprom_size: usize,
    pub fuses_size: usize,
    pub lock_size: usize,
    pub signature_size: usize,
    pub user_signature_size: usize,
    pub vector_count: u16,
    pub vector_size: u8,
}

impl MemoryLayout {
    pub fn from_descriptor(mcu: &McuDescriptor) -> Result<Self, ConfigError> {
        let size = |what: &str, s: &str| -> Result<usize, ConfigError> {
            parse_size(s)
                .map(|v| v as usize)
                .map_err(|e| ConfigError::InvalidCapacity {
                    region: what.to_string(),
                    reason: e.to_string(),
                })
        };
        let layout = Self {
            flash_size: size("flash", &mcu.flash)?,
            sram_start: mcu.sram_start,
            sram_size: size("sram", &mcu.sram)?,
            eeprom_size: size("eeprom", &mcu.eeprom)?,
            fuses_size: size("fuses", &mcu.fuses)?,
            lock_size: size("lock", &mcu.lock)?,
            signature_size: size("signature", &mcu.signature)?,
            user_signature_size: size("user_signature", &mcu.user_signature)?,
            vector_count: mcu.vectors.count,
            vector_size: mcu.vectors.size,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |region: &str, reason: String| ConfigError::InvalidCapacity {
            region: region.to_string(),
            reason,
        };
        if self.flash_size == 0 || self.flash_size % 2 != 0 || self.flash_size > 0x80_0000 {
            return Err(invalid("flash", format!("unsupported size {}", self.flash_size)));
        }
        if self.sram_start <= SREG {
            return Err(invalid(
                "sram",
                format!("start {:#x} overlaps the core registers", self.sram_start),
            ));
        }
        if self.sram_size == 0 || self.sram_start as usize + self.sram_size > 0x1_0000 {
            return Err(invalid("sram", format!("unsupported size {}", self.sram_size)));
        }
        if self.vector_count == 0 || !matches!(self.vector_size, 1 | 2) {
            return Err(invalid(
                "vectors",
                format!("{} vectors of {} words", self.vector_count, self.vector_size),
            ));
        }
        Ok(())
    }

    /// Last SRAM address; the stack pointer starts here.
    pub fn ramend(&self) -> u16 {
        (self.sram_start as usize + self.sram_size - 1) as u16
    }

    /// Devices with more than 128 KiB of flash use a 22-bit program counter.
    pub fn pc_22bit(&self) -> bool {
        self.flash_size > 0x2_0000
    }

    pub fn has_rampz(&self) -> bool {
        self.flash_size > 0x1_0000
    }

    pub fn has_eind(&self) -> bool {
        self.pc_22bit()
    }

    /// I/O addresses the core implements itself.
    pub fn reserved_io(&self) -> Vec<u16> {
        let mut reserved = vec![SPL, SPH, SREG];
        if self.has_rampz() {
            reserved.push(RAMPZ);
        }
        if self.has_eind() {
            reserved.push(EIND);
        }
        reserved
    }

    pub fn area_size(&self, area: Area) -> usize {
        match area {
            Area::Flash => self.flash_size,
            Area::Eeprom => self.eeprom_size,
            Area::Fuses => self.fuses_size,
            Area::Lock => self.lock_size,
            Area::Signature => self.signature_size,
            Area::UserSignature => self.user_signature_size,
        }
    }
}

#[derive(Debug)]
pub struct DeviceSlot {
    pub name: String,
    pub io: Vec<u16>,
    pub vectors: Vec<u8>,
    pub last_advance: u64,
    pub dev: Box<dyn Device>,
}

/// Routes I/O register accesses to their owning device.
///
/// Addresses nobody owns behave as plain read/write registers.
#[derive(Debug)]
pub struct IoRouter {
    registers: Vec<u8>,
    owners: Vec<Option<DeviceId>>,
    reserved: Vec<u16>,
    devices: BTreeMap<DeviceId, DeviceSlot>,
    next_id: u32,
}

impl IoRouter {
    pub fn new(sram_start: u16, reserved: Vec<u16>) -> Self {
        let len = (sram_start - IO_START) as usize;
        Self {
            registers: vec![0; len],
            owners: vec![None; len],
            reserved,
            devices: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn index(&self, addr: u16) -> Option<usize> {
        addr.checked_sub(IO_START)
            .map(|i| i as usize)
            .filter(|&i| i < self.registers.len())
    }

    pub fn owner(&self, addr: u16) -> Option<DeviceId> {
        self.index(addr).and_then(|i| self.owners[i])
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceSlot> {
        self.devices.get(&id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut DeviceSlot> {
        self.devices.get_mut(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceId, &DeviceSlot)> {
        self.devices.iter().map(|(id, slot)| (*id, slot))
    }

    fn check_claim(&self, io: &[u16]) -> Result<(), ConfigError> {
        for (n, &addr) in io.iter().enumerate() {
            if self.reserved.contains(&addr) {
                return Err(ConfigError::ReservedIoAddress(addr));
            }
            let idx = self.index(addr).ok_or(ConfigError::IoAddressOutOfRange(addr))?;
            if let Some(owner) = self.owners[idx] {
                return Err(ConfigError::IoAddressInUse { addr, owner });
            }
            if io[..n].contains(&addr) {
                return Err(ConfigError::DuplicateIoAddress(addr));
            }
        }
        Ok(())
    }

    /// Plain register content, ignoring ownership.
    pub fn register(&self, addr: u16) -> Option<u8> {
        self.index(addr).map(|i| self.registers[i])
    }

    pub fn set_register(&mut self, addr: u16, value: u8) -> bool {
        match self.index(addr) {
            Some(i) => {
                self.registers[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    pub fn restore_registers(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.registers.len());
        self.registers[..n].copy_from_slice(&bytes[..n]);
    }

    fn reset(&mut self, now: u64) {
        self.registers.fill(0);
        for slot in self.devices.values_mut() {
            slot.dev.reset();
            slot.last_advance = now;
        }
    }
}

/// The data, program and NVM spaces of one MCU plus the interrupt controller.
#[derive(Debug)]
pub struct SystemBus {
    pub layout: MemoryLayout,
    pub flash: MemoryRegion,
    pub sram: MemoryRegion,
    pub eeprom: MemoryRegion,
    pub fuses: MemoryRegion,
    pub lock: MemoryRegion,
    pub signature: MemoryRegion,
    pub user_signature: MemoryRegion,
    pub io: IoRouter,
    pub interrupts: InterruptController,
    signals: Arc<SignalBus>,
    cycle: u64,
    wake_requests: Vec<(DeviceId, u64)>,
}

impl SystemBus {
    pub fn new(layout: MemoryLayout, signals: Arc<SignalBus>) -> Self {
        let io = IoRouter::new(layout.sram_start, layout.reserved_io());
        let interrupts = InterruptController::new(layout.vector_count, layout.vector_size);
        Self {
            flash: MemoryRegion::for_area(Area::Flash, layout.flash_size),
            sram: MemoryRegion::new("sram", layout.sram_size),
            eeprom: MemoryRegion::for_area(Area::Eeprom, layout.eeprom_size),
            fuses: MemoryRegion::for_area(Area::Fuses, layout.fuses_size),
            lock: MemoryRegion::for_area(Area::Lock, layout.lock_size),
            signature: MemoryRegion::for_area(Area::Signature, layout.signature_size),
            user_signature: MemoryRegion::for_area(Area::UserSignature, layout.user_signature_size),
            io,
            interrupts,
            signals,
            cycle: 0,
            wake_requests: Vec::new(),
            layout,
        }
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn region(&self, area: Area) -> &MemoryRegion {
        match area {
            Area::Flash => &self.flash,
            Area::Eeprom => &self.eeprom,
            Area::Fuses => &self.fuses,
            Area::Lock => &self.lock,
            Area::Signature => &self.signature,
            Area::UserSignature => &self.user_signature,
        }
    }

    pub fn region_mut(&mut self, area: Area) -> &mut MemoryRegion {
        match area {
            Area::Flash => &mut self.flash,
            Area::Eeprom => &mut self.eeprom,
            Area::Fuses => &mut self.fuses,
            Area::Lock => &mut self.lock,
            Area::Signature => &mut self.signature,
            Area::UserSignature => &mut self.user_signature,
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Mirrors the scheduler clock for handlers running inside an instruction.
    pub(crate) fn sync_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    pub(crate) fn take_wake_requests(&mut self) -> Vec<(DeviceId, u64)> {
        std::mem::take(&mut self.wake_requests)
    }

    /// Validates and installs a device. Nothing changes if any claim fails.
    pub fn attach(
        &mut self,
        dev: Box<dyn Device>,
        io: &[u16],
        vectors: &[u8],
    ) -> Result<DeviceId, ConfigError> {
        self.io.check_claim(io)?;
        for (n, &vector) in vectors.iter().enumerate() {
            if vector == 0 || vector as usize >= self.interrupts.vector_count() {
                return Err(ConfigError::InvalidVector(vector));
            }
            if let Some(owner) = self.interrupts.owner(vector) {
                return Err(ConfigError::VectorInUse { vector, owner });
            }
            if vectors[..n].contains(&vector) {
                return Err(ConfigError::DuplicateVector(vector));
            }
        }

        self.io.next_id += 1;
        let id = DeviceId(self.io.next_id);
        for &addr in io {
            if let Some(i) = self.io.index(addr) {
                self.io.owners[i] = Some(id);
            }
        }
        for &vector in vectors {
            self.interrupts.register(vector, id)?;
        }

        let name = dev.name().to_string();
        tracing::debug!(
            "Registered {} as {} (io {:x?}, vectors {:?})",
            name,
            id,
            io,
            vectors
        );
        self.io.devices.insert(
            id,
            DeviceSlot {
                name,
                io: io.to_vec(),
                vectors: vectors.to_vec(),
                last_advance: self.cycle,
                dev,
            },
        );
        Ok(id)
    }

    /// Removes a device, releasing its addresses and vectors.
    pub fn detach(&mut self, id: DeviceId) -> Result<Box<dyn Device>, ConfigError> {
        let slot = self
            .io
            .devices
            .remove(&id)
            .ok_or(ConfigError::UnknownDevice(id))?;
        for owner in self.io.owners.iter_mut().filter(|o| **o == Some(id)) {
            *owner = None;
        }
        self.interrupts.release(id);
        self.wake_requests.retain(|(d, _)| *d != id);
        tracing::debug!("Deregistered {} ({})", slot.name, id);
        Ok(slot.dev)
    }

    /// Runs a device's cycle-advance handler at `now`.
    pub(crate) fn advance_device(&mut self, id: DeviceId, now: u64) -> SimResult<Option<u64>> {
        let slot = self
            .io
            .devices
            .get_mut(&id)
            .ok_or(ConfigError::UnknownDevice(id))?;
        let elapsed = now.saturating_sub(slot.last_advance);
        slot.last_advance = now;
        let mut ctx = DeviceContext::new(
            id,
            now,
            &mut self.interrupts,
            &self.signals,
            &mut self.wake_requests,
        );
        slot.dev.advance(&mut ctx, elapsed)
    }

    fn read_io(&mut self, addr: u16) -> SimResult<u8> {
        let idx = self
            .io
            .index(addr)
            .ok_or(SimulationError::MemoryViolation(addr as u32))?;
        let Some(id) = self.io.owners[idx] else {
            return Ok(self.io.registers[idx]);
        };
        let slot = self
            .io
            .devices
            .get_mut(&id)
            .ok_or(ConfigError::UnknownDevice(id))?;
        let mut ctx = DeviceContext::new(
            id,
            self.cycle,
            &mut self.interrupts,
            &self.signals,
            &mut self.wake_requests,
        );
        slot.dev.read_io(&mut ctx, addr)
    }

    fn write_io(&mut self, addr: u16, value: u8) -> SimResult<()> {
        let idx = self
            .io
            .index(addr)
            .ok_or(SimulationError::MemoryViolation(addr as u32))?;
        let Some(id) = self.io.owners[idx] else {
            self.io.registers[idx] = value;
            return Ok(());
        };
        let slot = self
            .io
            .devices
            .get_mut(&id)
            .ok_or(ConfigError::UnknownDevice(id))?;
        let mut ctx = DeviceContext::new(
            id,
            self.cycle,
            &mut self.interrupts,
            &self.signals,
            &mut self.wake_requests,
        );
        slot.dev.write_io(&mut ctx, addr, value)
    }

    /// Data-space view without side effects. Core registers are not covered.
    pub fn peek(&self, addr: u16) -> Option<u8> {
        if addr >= self.layout.sram_start {
            return self.sram.block((addr - self.layout.sram_start) as u32, 1).ok().map(|b| b[0]);
        }
        match self.io.owner(addr) {
            Some(id) => self
                .io
                .devices
                .get(&id)
                .and_then(|slot| slot.dev.peek_io(addr))
                .or_else(|| self.io.register(addr)),
            None => self.io.register(addr),
        }
    }

    fn emit(&self, kind: SignalKind, vector: u8) {
        self.signals.emit(Signal {
            source: SignalSource::Interrupts,
            kind,
            cycle: self.cycle,
            data: SignalData::Vector(vector),
        });
    }

    pub(crate) fn reset(&mut self, now: u64) {
        self.cycle = now;
        self.io.reset(now);
        self.interrupts.reset();
        self.wake_requests.clear();
    }
}

impl Bus for SystemBus {
    fn read_u8(&mut self, addr: u16) -> SimResult<u8> {
        let start = self.layout.sram_start;
        if addr >= start {
            self.sram
                .read_u8((addr - start) as u32)
                .map_err(|_| SimulationError::MemoryViolation(addr as u32))
        } else {
            self.read_io(addr)
        }
    }

    fn write_u8(&mut self, addr: u16, value: u8) -> SimResult<()> {
        let start = self.layout.sram_start;
        if addr >= start {
            self.sram
                .write_u8((addr - start) as u32, value)
                .map_err(|_| SimulationError::MemoryViolation(addr as u32))
        } else {
            self.write_io(addr, value)
        }
    }

    fn fetch(&self, word_addr: u32) -> SimResult<u16> {
        let addr = word_addr.wrapping_mul(2);
        self.flash
            .read_u16(addr)
            .map_err(|_| SimulationError::MemoryViolation(addr))
    }

    fn read_program(&self, addr: u32) -> SimResult<u8> {
        self.flash
            .read_u8(addr)
            .map_err(|_| SimulationError::MemoryViolation(addr))
    }

    fn write_program(&mut self, addr: u32, word: u16) -> SimResult<()> {
        self.flash.program(addr & !1, &word.to_le_bytes())?;
        Ok(())
    }

    fn pending_interrupt(&self, global_enable: bool) -> Option<u8> {
        self.interrupts.resolve(global_enable)
    }

    fn acknowledge_interrupt(&mut self, vector: u8, sreg: &mut Sreg) -> SimResult<u32> {
        let target = self.interrupts.service(vector, sreg)?;
        tracing::trace!("Acknowledged vector {} at cycle {}", vector, self.cycle);
        self.emit(SignalKind::Acknowledged, vector);

        if let Some(id) = self.interrupts.owner(vector) {
            if let Some(slot) = self.io.devices.get_mut(&id) {
                let mut ctx = DeviceContext::new(
                    id,
                    self.cycle,
                    &mut self.interrupts,
                    &self.signals,
                    &mut self.wake_requests,
                );
                slot.dev.interrupt_acknowledged(&mut ctx, vector)?;
            }
        }
        Ok(target)
    }

    fn return_from_interrupt(&mut self) {
        if let Some(vector) = self.interrupts.return_from_interrupt() {
            tracing::trace!("Returned from vector {}", vector);
            self.emit(SignalKind::Returned, vector);
        }
    }
}
