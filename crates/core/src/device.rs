// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::interrupt::InterruptController;
use crate::signals::{Signal, SignalBus, SignalData, SignalKind, SignalSource};
use crate::{ConfigError, SimResult};
use std::any::Any;
use std::fmt;

/// Registration handle of a device. Ids grow with registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// What a device may touch while one of its handlers runs.
pub struct DeviceContext<'a> {
    id: DeviceId,
    cycle: u64,
    interrupts: &'a mut InterruptController,
    signals: &'a SignalBus,
    wake: &'a mut Vec<(DeviceId, u64)>,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(
        id: DeviceId,
        cycle: u64,
        interrupts: &'a mut InterruptController,
        signals: &'a SignalBus,
        wake: &'a mut Vec<(DeviceId, u64)>,
    ) -> Self {
        Self {
            id,
            cycle,
            interrupts,
            signals,
            wake,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Current simulated cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn owned(&self, vector: u8) -> Result<(), ConfigError> {
        if self.interrupts.owner(vector) == Some(self.id) {
            Ok(())
        } else {
            Err(ConfigError::VectorNotOwned {
                vector,
                device: self.id,
            })
        }
    }

    /// Raises one of this device's vectors.
    pub fn raise(&mut self, vector: u8) -> Result<(), ConfigError> {
        self.owned(vector)?;
        if self.interrupts.raise(vector)? {
            tracing::trace!("{} raised vector {}", self.id, vector);
            self.signals.emit(Signal {
                source: SignalSource::Interrupts,
                kind: SignalKind::Raised,
                cycle: self.cycle,
                data: SignalData::Vector(vector),
            });
        }
        Ok(())
    }

    /// Cancels a pending request on one of this device's vectors.
    pub fn clear(&mut self, vector: u8) -> Result<(), ConfigError> {
        self.owned(vector)?;
        if self.interrupts.clear(vector)? {
            tracing::trace!("{} cancelled vector {}", self.id, vector);
            self.signals.emit(Signal {
                source: SignalSource::Interrupts,
                kind: SignalKind::Cancelled,
                cycle: self.cycle,
                data: SignalData::Vector(vector),
            });
        }
        Ok(())
    }

    pub fn emit(&self, kind: SignalKind, data: SignalData) {
        self.signals.emit(Signal {
            source: SignalSource::Device(self.id),
            kind,
            cycle: self.cycle,
            data,
        });
    }

    /// Asks to be advanced `delay` cycles from now, replacing any earlier wake.
    pub fn wake_in(&mut self, delay: u64) {
        self.wake.push((self.id, self.cycle + delay.max(1)));
    }
}

/// Contract of every on-chip peripheral.
///
/// Handlers run to completion on the simulation thread and must not block.
pub trait Device: fmt::Debug + Send {
    fn name(&self) -> &str;

    fn reset(&mut self) {}

    /// Called when the scheduler's wake point for this device is reached.
    /// `elapsed` counts cycles since the previous advance. Returns the number
    /// of cycles until the device wants to run again.
    fn advance(&mut self, _ctx: &mut DeviceContext, _elapsed: u64) -> SimResult<Option<u64>> {
        Ok(None)
    }

    fn read_io(&mut self, ctx: &mut DeviceContext, addr: u16) -> SimResult<u8>;

    fn write_io(&mut self, ctx: &mut DeviceContext, addr: u16, value: u8) -> SimResult<()>;

    /// Side-effect free view of a register, for inspection.
    fn peek_io(&self, _addr: u16) -> Option<u8> {
        None
    }

    /// The CPU entered one of this device's vectors.
    fn interrupt_acknowledged(&mut self, _ctx: &mut DeviceContext, _vector: u8) -> SimResult<()> {
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn as_any(&self) -> Option<&dyn Any> {
        None
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}
