// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::cpu::Sreg;
use crate::device::DeviceId;
use crate::ConfigError;

/// Lifecycle of one vector as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorState {
    Idle,
    Pending,
    Serviced,
}

#[derive(Debug, Clone, Default)]
struct VectorEntry {
    owner: Option<DeviceId>,
    enabled: bool,
    pending: bool,
    in_service: bool,
}

/// Fixed-priority vector table. Lower index wins; vector 0 is reset.
///
/// The controller is level-agnostic: it only tracks pending, enabled and
/// in-service state. Devices decide whether their condition re-raises.
#[derive(Debug, Clone)]
pub struct InterruptController {
    vectors: Vec<VectorEntry>,
    vector_size: u8,
    in_service: Vec<u8>,
}

impl InterruptController {
    /// `vector_size` is the size of one table slot in flash words.
    pub fn new(count: u16, vector_size: u8) -> Self {
        let vectors = (0..count)
            .map(|_| VectorEntry {
                enabled: true,
                ..Default::default()
            })
            .collect();
        Self {
            vectors,
            vector_size,
            in_service: Vec::new(),
        }
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    fn entry_mut(&mut self, vector: u8) -> Result<&mut VectorEntry, ConfigError> {
        if vector == 0 {
            return Err(ConfigError::InvalidVector(vector));
        }
        self.vectors
            .get_mut(vector as usize)
            .ok_or(ConfigError::InvalidVector(vector))
    }

    /// Gives `owner` exclusive rights to raise and clear `vector`.
    pub fn register(&mut self, vector: u8, owner: DeviceId) -> Result<(), ConfigError> {
        let entry = self.entry_mut(vector)?;
        if let Some(existing) = entry.owner {
            return Err(ConfigError::VectorInUse { vector, owner: existing });
        }
        entry.owner = Some(owner);
        Ok(())
    }

    /// Drops every vector owned by `owner`, cancelling anything pending.
    pub fn release(&mut self, owner: DeviceId) {
        for entry in self.vectors.iter_mut().filter(|e| e.owner == Some(owner)) {
            entry.owner = None;
            entry.pending = false;
        }
    }

    pub fn owner(&self, vector: u8) -> Option<DeviceId> {
        self.vectors.get(vector as usize).and_then(|e| e.owner)
    }

    /// Marks `vector` pending. Returns false if it already was.
    pub fn raise(&mut self, vector: u8) -> Result<bool, ConfigError> {
        let entry = self.entry_mut(vector)?;
        let fresh = !entry.pending;
        entry.pending = true;
        Ok(fresh)
    }

    /// Cancels a pending request. Returns false if nothing was pending.
    pub fn clear(&mut self, vector: u8) -> Result<bool, ConfigError> {
        let entry = self.entry_mut(vector)?;
        let was = entry.pending;
        entry.pending = false;
        Ok(was)
    }

    pub fn enable(&mut self, vector: u8) -> Result<(), ConfigError> {
        self.entry_mut(vector)?.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self, vector: u8) -> Result<(), ConfigError> {
        self.entry_mut(vector)?.enabled = false;
        Ok(())
    }

    pub fn state(&self, vector: u8) -> Option<VectorState> {
        self.vectors.get(vector as usize).map(|e| {
            if e.pending {
                VectorState::Pending
            } else if e.in_service {
                VectorState::Serviced
            } else {
                VectorState::Idle
            }
        })
    }

    /// Lowest pending and enabled vector, if the global gate is open.
    pub fn resolve(&self, global_enable: bool) -> Option<u8> {
        if !global_enable {
            return None;
        }
        self.vectors
            .iter()
            .position(|e| e.pending && e.enabled)
            .map(|v| v as u8)
    }

    /// Commits to entering `vector`: clears `I` and returns the word address
    /// of its table slot.
    pub fn service(&mut self, vector: u8, sreg: &mut Sreg) -> Result<u32, ConfigError> {
        let vector_size = self.vector_size as u32;
        let entry = self.entry_mut(vector)?;
        entry.pending = false;
        entry.in_service = true;
        self.in_service.push(vector);
        sreg.remove(Sreg::I);
        Ok(vector as u32 * vector_size)
    }

    /// Ends the innermost service, returning its vector.
    pub fn return_from_interrupt(&mut self) -> Option<u8> {
        let vector = self.in_service.pop()?;
        if let Some(entry) = self.vectors.get_mut(vector as usize) {
            entry.in_service = false;
        }
        Some(vector)
    }

    /// Innermost vector currently being serviced.
    pub fn active(&self) -> Option<u8> {
        self.in_service.last().copied()
    }

    /// Clears all runtime state. Ownership survives a reset.
    pub fn reset(&mut self) {
        for entry in &mut self.vectors {
            entry.pending = false;
            entry.in_service = false;
            entry.enabled = true;
        }
        self.in_service.clear();
    }
}
