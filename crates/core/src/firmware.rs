// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Firmware image model: named areas holding sorted, non-overlapping blocks.

use crate::memory::{MemoryError, MemoryRegion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The closed set of memory spaces a firmware image can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Area {
    Flash,
    Eeprom,
    Fuses,
    Lock,
    Signature,
    UserSignature,
}

impl Area {
    pub const ALL: [Area; 6] = [
        Area::Flash,
        Area::Eeprom,
        Area::Fuses,
        Area::Lock,
        Area::Signature,
        Area::UserSignature,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Area::Flash => "flash",
            Area::Eeprom => "eeprom",
            Area::Fuses => "fuses",
            Area::Lock => "lock",
            Area::Signature => "signature",
            Area::UserSignature => "user_signature",
        }
    }

    /// Offset added to area addresses in AVR ELF load addresses.
    pub fn elf_offset(self) -> u32 {
        match self {
            Area::Flash => 0,
            Area::Eeprom => 0x81_0000,
            Area::Fuses => 0x82_0000,
            Area::Lock => 0x83_0000,
            Area::Signature => 0x84_0000,
            Area::UserSignature => 0x85_0000,
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(base: u32, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last address covered by the block.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FirmwareError {
    #[error("{area} blocks overlap at {base:#x}")]
    Overlap { area: Area, base: u32 },
    #[error("firmware has no {0} content")]
    MissingArea(Area),
}

/// Collects blocks and produces an immutable [`Firmware`].
#[derive(Debug, Default)]
pub struct FirmwareBuilder {
    memories: BTreeMap<Area, Vec<Block>>,
    datasize: u32,
    bsssize: u32,
}

impl FirmwareBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block. Empty payloads are ignored.
    pub fn add_block(&mut self, area: Area, base: u32, data: Vec<u8>) -> &mut Self {
        if !data.is_empty() {
            self.memories
                .entry(area)
                .or_default()
                .push(Block::new(base, data));
        }
        self
    }

    pub fn datasize(&mut self, size: u32) -> &mut Self {
        self.datasize = size;
        self
    }

    pub fn bsssize(&mut self, size: u32) -> &mut Self {
        self.bsssize = size;
        self
    }

    /// Sorts every area by base address and rejects overlapping blocks.
    pub fn build(self) -> Result<Firmware, FirmwareError> {
        let mut memories = self.memories;
        for (area, blocks) in memories.iter_mut() {
            blocks.sort_by_key(|b| b.base);
            for pair in blocks.windows(2) {
                if pair[0].end() > pair[1].base as u64 {
                    return Err(FirmwareError::Overlap {
                        area: *area,
                        base: pair[1].base,
                    });
                }
            }
        }
        Ok(Firmware {
            memories,
            datasize: self.datasize,
            bsssize: self.bsssize,
            variant: None,
            frequency: None,
            vcc: None,
            aref: None,
            console_register: None,
        })
    }
}

/// A parsed firmware image. Built once, never mutated apart from its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firmware {
    memories: BTreeMap<Area, Vec<Block>>,
    datasize: u32,
    bsssize: u32,
    variant: Option<String>,
    frequency: Option<u64>,
    vcc: Option<f64>,
    aref: Option<f64>,
    console_register: Option<u16>,
}

impl Firmware {
    pub fn builder() -> FirmwareBuilder {
        FirmwareBuilder::new()
    }

    pub fn has_memory(&self, area: Area) -> bool {
        self.memories.get(&area).is_some_and(|b| !b.is_empty())
    }

    /// Blocks of `area` in ascending base order; empty if the area is absent.
    pub fn blocks(&self, area: Area) -> &[Block] {
        self.memories.get(&area).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Areas that carry at least one block.
    pub fn memories(&self) -> Vec<Area> {
        self.memories
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(a, _)| *a)
            .collect()
    }

    /// Total payload bytes of `area`.
    pub fn memory_size(&self, area: Area) -> usize {
        self.blocks(area).iter().map(Block::len).sum()
    }

    /// Initialized data copied to SRAM at startup.
    pub fn datasize(&self) -> u32 {
        self.datasize
    }

    /// Zero-initialized SRAM not present in the image.
    pub fn bsssize(&self) -> u32 {
        self.bsssize
    }

    /// Copies every block of `area` into `region`.
    ///
    /// Blocks written before a failing one are not rolled back.
    pub fn load_memory(&self, area: Area, region: &mut MemoryRegion) -> Result<(), MemoryError> {
        for block in self.blocks(area) {
            region.program(block.base, &block.data)?;
        }
        Ok(())
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    pub fn frequency(&self) -> Option<u64> {
        self.frequency
    }

    pub fn vcc(&self) -> Option<f64> {
        self.vcc
    }

    pub fn aref(&self) -> Option<f64> {
        self.aref
    }

    pub fn console_register(&self) -> Option<u16> {
        self.console_register
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    pub fn with_frequency(mut self, hz: u64) -> Self {
        self.frequency = Some(hz);
        self
    }

    pub fn with_vcc(mut self, volts: f64) -> Self {
        self.vcc = Some(volts);
        self
    }

    pub fn with_aref(mut self, volts: f64) -> Self {
        self.aref = Some(volts);
        self
    }

    pub fn with_console_register(mut self, addr: u16) -> Self {
        self.console_register = Some(addr);
        self
    }
}
