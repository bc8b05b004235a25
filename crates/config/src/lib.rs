// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VectorTable {
    /// Number of vectors, including the reset vector.
    pub count: u16,
    /// Size of one vector slot in flash words (1 for RJMP slots, 2 for JMP slots).
    #[serde(default = "default_vector_size")]
    pub size: u8,
}

fn default_vector_size() -> u8 {
    2
}

fn zero_size() -> String {
    "0".to_string()
}

/// Describes one AVR variant: memory sizes, data-space layout and vector table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct McuDescriptor {
    pub name: String,
    pub flash: String, // e.g. "32KB"
    pub sram: String,
    /// First data-space address of SRAM; everything below is registers and I/O.
    pub sram_start: u16,
    #[serde(default = "zero_size")]
    pub eeprom: String,
    #[serde(default = "zero_size")]
    pub fuses: String,
    #[serde(default = "zero_size")]
    pub lock: String,
    #[serde(default = "zero_size")]
    pub signature: String,
    #[serde(default = "zero_size")]
    pub user_signature: String,
    pub vectors: VectorTable,
    #[serde(default)]
    pub frequency: Option<u64>,
}

impl McuDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open MCU descriptor at {:?}", path.as_ref()))?;
        let mcu: Self = serde_yaml::from_reader(f).context("Failed to parse MCU Descriptor")?;
        mcu.validate()?;
        Ok(mcu)
    }

    pub fn atmega328p() -> Self {
        Self {
            name: "atmega328p".to_string(),
            flash: "32KiB".to_string(),
            sram: "2KiB".to_string(),
            sram_start: 0x100,
            eeprom: "1KiB".to_string(),
            fuses: "3B".to_string(),
            lock: "1B".to_string(),
            signature: "3B".to_string(),
            user_signature: "0".to_string(),
            vectors: VectorTable { count: 26, size: 2 },
            frequency: Some(16_000_000),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let flash = parse_size(&self.flash)?;
        if flash == 0 || flash % 2 != 0 {
            anyhow::bail!("Flash size must be a non-zero even number of bytes, got {}", flash);
        }
        if flash > 0x80_0000 {
            anyhow::bail!("Flash size {} exceeds the 22-bit program counter range", flash);
        }
        if parse_size(&self.sram)? == 0 {
            anyhow::bail!("SRAM size cannot be zero");
        }
        if self.sram_start < 0x60 {
            anyhow::bail!("sram_start {:#x} overlaps the register and I/O space", self.sram_start);
        }
        let end = self.sram_start as u64 + parse_size(&self.sram)?;
        if end > 0x1_0000 {
            anyhow::bail!("SRAM ends at {:#x}, beyond the 16-bit data space", end);
        }
        if self.vectors.count == 0 {
            anyhow::bail!("Vector table must contain at least the reset vector");
        }
        if !matches!(self.vectors.size, 1 | 2) {
            anyhow::bail!("Vector size must be 1 or 2 words, got {}", self.vectors.size);
        }
        for (label, s) in [
            ("eeprom", &self.eeprom),
            ("fuses", &self.fuses),
            ("lock", &self.lock),
            ("signature", &self.signature),
            ("user_signature", &self.user_signature),
        ] {
            parse_size(s).with_context(|| format!("Invalid '{}' size", label))?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestInputs {
    pub firmware: String,
    #[serde(default)]
    pub mcu: Option<String>,
    #[serde(default)]
    pub console_register: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    pub max_cycles: u64,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
}

/// Stop reasons as spelled in test scripts and `result.json`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    CycleLimit,
    WallTime,
    Requested,
    Sleep,
    InfiniteLoop,
    Break,
    MemoryViolation,
    DecodeError,
    StackFault,
    Fault,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConsoleContainsAssertion {
    pub console_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StopReasonAssertion {
    pub expected_stop_reason: StopKind,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TestAssertion {
    ConsoleContains(ConsoleContainsAssertion),
    ExpectedStopReason(StopReasonAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    pub schema_version: String,
    pub inputs: TestInputs,
    pub limits: TestLimits,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

impl TestScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open test script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Test Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.inputs.firmware.trim().is_empty() {
            anyhow::bail!("Input 'firmware' path cannot be empty");
        }

        if self.limits.max_cycles == 0 {
            anyhow::bail!("Limit 'max_cycles' must be greater than zero");
        }

        if self.limits.wall_time_ms == Some(0) {
            anyhow::bail!("Limit 'wall_time_ms' must be greater than zero when set");
        }

        Ok(())
    }
}

/// Parses a human readable size ("32KiB", "3B", "0") into bytes.
pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let trimmed = size_str.trim();
    if let Ok(raw) = trimmed.parse::<u64>() {
        return Ok(raw);
    }
    let s: Size = trimmed
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format '{}': {}", size_str, e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
