// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub cycle: u64,
    pub cpu: CpuSnapshot,
    /// Region content keyed by region name.
    pub memories: BTreeMap<String, Vec<u8>>,
    /// Plain I/O register file, device-owned addresses excluded.
    pub io: Vec<u8>,
    pub devices: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub registers: [u8; 32],
    pub sreg: u8,
    pub pc: u32,
    pub sp: u16,
    pub rampz: u8,
    pub eind: u8,
    pub sleeping: bool,
    #[serde(default)]
    pub wake_latency: u32,
}
