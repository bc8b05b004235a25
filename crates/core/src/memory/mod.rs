// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::firmware::Area;
use bitflags::bitflags;
use std::ops::Range;

bitflags! {
    /// Access rights of a region, or of a sub-range inside it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Value of an erased NVM cell.
pub const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("{region}: access of {len} byte(s) at {addr:#x} is outside of {size} byte region")]
    AddressOutOfRange {
        region: String,
        addr: u32,
        len: usize,
        size: usize,
    },
    #[error("{region}: write at {addr:#x} to read-only memory")]
    ReadOnlyViolation { region: String, addr: u32 },
    #[error("{region}: read at {addr:#x} from unreadable memory")]
    ReadViolation { region: String, addr: u32 },
}

/// A flat byte store with bounds checking, access rights and NVM bookkeeping.
///
/// CPU-visible writes go through [`MemoryRegion::write`], which honours the
/// `WRITE` bit. Programming (firmware load, self-programming) goes through
/// [`MemoryRegion::program`], which only honours [`MemoryRegion::lock`].
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    name: String,
    area: Option<Area>,
    data: Vec<u8>,
    programmed: Vec<bool>,
    access: Access,
    overrides: Vec<(Range<u32>, Access)>,
    locked: bool,
}

impl MemoryRegion {
    /// Volatile read/write memory filled with zeroes.
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            area: None,
            data: vec![0; size],
            programmed: vec![false; size],
            access: Access::READ | Access::WRITE,
            overrides: Vec::new(),
            locked: false,
        }
    }

    /// Non-volatile memory for a firmware area, initially erased.
    pub fn for_area(area: Area, size: usize) -> Self {
        let access = match area {
            Area::Flash => Access::READ | Access::EXEC,
            Area::Eeprom => Access::READ | Access::WRITE,
            _ => Access::READ,
        };
        Self {
            name: area.name().to_string(),
            area: Some(area),
            data: vec![ERASED; size],
            programmed: vec![false; size],
            access,
            overrides: Vec::new(),
            locked: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn area(&self) -> Option<Area> {
        self.area
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    /// Overrides the access rights for `range`. Later overrides win.
    pub fn set_range_access(&mut self, range: Range<u32>, access: Access) -> Result<(), MemoryError> {
        self.check(range.start, (range.end.saturating_sub(range.start)) as usize)?;
        self.overrides.push((range, access));
        Ok(())
    }

    /// Access rights in effect at `addr`.
    pub fn access_at(&self, addr: u32) -> Access {
        self.overrides
            .iter()
            .rev()
            .find(|(r, _)| r.contains(&addr))
            .map(|(_, a)| *a)
            .unwrap_or(self.access)
    }

    /// Makes the region read-only for every path, programming included.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn check(&self, addr: u32, len: usize) -> Result<Range<usize>, MemoryError> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(MemoryError::AddressOutOfRange {
                region: self.name.clone(),
                addr,
                len,
                size: self.data.len(),
            }),
        }
    }

    fn range_allows(&self, range: &Range<usize>, flag: Access) -> Option<u32> {
        range
            .clone()
            .map(|a| a as u32)
            .find(|&a| !self.access_at(a).contains(flag))
    }

    pub fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let range = self.check(addr, len)?;
        if let Some(bad) = self.range_allows(&range, Access::READ) {
            return Err(MemoryError::ReadViolation {
                region: self.name.clone(),
                addr: bad,
            });
        }
        Ok(self.data[range].to_vec())
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        let range = self.check(addr, 1)?;
        if !self.access_at(addr).contains(Access::READ) {
            return Err(MemoryError::ReadViolation {
                region: self.name.clone(),
                addr,
            });
        }
        Ok(self.data[range.start])
    }

    /// Little-endian word at a byte address.
    pub fn read_u16(&self, addr: u32) -> Result<u16, MemoryError> {
        let bytes = self.read(addr, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = self.check(addr, bytes.len())?;
        if self.locked {
            return Err(MemoryError::ReadOnlyViolation {
                region: self.name.clone(),
                addr,
            });
        }
        if let Some(bad) = self.range_allows(&range, Access::WRITE) {
            return Err(MemoryError::ReadOnlyViolation {
                region: self.name.clone(),
                addr: bad,
            });
        }
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    /// Programs NVM content and tags the bytes as programmed.
    pub fn program(&mut self, base: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = self.check(base, bytes.len())?;
        if self.locked {
            return Err(MemoryError::ReadOnlyViolation {
                region: self.name.clone(),
                addr: base,
            });
        }
        self.data[range.clone()].copy_from_slice(bytes);
        self.programmed[range].fill(true);
        Ok(())
    }

    pub fn is_programmed(&self, pos: u32) -> bool {
        self.programmed.get(pos as usize).copied().unwrap_or(false)
    }

    /// Restores the whole region to the erased state.
    pub fn erase(&mut self) -> Result<(), MemoryError> {
        self.erase_range(0, self.data.len())
    }

    pub fn erase_range(&mut self, base: u32, len: usize) -> Result<(), MemoryError> {
        let range = self.check(base, len)?;
        if self.locked {
            return Err(MemoryError::ReadOnlyViolation {
                region: self.name.clone(),
                addr: base,
            });
        }
        self.data[range.clone()].fill(ERASED);
        self.programmed[range].fill(false);
        Ok(())
    }

    /// Overwrites every byte, ignoring access rights. Used for power-on state.
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
        self.programmed.fill(false);
    }

    /// Immutable view of the current content.
    pub fn block(&self, base: u32, len: usize) -> Result<&[u8], MemoryError> {
        let range = self.check(base, len)?;
        Ok(&self.data[range])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the content from a snapshot. The length must match.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check(0, bytes.len())?;
        if bytes.len() != self.data.len() {
            return Err(MemoryError::AddressOutOfRange {
                region: self.name.clone(),
                addr: 0,
                len: bytes.len(),
                size: self.data.len(),
            });
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_capacity_leaves_content() {
        let mut sram = MemoryRegion::new("sram", 16);
        sram.write(12, &[1, 2, 3, 4]).unwrap();

        let err = sram.read(14, 4).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::AddressOutOfRange { addr: 14, len: 4, size: 16, .. }
        ));
        assert_eq!(sram.block(12, 4).unwrap(), &[1, 2, 3, 4]);

        let err = sram.write(15, &[9, 9]).unwrap_err();
        assert!(matches!(err, MemoryError::AddressOutOfRange { .. }));
        assert_eq!(sram.block(12, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_read_only_region() {
        let mut fuses = MemoryRegion::for_area(Area::Fuses, 3);
        fuses.program(0, &[0x12, 0x34, 0x56]).unwrap();
        assert!(matches!(
            fuses.write(1, &[0]),
            Err(MemoryError::ReadOnlyViolation { addr: 1, .. })
        ));

        fuses.lock();
        assert!(fuses.program(0, &[0]).is_err());
        assert!(fuses.erase().is_err());
        assert_eq!(fuses.block(0, 3).unwrap(), &[0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_program_tags_and_erase() {
        let mut eeprom = MemoryRegion::for_area(Area::Eeprom, 8);
        assert_eq!(eeprom.read(0, 8).unwrap(), vec![ERASED; 8]);

        eeprom.program(2, &[0xAA, 0xBB]).unwrap();
        assert!(!eeprom.is_programmed(1));
        assert!(eeprom.is_programmed(2));
        assert!(eeprom.is_programmed(3));
        assert!(!eeprom.is_programmed(100));

        eeprom.erase_range(3, 1).unwrap();
        assert!(eeprom.is_programmed(2));
        assert!(!eeprom.is_programmed(3));
        assert_eq!(eeprom.block(2, 2).unwrap(), &[0xAA, ERASED]);
    }

    #[test]
    fn test_range_access_override() {
        let mut sram = MemoryRegion::new("sram", 32);
        sram.set_range_access(16..32, Access::READ).unwrap();
        sram.write(0, &[1]).unwrap();
        assert!(matches!(
            sram.write(14, &[0, 0, 0]),
            Err(MemoryError::ReadOnlyViolation { addr: 16, .. })
        ));
        assert_eq!(sram.read_u8(14).unwrap(), 0);
        assert!(sram.set_range_access(30..40, Access::empty()).is_err());
    }

    #[test]
    fn test_word_access_is_little_endian() {
        let mut flash = MemoryRegion::for_area(Area::Flash, 4);
        flash.program(0, &[0x0C, 0x94]).unwrap();
        assert_eq!(flash.read_u16(0).unwrap(), 0x940C);
        assert_eq!(flash.read_u16(2).unwrap(), 0xFFFF);
        assert!(flash.write_u8(0, 0).is_err());
    }
}
