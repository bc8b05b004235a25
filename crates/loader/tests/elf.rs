// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

mod common;

use common::{ElfWriter, EM_ARM};
use labwired_avr_core::firmware::Area;
use labwired_avr_loader::{read_elf, read_elf_bytes, LoadError};
use std::path::Path;

const TEXT: [u8; 6] = [0x0C, 0x94, 0x34, 0x00, 0xFF, 0xCF];

#[test]
fn test_sections_map_to_areas() {
    let image = ElfWriter::new()
        .load(".text", 0, &TEXT)
        .load(".data", TEXT.len() as u32, b"Char\0\0")
        .bss(16)
        .load(".eeprom", 0x810000, &[0xAA, 0xBB])
        .load(".fuse", 0x820000, &[0x62, 0xD9, 0xFF])
        .load(".lock", 0x830000, &[0xFC])
        .load(".signature", 0x840000, &[0x1E, 0x95, 0x0F])
        .note(".comment", b"GCC: (GNU) 7.3.0\0")
        .build();

    let fw = read_elf_bytes(&image, "test.elf").unwrap();

    let flash = fw.blocks(Area::Flash);
    assert_eq!(flash.len(), 2);
    assert_eq!((flash[0].base, flash[0].data.as_slice()), (0, &TEXT[..]));
    assert_eq!((flash[1].base, flash[1].data.as_slice()), (6, &b"Char\0\0"[..]));
    assert_eq!(fw.memory_size(Area::Flash), 12);

    assert_eq!(fw.blocks(Area::Eeprom)[0].base, 0);
    assert_eq!(fw.blocks(Area::Eeprom)[0].data, vec![0xAA, 0xBB]);
    assert_eq!(fw.blocks(Area::Fuses)[0].data, vec![0x62, 0xD9, 0xFF]);
    assert_eq!(fw.blocks(Area::Lock)[0].data, vec![0xFC]);
    assert_eq!(fw.blocks(Area::Signature)[0].data, vec![0x1E, 0x95, 0x0F]);
    assert!(!fw.has_memory(Area::UserSignature));

    assert_eq!(fw.datasize(), 6);
    assert_eq!(fw.bsssize(), 16);
    assert_eq!(fw.console_register(), None);
}

#[test]
fn test_unknown_and_orphan_sections_are_skipped() {
    let image = ElfWriter::new()
        .load(".text", 0, &TEXT)
        .load(".noinit_custom", 0x100, &[1, 2, 3])
        .orphan(".rodata", &[9, 9])
        .build();

    let fw = read_elf_bytes(&image, "test.elf").unwrap();
    assert_eq!(fw.memories(), vec![Area::Flash]);
    assert_eq!(fw.blocks(Area::Flash).len(), 1);
}

#[test]
fn test_not_an_elf() {
    let err = read_elf_bytes(b":100000000C9434000C943E000C943E000C943E0082", "fw.hex").unwrap_err();
    assert!(matches!(err, LoadError::UnsupportedFormat { .. }), "{err}");
}

#[test]
fn test_wrong_machine() {
    let image = ElfWriter::new().machine(EM_ARM).load(".text", 0, &TEXT).build();
    let err = read_elf_bytes(&image, "arm.elf").unwrap_err();
    assert!(matches!(err, LoadError::UnsupportedFormat { .. }), "{err}");
}

#[test]
fn test_truncated_image() {
    let image = ElfWriter::new().load(".text", 0, &TEXT).build();
    let err = read_elf_bytes(&image[..60], "short.elf").unwrap_err();
    assert!(matches!(err, LoadError::MalformedImage { .. }), "{err}");
}

#[test]
fn test_overlapping_sections() {
    let image = ElfWriter::new()
        .load(".text", 0, &TEXT)
        .load(".rodata", 4, &[1, 2, 3, 4])
        .build();
    let err = read_elf_bytes(&image, "overlap.elf").unwrap_err();
    assert!(matches!(err, LoadError::MalformedImage { .. }), "{err}");
}

#[test]
fn test_missing_file() {
    let err = read_elf(Path::new("/nonexistent/firmware.elf")).unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }));
    assert!(err.to_string().contains("/nonexistent/firmware.elf"));
}
