// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Minimal ELF32 little-endian writer for loader tests.

#![allow(dead_code)]

pub const EM_AVR: u16 = 83;
pub const EM_ARM: u16 = 40;

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;
const SHF_WRITE: u32 = 1;
const SHF_ALLOC: u32 = 2;
const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;

pub struct Section {
    name: String,
    kind: u32,
    flags: u32,
    data: Vec<u8>,
    nobits_size: u32,
    lma: u32,
    segment: bool,
}

pub struct ElfWriter {
    machine: u16,
    sections: Vec<Section>,
}

impl ElfWriter {
    pub fn new() -> Self {
        Self {
            machine: EM_AVR,
            sections: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Allocatable PROGBITS section inside its own PT_LOAD segment.
    pub fn load(mut self, name: &str, lma: u32, data: &[u8]) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            kind: SHT_PROGBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            data: data.to_vec(),
            nobits_size: 0,
            lma,
            segment: true,
        });
        self
    }

    /// Allocatable section no segment covers.
    pub fn orphan(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            kind: SHT_PROGBITS,
            flags: SHF_ALLOC,
            data: data.to_vec(),
            nobits_size: 0,
            lma: 0,
            segment: false,
        });
        self
    }

    /// Non-allocatable section, like `.comment`.
    pub fn note(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            kind: SHT_PROGBITS,
            flags: 0,
            data: data.to_vec(),
            nobits_size: 0,
            lma: 0,
            segment: false,
        });
        self
    }

    pub fn bss(mut self, size: u32) -> Self {
        self.sections.push(Section {
            name: ".bss".to_string(),
            kind: SHT_NOBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            data: Vec::new(),
            nobits_size: size,
            lma: 0,
            segment: false,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.sections.iter().filter(|s| s.segment).count();

        let mut shstrtab = vec![0u8];
        let mut names = Vec::new();
        for s in &self.sections {
            names.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(s.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let mut offset = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut offsets = Vec::new();
        for s in &self.sections {
            offsets.push(offset as u32);
            offset += s.data.len();
        }
        let shstrtab_offset = offset as u32;
        offset += shstrtab.len();
        let shoff = offset as u32;
        let shnum = self.sections.len() + 2;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        put16(&mut out, 2);
        put16(&mut out, self.machine);
        put32(&mut out, 1);
        put32(&mut out, 0);
        put32(&mut out, if phnum > 0 { EHDR_SIZE as u32 } else { 0 });
        put32(&mut out, shoff);
        put32(&mut out, 0);
        put16(&mut out, EHDR_SIZE as u16);
        put16(&mut out, PHDR_SIZE as u16);
        put16(&mut out, phnum as u16);
        put16(&mut out, SHDR_SIZE as u16);
        put16(&mut out, shnum as u16);
        put16(&mut out, (shnum - 1) as u16);

        for (s, &off) in self.sections.iter().zip(&offsets) {
            if !s.segment {
                continue;
            }
            let len = s.data.len() as u32;
            for v in [PT_LOAD, off, s.lma, s.lma, len, len, 6, 1] {
                put32(&mut out, v);
            }
        }

        for s in &self.sections {
            out.extend_from_slice(&s.data);
        }
        out.extend_from_slice(&shstrtab);

        out.extend_from_slice(&[0; SHDR_SIZE]);
        for ((s, &off), &name) in self.sections.iter().zip(&offsets).zip(&names) {
            let size = if s.kind == SHT_NOBITS {
                s.nobits_size
            } else {
                s.data.len() as u32
            };
            for v in [name, s.kind, s.flags, s.lma, off, size, 0, 0, 1, 0] {
                put32(&mut out, v);
            }
        }
        for v in [
            shstrtab_name,
            SHT_STRTAB,
            0,
            0,
            shstrtab_offset,
            shstrtab.len() as u32,
            0,
            0,
            1,
            0,
        ] {
            put32(&mut out, v);
        }
        out
    }
}

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
