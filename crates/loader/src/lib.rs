// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use goblin::elf::header::{EM_AVR, ELFMAG, SELFMAG};
use goblin::elf::program_header::{ProgramHeader, PT_LOAD};
use goblin::elf::section_header::{SectionHeader, SHT_NOBITS, SHT_PROGBITS};
use goblin::elf::Elf;
use labwired_avr_core::firmware::{Area, Firmware};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin}: unsupported format: {reason}")]
    UnsupportedFormat { origin: String, reason: String },
    #[error("{origin}: malformed image: {reason}")]
    MalformedImage { origin: String, reason: String },
}

pub type Result<T> = std::result::Result<T, LoadError>;

/// Reads an AVR ELF file into a firmware image.
pub fn read_elf(path: &Path) -> Result<Firmware> {
    let buffer = fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let firmware = read_elf_bytes(&buffer, &path.display().to_string())?;
    info!("Firmware read from ELF file {:?}", path);
    Ok(firmware)
}

/// Area a section belongs to. `None` for sections we do not load.
fn classify(name: &str) -> Option<Area> {
    match name {
        ".text" | ".data" | ".rodata" => Some(Area::Flash),
        ".eeprom" => Some(Area::Eeprom),
        ".fuse" => Some(Area::Fuses),
        ".lock" => Some(Area::Lock),
        ".signature" => Some(Area::Signature),
        ".user_signatures" => Some(Area::UserSignature),
        _ => None,
    }
}

/// First `PT_LOAD` segment whose file image holds the whole section.
fn containing_segment<'a>(
    phdrs: &'a [ProgramHeader],
    sh: &SectionHeader,
) -> Option<&'a ProgramHeader> {
    phdrs.iter().find(|ph| {
        ph.p_type == PT_LOAD
            && sh.sh_offset >= ph.p_offset
            && sh.sh_offset + sh.sh_size <= ph.p_offset + ph.p_filesz
    })
}

/// Parses an in-memory AVR ELF image. `origin` names it in errors.
pub fn read_elf_bytes(bytes: &[u8], origin: &str) -> Result<Firmware> {
    let unsupported = |reason: String| LoadError::UnsupportedFormat {
        origin: origin.to_string(),
        reason,
    };
    let malformed = |reason: String| LoadError::MalformedImage {
        origin: origin.to_string(),
        reason,
    };

    if bytes.len() < SELFMAG || &bytes[..SELFMAG] != ELFMAG {
        return Err(unsupported("not an ELF file".to_string()));
    }
    let elf = Elf::parse(bytes).map_err(|e| malformed(e.to_string()))?;
    if elf.is_64 {
        return Err(unsupported("64-bit ELF".to_string()));
    }
    if elf.header.e_machine != EM_AVR {
        return Err(unsupported(format!(
            "machine {} is not AVR",
            elf.header.e_machine
        )));
    }

    let mut builder = Firmware::builder();
    for sh in &elf.section_headers {
        let name = elf
            .shdr_strtab
            .get_at(sh.sh_name)
            .ok_or_else(|| malformed(format!("bad section name offset {}", sh.sh_name)))?;

        match name {
            ".bss" => {
                builder.bsssize(sh.sh_size as u32);
            }
            ".data" => {
                builder.datasize(sh.sh_size as u32);
            }
            _ => {}
        }

        if !sh.is_alloc() || sh.sh_type != SHT_PROGBITS || sh.sh_size == 0 {
            if sh.sh_type != SHT_NOBITS && sh.is_alloc() {
                debug!("Skipping section {} (type {})", name, sh.sh_type);
            }
            continue;
        }
        let Some(ph) = containing_segment(&elf.program_headers, sh) else {
            debug!("Section {} is outside of any loadable segment", name);
            continue;
        };
        let Some(area) = classify(name) else {
            warn!("Firmware section unknown: '{}'", name);
            continue;
        };

        let start = sh.sh_offset as usize;
        let data = bytes
            .get(start..start + sh.sh_size as usize)
            .ok_or_else(|| malformed(format!("section {} runs past the end of the file", name)))?;

        let lma = ph.p_paddr + sh.sh_offset - ph.p_offset;
        let base = lma
            .checked_sub(area.elf_offset() as u64)
            .and_then(|b| u32::try_from(b).ok())
            .ok_or_else(|| malformed(format!("section {} has load address {:#x}", name, lma)))?;

        debug!(
            "Section {} -> {} at {:#x} ({} bytes)",
            name,
            area,
            base,
            data.len()
        );
        builder.add_block(area, base, data.to_vec());
    }

    builder.build().map_err(|e| malformed(e.to_string()))
}
