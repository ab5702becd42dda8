// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! Section Model
//!
//! Derives, for one ELF binary, the ordered list of allocable sections with
//! their true on-disk footprint. A section's `mem_size` (size during
//! execution) is not always the space it occupies in the file: NOBITS
//! sections occupy nothing, and the linker may leave orphaned bytes between
//! neighbouring sections. `resolve_file_sizes` settles both cases so the
//! address-translation queries in [`crate::layout`] can operate on exact
//! `[start, start+len)` ranges.

use std::fs;
use std::path::Path;

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{SHF_ALLOC, SHT_NOBITS};
use goblin::elf::Elf;

use crate::error::UldError;

/// One allocable section of an ELF image.
#[derive(Debug, Clone)]
pub struct ElfSection {
    pub index: usize,
    pub name: String,
    /// Declared size during execution (`sh_size`).
    pub mem_size: u64,
    pub vma: u64,
    pub lma: u64,
    pub file_offset: u64,
    /// Alignment (`sh_addralign`).
    pub alignment: u64,
    pub flags: u64,
    pub sh_type: u32,
    /// Resolved on-disk footprint; 0 for sections with no file content.
    pub file_size: u64,
}

impl ElfSection {
    pub fn has_file_content(&self) -> bool {
        self.sh_type != SHT_NOBITS
    }
}

/// Capability: list the allocable sections of an ELF image.
///
/// The shipped implementation parses the file natively; an alternative
/// could shell out to binutils and scrape the output. Callers must be
/// indifferent to which.
pub trait SectionLister {
    fn sections(&self, path: &Path) -> Result<Vec<ElfSection>, UldError>;
}

/// [`SectionLister`] backed by an in-process ELF parser.
pub struct NativeLister;

impl SectionLister for NativeLister {
    fn sections(&self, path: &Path) -> Result<Vec<ElfSection>, UldError> {
        let bytes = fs::read(path)?;
        parse_sections(&bytes)
    }
}

/// Parse the allocable sections of `bytes` and resolve their footprints.
pub fn parse_sections(bytes: &[u8]) -> Result<Vec<ElfSection>, UldError> {
    let elf = Elf::parse(bytes)?;

    let mut sections = Vec::new();
    for (index, sh) in elf.section_headers.iter().enumerate() {
        if sh.sh_flags & u64::from(SHF_ALLOC) == 0 {
            continue;
        }
        let name = elf
            .shdr_strtab
            .get_at(sh.sh_name)
            .unwrap_or_default()
            .to_string();
        sections.push(ElfSection {
            index,
            name,
            mem_size: sh.sh_size,
            vma: sh.sh_addr,
            lma: lma_of(&elf, sh.sh_addr),
            file_offset: sh.sh_offset,
            alignment: sh.sh_addralign,
            flags: sh.sh_flags,
            sh_type: sh.sh_type,
            file_size: 0,
        });
    }

    resolve_file_sizes(&mut sections);
    Ok(sections)
}

/// Load address of a virtual address: `PT_LOAD` segments carry the physical
/// (load) address in `p_paddr`. Sections outside any segment load where
/// they live.
fn lma_of(elf: &Elf, vma: u64) -> u64 {
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD {
            continue;
        }
        if vma >= ph.p_vaddr && vma < ph.p_vaddr + ph.p_memsz {
            return ph.p_paddr + (vma - ph.p_vaddr);
        }
    }
    vma
}

/// Resolve each section's on-disk footprint.
///
/// NOBITS sections get 0. The rest are considered in file-offset order:
/// each one's footprint is the distance to the next section's file offset,
/// clipped to `mem_size` (orphaned bytes between sections must not count),
/// and the last one falls back to `mem_size`.
pub fn resolve_file_sizes(sections: &mut [ElfSection]) {
    let mut order: Vec<usize> = (0..sections.len())
        .filter(|&i| sections[i].has_file_content())
        .collect();
    order.sort_by_key(|&i| sections[i].file_offset);

    for (pos, &i) in order.iter().enumerate() {
        if pos == order.len() - 1 {
            // Best guess.
            sections[i].file_size = sections[i].mem_size;
            break;
        }
        let next = &sections[order[pos + 1]];
        let gap = next.file_offset - sections[i].file_offset;
        sections[i].file_size = gap.min(sections[i].mem_size);
    }
}
