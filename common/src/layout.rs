// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! Address-space triangulation over one ELF image.
//!
//! An [`AddressSpace`] is built once per image from the resolved section
//! list and answers the three lookup directions the patch tools need: file
//! offset, load address, virtual address. All queries are pure.

use std::fs;
use std::path::Path;

use crate::error::{AddrKind, UldError};
use crate::section::{parse_sections, ElfSection};

/// Immutable view of one image's allocable sections.
#[derive(Debug)]
pub struct AddressSpace {
    sections: Vec<ElfSection>,
}

impl AddressSpace {
    pub fn from_path(path: &Path) -> Result<Self, UldError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UldError> {
        Ok(Self::from_sections(parse_sections(bytes)?))
    }

    pub fn from_sections(sections: Vec<ElfSection>) -> Self {
        AddressSpace { sections }
    }

    pub fn sections(&self) -> &[ElfSection] {
        &self.sections
    }

    pub fn section_by_name(&self, name: &str) -> Option<&ElfSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section whose on-disk span contains `file_offset`.
    pub fn section_by_file_offset(&self, file_offset: u64) -> Result<&ElfSection, UldError> {
        self.sections
            .iter()
            .find(|s| {
                file_offset >= s.file_offset && file_offset < s.file_offset + s.file_size
            })
            .ok_or(UldError::LookupFailure {
                kind: AddrKind::FileOffset,
                addr: file_offset,
            })
    }

    /// Section whose load span contains `lma`. The span uses the resolved
    /// file footprint: bytes that only exist at runtime have no load image.
    pub fn section_by_lma(&self, lma: u64) -> Result<&ElfSection, UldError> {
        self.sections
            .iter()
            .find(|s| lma >= s.lma && lma < s.lma + s.file_size)
            .ok_or(UldError::LookupFailure {
                kind: AddrKind::LoadAddress,
                addr: lma,
            })
    }

    /// Section whose virtual span contains `vma`.
    pub fn section_by_vma(&self, vma: u64) -> Result<&ElfSection, UldError> {
        self.sections
            .iter()
            .find(|s| vma >= s.vma && vma < s.vma + s.mem_size)
            .ok_or(UldError::LookupFailure {
                kind: AddrKind::VirtualAddress,
                addr: vma,
            })
    }

    /// Translate a load address to its file offset.
    pub fn lma_to_file_offset(&self, lma: u64) -> Result<u64, UldError> {
        let sec = self.section_by_lma(lma)?;
        Ok(lma - sec.lma + sec.file_offset)
    }
}
