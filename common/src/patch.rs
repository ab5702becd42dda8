// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! In-memory patching of a linked firmware image.
//!
//! All operations here mutate the firmware image as a byte buffer; callers
//! flush it to disk once at the end of a finalize run, so a failure partway
//! through never leaves a half-patched artifact on disk.
//!
//! Three patch passes run per embedded module:
//! 1. rofixups — rewrite position-dependent words for the module's final
//!    load address ([`apply_rofixups`]),
//! 2. PLT descriptor offsets — correct for a merged/rebased GOT base
//!    ([`patch_plt_descriptors`]),
//! 3. file CRC ([`write_file_crc`]).
//!
//! followed by one table-wide CRC pass ([`write_table_crc`]).

use log::debug;

use crate::error::UldError;
use crate::fs_table::{FsEntry, FS_ENTRY_CRC_OFFSET, PSTORE_TABLE_CRC_OFFSET};
use crate::layout::AddressSpace;

/// Section holding the module's list of fixup addresses.
pub const ROFIXUP_SECTION: &str = ".rofixup";

/// Sections whose contents are populated at runtime; fixups pointing into
/// them are the on-device loader's job.
pub const RUNTIME_SECTIONS: [&str; 4] = [".got", ".got.plt", ".data", ".bss"];

/// Size of one PLT entry.
pub const PLT_ENTRY_SIZE: u64 = 0x14;
/// Offset of the function-descriptor offset word within a PLT entry.
pub const PLT_DESC_OFFSET: u64 = 0x10;

fn read_word(buf: &[u8], off: usize) -> Result<u32, UldError> {
    let bytes = buf.get(off..off + 4).ok_or_else(|| {
        UldError::ValidationFailure(format!("read of 4 bytes at 0x{off:x} is out of range"))
    })?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn write_word(buf: &mut [u8], off: usize, value: u32) -> Result<(), UldError> {
    let bytes = buf.get_mut(off..off + 4).ok_or_else(|| {
        UldError::ValidationFailure(format!("write of 4 bytes at 0x{off:x} is out of range"))
    })?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Apply the module's rofixups to the firmware image.
///
/// `module_lma` is the module's final load address within the firmware
/// (the `base` of its file-table entry). Each fixup is a 4-byte LE load
/// address within the module whose stored word is a position-dependent
/// reference. Fixups whose target lives in a runtime-populated section, or
/// resolves to no loadable section at all, are left for the on-device
/// loader. Returns the number of words rewritten.
pub fn apply_rofixups(
    fw_space: &AddressSpace,
    fw: &mut [u8],
    module_space: &AddressSpace,
    module: &[u8],
    module_lma: u32,
) -> Result<usize, UldError> {
    let Some(rofixup) = module_space.section_by_name(ROFIXUP_SECTION) else {
        return Ok(0);
    };

    let module_file_off = fw_space.lma_to_file_offset(u64::from(module_lma))? as usize;

    let start = rofixup.file_offset as usize;
    let end = start + rofixup.file_size as usize;
    let fixups = module.get(start..end).ok_or_else(|| {
        UldError::ValidationFailure(format!(
            "{ROFIXUP_SECTION} extends beyond module file"
        ))
    })?;

    let mut applied = 0usize;
    for record in fixups.chunks_exact(4) {
        let addr = u32::from_le_bytes(record.try_into().unwrap());

        let site_off = module_space.lma_to_file_offset(u64::from(addr))? as usize;
        let value = read_word(module, site_off)?;

        // A value without a valid lma points at a section with no load
        // image (e.g. .bss); either way the on-device loader resolves it.
        let skip = match module_space.section_by_lma(u64::from(value)) {
            Err(_) => true,
            Ok(sec) => RUNTIME_SECTIONS.contains(&sec.name.as_str()),
        };
        if skip {
            debug!("  addr: 0x{addr:08x}  value: 0x{value:08x} (skip)");
            continue;
        }

        // Sanity check that the embedded copy still matches the module.
        let fw_off = module_file_off + site_off;
        let fw_value = read_word(fw, fw_off)?;
        if fw_value != value {
            return Err(UldError::ConsistencyFailure {
                offset: fw_off as u64,
                expected: value,
                found: fw_value,
            });
        }

        let fixup_value =
            module_space.lma_to_file_offset(u64::from(value))? as u32 + module_lma;
        debug!("    applying fixup for 0x{addr:08x} value 0x{value:08x}->0x{fixup_value:08x}");
        write_word(fw, fw_off, fixup_value)?;
        applied += 1;
    }

    Ok(applied)
}

/// Correct the function-descriptor offsets in the module's PLT.
///
/// `ld` generates the descriptor offsets relative to the base of
/// `.got.plt`, but at runtime they are referenced through the PIC base
/// register, which points at the base of `.got` when one is present. The
/// difference between the two bases is added to every entry's descriptor
/// word. Returns the number of entries updated.
pub fn patch_plt_descriptors(
    fw_space: &AddressSpace,
    fw: &mut [u8],
    module_space: &AddressSpace,
    module_lma: u32,
) -> Result<usize, UldError> {
    let Some(plt) = module_space.section_by_name(".plt") else {
        return Ok(0);
    };

    // A .plt should not exist without a .got.plt.
    let got_plt = module_space.section_by_name(".got.plt").ok_or_else(|| {
        UldError::ValidationFailure(
            ".got.plt section not found when .plt section is present".into(),
        )
    })?;

    let picreg_offset = match module_space.section_by_name(".got") {
        Some(got) => got_plt.lma as i64 - got.lma as i64,
        None => 0,
    };
    if picreg_offset == 0 {
        debug!("updated descriptor offsets for 0 plt entries");
        return Ok(0);
    }

    if plt.mem_size % PLT_ENTRY_SIZE != 0 {
        return Err(UldError::ValidationFailure(format!(
            ".plt size {} is not multiple of {PLT_ENTRY_SIZE}",
            plt.mem_size
        )));
    }

    let module_file_off = fw_space.lma_to_file_offset(u64::from(module_lma))? as usize;
    let plt_file_off = module_space.lma_to_file_offset(plt.lma)? as usize;

    let mut count = 0usize;
    let mut val_off = PLT_DESC_OFFSET;
    while val_off < plt.mem_size {
        let off = module_file_off + plt_file_off + val_off as usize;
        let val = read_word(fw, off)?;
        write_word(fw, off, val.wrapping_add(picreg_offset as u32))?;
        count += 1;
        val_off += PLT_ENTRY_SIZE;
    }

    debug!("updated descriptor offsets for {count} plt entries");
    Ok(count)
}

/// Recompute a module's CRC over its final patched bytes and store it in
/// the module's table entry. Returns the new CRC.
pub fn write_file_crc(
    fw_space: &AddressSpace,
    fw: &mut [u8],
    entry: &FsEntry,
) -> Result<u32, UldError> {
    let file_off = fw_space.lma_to_file_offset(u64::from(entry.base))? as usize;
    let data = fw
        .get(file_off..file_off + entry.size as usize)
        .ok_or_else(|| {
            UldError::ValidationFailure(format!(
                "file {} extends beyond image", entry.name
            ))
        })?;
    let crc = crc32fast::hash(data);

    debug!("patching new crc 0x{crc:08x} for file {}", entry.name);
    write_word(fw, entry.entry_file_off + FS_ENTRY_CRC_OFFSET, crc)?;
    Ok(crc)
}

/// Recompute the CRC over the whole table range and store it in the pstore
/// metadata region. Returns the new CRC.
pub fn write_table_crc(
    fw: &mut [u8],
    table_off: usize,
    table_size: usize,
    pstore_off: usize,
) -> Result<u32, UldError> {
    let data = fw.get(table_off..table_off + table_size).ok_or_else(|| {
        UldError::ValidationFailure("fs table extends beyond image".into())
    })?;
    let crc = crc32fast::hash(data);

    debug!("patching new crc 0x{crc:08x} for fs_table");
    write_word(fw, pstore_off + PSTORE_TABLE_CRC_OFFSET, crc)?;
    Ok(crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::ElfSection;

    const SHT_PROGBITS: u32 = 1;
    const SHT_NOBITS: u32 = 8;

    fn sec(
        name: &str,
        lma: u64,
        file_offset: u64,
        mem_size: u64,
        file_size: u64,
        sh_type: u32,
    ) -> ElfSection {
        ElfSection {
            index: 0,
            name: name.to_string(),
            mem_size,
            vma: lma,
            lma,
            file_offset,
            alignment: 4,
            flags: 0,
            sh_type,
            file_size,
        }
    }

    /// Module layout: .text at lma 0 (file 0x00..0x40), .rofixup at lma
    /// 0x40 (file 0x40..0x50), .bss at lma 0x100 (no file image).
    fn module_space(fixup_count: u64) -> AddressSpace {
        AddressSpace::from_sections(vec![
            sec(".text", 0x0, 0x0, 0x40, 0x40, SHT_PROGBITS),
            sec(".rofixup", 0x40, 0x40, fixup_count * 4, fixup_count * 4, SHT_PROGBITS),
            sec(".bss", 0x100, 0x50, 0x40, 0, SHT_NOBITS),
        ])
    }

    /// Firmware: one .files section holding the module image at lma
    /// 0x2_0000, file offset 0x1000.
    fn firmware_space() -> AddressSpace {
        AddressSpace::from_sections(vec![sec(
            ".files",
            0x2_0000,
            0x1000,
            0x100,
            0x100,
            SHT_PROGBITS,
        )])
    }

    const MODULE_LMA: u32 = 0x2_0000;
    const MODULE_FW_OFF: usize = 0x1000;

    fn put_word(buf: &mut [u8], off: usize, value: u32) {
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn module_with_fixup(site: u32, value: u32) -> Vec<u8> {
        let mut module = vec![0u8; 0x50];
        put_word(&mut module, site as usize, value);
        put_word(&mut module, 0x40, site); // one rofixup record
        module
    }

    fn firmware_with_module(module: &[u8]) -> Vec<u8> {
        let mut fw = vec![0u8; 0x1100];
        fw[MODULE_FW_OFF..MODULE_FW_OFF + module.len()].copy_from_slice(module);
        fw
    }

    #[test]
    fn fixup_is_rewritten_in_firmware_space() {
        // Word at module lma 0x10 points at module lma 0x20 (.text).
        let module = module_with_fixup(0x10, 0x20);
        let mut fw = firmware_with_module(&module);

        let n = apply_rofixups(
            &firmware_space(),
            &mut fw,
            &module_space(1),
            &module,
            MODULE_LMA,
        )
        .unwrap();
        assert_eq!(n, 1);

        // New value: file offset of 0x20 in the module (0x20) rebased by
        // the module's firmware load address.
        let patched = read_word(&fw, MODULE_FW_OFF + 0x10).unwrap();
        assert_eq!(patched, MODULE_LMA + 0x20);
        // The module file itself is untouched.
        assert_eq!(read_word(&module, 0x10).unwrap(), 0x20);
    }

    #[test]
    fn fixup_into_runtime_section_is_skipped() {
        // Value resolves to .bss via vma only; it has no load image.
        let module = module_with_fixup(0x10, 0x100);
        let mut fw = firmware_with_module(&module);
        let before = fw.clone();

        let n = apply_rofixups(
            &firmware_space(),
            &mut fw,
            &module_space(1),
            &module,
            MODULE_LMA,
        )
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(fw, before);
    }

    #[test]
    fn fixup_into_got_is_skipped() {
        let space = AddressSpace::from_sections(vec![
            sec(".text", 0x0, 0x0, 0x40, 0x40, SHT_PROGBITS),
            sec(".rofixup", 0x40, 0x40, 4, 4, SHT_PROGBITS),
            sec(".got", 0x50, 0x50, 0x10, 0x10, SHT_PROGBITS),
        ]);

        let mut module = vec![0u8; 0x60];
        put_word(&mut module, 0x10, 0x54); // points into .got
        put_word(&mut module, 0x40, 0x10);
        let mut fw = firmware_with_module(&module);
        let before = fw.clone();

        let n = apply_rofixups(&firmware_space(), &mut fw, &space, &module, MODULE_LMA).unwrap();
        assert_eq!(n, 0);
        assert_eq!(fw, before);
    }

    #[test]
    fn diverged_firmware_copy_is_a_consistency_failure() {
        let module = module_with_fixup(0x10, 0x20);
        let mut fw = firmware_with_module(&module);
        // Corrupt the embedded copy.
        put_word(&mut fw, MODULE_FW_OFF + 0x10, 0xffff_ffff);

        let err = apply_rofixups(
            &firmware_space(),
            &mut fw,
            &module_space(1),
            &module,
            MODULE_LMA,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UldError::ConsistencyFailure {
                expected: 0x20,
                found: 0xffff_ffff,
                ..
            }
        ));
    }

    #[test]
    fn module_without_rofixup_is_a_noop() {
        let space = AddressSpace::from_sections(vec![sec(
            ".text",
            0x0,
            0x0,
            0x40,
            0x40,
            SHT_PROGBITS,
        )]);
        let module = vec![0u8; 0x40];
        let mut fw = firmware_with_module(&module);
        let n = apply_rofixups(&firmware_space(), &mut fw, &space, &module, MODULE_LMA).unwrap();
        assert_eq!(n, 0);
    }

    fn plt_module_space(plt_size: u64, got: Option<u64>, got_plt: Option<u64>) -> AddressSpace {
        let mut sections = vec![
            sec(".text", 0x0, 0x0, 0x40, 0x40, SHT_PROGBITS),
            sec(".plt", 0x40, 0x40, plt_size, plt_size, SHT_PROGBITS),
        ];
        let after_plt = 0x40 + plt_size;
        if let Some(lma) = got {
            sections.push(sec(".got", lma, after_plt, 0x10, 0x10, SHT_PROGBITS));
        }
        if let Some(lma) = got_plt {
            sections.push(sec(
                ".got.plt",
                lma,
                after_plt + 0x10,
                0x10,
                0x10,
                SHT_PROGBITS,
            ));
        }
        AddressSpace::from_sections(sections)
    }

    #[test]
    fn descriptor_offsets_are_corrected() {
        // Two PLT entries; .got at 0x100, .got.plt at 0x130.
        let space = plt_module_space(0x28, Some(0x100), Some(0x130));
        let module = vec![0u8; 0x100];
        let mut fw = firmware_with_module(&module);
        put_word(&mut fw, MODULE_FW_OFF + 0x40 + 0x10, 0x8);
        put_word(&mut fw, MODULE_FW_OFF + 0x40 + 0x24, 0x10);

        let n = patch_plt_descriptors(&firmware_space(), &mut fw, &space, MODULE_LMA).unwrap();
        assert_eq!(n, 2);
        assert_eq!(read_word(&fw, MODULE_FW_OFF + 0x50).unwrap(), 0x8 + 0x30);
        assert_eq!(read_word(&fw, MODULE_FW_OFF + 0x64).unwrap(), 0x10 + 0x30);
    }

    #[test]
    fn no_got_means_no_correction() {
        let space = plt_module_space(0x28, None, Some(0x130));
        let module = vec![0u8; 0x100];
        let mut fw = firmware_with_module(&module);
        let before = fw.clone();

        let n = patch_plt_descriptors(&firmware_space(), &mut fw, &space, MODULE_LMA).unwrap();
        assert_eq!(n, 0);
        assert_eq!(fw, before);
    }

    #[test]
    fn equal_got_bases_mean_no_correction() {
        let space = plt_module_space(0x28, Some(0x130), Some(0x130));
        let module = vec![0u8; 0x100];
        let mut fw = firmware_with_module(&module);
        let before = fw.clone();

        let n = patch_plt_descriptors(&firmware_space(), &mut fw, &space, MODULE_LMA).unwrap();
        assert_eq!(n, 0);
        assert_eq!(fw, before);
    }

    #[test]
    fn plt_without_got_plt_is_invalid() {
        let space = plt_module_space(0x28, Some(0x100), None);
        let module = vec![0u8; 0x100];
        let mut fw = firmware_with_module(&module);
        let err =
            patch_plt_descriptors(&firmware_space(), &mut fw, &space, MODULE_LMA).unwrap_err();
        assert!(matches!(err, UldError::ValidationFailure(_)));
    }

    #[test]
    fn ragged_plt_size_fails_before_modifying_bytes() {
        let space = plt_module_space(0x2a, Some(0x100), Some(0x130));
        let module = vec![0u8; 0x100];
        let mut fw = firmware_with_module(&module);
        let before = fw.clone();

        let err =
            patch_plt_descriptors(&firmware_space(), &mut fw, &space, MODULE_LMA).unwrap_err();
        assert!(matches!(err, UldError::ValidationFailure(_)));
        assert_eq!(fw, before);
    }

    #[test]
    fn file_crc_is_stamped_into_entry() {
        let module = vec![0xa5u8; 0x40];
        let mut fw = firmware_with_module(&module);
        let entry = FsEntry {
            entry_file_off: 0x200,
            base: MODULE_LMA,
            next: 0,
            size: 0x40,
            crc: 0,
            flags: 0,
            name: "mod".into(),
        };

        let crc = write_file_crc(&firmware_space(), &mut fw, &entry).unwrap();
        assert_eq!(crc, crc32fast::hash(&vec![0xa5u8; 0x40]));
        assert_eq!(
            read_word(&fw, 0x200 + FS_ENTRY_CRC_OFFSET).unwrap(),
            crc
        );
    }

    #[test]
    fn table_crc_is_stamped_into_pstore() {
        let mut fw = vec![0u8; 0x800];
        fw[0x100..0x300].fill(0x5a);
        let crc = write_table_crc(&mut fw, 0x100, 0x200, 0x400).unwrap();
        assert_eq!(crc, crc32fast::hash(&vec![0x5au8; 0x200]));
        assert_eq!(
            read_word(&fw, 0x400 + PSTORE_TABLE_CRC_OFFSET).unwrap(),
            crc
        );
    }
}
