// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! Firmware finalize tool
//!
//! Apply rofixups for the modules embedded in a linked uld firmware image,
//! correct PLT function-descriptor offsets, and recalculate the CRC32
//! checksums for each file and for the fs table.
//!
//! The image is read into memory once, every patch is applied to the
//! buffer, and the file is rewritten in a single step at the end; a failure
//! partway through leaves the on-disk image untouched.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use uld_common::fs_table::{parse_fs_table, FsEntry};
use uld_common::patch::{
    apply_rofixups, patch_plt_descriptors, write_file_crc, write_table_crc,
};
use uld_common::{AddressSpace, ElfSection, UldError};

#[derive(Parser, Debug)]
#[command(name = "patch-uld-elf")]
#[command(
    about = "Apply rofixups for files contained within uld firmware and \
             recalculate crc32 checksums for files and fs_table"
)]
struct Args {
    /// Section prefix for embedded files
    #[arg(long, default_value = ".files")]
    file_section: String,

    /// Section holding the fs table
    #[arg(long, default_value = ".fs_table")]
    fs_table_section: String,

    /// Section holding the pstore metadata region
    #[arg(long, default_value = ".uld_pdata")]
    pstore_section: String,

    /// Offset from the pstore section base
    #[arg(long, default_value_t = 0)]
    pstore_offset: u32,

    /// Search path for module files, each directory tried in order,
    /// followed by the firmware's own directory
    #[arg(long, num_args = 1..)]
    elf_search_path: Vec<PathBuf>,

    #[arg(long)]
    verbose: bool,

    /// Path to the linked uld firmware image, patched in place
    #[arg(value_name = "uld-path")]
    uld_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    run(&args)
}

fn run(args: &Args) -> Result<()> {
    let mut fw = fs::read(&args.uld_path)
        .with_context(|| format!("failed to read {}", args.uld_path.display()))?;
    let fw_space = AddressSpace::from_bytes(&fw)
        .with_context(|| format!("failed to parse {}", args.uld_path.display()))?;

    let fs_table_sec = fw_space
        .section_by_name(&args.fs_table_section)
        .ok_or_else(|| {
            UldError::ValidationFailure(format!(
                "{} section not found in {}",
                args.fs_table_section,
                args.uld_path.display()
            ))
        })?;
    let table_off = fs_table_sec.file_offset as usize;
    let table_size = fs_table_sec.mem_size as usize;

    let pstore_sec = fw_space
        .section_by_name(&args.pstore_section)
        .ok_or_else(|| {
            UldError::ValidationFailure(format!(
                "{} section not found in {}",
                args.pstore_section,
                args.uld_path.display()
            ))
        })?;
    let pstore_off = pstore_sec.file_offset as usize + args.pstore_offset as usize;

    let fs_table = read_fs_table(&fw, &fw_space, &args.file_section, fs_table_sec)?;

    debug!(
        "read {} fs entr(ies) from {}",
        fs_table.len(),
        args.uld_path.display()
    );
    for entry in &fs_table {
        debug!(
            "  {} base 0x{:08x} size 0x{:08x} crc 0x{:08x}",
            entry.name, entry.base, entry.size, entry.crc
        );
    }

    let fw_dir = args
        .uld_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut search_path = args.elf_search_path.clone();
    search_path.push(fw_dir);

    for entry in &fs_table {
        let module_path = find_module(&search_path, &entry.name)?;
        debug!("processing file {}", module_path.display());

        let module = fs::read(&module_path)
            .with_context(|| format!("failed to read {}", module_path.display()))?;
        let module_space = AddressSpace::from_bytes(&module)
            .with_context(|| format!("failed to parse {}", module_path.display()))?;

        apply_module_patches(&fw_space, &mut fw, &module_space, &module, entry)?;
    }

    write_table_crc(&mut fw, table_off, table_size, pstore_off)?;

    fs::write(&args.uld_path, &fw)
        .with_context(|| format!("failed to write {}", args.uld_path.display()))?;
    debug!("finalized {} module(s)", fs_table.len());
    Ok(())
}

fn apply_module_patches(
    fw_space: &AddressSpace,
    fw: &mut [u8],
    module_space: &AddressSpace,
    module: &[u8],
    entry: &FsEntry,
) -> Result<(), UldError> {
    let fixups = apply_rofixups(fw_space, fw, module_space, module, entry.base)?;
    debug!("applied {fixups} fixup(s) for {}", entry.name);

    patch_plt_descriptors(fw_space, fw, module_space, entry.base)?;
    write_file_crc(fw_space, fw, entry)?;
    Ok(())
}

/// Read the fs table out of the firmware image.
///
/// A firmware without the files section has nothing embedded yet (dev
/// case); the table is still all padding and parses as empty rather than
/// failing.
fn read_fs_table(
    fw: &[u8],
    fw_space: &AddressSpace,
    file_section: &str,
    fs_table_sec: &ElfSection,
) -> Result<Vec<FsEntry>, UldError> {
    if fw_space.section_by_name(file_section).is_none() {
        return Ok(Vec::new());
    }

    let table_off = fs_table_sec.file_offset as usize;
    let table_buf = fw
        .get(table_off..table_off + fs_table_sec.file_size as usize)
        .ok_or_else(|| {
            UldError::ValidationFailure(format!(
                "{} section extends beyond image",
                fs_table_sec.name
            ))
        })?;
    parse_fs_table(table_buf, table_off, fw_space)
}

/// Locate a module by table-entry name along the search path.
fn find_module(search_path: &[PathBuf], name: &str) -> Result<PathBuf, UldError> {
    for dir in search_path {
        let path = dir.join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(UldError::MissingDependency(name.to_string()))
}
