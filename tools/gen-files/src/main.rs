// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! File-table generator for uld firmware builds
//!
//! Embed a set of files into a host object as sections and generate the
//! matching header: a file-count and table-size constant plus an inlinable
//! assembler rendition of the fixed-capacity file table. The table's base
//! and next pointers are emitted as symbol+offset expressions that the
//! final link resolves to concrete load addresses.
//!
//! The target object is only replaced, atomically, after every file has
//! been embedded and the whole table generated; all intermediates are
//! scoped temporary files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use tempfile::NamedTempFile;

use uld_common::embed::{add_section, DEFAULT_SECTION_FLAGS};
use uld_common::fs_table::{layout_table, pad_len, TableLayout, TableSource};

#[derive(Parser, Debug)]
#[command(name = "gen-uld-files")]
#[command(about = "Generate uld files header/object")]
#[command(
    after_help = "If OBJCOPY is not present in the environment 'objcopy' will be used."
)]
struct Args {
    /// File alignment in low-order zero bits
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(..=31))]
    file_align: u32,

    /// Comma separated path prefix(es) to strip off files when naming
    /// table entries; the longest matching prefix wins
    #[arg(long)]
    file_path_strip: Option<String>,

    /// Section prefix for embedded files
    #[arg(long, default_value = ".files")]
    file_section: String,

    /// Symbol base added to file pointers in the fs table
    #[arg(long, default_value = "_s_files")]
    sec_sym_base: String,

    /// fs table file-count define name
    #[arg(long, default_value = "_ULD_FS_FILE_COUNT")]
    file_count_def: String,

    /// fs table size in bytes, err if over, pad if under
    #[arg(long, default_value_t = 0x200)]
    fs_table_size: u32,

    /// fs table base define name
    #[arg(long, default_value = "_ULD_FS_TABLE")]
    fs_table_sym_def: String,

    /// fs table size define name
    #[arg(long, default_value = "_ULD_FS_TABLE_SIZE")]
    fs_table_size_def: String,

    #[arg(long)]
    verbose: bool,

    /// Path of the fs header file to create
    hdr: PathBuf,

    /// Path to an existing object to add files to
    obj: PathBuf,

    /// Input file path, or name=path to override the default name
    /// (derived from the path and --file-path-strip)
    #[arg(value_name = "FILE")]
    files: Vec<String>,
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
    let strip_prefixes: Vec<&str> = args
        .file_path_strip
        .as_deref()
        .map(|s| s.split(',').filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    // Duplicate the target object into a temporary in the same directory so
    // the final replace is an atomic rename. Opened before any embedding
    // starts to fail early.
    let obj_dir = args
        .obj
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut out_obj = NamedTempFile::new_in(obj_dir)
        .context("failed to create temporary object")?;
    let obj_bytes = fs::read(&args.obj)
        .with_context(|| format!("failed to read {}", args.obj.display()))?;
    out_obj.write_all(&obj_bytes)?;
    out_obj.flush()?;
    debug!("opened tmp object: {}", out_obj.path().display());

    let mut sources = Vec::with_capacity(args.files.len());
    // Padded blobs must outlive the objcopy invocations.
    let mut blobs = Vec::with_capacity(args.files.len());

    for spec in &args.files {
        let (name, path) = split_file_spec(spec, &strip_prefixes);
        let data = fs::read(&path)
            .with_context(|| format!("failed to read input file {path}"))?;

        // The embedder cannot change section alignment, so pad the contents
        // here; padded files align together on the final link.
        let pad = pad_len(data.len() as u64, args.file_align) as usize;
        let mut padded = data;
        padded.extend(std::iter::repeat(0u8).take(pad));
        let crc = crc32fast::hash(&padded);

        let mut blob = NamedTempFile::new().context("failed to create temporary file")?;
        blob.write_all(&padded)?;
        blob.flush()?;

        let section = format!("{}.{}", args.file_section, name);
        debug!(
            "embedding {path} as {section} ({} bytes, crc 0x{crc:08x})",
            padded.len()
        );
        add_section(out_obj.path(), &section, blob.path(), DEFAULT_SECTION_FLAGS)?;
        blobs.push(blob);

        sources.push(TableSource {
            name,
            size: padded.len() as u32,
            crc,
        });
    }

    let layout = layout_table(&sources, args.fs_table_size)?;
    let header = render_header(args, &layout);

    fs::write(&args.hdr, header)
        .with_context(|| format!("failed to write {}", args.hdr.display()))?;
    out_obj
        .persist(&args.obj)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", args.obj.display()))?;

    debug!(
        "embedded {} file(s), table uses {} of {} bytes",
        sources.len(),
        layout.used,
        layout.capacity
    );
    Ok(())
}

/// Split a `name=path` or bare `path` specifier. A bare path's name is the
/// path with the longest matching strip prefix removed.
fn split_file_spec(spec: &str, strip_prefixes: &[&str]) -> (String, String) {
    if let Some((name, path)) = spec.split_once('=') {
        return (name.to_string(), path.to_string());
    }
    let name = strip_prefixes
        .iter()
        .filter(|p| spec.starts_with(**p))
        .max_by_key(|p| p.len())
        .map(|p| &spec[p.len()..])
        .unwrap_or(spec);
    (name.to_string(), spec.to_string())
}

/// Include guard derived from the header path.
fn header_guard(hdr: &Path) -> String {
    let mut guard = String::from("_");
    guard.push_str(&hdr.to_string_lossy().replace(['/', '.'], "_"));
    guard.to_uppercase()
}

/// The table as assembler directives, addresses as symbol+offset
/// expressions against the embedding symbols.
fn render_table_asm(layout: &TableLayout, sec_sym_base: &str, table_sym: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in &layout.entries {
        lines.push(format!(
            "    .word {} + 0x{:08x} @ .base",
            sec_sym_base, entry.base_off
        ));
        match entry.next_off {
            Some(off) => lines.push(format!(
                "    .word {} + 0x{:08x} @ .next",
                table_sym, off
            )),
            None => lines.push("    .word 0x00000000 @ .next".to_string()),
        }
        lines.push(format!("    .word 0x{:08x} @ .size", entry.size));
        lines.push(format!("    .word 0x{:08x} @ .crc", entry.crc));
        lines.push(format!("    .word 0x{:08x} @ .flags", entry.flags));

        let name = entry
            .name_padded
            .iter()
            .map(|&b| {
                if b == 0 {
                    "\\000".to_string()
                } else {
                    char::from(b).to_string()
                }
            })
            .collect::<String>();
        lines.push(format!("    .ascii \"{name}\""));
    }
    lines.push(format!("    .space {}", layout.remaining()));
    lines
}

fn render_header(args: &Args, layout: &TableLayout) -> String {
    let guard = header_guard(&args.hdr);
    let mut out = String::new();

    out.push_str("/* Autogenerated file, DO NOT EDIT manually!\n");
    out.push_str("   This file was generated by gen-uld-files\n");
    out.push_str("*/\n\n");

    out.push_str(&format!("#ifndef {guard}\n"));
    out.push_str(&format!("#define {guard}\n\n"));
    out.push_str(&format!(
        "#define {} {}\n",
        args.file_count_def,
        layout.entries.len()
    ));
    out.push_str(&format!(
        "#define {} {}\n\n",
        args.fs_table_size_def, args.fs_table_size
    ));
    out.push_str(&format!("#endif  // {guard}\n\n"));

    // The inline block emits the table itself and expects the includer to
    // have defined the table-base symbol macro first.
    out.push_str("#ifdef __INLINE_FS_TABLE__\n");
    out.push_str("#undef __INLINE_FS_TABLE__\n\n");
    out.push_str(&format!("#ifndef {}\n", args.fs_table_sym_def));
    out.push_str(&format!(
        "#error Please define {} with the current fs table symbol\n",
        args.fs_table_sym_def
    ));
    out.push_str(&format!("#endif  // {}\n\n", args.fs_table_sym_def));

    for line in render_table_asm(layout, &args.sec_sym_base, &args.fs_table_sym_def) {
        out.push('\t');
        out.push_str(&line);
        out.push('\n');
    }

    out.push_str(&format!("\n#undef {}\n\n", args.fs_table_sym_def));
    out.push_str("#endif  // __INLINE_FS_TABLE__\n");
    out
}
