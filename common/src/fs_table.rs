// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! File-table wire format, builder layout and parser.
//!
//! The table is a fixed-capacity, singly-linked directory of the files
//! embedded in a firmware image. Each entry is five little-endian words
//! followed by the NUL-padded name:
//!
//! ```text
//! base:u32  next:u32  size:u32  crc:u32  flags:u32  name... \0 pad-to-4
//! ```
//!
//! `base` and `next` are symbol+offset expressions at build time and only
//! become concrete load addresses after final linking, which is why the
//! parser needs the firmware's [`AddressSpace`] to walk `next` pointers.
//! Unused trailing capacity is zero-filled.

use std::collections::HashSet;

use crate::error::{AddrKind, UldError};
use crate::layout::AddressSpace;

/// Size of the five fixed header words.
pub const FS_ENTRY_SIZE: usize = 20;
/// Byte offset of the `crc` field within an entry.
pub const FS_ENTRY_CRC_OFFSET: usize = 0xc;
/// Byte offset of the table-wide CRC within the pstore metadata region.
pub const PSTORE_TABLE_CRC_OFFSET: usize = 0x18;

/// Bytes needed to round `size` up to the next multiple of `2^align`.
pub fn pad_len(size: u64, align: u32) -> u64 {
    let m = (1u64 << align) - 1;
    ((size + m) & !m) - size
}

/// One parsed file-table entry, as recovered from a linked firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// File offset of this entry within the firmware image.
    pub entry_file_off: usize,
    /// Load address of the file's first byte.
    pub base: u32,
    /// Load address of the next entry, 0 for the last.
    pub next: u32,
    /// Padded file size in bytes.
    pub size: u32,
    pub crc: u32,
    pub flags: u32,
    pub name: String,
}

fn word(buf: &[u8], off: usize) -> Result<u32, UldError> {
    let bytes = buf
        .get(off..off + 4)
        .ok_or_else(|| UldError::ValidationFailure(format!(
            "fs table truncated at offset 0x{off:x}"
        )))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Walk the in-place linked list starting at offset 0 of `buf`.
///
/// `buf_file_off` is the file offset of `buf` within the firmware image;
/// `next` pointers are load addresses and are translated through `space`
/// and re-based against it. A `next` pointer that lands outside the buffer
/// means the table was not built and linked consistently.
pub fn parse_fs_table(
    buf: &[u8],
    buf_file_off: usize,
    space: &AddressSpace,
) -> Result<Vec<FsEntry>, UldError> {
    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    let mut e_base = 0usize;

    loop {
        if !visited.insert(e_base) {
            return Err(UldError::ValidationFailure(format!(
                "fs table next pointer loops back to offset 0x{e_base:x}"
            )));
        }
        let base = word(buf, e_base)?;
        let next = word(buf, e_base + 4)?;
        let size = word(buf, e_base + 8)?;
        let crc = word(buf, e_base + 12)?;
        let flags = word(buf, e_base + 16)?;

        // Scan for the NUL terminating the variable-length name.
        let mut offset = e_base + FS_ENTRY_SIZE;
        loop {
            match buf.get(offset) {
                Some(0) => break,
                Some(_) => offset += 1,
                None => {
                    return Err(UldError::ValidationFailure(format!(
                        "unterminated name in fs entry at offset 0x{e_base:x}"
                    )))
                }
            }
        }
        let name = String::from_utf8_lossy(&buf[e_base + FS_ENTRY_SIZE..offset]).into_owned();

        entries.push(FsEntry {
            entry_file_off: e_base + buf_file_off,
            base,
            next,
            size,
            crc,
            flags,
            name,
        });

        if next == 0 {
            break;
        }

        let next_file_off = space.lma_to_file_offset(u64::from(next))?;
        let rebased = next_file_off as i64 - buf_file_off as i64;
        if rebased < 0 || rebased as usize >= buf.len() {
            return Err(UldError::LookupFailure {
                kind: AddrKind::FileOffset,
                addr: next_file_off,
            });
        }
        e_base = rebased as usize;
    }

    Ok(entries)
}

/// One file to be placed in the table: already padded, CRC over the padded
/// bytes.
#[derive(Debug, Clone)]
pub struct TableSource {
    pub name: String,
    /// Padded size in bytes.
    pub size: u32,
    pub crc: u32,
}

/// A laid-out entry, addresses still relative to the embedding symbols.
#[derive(Debug, Clone)]
pub struct TableEntryLayout {
    /// Name with its NUL terminator and padding to a 4-byte boundary.
    pub name_padded: Vec<u8>,
    /// Offset of the file's bytes from the files-base symbol.
    pub base_off: u32,
    /// Offset of the following entry from the table-base symbol; `None`
    /// terminates the list.
    pub next_off: Option<u32>,
    pub size: u32,
    pub crc: u32,
    pub flags: u32,
}

/// The complete laid-out table.
#[derive(Debug)]
pub struct TableLayout {
    pub entries: Vec<TableEntryLayout>,
    /// Bytes consumed by the serialized entries.
    pub used: u32,
    pub capacity: u32,
}

impl TableLayout {
    /// Zero-filled remainder after the last entry.
    pub fn remaining(&self) -> u32 {
        self.capacity - self.used
    }

    /// Serialize with concrete base addresses, zero-filling to capacity.
    pub fn to_bytes(&self, files_base: u32, table_base: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.capacity as usize);
        for entry in &self.entries {
            let next = match entry.next_off {
                Some(off) => table_base + off,
                None => 0,
            };
            out.extend_from_slice(&(files_base + entry.base_off).to_le_bytes());
            out.extend_from_slice(&next.to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
            out.extend_from_slice(&entry.crc.to_le_bytes());
            out.extend_from_slice(&entry.flags.to_le_bytes());
            out.extend_from_slice(&entry.name_padded);
        }
        out.resize(self.capacity as usize, 0);
        out
    }
}

/// Lay the files out as a linked table of at most `capacity` bytes.
///
/// Fails with [`UldError::GenerationOverflow`] before any output exists if
/// the serialized entries alone exceed the capacity.
pub fn layout_table(files: &[TableSource], capacity: u32) -> Result<TableLayout, UldError> {
    let mut entries = Vec::with_capacity(files.len());
    let mut base_off = 0u32;
    let mut next_off = 0u32;
    let last = files.len().saturating_sub(1);

    for (index, file) in files.iter().enumerate() {
        // Pad the name to 4 bytes including the NUL so every header word of
        // the following entry stays naturally aligned.
        let mut name_padded = file.name.clone().into_bytes();
        let pad = pad_len(name_padded.len() as u64 + 1, 2) + 1;
        name_padded.extend(std::iter::repeat(0u8).take(pad as usize));

        next_off += (FS_ENTRY_SIZE + name_padded.len()) as u32;

        entries.push(TableEntryLayout {
            name_padded,
            base_off,
            next_off: if index == last { None } else { Some(next_off) },
            size: file.size,
            crc: file.crc,
            flags: 0,
        });
        base_off += file.size;
    }

    if next_off > capacity {
        return Err(UldError::GenerationOverflow {
            size: next_off,
            capacity,
        });
    }

    Ok(TableLayout {
        entries,
        used: next_off,
        capacity,
    })
}
