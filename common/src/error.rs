// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! Error types for the uld firmware tools.
//!
//! Every error here is fatal for the current invocation; nothing is retried
//! or recovered from internally.

use thiserror::Error;

/// Which address space a failed section lookup was performed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    FileOffset,
    LoadAddress,
    VirtualAddress,
}

impl std::fmt::Display for AddrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrKind::FileOffset => write!(f, "file offset"),
            AddrKind::LoadAddress => write!(f, "lma"),
            AddrKind::VirtualAddress => write!(f, "vma"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UldError {
    /// An invoked external tool reported non-zero status.
    #[error("cmd: `{command}` exited with code: {status}")]
    CommandFailure { command: String, status: i32 },

    /// Built table content exceeds the configured fixed capacity.
    #[error("generated table size {size} greater than {capacity}")]
    GenerationOverflow { size: u32, capacity: u32 },

    /// An address could not be resolved against any known section.
    #[error("could not find section for {kind}: 0x{addr:08x}")]
    LookupFailure { kind: AddrKind, addr: u64 },

    /// A word read from the firmware image does not match the corresponding
    /// word in the original module, indicating a build/link mismatch.
    #[error(
        "incorrect value 0x{found:08x} at 0x{offset:08x} in image, expected 0x{expected:08x}"
    )]
    ConsistencyFailure {
        offset: u64,
        expected: u32,
        found: u32,
    },

    /// A module referenced by the file table is not in the search path.
    #[error("{0} not found in search path")]
    MissingDependency(String),

    /// A structurally required section is absent or a size constraint is
    /// violated.
    #[error("{0}")]
    ValidationFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse ELF: {0}")]
    Elf(#[from] goblin::error::Error),
}
