// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! Uld Firmware Tools Common Library
//!
//! This library provides the offline half of the uld loadable-module story:
//! building the fixed-capacity file table that is linked into a firmware
//! image, and finalizing an already-linked image by resolving position-
//! independent fixups against each module's final load address and stamping
//! CRC32 checksums.
//!
//! The on-device loader only walks structures produced here; it is not part
//! of this crate.

pub mod embed;
pub mod error;
pub mod fs_table;
pub mod layout;
pub mod patch;
pub mod section;

pub use error::UldError;
pub use layout::AddressSpace;
pub use section::ElfSection;
