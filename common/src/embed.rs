// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Uld Contributors 2026.

//! Section Embedder
//!
//! Adding a byte-blob section to an object file is delegated to an external
//! object-manipulation tool; this module only builds and runs the command.
//! Repeated calls add further sections, there is no deduplication.

use std::env;
use std::path::Path;
use std::process::Command;

use log::debug;

use crate::error::UldError;

/// Flags given to every embedded file section.
pub const DEFAULT_SECTION_FLAGS: &str = "alloc,contents,load,readonly,code";

/// Name of the object-manipulation tool, overridable via `$OBJCOPY`.
pub fn objcopy() -> String {
    env::var("OBJCOPY").unwrap_or_else(|_| "objcopy".to_string())
}

/// Add section `section_name` with the contents of `content` to `object`,
/// in place, with the given section flags.
pub fn add_section(
    object: &Path,
    section_name: &str,
    content: &Path,
    flags: &str,
) -> Result<(), UldError> {
    let tool = objcopy();
    let mut cmd = Command::new(&tool);
    cmd.arg("--add-section")
        .arg(format!("{}={}", section_name, content.display()))
        .arg("--set-section-flags")
        .arg(format!("{section_name}={flags}"))
        .arg(object);

    let rendered = format!(
        "{tool} --add-section {}={} --set-section-flags {section_name}={flags} {}",
        section_name,
        content.display(),
        object.display()
    );
    debug!("running: {rendered}");

    let status = cmd.status()?;
    if !status.success() {
        return Err(UldError::CommandFailure {
            command: rendered,
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}
