// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Hooks shared by the pseudo-filesystems (proc, sysfs, devpts, cgroup2,
//! mqueue, securityfs, debugfs, autofs): the kernel populates them fresh on
//! every mount, so there is no content to carry across. Dump only verifies
//! the directory looks the way an unmounted pseudo-filesystem mountpoint
//! should (empty, since the kernel hasn't populated it through this path),
//! and restore does nothing at all.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::CoreError;

pub fn dump_empty(dir: &Path, _out: &mut dyn Write) -> Result<(), CoreError> {
    let mut entries = std::fs::read_dir(dir)?;
    if entries.next().is_some() {
        return Err(CoreError::Capability {
            mountpoint: dir.display().to_string(),
            detail: "expected an empty pseudo-filesystem mountpoint".into(),
        });
    }
    Ok(())
}

pub fn restore_noop(_dir: &Path, _input: &mut dyn Read) -> Result<(), CoreError> {
    Ok(())
}
