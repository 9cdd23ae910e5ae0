// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The three propagation primitives the mount executor composes to
//! reproduce a mount's shared-subtree state: private, slave, shared,
//! applied in that order so a mount that needs to be both slave and
//! shared (a shared slave) ends up correctly tagged either way.

use std::path::Path;

use nix::mount::{mount, MsFlags};

use crate::error::CoreError;

/// Applies whichever of private/slave/shared the caller asks for, in that
/// fixed order, to the mountpoint at `path`.
pub fn restore_shared_options(
    path: &Path,
    private: bool,
    shared: bool,
    slave: bool,
) -> Result<(), CoreError> {
    if private {
        make_private(path)?;
    }
    if slave {
        make_slave(path)?;
    }
    if shared {
        make_shared(path)?;
    }
    Ok(())
}

pub fn make_private(path: &Path) -> Result<(), CoreError> {
    mount(None::<&str>, path, None::<&str>, MsFlags::MS_PRIVATE, None::<&str>)?;
    Ok(())
}

pub fn make_slave(path: &Path) -> Result<(), CoreError> {
    mount(None::<&str>, path, None::<&str>, MsFlags::MS_SLAVE, None::<&str>)?;
    Ok(())
}

pub fn make_shared(path: &Path) -> Result<(), CoreError> {
    mount(None::<&str>, path, None::<&str>, MsFlags::MS_SHARED, None::<&str>)?;
    Ok(())
}
