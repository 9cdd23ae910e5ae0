// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The plugin hook is how the core hands off mountpoints it can't resolve
//! any other way (neither a supported fsroot, nor a bind source, nor an
//! external mapping). It is a collaborator the core calls into, not
//! something the core implements discovery for — plugin *discovery* is out
//! of scope, per the engine's non-goals.

use crate::error::CoreError;

/// Outcome of asking a plugin whether it can handle a mountpoint.
pub enum PluginOutcome {
    /// The plugin will take care of this mount; mark it `need_plugin`.
    Handled,
    /// The plugin has no opinion; the core should try the next resolution
    /// strategy (an external mapping) before giving up.
    NotSupported,
}

pub trait MountPlugin {
    /// Called during dump-side validation for a mountpoint without an
    /// obvious fsroot. `mnt_id` and `mountpoint` (without the leading
    /// marker byte) identify the mount.
    fn dump_ext_mount(&self, mountpoint: &str, mnt_id: i32) -> Result<PluginOutcome, CoreError>;

    /// Called during restore for a mount previously marked `need_plugin`.
    /// The plugin is responsible for making `mountpoint` appear correctly
    /// mounted; the core only checks the outcome.
    fn restore_ext_mount(&self, mnt_id: i32, mountpoint: &str) -> Result<(), CoreError>;
}

/// A plugin table with nothing registered: every call declines, pushing
/// resolution on to the external-mapping fallback.
pub struct NoPlugin;

impl MountPlugin for NoPlugin {
    fn dump_ext_mount(&self, _mountpoint: &str, _mnt_id: i32) -> Result<PluginOutcome, CoreError> {
        Ok(PluginOutcome::NotSupported)
    }

    fn restore_ext_mount(&self, mnt_id: i32, mountpoint: &str) -> Result<(), CoreError> {
        Err(CoreError::PluginDeclined {
            mnt_id,
            reason: format!("no plugin registered for {mountpoint}"),
        })
    }
}
