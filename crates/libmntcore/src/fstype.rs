// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The filesystem registry: a closed, statically-known table mapping a
//! filesystem name to a numeric code and an optional set of hooks
//! (`parse`/`dump`/`restore`). Polymorphism over filesystems is a value
//! (this table), not a trait hierarchy: the hook table for a variant that
//! has none of the three is simply all-`None`, and `Unsupported` is a
//! first-class entry rather than a null.

use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use nix::sys::statfs::statfs;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::record::MountRecord;

/// `btrfs`'s `statfs(2)` magic number. Subvolumes of the same btrfs
/// filesystem report distinct device ids, which confuses plain name-based
/// fstype lookup during raw mount-table parsing; a record left
/// `Unsupported` after name lookup is re-checked against this magic before
/// validation runs.
const BTRFS_SUPER_MAGIC: i64 = 0x9123683e;

mod pseudo;
mod tmpfs;

/// Numeric code identifying a filesystem type. `Unsupported` is the
/// sentinel for anything outside the closed set this engine knows how to
/// restore from scratch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum FsTypeId {
    Unsupported = 0,
    Ext4,
    Xfs,
    Btrfs,
    Tmpfs,
    Proc,
    Sysfs,
    Devtmpfs,
    Devpts,
    Cgroup2,
    Mqueue,
    Securityfs,
    Debugfs,
    Autofs,
    Overlay,
}

/// Optional per-filesystem hook called at collect time to normalize
/// `options` before the record is considered final.
pub type ParseFn = fn(&mut MountRecord);

/// Optional per-filesystem hook that serializes a mounted directory's
/// content into `out`.
pub type DumpFn = fn(dir: &Path, out: &mut dyn Write) -> Result<(), CoreError>;

/// Optional per-filesystem hook that rehydrates content previously
/// produced by the matching `DumpFn` into a freshly mounted directory.
pub type RestoreFn = fn(dir: &Path, input: &mut dyn Read) -> Result<(), CoreError>;

/// One entry of the filesystem registry.
pub struct FsTypeEntry {
    pub id: FsTypeId,
    pub name: &'static str,
    pub parse: Option<ParseFn>,
    pub dump: Option<DumpFn>,
    pub restore: Option<RestoreFn>,
}

macro_rules! entry {
    ($id:expr, $name:expr) => {
        FsTypeEntry { id: $id, name: $name, parse: None, dump: None, restore: None }
    };
    ($id:expr, $name:expr, parse = $parse:expr) => {
        FsTypeEntry { id: $id, name: $name, parse: Some($parse), dump: None, restore: None }
    };
    ($id:expr, $name:expr, dump = $dump:expr, restore = $restore:expr) => {
        FsTypeEntry { id: $id, name: $name, parse: None, dump: Some($dump), restore: Some($restore) }
    };
    ($id:expr, $name:expr, parse = $parse:expr, dump = $dump:expr, restore = $restore:expr) => {
        FsTypeEntry { id: $id, name: $name, parse: Some($parse), dump: Some($dump), restore: Some($restore) }
    };
}

static REGISTRY: &[FsTypeEntry] = &[
    entry!(FsTypeId::Unsupported, "unsupported"),
    entry!(FsTypeId::Ext4, "ext4"),
    entry!(FsTypeId::Xfs, "xfs"),
    // Reclassified in place by the mount executor when a record tagged
    // Unsupported turns out, via statfs magic, to actually be btrfs (its
    // subvolumes report distinct device ids than the name lookup expects).
    entry!(FsTypeId::Btrfs, "btrfs"),
    entry!(
        FsTypeId::Tmpfs,
        "tmpfs",
        parse = tmpfs::parse,
        dump = tmpfs::dump,
        restore = tmpfs::restore
    ),
    entry!(FsTypeId::Proc, "proc", dump = pseudo::dump_empty, restore = pseudo::restore_noop),
    entry!(FsTypeId::Sysfs, "sysfs", dump = pseudo::dump_empty, restore = pseudo::restore_noop),
    entry!(FsTypeId::Devtmpfs, "devtmpfs"),
    entry!(
        FsTypeId::Devpts,
        "devpts",
        dump = pseudo::dump_empty,
        restore = pseudo::restore_noop
    ),
    entry!(
        FsTypeId::Cgroup2,
        "cgroup2",
        dump = pseudo::dump_empty,
        restore = pseudo::restore_noop
    ),
    entry!(
        FsTypeId::Mqueue,
        "mqueue",
        dump = pseudo::dump_empty,
        restore = pseudo::restore_noop
    ),
    entry!(
        FsTypeId::Securityfs,
        "securityfs",
        dump = pseudo::dump_empty,
        restore = pseudo::restore_noop
    ),
    entry!(
        FsTypeId::Debugfs,
        "debugfs",
        dump = pseudo::dump_empty,
        restore = pseudo::restore_noop
    ),
    entry!(
        FsTypeId::Autofs,
        "autofs",
        dump = pseudo::dump_empty,
        restore = pseudo::restore_noop
    ),
    entry!(FsTypeId::Overlay, "overlay"),
];

/// Looks up a registry entry by its numeric id. Always succeeds: every
/// `FsTypeId` variant has an entry, including `Unsupported`.
pub fn entry(id: FsTypeId) -> &'static FsTypeEntry {
    REGISTRY
        .iter()
        .find(|e| e.id == id)
        .expect("every FsTypeId has a registry entry")
}

impl FromStr for FsTypeId {
    type Err = ();

    /// Maps a kernel-reported filesystem name to its registry id. Unknown
    /// names map to `Unsupported` rather than failing: the closed set is
    /// deliberate (spec non-goal: not every filesystem is supported), and
    /// an unrecognized name just means this particular mount will need a
    /// bind source, an external mapping, or a plugin at restore time.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(REGISTRY
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.id)
            .unwrap_or(FsTypeId::Unsupported))
    }
}

impl FsTypeId {
    pub fn name(self) -> &'static str {
        entry(self).name
    }
}

/// Re-checks `current` against `dir`'s `statfs(2)` magic, reclassifying
/// `Unsupported` to `Btrfs` when it matches. Any other fstype is returned
/// unchanged; this only ever upgrades a name lookup that came back empty.
pub fn reclassify_by_statfs(dir: &Path, current: FsTypeId) -> Result<FsTypeId, CoreError> {
    if current != FsTypeId::Unsupported {
        return Ok(current);
    }

    let stat = statfs(dir)?;
    if stat.filesystem_type().0 as i64 == BTRFS_SUPER_MAGIC {
        Ok(FsTypeId::Btrfs)
    } else {
        Ok(current)
    }
}
