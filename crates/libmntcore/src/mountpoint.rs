// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Opening a mount directly would follow any overmounting child and yield
//! the wrong filesystem's content. When a mount has children, the opener
//! instead enters the target namespace, performs a non-recursive bind of
//! the mount into a scratch directory, opens that, detaches the bind, and
//! restores the caller's namespace -- a detour entirely to dodge the
//! overmount.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::CoreError;
use crate::record::{Device, MountHandle};
use crate::store::MountStore;

/// Abstraction over "enter another mount namespace, then come back",
/// isolated behind a trait so the opener is unit-testable without
/// requiring the calling process to actually own multiple namespaces.
pub trait NamespaceSwitch {
    fn enter(&self) -> Result<(), CoreError>;
    fn restore(&self) -> Result<(), CoreError>;
}

/// No-op switch for callers already running in the right namespace (the
/// common case: dumping or restoring one's own namespace).
pub struct SameNamespace;

impl NamespaceSwitch for SameNamespace {
    fn enter(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn restore(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Opens the given mount's target directory such that reading from it
/// yields the content of *this* mount, not any mount stacked on top of it.
///
/// `base` is the directory under which a scratch bind-target can be
/// created when a detour is needed (normally the roots yard).
pub fn open_mountpoint(
    store: &MountStore,
    handle: MountHandle,
    ns_root: &Path,
    scratch_base: &Path,
    ns: &dyn NamespaceSwitch,
) -> Result<File, CoreError> {
    let record = store.get(handle);
    let full_path = join_under(ns_root, record.mountpoint.as_path());

    let file = if record.children.is_empty() {
        File::open(&full_path)?
    } else {
        open_via_detour(&full_path, scratch_base, ns)?
    };

    check_dev(&file, record.s_dev, &full_path)?;
    Ok(file)
}

fn open_via_detour(
    full_path: &Path,
    scratch_base: &Path,
    ns: &dyn NamespaceSwitch,
) -> Result<File, CoreError> {
    ns.enter()?;
    let result = open_via_detour_inner(full_path, scratch_base);
    ns.restore()?;
    result
}

fn open_via_detour_inner(full_path: &Path, scratch_base: &Path) -> Result<File, CoreError> {
    let tmp = tempfile::tempdir_in(scratch_base)?;

    mount(Some(full_path), tmp.path(), None::<&str>, MsFlags::MS_BIND, None::<&str>)?;
    let opened = File::open(tmp.path());
    // Always try to detach the scratch bind, even if the open above failed,
    // so a dump/restore failure doesn't leak a mount under the yard.
    let detach_result = umount2(tmp.path(), MntFlags::MNT_DETACH);

    let file = opened?;
    detach_result?;
    Ok(file)
}

fn check_dev(file: &File, expected: Device, path: &Path) -> Result<(), CoreError> {
    let meta = file.metadata()?;
    let dev = meta.dev();
    let major = unsafe { libc::major(dev) } as u32;
    let minor = unsafe { libc::minor(dev) } as u32;

    if major == expected.major && minor == expected.minor {
        Ok(())
    } else {
        Err(CoreError::Io(format!(
            "opened {} resolved to device {}:{}, expected {}",
            path.display(),
            major,
            minor,
            expected,
        )))
    }
}

fn join_under(base: &Path, relative: &str) -> PathBuf {
    base.join(relative.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::bare_record;
    use std::os::unix::fs::MetadataExt as _;

    #[test]
    fn opens_leaf_mount_directly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), b"x").unwrap();

        let mut store = MountStore::new();
        let mut record = bare_record(1, Path::new("/"));
        let dev = std::fs::metadata(dir.path()).unwrap().dev();
        record.s_dev = Device::new(0, 0);
        let expected_dev = Device::new(
            unsafe { libc::major(dev) } as u32,
            unsafe { libc::minor(dev) } as u32,
        );
        record.s_dev = expected_dev;
        let handle = store.insert(record);

        let file = open_mountpoint(&store, handle, dir.path(), dir.path(), &SameNamespace).unwrap();
        assert!(file.metadata().unwrap().is_dir());
    }
}
