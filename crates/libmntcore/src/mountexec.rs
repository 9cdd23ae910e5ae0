// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The mount executor: the visit function the ordered traversal engine
//! drives during restore. Decides, for one node at a time, whether its
//! prerequisites are satisfied yet, performs the actual mount syscall
//! (fresh, bind, or plugin-delegated), and fixes up propagation state
//! afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::CoreError;
use crate::fstype::{self, FsTypeId};
use crate::plugin::MountPlugin;
use crate::propagation::restore_shared_options;
use crate::record::MountHandle;
use crate::store::MountStore;
use crate::traverse::Visit;

/// Flags meaningful to an initial `mount(2)` call. Propagation
/// (`MS_SHARED`/`MS_SLAVE`/`MS_PRIVATE`/`MS_UNBINDABLE`) and the
/// operation selectors (`MS_BIND`/`MS_REMOUNT`/`MS_MOVE`) are applied as
/// separate calls instead, since the kernel rejects them combined with a
/// fresh mount.
const NEW_MOUNT_FLAGS_MASK: MsFlags = MsFlags::from_bits_truncate(
    MsFlags::MS_RDONLY.bits()
        | MsFlags::MS_NOSUID.bits()
        | MsFlags::MS_NODEV.bits()
        | MsFlags::MS_NOEXEC.bits()
        | MsFlags::MS_SYNCHRONOUS.bits()
        | MsFlags::MS_NOATIME.bits()
        | MsFlags::MS_NODIRATIME.bits()
        | MsFlags::MS_RELATIME.bits(),
);

/// Visits one node of the tree during restore. Returns `Defer` when the
/// node's parent isn't mounted yet, or `can_mount_now` isn't satisfied
/// (root mounts are always mountable; fsroot mounts are mountable unless
/// slaved; anything else needs a resolved `bind_source`, a plugin, or an
/// external mapping).
pub fn do_mount_one(
    store: &mut MountStore,
    handle: MountHandle,
    ns_root: &Path,
    plugin: &dyn MountPlugin,
) -> Visit {
    if store.get(handle).mounted {
        return Visit::Ok;
    }

    if let Some(parent) = store.get(handle).parent {
        if !store.get(parent).mounted {
            return Visit::Defer;
        }
    }

    if !can_mount_now(store, handle) {
        return Visit::Defer;
    }

    match mount_node(store, handle, ns_root, plugin) {
        Ok(Visit::Ok) => {
            store.get_mut(handle).mounted = true;
            Visit::Ok
        }
        Ok(Visit::Defer) => Visit::Defer,
        Ok(Visit::Fail(e)) | Err(e) => Visit::Fail(e),
    }
}

/// §4.5's `can_mount_now`: opportunistically resolves a bind source as a
/// side effect, since that's the only one of the three tests that isn't a
/// plain field read.
fn can_mount_now(store: &mut MountStore, handle: MountHandle) -> bool {
    let record = store.get(handle);
    if record.parent.is_none() {
        return true;
    }
    if record.need_plugin || record.external {
        return true;
    }
    if record.is_fsroot() && record.master_peer.is_none() {
        return true;
    }
    resolve_bind_source(store, handle).is_some()
}

fn mount_node(
    store: &mut MountStore,
    handle: MountHandle,
    ns_root: &Path,
    plugin: &dyn MountPlugin,
) -> Result<Visit, CoreError> {
    let target = join_under(ns_root, store.get(handle).mountpoint.as_path());
    fs::create_dir_all(&target)?;

    let record = store.get(handle);
    let mnt_id = record.mnt_id;
    let mountpoint = record.mountpoint.to_string();

    if record.need_plugin {
        info!("delegating mount {mnt_id} at {mountpoint} to plugin");
        plugin.restore_ext_mount(mnt_id, &mountpoint)?;
    } else if record.is_fsroot() {
        if let Some(parent) = record.parent {
            if store.get(parent).shared_id != 0
                && store.get(parent).peers.iter().any(|&p| !store.get(p).mounted)
            {
                // Shared parent hasn't finished propagating to all its peers
                // yet; mounting here now could be observed by only some of
                // them. Wait for the rest.
                debug!("deferring mount {mnt_id} at {mountpoint}: shared parent not fully propagated yet");
                return Ok(Visit::Defer);
            }
        }
        do_new_mount(store, handle, &target)?;
    } else if record.external {
        let ext_key = record.root.clone();
        let Some(host_path) = store.external.lookup(&ext_key).map(str::to_owned) else {
            return Err(CoreError::Capability {
                mountpoint,
                detail: "marked external but no mapping supplied".into(),
            });
        };
        info!("binding external mount {mnt_id} at {mountpoint} from {host_path}");
        do_bind_mount(&PathBuf::from(host_path), &target, store.get(handle).flags)?;
    } else {
        match resolve_bind_source(store, handle) {
            Some(source) => {
                let source_dir = bind_source_path(store, handle, source, ns_root);
                let flags = store.get(handle).flags;
                do_bind_mount(&source_dir, &target, flags)?;
            }
            None => {
                debug!("deferring bind mount {mnt_id} at {mountpoint}: no bind source resolved yet");
                return Ok(Visit::Defer);
            }
        }
    }

    reclassify(store, handle, &target)?;
    propagate_mount(store, handle, &target, ns_root)?;

    Ok(Visit::Ok)
}

/// Fresh mount of a fsroot-mounted filesystem.
fn do_new_mount(store: &MountStore, handle: MountHandle, target: &Path) -> Result<(), CoreError> {
    let record = store.get(handle);
    let fstype_name = fstype::entry(record.fstype).name;
    let source = if record.source.is_empty() { None } else { Some(record.source.as_str()) };
    let options = if record.options.is_empty() { None } else { Some(record.options.as_str()) };

    info!("mounting {fstype_name} at {}", target.display());
    mount(source, target, Some(fstype_name), record.flags & NEW_MOUNT_FLAGS_MASK, options)?;
    Ok(())
}

fn do_bind_mount(source: &Path, target: &Path, flags: MsFlags) -> Result<(), CoreError> {
    info!("binding {} at {}", source.display(), target.display());
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)?;

    if flags.intersects(NEW_MOUNT_FLAGS_MASK) {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | (flags & NEW_MOUNT_FLAGS_MASK),
            None::<&str>,
        )?;
    }

    Ok(())
}

/// Returns `handle`'s resolved `bind_source`, if any, caching it if this
/// is the first time it can be determined. The field is usually already
/// set by a prior mount's propagation fix-up (see `propagate_mount`); the
/// direct scan here is the fallback for the first record in a bind
/// equivalence class to come up for air, before anything has fixed it up
/// for it yet.
fn resolve_bind_source(store: &mut MountStore, handle: MountHandle) -> Option<MountHandle> {
    if let Some(source) = store.get(handle).bind_source {
        return Some(source);
    }

    let root_path = store.get(handle).root.clone();
    let found = store.get(handle).binds.iter().copied().find(|&t| {
        let candidate = store.get(t);
        candidate.mounted
            && (candidate.is_fsroot() || (candidate.parent.is_none() && root_path.starts_with(&candidate.root)))
    });

    if let Some(source) = found {
        store.get_mut(handle).bind_source = Some(source);
    }
    found
}

/// Absolute path to bind from: the source's mounted location, plus
/// whatever part of `handle`'s root the source doesn't already expose.
fn bind_source_path(store: &MountStore, handle: MountHandle, source: MountHandle, ns_root: &Path) -> PathBuf {
    let target_root = &store.get(handle).root;
    let source_root = &store.get(source).root;
    let remainder = target_root.strip_prefix(source_root).unwrap_or(target_root).trim_start_matches('/');

    let source_dir = join_under(ns_root, store.get(source).mountpoint.as_path());
    if remainder.is_empty() {
        source_dir
    } else {
        source_dir.join(remainder)
    }
}

fn reclassify(store: &mut MountStore, handle: MountHandle, target: &Path) -> Result<(), CoreError> {
    let current = store.get(handle).fstype;
    if current == FsTypeId::Unsupported {
        let reclassified = fstype::reclassify_by_statfs(target, current)?;
        store.get_mut(handle).fstype = reclassified;
    }
    Ok(())
}

/// Fixes up propagation state after `handle` is successfully mounted at
/// `target`: sets the shared/slave/private flags on its own mountpoint,
/// then propagates the result sideways so peer and slave mounts the
/// kernel has already materialized are marked satisfied instead of being
/// mounted a second time.
fn propagate_mount(
    store: &mut MountStore,
    handle: MountHandle,
    target: &Path,
    ns_root: &Path,
) -> Result<(), CoreError> {
    let record = store.get(handle);
    let shared = record.shared_id != 0;
    let slave = record.master_peer.is_some();
    restore_shared_options(target, true, shared, slave)?;

    assign_bind_source_to_group(store, handle);

    if let Some(parent) = store.get(handle).parent {
        mark_peer_counterparts_mounted(store, handle, parent);
        umount_slave_counterparts(store, handle, parent, ns_root)?;
    }

    if store.get(handle).is_fsroot() || store.get(handle).parent.is_none() {
        assign_bind_source_to_unresolved_binds(store, handle);
    }

    Ok(())
}

/// Every record whose `master_id` matches a peer group's `shared_id` is
/// linked into only the one peer handle the collector happened to find
/// first (see `collect::collect_relations`); to see every slave of a
/// whole peer group we union each member's `slaves` list.
fn slaves_of_group(store: &MountStore, handle: MountHandle) -> Vec<MountHandle> {
    let mut out = store.get(handle).slaves.clone();
    for &peer in &store.get(handle).peers {
        out.extend(store.get(peer).slaves.iter().copied());
    }
    out.sort_by_key(|h| h.0);
    out.dedup();
    out
}

/// Once `handle` is mounted, any still-unmounted peer or slave of its peer
/// group can be satisfied by binding from `handle` on a later pass --
/// record it as their `bind_source` now.
fn assign_bind_source_to_group(store: &mut MountStore, handle: MountHandle) {
    let peers = store.get(handle).peers.clone();
    for p in peers {
        if !store.get(p).mounted && store.get(p).bind_source.is_none() {
            store.get_mut(p).bind_source = Some(handle);
        }
    }
    for s in slaves_of_group(store, handle) {
        if !store.get(s).mounted && store.get(s).bind_source.is_none() {
            store.get_mut(s).bind_source = Some(handle);
        }
    }
}

/// `handle`'s fsroot (or parentless) mount satisfies any other
/// bind-equivalent record that isn't itself waiting on a slave master --
/// those are ordinary bind mounts of the same filesystem, not shared-group
/// propagation, so they're resolved here rather than in the peer/slave
/// fix-up above.
fn assign_bind_source_to_unresolved_binds(store: &mut MountStore, handle: MountHandle) {
    let binds = store.get(handle).binds.clone();
    for b in binds {
        let rec = store.get(b);
        if !rec.mounted && rec.master_peer.is_none() && rec.bind_source.is_none() {
            store.get_mut(b).bind_source = Some(handle);
        }
    }
}

/// For every peer of `handle`'s parent, finds the child under that peer
/// structurally equal to `handle` and marks it mounted: shared-subtree
/// propagation means the kernel already produced that mount the moment
/// `parent`'s peer became shared, so no second mount call is issued for
/// it. Further levels of the same peer group cascade the same way as the
/// traversal reaches them in turn, since each level re-runs this fix-up.
fn mark_peer_counterparts_mounted(store: &mut MountStore, handle: MountHandle, parent: MountHandle) {
    let parent_peers = store.get(parent).peers.clone();
    for peer in parent_peers {
        let counterpart = store
            .get(peer)
            .children
            .iter()
            .copied()
            .find(|&c| store.get(c).structurally_equal(store.get(handle)));
        if let Some(counterpart) = counterpart {
            store.get_mut(counterpart).mounted = true;
        }
    }
}

/// Slave propagation is one-way and not guaranteed to reflect exactly what
/// this restore wants there (it mirrors whatever transient state existed
/// in the kernel at binding time); any mount the kernel auto-propagated
/// into a slave of `handle`'s parent is torn back down so a later pass
/// rebuilds it explicitly from `handle`'s `bind_source` fix-up instead.
fn umount_slave_counterparts(
    store: &mut MountStore,
    handle: MountHandle,
    parent: MountHandle,
    ns_root: &Path,
) -> Result<(), CoreError> {
    for slave in slaves_of_group(store, parent) {
        let counterpart = store
            .get(slave)
            .children
            .iter()
            .copied()
            .find(|&c| store.get(c).structurally_equal(store.get(handle)));
        let Some(counterpart) = counterpart else { continue };

        let target = join_under(ns_root, store.get(counterpart).mountpoint.as_path());
        match umount2(&target, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            Err(nix::Error::EINVAL) => {}
            Err(e) => return Err(e.into()),
        }
        store.get_mut(counterpart).mounted = false;
    }
    Ok(())
}

/// Post-order cleanup visit: detaches `handle`'s mount and marks it
/// unmounted, without touching anything already removed by an ancestor's
/// recursive detach.
pub fn do_umount_one(store: &mut MountStore, handle: MountHandle, ns_root: &Path) -> Result<(), CoreError> {
    if !store.get(handle).mounted {
        return Ok(());
    }

    let target = join_under(ns_root, store.get(handle).mountpoint.as_path());
    umount2(&target, MntFlags::MNT_DETACH)?;
    store.get_mut(handle).mounted = false;
    Ok(())
}

fn join_under(base: &Path, relative: &str) -> PathBuf {
    base.join(relative.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_tree;
    use crate::plugin::NoPlugin;
    use crate::store::test_support::bare_record;
    use std::path::Path as StdPath;

    #[test]
    fn bind_source_path_appends_remainder() {
        let mut store = MountStore::new();
        let mut root = bare_record(1, StdPath::new("/"));
        root.parent_mnt_id = 0;
        let root_h = store.insert(root);

        let mut fsroot = bare_record(2, StdPath::new("/data"));
        fsroot.parent_mnt_id = 1;
        let fsroot_h = store.insert(fsroot);

        let mut bind = bare_record(3, StdPath::new("/bound"));
        bind.parent_mnt_id = 1;
        bind.root = "/sub/dir".into();
        let bind_h = store.insert(bind);

        build_tree(&mut store).unwrap();
        let path = bind_source_path(&store, bind_h, fsroot_h, StdPath::new("/ns"));
        assert_eq!(path, StdPath::new("/ns/data/sub/dir"));
        let _ = root_h;
    }

    #[test]
    fn external_mount_resolves_host_path_by_opaque_root_not_mountpoint() {
        let mut store = MountStore::new();
        let mut root = bare_record(1, StdPath::new("/"));
        root.parent_mnt_id = 0;
        store.insert(root);

        let mut ext = bare_record(2, StdPath::new("/ext"));
        ext.parent_mnt_id = 1;
        ext.root = "host-share".into();
        ext.external = true;
        let ext_h = store.insert(ext);

        build_tree(&mut store).unwrap();

        // Keyed by the opaque name carried in `root`, not by the mountpoint
        // path: a lookup keyed by mountpoint would miss this entirely.
        store.external.add("host-share", "/var/host");
        assert!(store.external.lookup("/ext").is_none());
        assert_eq!(store.external.lookup(&store.get(ext_h).root), Some("/var/host"));
    }

    #[test]
    fn mount_defers_until_parent_mounted() {
        let mut store = MountStore::new();
        let mut root = bare_record(1, StdPath::new("/"));
        root.parent_mnt_id = 0;
        let root_h = store.insert(root);
        let mut child = bare_record(2, StdPath::new("/a"));
        child.parent_mnt_id = 1;
        let child_h = store.insert(child);
        build_tree(&mut store).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let visit = do_mount_one(&mut store, child_h, dir.path(), &NoPlugin);
        assert!(matches!(visit, Visit::Defer));
        assert!(!store.get(child_h).mounted);
        let _ = root_h;
    }
}
