// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Enforces the invariants required for restore, after the tree is built
//! and peer/slave/bind relations are collected. Every check here maps to
//! one of §7's fatal error kinds; none of them are recoverable by the core.

use crate::error::CoreError;
use crate::fstype::FsTypeId;
use crate::plugin::{MountPlugin, PluginOutcome};
use crate::record::MountHandle;
use crate::store::MountStore;

/// Whether we're validating a tree being dumped (fsroot discovery may call
/// into the plugin) or one being restored (fsroot discovery only checks
/// markers already resolved at image-read time).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Dump,
    Restore,
}

pub fn validate_mounts(
    store: &mut MountStore,
    mode: Mode,
    plugin: &dyn MountPlugin,
) -> Result<(), CoreError> {
    let handles: Vec<_> = store.handles().collect();

    for &m in &handles {
        if store.get(m).parent.is_none() || store.get(m).is_ns_root {
            continue;
        }

        check_shared_parent_children(store, m)?;
        resolve_capability(store, m, mode, plugin)?;
        check_no_sibling_overmount(store, m)?;
    }

    Ok(())
}

/// Invariant: if `m`'s parent is a shared peer, every peer of the parent
/// must have a structurally-equal child to `m` (ignoring path offsets
/// specific to each peer's absolute location).
fn check_shared_parent_children(store: &MountStore, m: MountHandle) -> Result<(), CoreError> {
    let parent = store.get(m).parent.unwrap();
    if store.get(parent).shared_id == 0 {
        return Ok(());
    }
    let Some(&peer) = store.get(parent).peers.first() else {
        return Ok(());
    };

    let has_match = store
        .get(peer)
        .children
        .iter()
        .any(|&c| store.get(c).structurally_equal(store.get(m)));

    if has_match {
        Ok(())
    } else {
        Err(CoreError::Consistency(format!(
            "shared mounts {} and {} have different sets of children (missing counterpart for {}:{})",
            store.get(parent).mnt_id,
            store.get(peer).mnt_id,
            store.get(m).mnt_id,
            store.get(m).mountpoint,
        )))
    }
}

/// Invariant 7: every non-root record needs either a supported fsroot
/// mount, a bind source whose subtree actually contains `root`, or an
/// external/plugin resolution.
fn resolve_capability(
    store: &mut MountStore,
    m: MountHandle,
    mode: Mode,
    plugin: &dyn MountPlugin,
) -> Result<(), CoreError> {
    let record = store.get(m);
    if record.is_fsroot() {
        if record.fstype == FsTypeId::Unsupported {
            return Err(CoreError::Capability {
                mountpoint: record.mountpoint.to_string(),
                detail: format!("fstype is unsupported (mnt_id {})", record.mnt_id),
            });
        }
        return Ok(());
    }

    let root_path = record.root.clone();
    let found = store.get(m).binds.iter().copied().find(|&t| {
        let t = store.get(t);
        // The candidate is an authoritative bind source only if it is
        // itself fsroot-mounted, or it is a namespace root whose `root`
        // is a prefix of the candidate record's `root` -- a bind peer
        // discovered mid-list is not accepted on bind-equivalence alone.
        t.is_fsroot() || (t.parent.is_none() && root_path.starts_with(&t.root))
    });

    if found.is_some() {
        return Ok(());
    }

    let mountpoint = store.get(m).mountpoint.to_string();
    let mnt_id = store.get(m).mnt_id;

    match mode {
        Mode::Dump => match plugin.dump_ext_mount(&mountpoint, mnt_id)? {
            PluginOutcome::Handled => {
                store.get_mut(m).need_plugin = true;
                Ok(())
            }
            PluginOutcome::NotSupported => {
                if store.get(m).external {
                    Ok(())
                } else {
                    Err(CoreError::Capability {
                        mountpoint,
                        detail: "no proper root mount".into(),
                    })
                }
            }
        },
        Mode::Restore => {
            if store.get(m).need_plugin || store.get(m).external {
                Ok(())
            } else {
                Err(CoreError::Capability {
                    mountpoint,
                    detail: "no proper root mount".into(),
                })
            }
        }
    }
}

fn check_no_sibling_overmount(store: &MountStore, m: MountHandle) -> Result<(), CoreError> {
    let parent = store.get(m).parent.unwrap();
    let mp = &store.get(m).mountpoint;

    for &t in &store.get(parent).children {
        if t == m {
            continue;
        }
        let tp = &store.get(t).mountpoint;
        if tp.is_strict_prefix_of(mp) || mp.is_strict_prefix_of(tp) {
            return Err(CoreError::Topology(format!(
                "{}:{} is overmounted by {}:{}",
                store.get(m).mnt_id,
                mp,
                store.get(t).mnt_id,
                tp,
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::collect_relations;
    use crate::graph::build_tree;
    use crate::plugin::NoPlugin;
    use crate::store::test_support::bare_record;
    use std::path::Path;

    fn base_store() -> (MountStore, MountHandle) {
        let mut store = MountStore::new();
        let mut root = bare_record(1, Path::new("/"));
        root.parent_mnt_id = 0;
        let r = store.insert(root);
        (store, r)
    }

    #[test]
    fn rejects_sibling_overmount() {
        let (mut store, _root) = base_store();
        let mut a = bare_record(2, Path::new("/p/a"));
        a.parent_mnt_id = 1;
        store.insert(a);
        let mut b = bare_record(3, Path::new("/p/a/b"));
        b.parent_mnt_id = 1;
        store.insert(b);

        build_tree(&mut store).unwrap();
        collect_relations(&mut store).unwrap();
        let err = validate_mounts(&mut store, Mode::Restore, &NoPlugin).unwrap_err();
        assert!(matches!(err, CoreError::Topology(_)));
    }

    #[test]
    fn bind_without_source_or_mapping_is_capability_error() {
        let (mut store, _root) = base_store();
        let mut bind = bare_record(2, Path::new("/b"));
        bind.parent_mnt_id = 1;
        bind.root = "/sub".into();
        store.insert(bind);

        build_tree(&mut store).unwrap();
        collect_relations(&mut store).unwrap();
        let err = validate_mounts(&mut store, Mode::Restore, &NoPlugin).unwrap_err();
        assert!(matches!(err, CoreError::Capability { .. }));
    }

    #[test]
    fn bind_with_fsroot_source_is_accepted() {
        let (mut store, _root) = base_store();
        let mut fsroot = bare_record(2, Path::new("/t"));
        fsroot.parent_mnt_id = 1;
        fsroot.source = "tmpfs-instance".into();
        let fsroot_dev = fsroot.s_dev;
        store.insert(fsroot);

        let mut bind = bare_record(3, Path::new("/b"));
        bind.parent_mnt_id = 1;
        bind.root = "/sub".into();
        bind.source = "tmpfs-instance".into();
        bind.s_dev = fsroot_dev;
        store.insert(bind);

        build_tree(&mut store).unwrap();
        collect_relations(&mut store).unwrap();
        validate_mounts(&mut store, Mode::Restore, &NoPlugin).unwrap();
    }

    #[test]
    fn external_mapping_satisfies_capability_at_restore() {
        let (mut store, _root) = base_store();
        let mut ext = bare_record(2, Path::new("/ext"));
        ext.parent_mnt_id = 1;
        ext.root = "/opaque".into();
        ext.external = true;
        store.insert(ext);

        build_tree(&mut store).unwrap();
        collect_relations(&mut store).unwrap();
        validate_mounts(&mut store, Mode::Restore, &NoPlugin).unwrap();
    }
}
