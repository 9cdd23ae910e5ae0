// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Turns the flat record list in a [`MountStore`] into a parent/child tree:
//! resolve each record's `parent_mnt_id`, find the namespace root, attach
//! any nested-namespace root, then resort siblings deepest-first.

use log::debug;

use crate::error::CoreError;
use crate::record::MountHandle;
use crate::store::MountStore;

/// Links every record's `parent`/`children` fields and identifies the
/// namespace root. Returns the root handle, or a topology error if one
/// can't be found or a record's parent can't be resolved.
pub fn build_tree(store: &mut MountStore) -> Result<MountHandle, CoreError> {
    let mut root: Option<MountHandle> = None;

    for handle in store.handles() {
        let (mnt_id, parent_mnt_id, is_ns_root, is_root_mountpoint) = {
            let m = store.get(handle);
            (m.mnt_id, m.parent_mnt_id, m.is_ns_root, m.mountpoint.as_path() == "/")
        };

        match store.by_mnt_id(parent_mnt_id) {
            Some(parent) => {
                store.get_mut(handle).parent = Some(parent);
                store.get_mut(parent).children.push(handle);
            }
            None => {
                if root.is_none() && is_root_mountpoint {
                    debug!("mount {mnt_id} is the namespace root");
                    root = Some(handle);
                    continue;
                }

                let root_handle = match root {
                    Some(h) => h,
                    None => {
                        return Err(CoreError::Topology(format!(
                            "mountpoint {mnt_id} has no resolvable parent {parent_mnt_id} and no root found yet"
                        )))
                    }
                };
                if is_ns_root {
                    let equivalent = {
                        let root_rec = store.get(root_handle);
                        let m = store.get(handle);
                        root_rec.bind_equivalent(m) && root_rec.root == m.root
                    };
                    if !equivalent {
                        return Err(CoreError::Topology(
                            "nested mount namespaces with different roots are not supported"
                                .into(),
                        ));
                    }
                    debug!("attaching nested namespace root {mnt_id} under {parent_mnt_id}");
                    store.get_mut(handle).parent = Some(root_handle);
                    store.get_mut(root_handle).children.push(handle);
                } else {
                    return Err(CoreError::Topology(format!(
                        "mountpoint {mnt_id} has no resolvable parent {parent_mnt_id}"
                    )));
                }
            }
        }
    }

    let root = root.ok_or_else(|| CoreError::Topology("no root found for tree".into()))?;
    resort_siblings(store, root);
    store.set_root(root);
    Ok(root)
}

/// Re-sorts `node`'s children (and recursively their children) so deeper
/// mountpoints come before shallower ones. Stable among equal depths.
/// Deeper mounts must leave first at umount time; this order also serves
/// fine for mounting, since siblings are independent of each other.
fn resort_siblings(store: &mut MountStore, node: MountHandle) {
    let mut children = std::mem::take(&mut store.get_mut(node).children);
    children.sort_by_key(|&h| std::cmp::Reverse(store.get(h).mountpoint.depth()));
    store.get_mut(node).children = children;

    let kids: Vec<MountHandle> = store.get(node).children.clone();
    for child in kids {
        resort_siblings(store, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::bare_record;
    use std::path::Path;

    fn with_parent(store: &mut MountStore, mnt_id: i32, parent_mnt_id: i32, path: &str) -> MountHandle {
        let mut r = bare_record(mnt_id, Path::new(path));
        r.parent_mnt_id = parent_mnt_id;
        store.insert(r)
    }

    #[test]
    fn builds_simple_tree() {
        let mut store = MountStore::new();
        let root = with_parent(&mut store, 1, 0, "/");
        let a = with_parent(&mut store, 2, 1, "/a");
        let b = with_parent(&mut store, 3, 2, "/a/b");

        let built_root = build_tree(&mut store).unwrap();
        assert_eq!(built_root, root);
        assert_eq!(store.get(root).children, vec![a]);
        assert_eq!(store.get(a).children, vec![b]);
        assert_eq!(store.get(b).parent, Some(a));
    }

    #[test]
    fn resorts_deepest_first() {
        let mut store = MountStore::new();
        let root = with_parent(&mut store, 1, 0, "/");
        let shallow = with_parent(&mut store, 2, 1, "/p");
        let deep = with_parent(&mut store, 3, 1, "/p/q/r");
        let mid = with_parent(&mut store, 4, 1, "/p/q");

        build_tree(&mut store).unwrap();
        assert_eq!(store.get(root).children, vec![deep, mid, shallow]);
    }

    #[test]
    fn missing_parent_is_topology_error() {
        let mut store = MountStore::new();
        with_parent(&mut store, 1, 0, "/");
        with_parent(&mut store, 2, 99, "/orphan");

        let err = build_tree(&mut store).unwrap_err();
        assert!(matches!(err, CoreError::Topology(_)));
    }
}
