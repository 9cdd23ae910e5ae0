// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The ordered traversal engine: a pre-order walk that lets its visit
//! function postpone a node. Deferred subtrees are retried as a whole in
//! the next pass; a pass that satisfies nothing is a fatal progress error.
//! Modeled as explicit frontier/postpone lists rather than recursion with
//! exceptions, so termination is visible in the loop structure itself.

use log::debug;

use crate::error::CoreError;
use crate::record::MountHandle;
use crate::store::MountStore;

/// Outcome of visiting one node.
pub enum Visit {
    Ok,
    Defer,
    Fail(CoreError),
}

/// Walks `root` pre-order, calling `visit` on each node. A `Defer` return
/// skips that node's subtree for this pass; a second pass (and further
/// passes) retries postponed subtrees in the same relative order. Fails
/// with [`CoreError::Progress`] if a whole pass mounts nothing new.
pub fn traverse_with_retries<F>(
    store: &mut MountStore,
    root: MountHandle,
    mut visit: F,
) -> Result<(), CoreError>
where
    F: FnMut(&mut MountStore, MountHandle) -> Visit,
{
    let mut frontier = vec![root];
    let mut pass = 0u32;

    loop {
        let mut postponed = Vec::new();
        let mut any_progress = false;

        for handle in &frontier {
            walk_node(store, *handle, &mut visit, &mut postponed, &mut any_progress)?;
        }

        if postponed.is_empty() {
            return Ok(());
        }

        if !any_progress {
            let stuck: Vec<String> = postponed
                .iter()
                .map(|&h| store.get(h).mountpoint.to_string())
                .collect();
            debug!("traversal made no progress in pass {pass}; stuck: {stuck:?}");
            return Err(CoreError::Progress { stuck });
        }

        debug!("traversal pass {pass} postponed {} node(s), retrying", postponed.len());
        pass += 1;
        frontier = postponed;
    }
}

fn walk_node<F>(
    store: &mut MountStore,
    handle: MountHandle,
    visit: &mut F,
    postponed: &mut Vec<MountHandle>,
    any_progress: &mut bool,
) -> Result<(), CoreError>
where
    F: FnMut(&mut MountStore, MountHandle) -> Visit,
{
    match visit(store, handle) {
        Visit::Ok => {
            *any_progress = true;
            let children = store.get(handle).children.clone();
            for child in children {
                walk_node(store, child, visit, postponed, any_progress)?;
            }
            Ok(())
        }
        Visit::Defer => {
            postponed.push(handle);
            Ok(())
        }
        Visit::Fail(e) => Err(e),
    }
}

/// Post-order reverse traversal for cleanup (umount): visits children
/// before the node itself, never defers.
pub fn traverse_reverse<F>(store: &mut MountStore, root: MountHandle, mut visit: F) -> Result<(), CoreError>
where
    F: FnMut(&mut MountStore, MountHandle) -> Result<(), CoreError>,
{
    fn go<F>(store: &mut MountStore, handle: MountHandle, visit: &mut F) -> Result<(), CoreError>
    where
        F: FnMut(&mut MountStore, MountHandle) -> Result<(), CoreError>,
    {
        let children = store.get(handle).children.clone();
        for child in children {
            go(store, child, visit)?;
        }
        visit(store, handle)
    }

    go(store, root, &mut visit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_tree;
    use crate::store::test_support::bare_record;
    use std::cell::RefCell;
    use std::path::Path;

    fn linear_store() -> (MountStore, MountHandle, MountHandle, MountHandle) {
        let mut store = MountStore::new();
        let mut root = bare_record(1, Path::new("/"));
        root.parent_mnt_id = 0;
        let r = store.insert(root);
        let mut a = bare_record(2, Path::new("/a"));
        a.parent_mnt_id = 1;
        let a_h = store.insert(a);
        let mut b = bare_record(3, Path::new("/a/b"));
        b.parent_mnt_id = 2;
        let b_h = store.insert(b);
        build_tree(&mut store).unwrap();
        (store, r, a_h, b_h)
    }

    #[test]
    fn visits_parent_before_child() {
        let (mut store, root, a, b) = linear_store();
        let order = RefCell::new(Vec::new());

        traverse_with_retries(&mut store, root, |_store, h| {
            order.borrow_mut().push(h);
            Visit::Ok
        })
        .unwrap();

        assert_eq!(order.into_inner(), vec![root, a, b]);
    }

    #[test]
    fn defer_retries_in_next_pass() {
        let (mut store, root, a, _b) = linear_store();
        let mut attempts = 0;

        traverse_with_retries(&mut store, root, |_store, h| {
            if h == a {
                attempts += 1;
                if attempts == 1 {
                    return Visit::Defer;
                }
            }
            Visit::Ok
        })
        .unwrap();

        assert_eq!(attempts, 2);
    }

    #[test]
    fn zero_progress_is_fatal() {
        let (mut store, root, _a, _b) = linear_store();

        let err = traverse_with_retries(&mut store, root, |_store, h| {
            if h == root {
                Visit::Ok
            } else {
                Visit::Defer
            }
        })
        .unwrap_err();

        match err {
            CoreError::Progress { stuck } => assert_eq!(stuck.len(), 1),
            other => panic!("expected progress error, got {other:?}"),
        }
    }

    #[test]
    fn reverse_visits_children_first() {
        let (mut store, root, a, b) = linear_store();
        let order = RefCell::new(Vec::new());

        traverse_reverse(&mut store, root, |_store, h| {
            order.borrow_mut().push(h);
            Ok(())
        })
        .unwrap();

        assert_eq!(order.into_inner(), vec![b, a, root]);
    }
}
