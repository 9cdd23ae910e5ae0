// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Populates `peers`, `slaves`, `master_peer` and `binds` across the whole
//! record list. Must run after [`crate::graph::build_tree`] (slave
//! resolution only fails for non-root mounts) and before
//! [`crate::validate::validate_mounts`].

use crate::error::CoreError;
use crate::store::MountStore;

pub fn collect_relations(store: &mut MountStore) -> Result<(), CoreError> {
    let handles: Vec<_> = store.handles().collect();

    for &m in &handles {
        if store.get(m).shared_id != 0 && store.get(m).peers.is_empty() {
            let shared_id = store.get(m).shared_id;
            let peers: Vec<_> = handles
                .iter()
                .copied()
                .filter(|&t| t != m && store.get(t).shared_id == shared_id)
                .collect();
            store.get_mut(m).peers = peers;
        }
    }

    for &m in &handles {
        let master_id = store.get(m).master_id;
        if master_id == 0 {
            continue;
        }

        let master = handles.iter().copied().find(|&t| store.get(t).shared_id == master_id);
        match master {
            Some(master) => {
                store.get_mut(master).slaves.push(m);
                store.get_mut(m).master_peer = Some(master);
            }
            None => {
                if store.get(m).parent.is_some() {
                    return Err(CoreError::Topology(format!(
                        "mount {} is slave to unreachable peer group {master_id}",
                        store.get(m).mnt_id
                    )));
                }
            }
        }
    }

    for &m in &handles {
        if !store.get(m).binds.is_empty() {
            continue;
        }
        let binds: Vec<_> = handles
            .iter()
            .copied()
            .filter(|&t| t != m && store.get(t).bind_equivalent(store.get(m)))
            .collect();
        store.get_mut(m).binds = binds;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_tree;
    use crate::store::test_support::bare_record;
    use std::path::Path;

    #[test]
    fn peers_are_symmetric() {
        let mut store = MountStore::new();
        let mut r1 = bare_record(1, Path::new("/"));
        r1.parent_mnt_id = 0;
        let root = store.insert(r1);

        let mut r2 = bare_record(2, Path::new("/p1"));
        r2.parent_mnt_id = 1;
        r2.shared_id = 42;
        let p1 = store.insert(r2);

        let mut r3 = bare_record(3, Path::new("/p2"));
        r3.parent_mnt_id = 1;
        r3.shared_id = 42;
        let p2 = store.insert(r3);

        build_tree(&mut store).unwrap();
        collect_relations(&mut store).unwrap();

        assert_eq!(store.get(p1).peers, vec![p2]);
        assert_eq!(store.get(p2).peers, vec![p1]);
        assert!(store.get(root).peers.is_empty());
    }

    #[test]
    fn slave_links_master_peer() {
        let mut store = MountStore::new();
        let mut r1 = bare_record(1, Path::new("/"));
        r1.parent_mnt_id = 0;
        store.insert(r1);

        let mut master = bare_record(2, Path::new("/m"));
        master.parent_mnt_id = 1;
        master.shared_id = 7;
        let master_h = store.insert(master);

        let mut slave = bare_record(3, Path::new("/s"));
        slave.parent_mnt_id = 1;
        slave.master_id = 7;
        let slave_h = store.insert(slave);

        build_tree(&mut store).unwrap();
        collect_relations(&mut store).unwrap();

        assert_eq!(store.get(master_h).slaves, vec![slave_h]);
        assert_eq!(store.get(slave_h).master_peer, Some(master_h));
    }

    #[test]
    fn unreachable_slave_on_non_root_is_fatal() {
        let mut store = MountStore::new();
        let mut r1 = bare_record(1, Path::new("/"));
        r1.parent_mnt_id = 0;
        store.insert(r1);

        let mut slave = bare_record(2, Path::new("/s"));
        slave.parent_mnt_id = 1;
        slave.master_id = 999;
        store.insert(slave);

        build_tree(&mut store).unwrap();
        let err = collect_relations(&mut store).unwrap_err();
        assert!(matches!(err, CoreError::Topology(_)));
    }
}
