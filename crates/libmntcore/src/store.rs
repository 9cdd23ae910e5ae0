// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The mount store is the context object the rest of the core is threaded
//! through: an arena of [`MountRecord`]s for one mount namespace, addressed
//! by stable [`MountHandle`]s, plus the namespace's resolved root and its
//! external-mount mappings. Modeling it this way (rather than module-level
//! singletons) keeps dump and restore reentrant and makes teardown
//! explicit: drop the store, the roots yard it may own gets torn down
//! separately by its owner.

use std::collections::HashMap;

use crate::external::ExternalMounts;
use crate::record::{MountHandle, MountRecord};

#[derive(Default)]
pub struct MountStore {
    records: Vec<MountRecord>,
    by_mnt_id: HashMap<i32, MountHandle>,
    root: Option<MountHandle>,
    pub external: ExternalMounts,
}

impl MountStore {
    pub fn new() -> Self {
        MountStore::default()
    }

    /// Inserts a record and returns its handle. Does not link it into the
    /// tree; that's `graph::build_tree`'s job.
    pub fn insert(&mut self, record: MountRecord) -> MountHandle {
        let handle = MountHandle(self.records.len() as u32);
        self.by_mnt_id.insert(record.mnt_id, handle);
        self.records.push(record);
        handle
    }

    pub fn get(&self, handle: MountHandle) -> &MountRecord {
        &self.records[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: MountHandle) -> &mut MountRecord {
        &mut self.records[handle.0 as usize]
    }

    pub fn by_mnt_id(&self, mnt_id: i32) -> Option<MountHandle> {
        self.by_mnt_id.get(&mnt_id).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = MountHandle> {
        (0..self.records.len() as u32).map(MountHandle)
    }

    pub fn root(&self) -> Option<MountHandle> {
        self.root
    }

    pub fn set_root(&mut self, root: MountHandle) {
        self.root = Some(root);
    }

    /// Resolves an absolute path to the most specific mount covering it:
    /// walk down from the root, following the child whose mountpoint is
    /// the longest prefix of `path`.
    pub fn resolve_path(&self, path: &str) -> Option<MountHandle> {
        let mut current = self.root?;
        loop {
            let children = &self.get(current).children;
            let next = children.iter().copied().find(|&child| {
                let cp = self.get(child).mountpoint.as_path();
                path == cp || (path.starts_with(cp) && path.as_bytes()[cp.len()] == b'/')
            });
            match next {
                Some(child) => current = child,
                None => return Some(current),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use nix::mount::MsFlags;

    use crate::fstype::FsTypeId;
    use crate::record::{Device, MountPath, MountRecord, NsId};
    use std::path::Path;

    pub(crate) fn bare_record(mnt_id: i32, mountpoint: &Path) -> MountRecord {
        MountRecord {
            mnt_id,
            parent_mnt_id: 0,
            s_dev: Device::new(0, mnt_id as u32),
            fstype: FsTypeId::Tmpfs,
            root: "/".into(),
            mountpoint: MountPath::new(mountpoint.to_str().unwrap()),
            source: "tmpfs".into(),
            options: String::new(),
            flags: MsFlags::empty(),
            shared_id: 0,
            master_id: 0,
            nsid: NsId(0),
            parent: None,
            children: Vec::new(),
            peers: Vec::new(),
            slaves: Vec::new(),
            binds: Vec::new(),
            bind_source: None,
            master_peer: None,
            is_ns_root: false,
            external: false,
            need_plugin: false,
            dumped: false,
            mounted: false,
        }
    }
}
