// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The dump pipeline: a raw mount table in, a validated graph plus
//! per-device content out. Ties together the graph builder, relation
//! collector, validator and filesystem registry; owns none of them.

use std::collections::HashSet;
use std::path::Path;

use crate::collect::collect_relations;
use crate::error::CoreError;
use crate::external::ExternalMounts;
use crate::fstype;
use crate::graph::build_tree;
use crate::image::ImageRecord;
use crate::plugin::MountPlugin;
use crate::rawsource::RawMountSource;
use crate::record::{Device, MountHandle};
use crate::store::MountStore;
use crate::validate::{validate_mounts, Mode};

/// Result of dumping one namespace: the metadata image plus the content
/// archive, keyed by the backing device of its representative mount so
/// bind-equivalent mounts are only captured once.
pub struct DumpOutput {
    pub image: Vec<ImageRecord>,
    pub content: Vec<ContentBlob>,
}

pub struct ContentBlob {
    pub device: Device,
    pub mnt_id: i32,
    pub bytes: Vec<u8>,
}

pub fn dump_namespace(
    source: &dyn RawMountSource,
    ns_root: &Path,
    plugin: &dyn MountPlugin,
    external: ExternalMounts,
) -> Result<DumpOutput, CoreError> {
    let mut store = MountStore::new();
    for raw in source.read_all()? {
        store.insert(raw.into_record());
    }

    build_tree(&mut store)?;
    collect_relations(&mut store)?;
    store.external = external;
    apply_external_mappings(&mut store);
    validate_mounts(&mut store, Mode::Dump, plugin)?;

    let mut content = Vec::new();
    let mut seen_devices = HashSet::new();
    for handle in store.handles() {
        if let Some(blob) = dump_content_for(&store, handle, ns_root, &mut seen_devices)? {
            content.push(blob);
        }
    }

    let image = store.handles().map(|h| ImageRecord::from_record(store.get(h))).collect();
    Ok(DumpOutput { image, content })
}

/// Shortcuts fsroot discovery for any mount the caller handed an external
/// mapping for: the mapping's value becomes the record's new `root`, an
/// opaque name meaningful only to whoever supplies the matching mapping
/// back at restore time, and `external` marks it so the validator accepts
/// it without a fsroot or resolvable bind source of its own.
fn apply_external_mappings(store: &mut MountStore) {
    let matches: Vec<(MountHandle, String)> = store
        .handles()
        .filter_map(|h| {
            let mountpoint = store.get(h).mountpoint.to_string();
            store.external.lookup(&mountpoint).map(|v| (h, v.to_owned()))
        })
        .collect();

    for (handle, opaque_name) in matches {
        let record = store.get_mut(handle);
        record.external = true;
        record.root = opaque_name;
    }
}

/// Content capture is restricted to mounts with no children: a mount
/// with something stacked on top of it would need the same bind-detour
/// the mountpoint opener uses to dodge the overmount, which only yields
/// an open file descriptor, not a path a registry dump hook can walk.
/// Those mounts are skipped; see DESIGN.md.
fn dump_content_for(
    store: &MountStore,
    handle: MountHandle,
    ns_root: &Path,
    seen_devices: &mut HashSet<Device>,
) -> Result<Option<ContentBlob>, CoreError> {
    let record = store.get(handle);
    if !record.children.is_empty() || seen_devices.contains(&record.s_dev) {
        return Ok(None);
    }

    let Some(dump_fn) = fstype::entry(record.fstype).dump else {
        return Ok(None);
    };

    let full_path = ns_root.join(record.mountpoint.as_path().trim_start_matches('/'));
    let mut bytes = Vec::new();
    dump_fn(&full_path, &mut bytes)?;
    seen_devices.insert(record.s_dev);

    Ok(Some(ContentBlob { device: record.s_dev, mnt_id: record.mnt_id, bytes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_tree;
    use crate::store::test_support::bare_record;
    use std::path::Path as StdPath;

    #[test]
    fn external_mapping_overwrites_root_and_marks_external() {
        let mut store = MountStore::new();
        let mut root = bare_record(1, StdPath::new("/"));
        root.parent_mnt_id = 0;
        store.insert(root);

        let mut ext = bare_record(2, StdPath::new("/ext"));
        ext.parent_mnt_id = 1;
        let ext_h = store.insert(ext);

        build_tree(&mut store).unwrap();

        let mut mappings = ExternalMounts::new();
        mappings.add("/ext", "host-share");
        store.external = mappings;

        apply_external_mappings(&mut store);

        let record = store.get(ext_h);
        assert!(record.external);
        assert_eq!(record.root, "host-share");
    }

    #[test]
    fn mounts_without_a_mapping_are_untouched() {
        let mut store = MountStore::new();
        let mut root = bare_record(1, StdPath::new("/"));
        root.parent_mnt_id = 0;
        store.insert(root);

        let mut plain = bare_record(2, StdPath::new("/plain"));
        plain.parent_mnt_id = 1;
        plain.root = "/".into();
        let plain_h = store.insert(plain);

        build_tree(&mut store).unwrap();
        apply_external_mappings(&mut store);

        let record = store.get(plain_h);
        assert!(!record.external);
        assert_eq!(record.root, "/");
    }
}
