// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The restore pipeline: an image plus its content archive in, a mounted
//! namespace out. Runs the same graph/relation/validation steps as dump,
//! then drives the ordered traversal with the mount executor as its visit
//! function, and finally replays each mount's captured content.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;

use crate::collect::collect_relations;
use crate::dump::ContentBlob;
use crate::error::CoreError;
use crate::external::ExternalMounts;
use crate::fstype;
use crate::graph::build_tree;
use crate::image::ImageRecord;
use crate::mountexec::do_mount_one;
use crate::plugin::MountPlugin;
use crate::record::{Device, MountHandle};
use crate::store::MountStore;
use crate::traverse::traverse_with_retries;
use crate::validate::{validate_mounts, Mode};

pub fn restore_namespace(
    records: Vec<ImageRecord>,
    content: Vec<ContentBlob>,
    ns_root: &Path,
    plugin: &dyn MountPlugin,
    external: ExternalMounts,
) -> Result<(), CoreError> {
    let mut store = MountStore::new();
    for record in records {
        store.insert(record.into_record());
    }

    let root = build_tree(&mut store)?;
    collect_relations(&mut store)?;
    store.external = external;
    validate_mounts(&mut store, Mode::Restore, plugin)?;

    traverse_with_retries(&mut store, root, |store, handle| {
        do_mount_one(store, handle, ns_root, plugin)
    })?;

    let by_device: HashMap<Device, &[u8]> =
        content.iter().map(|blob| (blob.device, blob.bytes.as_slice())).collect();
    let by_mnt_id: HashMap<i32, &[u8]> =
        content.iter().map(|blob| (blob.mnt_id, blob.bytes.as_slice())).collect();

    // Peer-propagated mounts share a device with the mount that actually
    // received the fresh filesystem; restoring the same archive into each
    // of them would just re-extract identical bytes onto the same
    // underlying storage through a different path, so restore once per
    // device, same as the dump side dedups by device.
    let mut restored_devices = HashSet::new();
    let mut restored_mnt_ids = HashSet::new();
    for handle in store.handles() {
        restore_content_for(
            &store,
            handle,
            ns_root,
            &by_device,
            &by_mnt_id,
            &mut restored_devices,
            &mut restored_mnt_ids,
        )?;
    }

    Ok(())
}

fn restore_content_for(
    store: &MountStore,
    handle: MountHandle,
    ns_root: &Path,
    by_device: &HashMap<Device, &[u8]>,
    by_mnt_id: &HashMap<i32, &[u8]>,
    restored_devices: &mut HashSet<Device>,
    restored_mnt_ids: &mut HashSet<i32>,
) -> Result<(), CoreError> {
    let record = store.get(handle);
    let Some(restore_fn) = fstype::entry(record.fstype).restore else {
        return Ok(());
    };

    let bytes = if let Some(&bytes) = by_device.get(&record.s_dev) {
        if restored_devices.contains(&record.s_dev) {
            return Ok(());
        }
        restored_devices.insert(record.s_dev);
        bytes
    } else if let Some(&bytes) = by_mnt_id.get(&record.mnt_id) {
        // The device key missed -- e.g. the backing device was reused or
        // reassigned between dump and restore -- fall back to the mnt_id
        // the blob was keyed under if the device lookup didn't find it.
        if restored_mnt_ids.contains(&record.mnt_id) {
            return Ok(());
        }
        restored_mnt_ids.insert(record.mnt_id);
        bytes
    } else {
        return Ok(());
    };

    let full_path = ns_root.join(record.mountpoint.as_path().trim_start_matches('/'));
    let mut cursor = Cursor::new(bytes);
    restore_fn(&full_path, &mut cursor)?;
    Ok(())
}
