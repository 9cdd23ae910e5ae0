// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! On-disk representation of a dumped mount tree: one newline-delimited
//! JSON record per mount, plus a second content archive keyed by device
//! so two mounts sharing a backing device (a bind pair) only pay for the
//! content once.

use std::io::{BufRead, BufReader, Write};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::fstype::FsTypeId;
use crate::record::{Device, MountHandle, MountPath, MountRecord, NsId};
use crate::store::MountStore;

/// One mount's metadata as written to the image. Field set mirrors
/// [`MountRecord`] minus the graph links, which are recomputed by
/// [`crate::graph::build_tree`] and [`crate::collect::collect_relations`]
/// on read.
#[derive(Serialize, Deserialize)]
pub struct ImageRecord {
    pub mnt_id: i32,
    pub parent_mnt_id: i32,
    pub s_dev: Device,
    pub fstype: FsTypeId,
    pub root: String,
    pub mountpoint: String,
    pub source: String,
    pub options: String,
    pub flags: u64,
    pub shared_id: u32,
    pub master_id: u32,
    pub nsid: NsId,
    pub is_ns_root: bool,
    pub external: bool,
    #[serde(default)]
    pub with_plugin: bool,
}

impl ImageRecord {
    pub fn from_record(record: &MountRecord) -> Self {
        ImageRecord {
            mnt_id: record.mnt_id,
            parent_mnt_id: record.parent_mnt_id,
            s_dev: record.s_dev,
            fstype: record.fstype,
            root: record.root.clone(),
            mountpoint: record.mountpoint.as_path().to_owned(),
            source: record.source.clone(),
            options: record.options.clone(),
            flags: record.flags.bits() as u64,
            shared_id: record.shared_id,
            master_id: record.master_id,
            nsid: record.nsid,
            is_ns_root: record.is_ns_root,
            external: record.external,
            with_plugin: record.need_plugin,
        }
    }

    pub fn into_record(self) -> MountRecord {
        MountRecord {
            mnt_id: self.mnt_id,
            parent_mnt_id: self.parent_mnt_id,
            s_dev: self.s_dev,
            fstype: self.fstype,
            root: self.root,
            mountpoint: MountPath::new(self.mountpoint),
            source: self.source,
            options: self.options,
            flags: nix::mount::MsFlags::from_bits_truncate(self.flags as _),
            shared_id: self.shared_id,
            master_id: self.master_id,
            nsid: self.nsid,
            parent: None,
            children: Vec::new(),
            peers: Vec::new(),
            slaves: Vec::new(),
            binds: Vec::new(),
            bind_source: None,
            master_peer: None,
            is_ns_root: self.is_ns_root,
            external: self.external,
            need_plugin: self.with_plugin,
            dumped: false,
            mounted: false,
        }
    }
}

/// Writes one JSON object per line, flushing after every record so a
/// killed dump leaves a valid prefix rather than a torn last line.
pub struct ImageWriter<W: Write> {
    out: W,
}

impl<W: Write> ImageWriter<W> {
    pub fn new(out: W) -> Self {
        ImageWriter { out }
    }

    pub fn write_record(&mut self, record: &ImageRecord) -> Result<(), CoreError> {
        serde_json::to_writer(&mut self.out, record).map_err(|e| CoreError::Io(e.to_string()))?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

pub struct ImageReader<R: BufRead> {
    lines: std::io::Lines<R>,
}

impl<R: BufRead> ImageReader<R> {
    pub fn new(reader: R) -> Self {
        ImageReader { lines: reader.lines() }
    }
}

impl<R: BufRead> Iterator for ImageReader<R> {
    type Item = Result<ImageRecord, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(e.into())),
        };
        if line.trim().is_empty() {
            return self.next();
        }
        Some(serde_json::from_str(&line).map_err(|e| CoreError::Parse(e.to_string())))
    }
}

pub fn reader_from<R: std::io::Read>(reader: R) -> ImageReader<BufReader<R>> {
    ImageReader::new(BufReader::new(reader))
}

/// Loads every record from an image into a fresh [`MountStore`], in the
/// order written (graph links are not yet populated; call
/// [`crate::graph::build_tree`] next).
pub fn load_into_store<R: std::io::Read>(reader: R) -> Result<MountStore, CoreError> {
    let mut store = MountStore::new();
    for record in reader_from(reader) {
        store.insert(record?.into_record());
    }
    Ok(store)
}

/// Dumps every record in `store` to `writer`, fsroot/namespace-root
/// mounts first so a partial read still has the structurally important
/// mounts.
pub fn dump_store<W: Write>(store: &MountStore, writer: &mut ImageWriter<W>) -> Result<(), CoreError> {
    for handle in store.handles() {
        write_one(store, handle, writer)?;
    }
    Ok(())
}

fn write_one<W: Write>(
    store: &MountStore,
    handle: MountHandle,
    writer: &mut ImageWriter<W>,
) -> Result<(), CoreError> {
    let record = store.get(handle);
    writer.write_record(&ImageRecord::from_record(record))
}
