// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! The contract between this engine and whatever collaborator hands it a
//! namespace's raw mount table. Parsing `/proc/<pid>/mountinfo` text,
//! discovering which namespaces exist, and deciding which pid to read it
//! from are all outside this crate -- a harness reads the kernel's table
//! and hands back [`RawMountRecord`]s, which [`crate::dump::dump_namespace`]
//! turns into a validated, content-carrying image.

use crate::error::CoreError;
use crate::fstype::FsTypeId;
use crate::record::{Device, MountPath, MountRecord, NsId};

/// One mount as read from the kernel, before graph links, fstype
/// normalization hooks, or bind/peer/slave collection have run.
#[derive(Debug, Clone)]
pub struct RawMountRecord {
    pub mnt_id: i32,
    pub parent_mnt_id: i32,
    pub s_dev: Device,
    pub fstype_name: String,
    pub root: String,
    pub mountpoint: String,
    pub source: String,
    pub options: String,
    pub flags: nix::mount::MsFlags,
    pub shared_id: u32,
    pub master_id: u32,
    pub nsid: NsId,
    pub is_ns_root: bool,
}

impl RawMountRecord {
    pub fn into_record(self) -> MountRecord {
        let fstype: FsTypeId = self.fstype_name.parse().unwrap_or(FsTypeId::Unsupported);
        let mut record = MountRecord {
            mnt_id: self.mnt_id,
            parent_mnt_id: self.parent_mnt_id,
            s_dev: self.s_dev,
            fstype,
            root: self.root,
            mountpoint: MountPath::new(self.mountpoint),
            source: self.source,
            options: self.options,
            flags: self.flags,
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
            external: false,
            need_plugin: false,
            dumped: false,
            mounted: false,
        };

        if let Some(parse) = crate::fstype::entry(fstype).parse {
            parse(&mut record);
        }

        record
    }
}

/// Implemented by whatever collaborator knows how to read a namespace's
/// mount table (from `/proc/<pid>/mountinfo`, a saved snapshot, or a test
/// fixture).
pub trait RawMountSource {
    fn read_all(&self) -> Result<Vec<RawMountRecord>, CoreError>;
}

/// A source that always returns a fixed list, useful for tests and for
/// replaying a previously captured table.
pub struct FixedMountSource(pub Vec<RawMountRecord>);

impl RawMountSource for FixedMountSource {
    fn read_all(&self) -> Result<Vec<RawMountRecord>, CoreError> {
        Ok(self.0.clone())
    }
}
