// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

use crate::consts::MOUNTPOINT_MARKER;
use crate::fstype::FsTypeId;

/// Stable, arena-local handle to a [`MountRecord`] inside a [`crate::store::MountStore`].
///
/// Relations between mounts (parent/children, peer groups, slave groups,
/// bind groups) are expressed as these integer handles rather than direct
/// references, so the graph can be cyclic (peers point at each other)
/// without fighting the borrow checker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountHandle(pub u32);

impl fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// (major, minor) of the backing superblock device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Device {
    pub major: u32,
    pub minor: u32,
}

impl Device {
    pub fn new(major: u32, minor: u32) -> Self {
        Device { major, minor }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Mount namespace identifier a record belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NsId(pub u32);

/// Absolute mountpoint path, stored with a leading marker byte so offset 0
/// is never part of the real path. Callers read the path from offset 1.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountPath(String);

impl MountPath {
    /// Builds a marked path from an absolute path string (e.g. "/" or "/a/b").
    pub fn new(path: impl AsRef<str>) -> Self {
        let mut s = String::with_capacity(path.as_ref().len() + 1);
        s.push(MOUNTPOINT_MARKER as char);
        s.push_str(path.as_ref());
        MountPath(s)
    }

    /// The path as it appears to callers, i.e. with the marker byte stripped.
    pub fn as_path(&self) -> &str {
        &self.0[1..]
    }

    /// Raw storage form including the marker byte, as written to the image.
    pub fn as_marked_str(&self) -> &str {
        &self.0
    }

    pub fn from_marked(marked: impl Into<String>) -> Self {
        MountPath(marked.into())
    }

    /// Count of path separators; used by the graph builder to order
    /// siblings deepest-first.
    pub fn depth(&self) -> usize {
        self.as_path().matches('/').count()
    }

    pub fn basename(&self) -> &str {
        self.as_path().rsplit('/').next().unwrap_or("")
    }

    /// True if `self` is exactly `other`, or a path strictly below it
    /// (`other` is a strict prefix of `self`, breaking on a '/' boundary).
    pub fn is_under(&self, other: &MountPath) -> bool {
        let (a, b) = (self.as_path(), other.as_path());
        if a.len() < b.len() {
            return false;
        }
        if !a.starts_with(b) {
            return false;
        }
        a.len() == b.len() || b == "/" || a.as_bytes()[b.len()] == b'/'
    }

    /// True if `other` is a strict path prefix of `self` (an overmount
    /// relationship when both are siblings under the same parent).
    pub fn is_strict_prefix_of(&self, other: &MountPath) -> bool {
        other.is_under(self) && self.as_path() != other.as_path()
    }
}

impl fmt::Debug for MountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path())
    }
}

impl fmt::Display for MountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path())
    }
}

/// One mount point as observed in a namespace, plus the graph links the
/// builder/collector populate. Most fields become immutable after
/// validation; only `bind_source` and `mounted` are written during restore.
#[derive(Debug, Clone)]
pub struct MountRecord {
    pub mnt_id: i32,
    pub parent_mnt_id: i32,
    pub s_dev: Device,
    pub fstype: FsTypeId,
    /// Path within the source filesystem exposed at this mount ("/" unless
    /// this is a bind mount of a subpath).
    pub root: String,
    pub mountpoint: MountPath,
    pub source: String,
    /// Comma-joined option list, leading/trailing commas trimmed.
    pub options: String,
    pub flags: MsFlags,
    pub shared_id: u32,
    pub master_id: u32,
    pub nsid: NsId,

    // Graph links, populated by `graph::build_tree` and `collect::collect_relations`.
    pub parent: Option<MountHandle>,
    pub children: Vec<MountHandle>,
    pub peers: Vec<MountHandle>,
    pub slaves: Vec<MountHandle>,
    pub binds: Vec<MountHandle>,
    pub bind_source: Option<MountHandle>,
    pub master_peer: Option<MountHandle>,

    pub is_ns_root: bool,
    pub external: bool,
    pub need_plugin: bool,
    pub dumped: bool,
    pub mounted: bool,
}

impl MountRecord {
    /// A mount is fsroot-mounted if it exposes the "/" of its source
    /// filesystem rather than some bind-mounted subpath.
    pub fn is_fsroot(&self) -> bool {
        self.root == "/"
    }

    /// Strict bind-equivalence (invariant 5): same backing device,
    /// filesystem, source string and option string. Ignores `root` and the
    /// mountpoint, so it is the relation used to discover bind *sources*,
    /// peer candidates and propagation partners.
    pub fn bind_equivalent(&self, other: &MountRecord) -> bool {
        self.s_dev == other.s_dev
            && self.fstype == other.fstype
            && self.source == other.source
            && self.options == other.options
    }

    /// Loose structural equivalence used to compare children across shared
    /// peers: bind-equivalent, and also agreeing on `root` and on the
    /// mountpoint's basename (ignores the parent-relative prefix, since
    /// peers live at different absolute paths).
    pub fn structurally_equal(&self, other: &MountRecord) -> bool {
        self.bind_equivalent(other)
            && self.root == other.root
            && self.mountpoint.basename() == other.mountpoint.basename()
    }
}
