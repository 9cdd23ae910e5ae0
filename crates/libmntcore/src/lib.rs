// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! Mount-namespace checkpoint and restore engine.
//!
//! Builds a graph out of a namespace's raw mount table, validates the
//! invariants a restore will need, and drives an ordered traversal that
//! reconstructs the tree -- respecting shared/slave propagation and bind
//! relationships -- in another namespace. Carrying filesystem content
//! (tmpfs, namely) across that reconstruction is in scope; parsing the
//! raw mount table, the outer CLI, image file framing beyond the record
//! format itself, and the process-tree checkpoint driver that actually
//! forks and pivots processes are not: those are external collaborators
//! this crate exposes traits and data types for, not things it does
//! itself.

pub use collect::collect_relations;
pub use dump::{dump_namespace, ContentBlob, DumpOutput};
pub use error::CoreError;
pub use external::{ExternalMount, ExternalMounts};
pub use fstype::FsTypeId;
pub use graph::build_tree;
pub use image::{dump_store, load_into_store, reader_from, ImageReader, ImageRecord, ImageWriter};
pub use mountpoint::{open_mountpoint, NamespaceSwitch, SameNamespace};
pub use namespace::{enter_namespace_fd, enter_namespace_file, pivot_into, CreationCell, NamespaceRecord, RootsYard};
pub use plugin::{MountPlugin, NoPlugin, PluginOutcome};
pub use rawsource::{FixedMountSource, RawMountRecord, RawMountSource};
pub use record::{Device, MountHandle, MountPath, MountRecord, NsId};
pub use restore::restore_namespace;
pub use store::MountStore;
pub use traverse::{traverse_reverse, traverse_with_retries, Visit};
pub use validate::{validate_mounts, Mode};

mod collect;
mod consts;
mod dump;
mod error;
mod external;
mod fstype;
mod graph;
mod image;
mod mountexec;
mod mountpoint;
mod namespace;
mod plugin;
mod propagation;
mod rawsource;
mod record;
mod restore;
mod store;
mod traverse;
mod validate;

pub mod prelude {
    //! Re-exports the handful of types most callers need together.
    pub use crate::{
        CoreError, Device, FsTypeId, MountHandle, MountPath, MountRecord, MountStore, NsId,
    };
}
