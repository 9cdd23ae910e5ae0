// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

/// Leading byte every [`crate::record::MountPath`] is stored with, so that
/// offset 0 is never mistaken for part of the real path. Mirrors the
/// "dot-prefixed" mountpoint strings kernels hand back in mountinfo-derived
/// tooling: the marker buys an always-non-empty, always-absolute-looking
/// string even for the namespace root ("/").
pub const MOUNTPOINT_MARKER: u8 = b'.';

/// Prefix for the scratch "roots yard" directory created under the
/// restore target root.
pub const ROOTS_YARD_PREFIX: &str = ".mntcore-roots";
