// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors the core can raise while building, validating, dumping or
/// restoring a mount tree. Variants mirror the error kinds the engine
/// recognizes; the core never retries one of its own initiative. The only
/// built-in retry is the ordered traversal's postpone/retry loop, which is
/// control flow rather than error recovery.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("malformed mount record: {0}")]
    Parse(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("filesystem unsupported for {mountpoint}: {detail}")]
    Capability { mountpoint: String, detail: String },

    #[error("shared mounts have different children: {0}")]
    Consistency(String),

    #[error("ordered traversal made no progress; stuck mounts: {stuck:?}")]
    Progress { stuck: Vec<String> },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("plugin declined mount {mnt_id}: {reason}")]
    PluginDeclined { mnt_id: i32, reason: String },
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        CoreError::Io(format!("{}", error))
    }
}

impl From<nix::Error> for CoreError {
    fn from(error: nix::Error) -> Self {
        CoreError::Io(format!("{} ({})", error.desc(), error))
    }
}
