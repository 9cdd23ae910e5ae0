// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! tmpfs is the one general-purpose filesystem this engine carries real
//! content for: it has no backing device to remount, so the only way to
//! reproduce it is to create a fresh instance and replay its directory
//! tree from an archive taken at dump time.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::CoreError;
use crate::record::MountRecord;

/// `seclabel` is stamped on by the host's LSM and is meaningless (and
/// sometimes invalid) on the restore side, which may run under a different
/// security module configuration. Strip it at collect time the same way a
/// fresh instance would.
pub fn parse(record: &mut MountRecord) {
    record.options = record
        .options
        .split(',')
        .filter(|opt| *opt != "seclabel" && !opt.is_empty())
        .collect::<Vec<_>>()
        .join(",");
}

pub fn dump(dir: &Path, out: &mut dyn Write) -> Result<(), CoreError> {
    let encoder = zstd::stream::write::Encoder::new(out, 0)?;
    let mut encoder = encoder.auto_finish();
    let mut builder = tar::Builder::new(&mut encoder);
    builder.append_dir_all(".", dir)?;
    builder.finish()?;
    Ok(())
}

pub fn restore(dir: &Path, input: &mut dyn Read) -> Result<(), CoreError> {
    let decoder = zstd::stream::read::Decoder::new(input)?;
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_seclabel() {
        let mut m = crate::store::test_support::bare_record(1, Path::new("/t"));
        m.options = "rw,seclabel,size=65536k".into();
        parse(&mut m);
        assert_eq!(m.options, "rw,size=65536k");
    }

    #[test]
    fn roundtrip_via_tar_zstd() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), b"hi there").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/nested"), b"nested content").unwrap();

        let mut buf = Vec::new();
        dump(src.path(), &mut buf).unwrap();

        let dest = tempfile::tempdir().unwrap();
        restore(dest.path(), &mut buf.as_slice()).unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("hello.txt")).unwrap(),
            b"hi there"
        );
        assert_eq!(
            std::fs::read(dest.path().join("sub/nested")).unwrap(),
            b"nested content"
        );
    }
}
