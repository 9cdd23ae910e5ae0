// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

//! A small parser for `/proc/<pid>/mountinfo`'s line format. Reading the
//! kernel's raw mount table is explicitly this harness's job rather than
//! libmntcore's: the engine only ever sees [`RawMountRecord`]s, so this
//! parser is the one piece that has to track the kernel's text format.
//!
//! Line shape (see proc(5)):
//! `ID PARENT MAJOR:MINOR ROOT MOUNTPOINT OPTIONS OPT-FIELDS - FSTYPE SOURCE SUPER-OPTIONS`

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use libmntcore::{Device, NsId, RawMountRecord};
use nix::mount::MsFlags;

pub fn read_for_pid(pid: i32, nsid: NsId) -> Result<Vec<RawMountRecord>> {
    let path = mountinfo_path(pid);
    let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    parse(&text, nsid)
}

pub fn parse(text: &str, nsid: NsId) -> Result<Vec<RawMountRecord>> {
    text.lines().filter(|l| !l.trim().is_empty()).map(|line| parse_line(line, nsid)).collect()
}

fn parse_line(line: &str, nsid: NsId) -> Result<RawMountRecord> {
    let (left, right) = line
        .split_once(" - ")
        .ok_or_else(|| anyhow!("mountinfo line missing '-' separator: {line:?}"))?;

    let mut left_fields = left.split(' ');
    let mnt_id: i32 = next_field(&mut left_fields, "mnt_id")?.parse()?;
    let parent_mnt_id: i32 = next_field(&mut left_fields, "parent_mnt_id")?.parse()?;
    let dev = next_field(&mut left_fields, "dev")?;
    let (major, minor) = dev
        .split_once(':')
        .ok_or_else(|| anyhow!("malformed major:minor {dev:?}"))?;
    let s_dev = Device::new(major.parse()?, minor.parse()?);
    let root = next_field(&mut left_fields, "root")?.to_owned();
    let mountpoint = unescape(next_field(&mut left_fields, "mountpoint")?);
    let mount_options = next_field(&mut left_fields, "mount_options")?;

    let mut shared_id = 0u32;
    let mut master_id = 0u32;
    for opt in left_fields {
        if let Some(v) = opt.strip_prefix("shared:") {
            shared_id = v.parse()?;
        } else if let Some(v) = opt.strip_prefix("master:") {
            master_id = v.parse()?;
        }
    }

    let mut right_fields = right.trim().split(' ');
    let fstype_name = next_field(&mut right_fields, "fstype")?.to_owned();
    let source = unescape(next_field(&mut right_fields, "source")?);
    let super_options = next_field(&mut right_fields, "super_options")?;

    let flags = parse_flags(mount_options) | parse_flags(super_options);
    let options = join_non_flag_options(mount_options, super_options);

    Ok(RawMountRecord {
        mnt_id,
        parent_mnt_id,
        s_dev,
        fstype_name,
        root,
        mountpoint,
        source,
        options,
        flags,
        shared_id,
        master_id,
        nsid,
        is_ns_root: false,
    })
}

fn next_field<'a>(fields: &mut impl Iterator<Item = &'a str>, name: &str) -> Result<&'a str> {
    fields.next().ok_or_else(|| anyhow!("mountinfo line missing field {name}"))
}

/// `/proc` escapes space, tab, newline and backslash as `\ooo` octal.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or(""), 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn parse_flags(options: &str) -> MsFlags {
    let mut flags = MsFlags::empty();
    for opt in options.split(',') {
        match opt {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            _ => {}
        }
    }
    flags
}

fn join_non_flag_options(mount_options: &str, super_options: &str) -> String {
    const KNOWN_FLAGS: &[&str] = &[
        "ro", "rw", "nosuid", "nodev", "noexec", "noatime", "nodiratime", "relatime", "sync", "async",
    ];
    mount_options
        .split(',')
        .chain(super_options.split(','))
        .filter(|o| !o.is_empty() && !KNOWN_FLAGS.contains(o))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn resolve_pid(arg: Option<i32>) -> i32 {
    arg.unwrap_or_else(|| std::process::id() as i32)
}

pub fn mountinfo_path(pid: i32) -> std::path::PathBuf {
    Path::new("/proc").join(pid.to_string()).join("mountinfo")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_line() {
        let line = "20 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro";
        let record = parse_line(line, NsId(0)).unwrap();
        assert_eq!(record.mnt_id, 20);
        assert_eq!(record.parent_mnt_id, 1);
        assert_eq!(record.s_dev, Device::new(8, 1));
        assert_eq!(record.root, "/");
        assert_eq!(record.mountpoint, "/");
        assert_eq!(record.fstype_name, "ext4");
        assert_eq!(record.source, "/dev/sda1");
        assert_eq!(record.shared_id, 1);
        assert!(record.flags.contains(MsFlags::MS_RDONLY) == false);
    }

    #[test]
    fn unescapes_space_in_mountpoint() {
        assert_eq!(unescape(r"/mnt/my\040dir"), "/mnt/my dir");
    }
}
