// Copyright 2023 Arjen Verstoep
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use libmntcore::{
    dump_namespace, reader_from, restore_namespace, ContentBlob, Device, ExternalMounts, ImageWriter, NoPlugin, NsId,
};

mod mountinfo;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the mount tree of a running process's namespace to an image.
    Dump {
        /// pid whose mount namespace to read; defaults to this process
        #[arg(long)]
        pid: Option<i32>,
        /// directory the mount table was read relative to (the namespace's root)
        #[arg(long, default_value = "/")]
        ns_root: PathBuf,
        /// path to write the newline-delimited JSON image to
        #[arg(long)]
        image_out: PathBuf,
        /// path to write the content archive to
        #[arg(long)]
        content_out: PathBuf,
        /// external mapping, as `mountpoint:opaque-name`; repeatable
        #[arg(long = "external", value_parser = parse_external)]
        external: Vec<(String, String)>,
    },
    /// Restore a previously dumped mount tree under a target root.
    Restore {
        /// path to a previously written image
        #[arg(long)]
        image_in: PathBuf,
        /// path to the matching content archive
        #[arg(long)]
        content_in: PathBuf,
        /// root under which to recreate the mount tree
        #[arg(long)]
        ns_root: PathBuf,
        /// external mapping, as `opaque-name:host-path`; repeatable
        #[arg(long = "external", value_parser = parse_external)]
        external: Vec<(String, String)>,
    },
}

fn parse_external(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw.split_once(':').ok_or_else(|| format!("expected key:value, got {raw:?}"))?;
    Ok((key.to_owned(), value.to_owned()))
}

fn external_mounts(pairs: Vec<(String, String)>) -> ExternalMounts {
    let mut external = ExternalMounts::new();
    for (key, value) in pairs {
        external.add(key, value);
    }
    external
}

fn main() -> Result<()> {
    env_logger::init();

    match Args::parse().command {
        Command::Dump { pid, ns_root, image_out, content_out, external } => {
            run_dump(pid, &ns_root, &image_out, &content_out, external)
        }
        Command::Restore { image_in, content_in, ns_root, external } => {
            run_restore(&image_in, &content_in, &ns_root, external)
        }
    }
}

fn run_dump(
    pid: Option<i32>,
    ns_root: &PathBuf,
    image_out: &PathBuf,
    content_out: &PathBuf,
    external: Vec<(String, String)>,
) -> Result<()> {
    let pid = mountinfo::resolve_pid(pid);
    info!("reading mount table for pid {pid}");
    let raw = mountinfo::read_for_pid(pid, NsId(0))?;

    let output = dump_namespace(&libmntcore::FixedMountSource(raw), ns_root, &NoPlugin, external_mounts(external))
        .context("dumping mount tree")?;

    info!("writing {} mount records to {}", output.image.len(), image_out.display());
    let mut writer = ImageWriter::new(BufWriter::new(
        File::create(image_out).with_context(|| format!("creating {}", image_out.display()))?,
    ));
    for record in &output.image {
        writer.write_record(record)?;
    }

    write_content(&output.content, content_out)?;

    Ok(())
}

fn run_restore(
    image_in: &PathBuf,
    content_in: &PathBuf,
    ns_root: &PathBuf,
    external: Vec<(String, String)>,
) -> Result<()> {
    let image_file = File::open(image_in).with_context(|| format!("opening {}", image_in.display()))?;
    let records: Vec<_> = reader_from(image_file).collect::<Result<_, _>>().context("reading image")?;

    let content = read_content(content_in)?;

    info!("restoring mount tree under {}", ns_root.display());
    restore_namespace(records, content, ns_root, &NoPlugin, external_mounts(external)).context("restoring mount tree")?;

    Ok(())
}

/// Content archive on disk: a sequence of `major minor mnt_id len\n<bytes>`
/// framed blobs, read back by [`read_content`]. Kept deliberately simple;
/// a production image format would want a real container format instead
/// of this ad hoc framing.
fn write_content(blobs: &[ContentBlob], path: &PathBuf) -> Result<()> {
    use std::io::Write;
    let mut out = BufWriter::new(File::create(path).with_context(|| format!("creating {}", path.display()))?);
    for blob in blobs {
        writeln!(out, "{} {} {} {}", blob.device.major, blob.device.minor, blob.mnt_id, blob.bytes.len())?;
        out.write_all(&blob.bytes)?;
    }
    Ok(())
}

fn read_content(path: &PathBuf) -> Result<Vec<ContentBlob>> {
    use std::io::{BufRead, Read};
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let mut blobs = Vec::new();

    loop {
        let mut header = String::new();
        let read = reader.read_line(&mut header)?;
        if read == 0 {
            break;
        }
        let mut fields = header.trim().split(' ');
        let major: u32 = fields.next().context("missing major")?.parse()?;
        let minor: u32 = fields.next().context("missing minor")?.parse()?;
        let mnt_id: i32 = fields.next().context("missing mnt_id")?.parse()?;
        let len: usize = fields.next().context("missing len")?.parse()?;

        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        blobs.push(ContentBlob { device: Device::new(major, minor), mnt_id, bytes });
    }

    Ok(blobs)
}
