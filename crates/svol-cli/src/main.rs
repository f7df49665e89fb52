#![forbid(unsafe_code)]
//! slicevol image tool.
//!
//! Operates on volume images (regular files or block devices): `format`
//! writes fresh metadata, `inspect` decodes the winning copy, and `check`
//! reports the health of both copies.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use svol::{
    ByteDevice, DeviceBackend, FileByteDevice, HEADER_BLOCK, Header, Metadata, VolumeManager,
    metadata_size, pick_winner, verify_hash,
};

#[derive(Parser)]
#[command(name = "svol", about = "slicevol — slice-granular volume manager toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write fresh volume metadata to an image, erasing its contents.
    Format {
        /// Path to the image file.
        image: PathBuf,
        /// Slice size in bytes; must be a multiple of the block size.
        #[arg(long, default_value_t = 1 << 20)]
        slice_size: u64,
        /// Device block size in bytes.
        #[arg(long, default_value_t = 512)]
        block_size: u32,
    },
    /// Decode and print the winning metadata copy.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Device block size in bytes.
        #[arg(long, default_value_t = 512)]
        block_size: u32,
    },
    /// Validate both metadata copies and report the winner.
    Check {
        /// Path to the image file.
        image: PathBuf,
        /// Device block size in bytes.
        #[arg(long, default_value_t = 512)]
        block_size: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Format {
            image,
            slice_size,
            block_size,
        } => format_image(&image, slice_size, block_size),
        Command::Inspect { image, block_size } => inspect_image(&image, block_size),
        Command::Check { image, block_size } => check_image(&image, block_size),
    }
}

fn format_image(image: &PathBuf, slice_size: u64, block_size: u32) -> Result<()> {
    let device = FileByteDevice::open(image)
        .with_context(|| format!("opening {}", image.display()))?;
    let backend = DeviceBackend::new(device, block_size).context("binding image")?;
    VolumeManager::format(&backend, slice_size).context("formatting image")?;
    println!(
        "formatted {} with {} byte slices",
        image.display(),
        slice_size
    );
    Ok(())
}

/// Read both metadata copies off an image.
fn read_copies(image: &PathBuf, block_size: u32) -> Result<(Vec<u8>, Vec<u8>, u64)> {
    let device = FileByteDevice::open(image)
        .with_context(|| format!("opening {}", image.display()))?;
    let disk_size = device.len_bytes();

    let mut first_block = vec![0_u8; usize::try_from(HEADER_BLOCK).unwrap_or(8192)];
    device
        .read_exact_at(svol::ByteOffset(0), &mut first_block)
        .context("reading superblock")?;
    let header = Header::parse(&first_block).context("decoding superblock")?;
    if header.slice_size == 0 || header.slice_size % u64::from(block_size) != 0 {
        bail!("superblock declares an unusable slice size");
    }

    let meta = metadata_size(disk_size, header.slice_size);
    let len = usize::try_from(meta).context("metadata region too large")?;
    let mut primary = vec![0_u8; len];
    let mut backup = vec![0_u8; len];
    device
        .read_exact_at(svol::ByteOffset(0), &mut primary)
        .context("reading primary metadata")?;
    device
        .read_exact_at(svol::ByteOffset(meta), &mut backup)
        .context("reading backup metadata")?;
    Ok((primary, backup, disk_size))
}

fn inspect_image(image: &PathBuf, block_size: u32) -> Result<()> {
    let (primary, backup, disk_size) = read_copies(image, block_size)?;
    let validated =
        pick_winner(&primary, &backup, disk_size, block_size).context("validating metadata")?;
    let metadata = &validated.metadata;
    let header = &metadata.header;

    println!("image:            {}", image.display());
    println!(
        "winning copy:     {}",
        if validated.first_is_primary {
            "first"
        } else {
            "second"
        }
    );
    println!("version:          {}", header.version);
    println!("generation:       {}", header.generation);
    println!("disk size:        {} bytes", header.disk_size);
    println!("slice size:       {} bytes", header.slice_size);
    println!("physical slices:  {}", header.pslice_count);

    let allocated = metadata
        .slices
        .iter()
        .filter(|entry| !entry.is_free())
        .count();
    println!("allocated slices: {allocated}");

    println!("partitions:");
    let mut live = 0;
    for (index, entry) in metadata.partitions.iter().enumerate() {
        if entry.is_free() {
            continue;
        }
        live += 1;
        println!(
            "  [{index}] {:24} type={} guid={} slices={} {}",
            entry.name(),
            entry.type_guid,
            entry.guid,
            entry.slices,
            if entry.is_inactive() { "INACTIVE" } else { "active" }
        );
    }
    if live == 0 {
        println!("  (none)");
    }
    Ok(())
}

fn describe_copy(name: &str, region: &[u8]) {
    match Metadata::parse(region) {
        Ok(metadata) => {
            let hash = if verify_hash(region) { "ok" } else { "BAD" };
            println!(
                "{name}: generation={} hash={hash}",
                metadata.header.generation
            );
        }
        Err(err) => println!("{name}: unreadable ({err})"),
    }
}

fn check_image(image: &PathBuf, block_size: u32) -> Result<()> {
    let (primary, backup, disk_size) = read_copies(image, block_size)?;
    describe_copy("first copy ", &primary);
    describe_copy("second copy", &backup);

    match pick_winner(&primary, &backup, disk_size, block_size) {
        Ok(validated) => {
            println!(
                "winner: {} copy, generation {}",
                if validated.first_is_primary {
                    "first"
                } else {
                    "second"
                },
                validated.metadata.header.generation
            );
            Ok(())
        }
        Err(err) => bail!("no valid metadata copy: {err}"),
    }
}
