//! Blobfs image tool
//!
//! Offline operations on blobfs images: format, check, inject and list.

use anyhow::{bail, Context, Result};
use blobfs::core::blobstore::Volume;
use blobfs::core::io::BlockDevice;
use blobfs::{BlobfsConfig, Checker};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "blobfs")]
#[command(about = "Create, check and populate blobfs images")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format a new image
    #[command(alias = "create")]
    Mkfs {
        /// Image path (created or truncated)
        image: PathBuf,

        /// Size of the image in blocks
        #[arg(short, long)]
        blocks: u64,

        /// Inode table capacity [default: from config, else 32768]
        #[arg(short, long)]
        inodes: Option<u64>,
    },

    /// Verify bitmap, inode table and counters
    #[command(alias = "fsck")]
    Check {
        image: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a host file as a blob
    Inject { image: PathBuf, file: PathBuf },

    /// List committed blobs
    Ls {
        image: PathBuf,

        /// Print the inodes as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BlobfsConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BlobfsConfig::default(),
    };

    match args.command {
        Command::Mkfs {
            image,
            blocks,
            inodes,
        } => {
            let mut options = config.format;
            if let Some(inodes) = inodes {
                options.inode_count = inodes;
            }

            let sb = blobfs::format(&image, blocks, &options)
                .with_context(|| format!("formatting {}", image.display()))?;
            info!(
                "Formatted {:?}: {} blocks, {} inodes, data starts at block {}",
                image,
                sb.block_count,
                sb.inode_count,
                sb.data_start()
            );
        }

        Command::Check { image, json } => {
            let checker =
                Checker::open(&image).with_context(|| format!("opening {}", image.display()))?;
            let report = checker.check();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}: {} blobs, {} of {} blocks in use ({} header)",
                    image.display(),
                    report.committed_inodes,
                    report.set_blocks,
                    report.block_count,
                    report.header_blocks
                );
                for error in &report.errors {
                    println!("error: {}", error);
                }
            }

            if !report.is_clean() {
                bail!("{} failed {} check(s)", image.display(), report.errors.len());
            }
        }

        Command::Inject { image, file } => {
            let inode = blobfs::inject(&image, &file).with_context(|| {
                format!("injecting {} into {}", file.display(), image.display())
            })?;
            println!("{}", inode.digest);
        }

        Command::Ls { image, json } => {
            let device = BlockDevice::open_read_only(&image)
                .with_context(|| format!("opening {}", image.display()))?;
            let volume = Volume::load(device)?;

            if json {
                let inodes: Vec<_> = volume.node_map().committed().map(|(_, inode)| inode).collect();
                println!("{}", serde_json::to_string_pretty(&inodes)?);
            } else {
                for (_, inode) in volume.node_map().committed() {
                    println!("{}  {}", inode.digest, inode.blob_size);
                }
            }
        }
    }

    Ok(())
}
