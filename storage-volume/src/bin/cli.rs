// SPDX-License-Identifier: GPL-3.0-only

//! Command-line front end over the volume registry for manual operations

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use storage_sys::ThinPool;
use storage_types::DriverType;
use storage_volume::{DriverContext, Registry, Volume, VolumeConfig, VolumeError};
use tracing_subscriber::{EnvFilter, fmt};

/// Snapshot, roll back and report on storage volumes
#[derive(Parser)]
#[command(name = "storage-volume-cli")]
#[command(about = "Manage volumes across btrfs, rsync, devicemapper and nfs roots", long_about = None)]
struct Cli {
    /// Driver root as `<driver-type>=<absolute path>`; repeatable
    #[arg(long = "root", value_name = "TYPE=PATH", global = true)]
    roots: Vec<String>,

    /// Argument passed to every driver at initialization, e.g. `dm.thinpooldev=pool`
    #[arg(long = "driver-arg", value_name = "ARG", global = true)]
    driver_args: Vec<String>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report usage of every driver root
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Snapshot a volume
    Snapshot {
        /// Absolute path of the volume
        volume: PathBuf,
        label: String,
        #[arg(long, short, default_value = "")]
        message: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List the snapshots of a volume, oldest first
    Snapshots {
        volume: PathBuf,
    },
    /// Replace a volume's contents with a snapshot
    Rollback {
        volume: PathBuf,
        label: String,
    },
    /// Write a snapshot stream to a file, or stdout
    Export {
        volume: PathBuf,
        label: String,
        /// Snapshot to send a delta against
        #[arg(long, default_value = "")]
        parent: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Read a snapshot stream from a file, or stdin
    Import {
        volume: PathBuf,
        label: String,
        #[arg(long, short)]
        input: Option<PathBuf>,
    },
    /// Blocks allocated by each thin device of a pool
    Usage {
        /// Pool name, bare or under /dev/mapper
        pool: String,
        metadata_device: String,
        #[arg(long)]
        json: bool,
    },
}

fn parse_root(entry: &str) -> Result<(DriverType, PathBuf)> {
    let Some((driver_type, path)) = entry.split_once('=') else {
        bail!("expected TYPE=PATH, got {entry:?}");
    };
    let driver_type: DriverType = driver_type.parse()?;
    Ok((driver_type, PathBuf::from(path)))
}

fn open_volume(registry: &Registry, path: &Path) -> Result<Box<dyn Volume>> {
    let (root, name) = registry.split_path(path)?;
    if name.is_empty() {
        return Err(VolumeError::PathIsDriver(root).into());
    }
    let driver = registry.get_driver(&root)?;
    if !driver.exists(&name) {
        return Err(VolumeError::VolumeNotExists(name).into());
    }
    Ok(driver.get(&name)?)
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storage_volume=info,storage_sys=info,warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VolumeConfig::load(path)?,
        None => VolumeConfig::default(),
    };
    let registry = Registry::with_default_backends(DriverContext::system(config));
    for entry in &cli.roots {
        let (driver_type, root) = parse_root(entry)?;
        registry
            .init_driver(driver_type, &root, &cli.driver_args)
            .with_context(|| format!("initializing {driver_type} driver at {}", root.display()))?;
    }

    match cli.command {
        Commands::Status { json } => {
            let statuses = registry.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print!("{statuses}");
            }
        }
        Commands::Snapshot {
            volume,
            label,
            message,
            tags,
        } => {
            open_volume(&registry, &volume)?.snapshot(&label, &message, &tags)?;
        }
        Commands::Snapshots { volume } => {
            for label in open_volume(&registry, &volume)?.snapshots()? {
                println!("{label}");
            }
        }
        Commands::Rollback { volume, label } => {
            open_volume(&registry, &volume)?.rollback(&label)?;
        }
        Commands::Export {
            volume,
            label,
            parent,
            output,
        } => {
            let volume = open_volume(&registry, &volume)?;
            let mut writer: Box<dyn Write> = match output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(&path).with_context(|| format!("creating {}", path.display()))?,
                )),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            volume.export(&label, &parent, &mut writer)?;
            writer.flush()?;
        }
        Commands::Import {
            volume,
            label,
            input,
        } => {
            let volume = open_volume(&registry, &volume)?;
            let mut reader: Box<dyn Read> = match input {
                Some(path) => Box::new(BufReader::new(
                    File::open(&path).with_context(|| format!("opening {}", path.display()))?,
                )),
                None => Box::new(io::stdin().lock()),
            };
            volume.import(&label, &mut reader)?;
        }
        Commands::Usage {
            pool,
            metadata_device,
            json,
        } => {
            let context = registry.context();
            let pool = ThinPool::new(&pool, metadata_device, "");
            let devices = context.usage.device_blocks(context.runner.as_ref(), &pool)?;
            let allocated: BTreeMap<u32, u64> = devices
                .iter()
                .map(|(id, device)| (*id, device.allocated()))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&allocated)?);
            } else {
                println!("{:>10} {:>16}", "DEVICE", "BLOCKS");
                for (id, blocks) in allocated {
                    println!("{id:>10} {:>16}", storage_types::grouped(blocks));
                }
            }
        }
    }

    Ok(())
}
