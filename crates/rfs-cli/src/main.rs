#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rfs::{FormatOptions, Mount, MountOptions, RecoverOutcome};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rfs", about = "RollFS — log-structured filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh filesystem image.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Segments in the main area.
        #[arg(long, default_value_t = 64)]
        segs: u32,
        /// Blocks per segment (power of two).
        #[arg(long, default_value_t = 512)]
        blocks_per_seg: u32,
    },
    /// Inspect an image's checkpoint state.
    Info {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Check whether fsynced data is waiting to be rolled forward.
    Check {
        /// Path to the filesystem image.
        image: PathBuf,
    },
    /// Roll fsynced data forward and write a recovery checkpoint.
    Recover {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output the recovery summary in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct ImageInfo {
    cp_ver: u64,
    blocks_per_seg: u32,
    main_segs: u32,
    total_blocks: u32,
    valid_blocks: u32,
    needs_recovery: bool,
    space_for_roll_forward: bool,
}

fn open(image: &PathBuf) -> Result<Mount> {
    Mount::open_path(image, MountOptions::default())
        .with_context(|| format!("mounting {}", image.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            image,
            segs,
            blocks_per_seg,
        } => {
            let opts = FormatOptions {
                blocks_per_seg,
                main_segs: segs,
                ..FormatOptions::default()
            };
            Mount::format_path(&image, &opts)
                .with_context(|| format!("formatting {}", image.display()))?;
            println!("formatted {} ({segs} segments)", image.display());
        }
        Command::Info { image, json } => {
            let mount = open(&image)?;
            let geo = mount.sbi.geometry();
            let info = ImageInfo {
                cp_ver: mount.sbi.cp_ver().0,
                blocks_per_seg: geo.sb.blocks_per_seg,
                main_segs: geo.sb.main_segs,
                total_blocks: geo.sb.total_blocks,
                valid_blocks: mount.sbi.valid_block_count(),
                needs_recovery: mount.needs_recovery(),
                space_for_roll_forward: mount.sbi.space_for_roll_forward(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("checkpoint version: {}", info.cp_ver);
                println!(
                    "geometry: {} segments x {} blocks ({} total)",
                    info.main_segs, info.blocks_per_seg, info.total_blocks
                );
                println!("valid blocks: {}", info.valid_blocks);
                println!("needs recovery: {}", info.needs_recovery);
                println!(
                    "space for roll-forward: {}",
                    info.space_for_roll_forward
                );
            }
            mount.close();
        }
        Command::Check { image } => {
            let mount = open(&image)?;
            let outcome = mount.recover_fsync_data(true).context("check-only recovery")?;
            match outcome {
                RecoverOutcome::NeedsRecovery => {
                    println!("fsynced data present: recovery needed");
                }
                RecoverOutcome::Clean(_) => println!("nothing to recover"),
            }
            mount.close();
        }
        Command::Recover { image, json } => {
            let mount = open(&image)?;
            let outcome = mount.recover_fsync_data(false).context("recovery")?;
            match outcome {
                RecoverOutcome::Clean(summary) => {
                    if json {
                        println!("{}", summary.to_json()?);
                    } else {
                        println!(
                            "recovered {} inode(s), {} data indices; checkpoint written: {}",
                            summary.fsynced_inodes,
                            summary.recovered_indices,
                            summary.checkpoint_written
                        );
                    }
                }
                RecoverOutcome::NeedsRecovery => bail!("unexpected check-only outcome"),
            }
            mount.close();
        }
    }
    Ok(())
}
