//! CLI for the CDM download manager.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cdm_core::config;
use cdm_core::store::Store;
use std::path::PathBuf;

use commands::{
    run_add, run_cancel, run_checksum, run_clear, run_pause, run_remove, run_resume,
    run_scheduler, run_status,
};

/// Top-level CLI for the CDM download manager.
#[derive(Debug, Parser)]
#[command(name = "cdm")]
#[command(about = "CDM: resumable segmented download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a new download.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Numeric id for the download (catalog id). Adding an existing id
        /// is a no-op and prints the stored row.
        #[arg(long)]
        id: i64,
        /// Human title; defaults to the last URL path segment.
        #[arg(long)]
        title: Option<String>,
        /// Destination file path. Defaults to the title inside --dir.
        #[arg(long, value_name = "FILE")]
        save_path: Option<PathBuf>,
        /// Directory for the default save path (default: current directory).
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Expected size in bytes if the catalog knows it (0 = probe).
        #[arg(long, default_value = "0")]
        size: u64,
        /// Queue priority; higher runs first.
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// Run the engine until the queue drains.
    Run {
        /// Print progress events to stdout while running.
        #[arg(long)]
        progress: bool,
    },

    /// Show status of all downloads.
    Status {
        /// Also print attempt history per download.
        #[arg(long)]
        attempts: bool,
    },

    /// Pause a download by id.
    Pause { id: i64 },

    /// Resume a paused download by id.
    Resume { id: i64 },

    /// Cancel a download by id.
    Cancel { id: i64 },

    /// Remove a download row by id (files on disk are left alone).
    Remove { id: i64 },

    /// Remove all completed/failed/cancelled downloads. Returns the count.
    Clear,

    /// Compute SHA-256 of a file (e.g. after download).
    Checksum {
        /// Path to the file.
        path: PathBuf,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let store = Store::open_default().await?;

        match cli.command {
            CliCommand::Add {
                url,
                id,
                title,
                save_path,
                dir,
                size,
                priority,
            } => run_add(&store, &cfg, &url, id, title, save_path, dir, size, priority).await?,
            CliCommand::Run { progress } => run_scheduler(store, cfg, progress).await?,
            CliCommand::Status { attempts } => run_status(&store, attempts).await?,
            CliCommand::Pause { id } => run_pause(&store, id).await?,
            CliCommand::Resume { id } => run_resume(&store, id).await?,
            CliCommand::Cancel { id } => run_cancel(&store, id).await?,
            CliCommand::Remove { id } => run_remove(&store, id).await?,
            CliCommand::Clear => run_clear(&store).await?,
            CliCommand::Checksum { path } => run_checksum(&path)?,
        }

        Ok(())
    }
}
