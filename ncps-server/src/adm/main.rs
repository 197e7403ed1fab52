use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use ncps_core::chunking::chunk_stream;
use ncps_server::config;
use ncps_server::eviction;
use ncps_server::fsck::{self, FsckOptions};
use ncps_server::migration;
use ncps_server::{ServerError, StateInner};

/// ncps server administration utilities.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
pub struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check (and optionally repair) consistency between the database and
    /// the chunk/blob stores.
    Fsck {
        /// Apply repairs without asking for confirmation.
        #[clap(long)]
        repair: bool,

        /// Report issues only; never touch the database or storage.
        #[clap(long, conflicts_with = "repair")]
        dry_run: bool,

        /// Skip narfiles verified more recently than this many hours ago.
        #[clap(long)]
        verified_within_hours: Option<i64>,
    },

    /// Legacy filesystem/database migration helpers.
    #[clap(subcommand)]
    Migrate(MigrateCommand),

    /// Run one eviction pass immediately and exit.
    EvictOnce,

    /// Chunk a local file the way the server would and print the
    /// resulting size distribution, without touching the database.
    TestChunking {
        /// Path to the file to chunk.
        path: PathBuf,

        #[clap(long, default_value_t = 16 * 1024)]
        min_size: usize,
        #[clap(long, default_value_t = 64 * 1024)]
        avg_size: usize,
        #[clap(long, default_value_t = 256 * 1024)]
        max_size: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Import legacy narinfo files sitting in the blob store into the
    /// database.
    Narinfo {
        #[clap(long)]
        concurrency: Option<usize>,
    },
    /// Split whole narfiles that predate content-defined chunking into
    /// chunks.
    Chunks {
        #[clap(long)]
        concurrency: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    // `test-chunking` doesn't need a database or storage backend, so it
    // runs without loading a config at all.
    if let Command::TestChunking {
        path,
        min_size,
        avg_size,
        max_size,
    } = &opts.command
    {
        return run_test_chunking(path, *min_size, *avg_size, *max_size).await;
    }

    let config = config::load_config(opts.config.as_deref())?
        .context("no configuration found; pass --config or set NCPS_CONFIG_BASE64")?;
    config::validate(&config)?;
    let state = StateInner::new(config).await?;

    match opts.command {
        Command::Fsck {
            repair,
            dry_run,
            verified_within_hours,
        } => {
            let verified_since = verified_within_hours
                .map(|hours| chrono::Utc::now() - chrono::Duration::hours(hours));
            let options = FsckOptions {
                mode_repair: repair,
                mode_dry_run: dry_run,
                verified_since,
            };
            let summary = fsck::run_fsck(&state, options).await;
            match summary {
                Ok(summary) => {
                    eprintln!("{}", summary.render());
                }
                Err(ServerError::IssuesFound) => {
                    eprintln!("issues remain; rerun with --repair to fix them");
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Migrate(MigrateCommand::Narinfo { concurrency }) => {
            let migrated = migration::migrate_narinfo_to_database(&state, concurrency).await?;
            eprintln!("migrated {migrated} narinfo records");
        }
        Command::Migrate(MigrateCommand::Chunks { concurrency }) => {
            let migrated = migration::migrate_narfiles_to_chunks(&state, concurrency).await?;
            eprintln!("chunked {migrated} narfiles");
        }
        Command::EvictOnce => {
            eviction::run_eviction_once(&state).await?;
        }
        Command::TestChunking { .. } => unreachable!("handled above"),
    }

    Ok(())
}

async fn run_test_chunking(
    path: &PathBuf,
    min_size: usize,
    avg_size: usize,
    max_size: usize,
) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let mut chunks = chunk_stream(file, min_size, avg_size, max_size);

    let mut count = 0u64;
    let mut total_bytes = 0u64;
    let mut smallest = u32::MAX;
    let mut largest = 0u32;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.context("chunking file")?;
        count += 1;
        total_bytes += chunk.size as u64;
        smallest = smallest.min(chunk.size);
        largest = largest.max(chunk.size);
    }

    if count == 0 {
        println!("0 chunks (empty file)");
        return Ok(());
    }

    println!("chunks: {count}");
    println!("total bytes: {total_bytes}");
    println!("smallest chunk: {smallest} bytes");
    println!("largest chunk: {largest} bytes");
    println!("average chunk: {} bytes", total_bytes / count);

    Ok(())
}
