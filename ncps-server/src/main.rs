use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::join;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use ncps_server::config::{self, Config};
use ncps_server::eviction;

/// Proxying Nix binary cache server.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Socket address to listen on. Overrides `listen` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, value_enum, default_value = "monolithic")]
    mode: ServerMode,

    /// Emit logs as JSON instead of human-readable text.
    #[clap(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run the API server and the scheduled evictor together.
    Monolithic,
    /// Run only the API server.
    ApiServer,
    /// Run pending database migrations then exit.
    DbMigrations,
    /// Run one eviction pass then exit.
    EvictionOnce,
    /// Validate the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.json_logs);

    let Some(config) = config::load_config(opts.config.as_deref())? else {
        eprintln!("No configuration found; pass --config or set NCPS_CONFIG_BASE64.");
        std::process::exit(1);
    };
    config::validate(&config)?;

    match opts.mode {
        ServerMode::Monolithic => run_monolithic(opts.listen, config).await?,
        ServerMode::ApiServer => ncps_server::run_api_server(opts.listen, config).await?,
        ServerMode::DbMigrations => ncps_server::run_migrations(config).await?,
        ServerMode::EvictionOnce => {
            let state = ncps_server::StateInner::new(config).await?;
            eviction::run_eviction_once(&state).await?;
        }
        ServerMode::CheckConfig => {
            eprintln!();
            eprintln!("+-------------------+");
            eprintln!("| Config looks good |");
            eprintln!("+-------------------+");
            eprintln!();
        }
    }

    Ok(())
}

/// Runs the API server and the scheduled evictor side by side, exiting
/// when either does (the evictor normally never returns on its own).
async fn run_monolithic(listen: Option<SocketAddr>, config: Config) -> Result<()> {
    let state = ncps_server::StateInner::new(config.clone()).await?;
    let _scheduler = eviction::spawn_scheduled_eviction(state.clone()).await?;

    let (api_result, _) = join!(
        ncps_server::run_api_server(listen, config),
        std::future::pending::<()>(),
    );

    api_result
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::from_default_env();

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer().json().with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}
