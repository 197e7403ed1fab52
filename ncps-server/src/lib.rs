#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod eviction;
pub mod fsck;
mod middleware;
pub mod migration;
pub mod narinfo;
pub mod nix_manifest;
pub mod storage;
pub mod upstream;

pub mod analytics;
pub mod lock;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{http::Uri, Extension, Router};
use sea_orm::Database as SeaDatabase;
use tower_http::catch_panic::CatchPanicLayer;

use analytics::Analytics;
use config::{Config, LockBackendKind};
use database::migration::{Migrator, MigratorTrait};
use database::Database;
use lock::{InProcessBackend, LockService, RetryPolicy, RowLockBackend};
use ncps_core::signing::NixKeypair;
use storage::{ChunkStore, LocalBlobStore, LocalChunkStore, S3BlobStore, S3ChunkStore, StorageConfig};

pub use error::{ServerError, ServerResult};
pub use storage::BlobStore;

pub type State = Arc<StateInner>;

/// Global server state, shared by the HTTP handlers, the eviction
/// scheduler, fsck, and the migration pipelines.
#[derive(Debug)]
pub struct StateInner {
    pub config: Config,
    pub database: Database,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub lock_service: LockService,
    pub upstream: upstream::UpstreamClient,
    pub analytics: Analytics,
    pub keypair: NixKeypair,
}

impl StateInner {
    /// Builds the global state: connects to the database, constructs the
    /// storage backends, loads (or generates, on first run) the signing
    /// key, and wires up the lock service, falling back to the in-process
    /// backend only if `lock.allow-degraded-mode` says that's acceptable.
    pub async fn new(config: Config) -> Result<State> {
        let conn = SeaDatabase::connect(&config.database.url)
            .await
            .context("connecting to the metadata database")?;
        let database = Database::new(conn);

        let chunk_store: Arc<dyn ChunkStore> = match &config.storage {
            StorageConfig::Local(local) => Arc::new(LocalChunkStore::new(local.clone()).await?),
            StorageConfig::S3(s3) => Arc::new(S3ChunkStore::new(s3.clone()).await?),
        };
        let blob_store: Arc<dyn BlobStore> = match &config.storage {
            StorageConfig::Local(local) => Arc::new(LocalBlobStore::new(local.clone()).await?),
            StorageConfig::S3(s3) => Arc::new(S3BlobStore::new(s3.clone()).await?),
        };

        let retry = RetryPolicy {
            initial_delay: config.lock.retry_initial_delay,
            max_delay: config.lock.retry_max_delay,
            max_attempts: config.lock.retry_max_attempts,
        };
        let lock_service = match &config.lock.backend {
            LockBackendKind::InProcess => LockService::new(Arc::new(InProcessBackend::new()), retry),
            LockBackendKind::Database => {
                LockService::new(Arc::new(RowLockBackend::new(database.clone())), retry)
            }
            LockBackendKind::Redis { url } => match build_redis_pool(url) {
                Ok(backend) => LockService::new(Arc::new(backend), retry),
                Err(e) if config.lock.allow_degraded_mode => {
                    tracing::error!(error = %e, "could not reach the Redis lock backend");
                    LockService::degraded(retry)
                }
                Err(e) => return Err(e),
            },
        };

        let upstream = upstream::UpstreamClient::new(
            config.upstream.caches.clone(),
            config.upstream.netrc_path.as_deref(),
        )?;

        let analytics = Analytics::install();
        let keypair = load_or_generate_keypair(&config.signing.key_path).await?;

        Ok(Arc::new(Self {
            config,
            database,
            chunk_store,
            blob_store,
            lock_service,
            upstream,
            analytics,
            keypair,
        }))
    }
}

/// Builds a Redis connection pool and wraps it as a lock backend.
fn build_redis_pool(url: &str) -> Result<lock::RedisBackend> {
    let cfg = deadpool_redis::Config::from_url(url);
    let pool = cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("creating the Redis connection pool")?;
    Ok(lock::RedisBackend::new(pool))
}

/// Loads the local signing key, generating and persisting a fresh one on
/// first run. The key's name is derived from the listen address so a
/// default config produces a working, if not very meaningful, key name;
/// operators are expected to set `api-endpoint` for anything public.
async fn load_or_generate_keypair(path: &Path) -> Result<NixKeypair> {
    if let Ok(existing) = tokio::fs::read_to_string(path).await {
        return NixKeypair::from_str(existing.trim())
            .map_err(|e| anyhow::anyhow!("loading signing key from {path:?}: {e}"));
    }

    tracing::info!(path = %path.display(), "generating a new signing key");
    let keypair = NixKeypair::generate("ncps-1")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(path, keypair.export_keypair()).await.ok();

    Ok(keypair)
}

/// The fallback route for anything that doesn't match a registered handler.
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the HTTP API server until the process is asked to shut down.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    let state = StateInner::new(config).await?;

    let listen = cli_listen.unwrap_or(state.config.listen);

    let app = Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        .layer(axum::middleware::from_fn(middleware::restrict_host))
        .layer(Extension(state.clone()))
        .layer(CatchPanicLayer::new());

    tracing::info!(%listen, "starting ncpsd API server");

    let heartbeat = async {
        if state.config.database.heartbeat {
            run_db_heartbeat(&state).await;
        }
    };

    let (server_ret, _) = tokio::join!(
        axum::Server::bind(&listen).serve(app.into_make_service()),
        heartbeat,
    );
    server_ret?;

    Ok(())
}

/// Sends a periodic no-op query to keep pooled connections alive behind
/// load balancers that close idle connections.
async fn run_db_heartbeat(state: &State) {
    use sea_orm::{ConnectionTrait, Statement};

    let conn = state.database.connection();
    let stmt = Statement::from_string(conn.get_database_backend(), "SELECT 1".to_string());

    loop {
        if let Err(error) = conn.execute(stmt.clone()).await {
            tracing::warn!(%error, "database heartbeat failed");
        }
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    }
}

/// Runs pending database migrations, then returns.
pub async fn run_migrations(config: Config) -> Result<()> {
    let state = StateInner::new(config).await?;
    Migrator::up(state.database.connection(), None).await?;
    Ok(())
}
