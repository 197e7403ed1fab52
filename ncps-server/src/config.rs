//! Server configuration.
//!
//! Every setting has a TOML key; most also have a matching `NCPS_*`
//! environment variable for container-friendly deployment, following the
//! `read_non_empty_var` pattern the teacher used for secret material. The
//! config file itself can be TOML (primary), YAML, or JSON, dispatched on
//! the file extension, or supplied whole as base64 in `NCPS_CONFIG_BASE64`
//! for platforms that don't offer a writable filesystem at deploy time.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::storage::StorageConfig;

/// Application prefix in XDG base directories (`$XDG_CONFIG_HOME/ncps`).
const XDG_PREFIX: &str = "ncps";

/// Environment variable carrying the whole config, base64-encoded TOML.
const ENV_CONFIG_BASE64: &str = "NCPS_CONFIG_BASE64";

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Allowed `Host` headers. Empty means all hosts are allowed.
    #[serde(rename = "allowed-hosts", default)]
    pub allowed_hosts: Vec<String>,

    /// The canonical API endpoint of this server, used to synthesize
    /// absolute URLs. If unset, it's derived from the client's `Host`
    /// header (convenient, but shouldn't be relied on in production).
    #[serde(rename = "api-endpoint", default)]
    pub api_endpoint: Option<String>,

    /// The Nix store directory this cache serves paths for.
    #[serde(rename = "store-dir", default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Priority advertised in `nix-cache-info`. Lower is preferred;
    /// cache.nixos.org uses 40.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Whether `PUT` on `.narinfo`/`nar` endpoints is accepted.
    #[serde(rename = "allow-put-verb", default)]
    pub allow_put_verb: bool,

    /// Whether `DELETE` on `.narinfo`/`nar` endpoints is accepted.
    #[serde(rename = "allow-delete-verb", default)]
    pub allow_delete_verb: bool,

    /// Whether to expose `GET /metrics` in Prometheus exposition format.
    #[serde(rename = "metrics-enabled", default = "default_true")]
    pub metrics_enabled: bool,

    /// Upstream binary cache(s) to proxy.
    pub upstream: UpstreamConfig,

    /// Database connection.
    pub database: DatabaseConfig,

    /// Storage backend for blobs and chunks.
    pub storage: StorageConfig,

    /// Content-defined chunking.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Narinfo re-signing.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Distributed lock service.
    #[serde(default)]
    pub lock: LockConfig,

    /// LRU eviction.
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// One or more upstream binary caches, tried in order.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URLs of upstream caches, e.g. `https://cache.nixos.org`.
    #[serde(default = "load_upstream_caches_from_env")]
    pub caches: Vec<String>,

    /// Path to a netrc file used for upstreams that require authentication.
    #[serde(default = "load_netrc_path_from_env")]
    pub netrc_path: Option<PathBuf>,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL, e.g. `sqlite://./ncps.db`, `postgres://...`, `mysql://...`.
    #[serde(default = "load_database_url_from_env")]
    pub url: String,

    /// Whether to send a periodic heartbeat query to keep pooled
    /// connections alive behind load balancers that close idle ones.
    #[serde(default)]
    pub heartbeat: bool,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

/// Content-defined chunking configuration.
///
/// Changing any of these values after deployment is disruptive: chunk cut
/// points shift, so previously-stored chunks stop deduplicating against
/// newly-ingested NARs until the whole corpus has been re-chunked.
/// `ncpsadm test-chunking <file>` reports the resulting chunk size
/// distribution for a sample file so these can be tuned before enabling
/// CDC in production.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    /// Whether CDC is enabled at all. If `false`, NARs are always stored
    /// whole in the blob store.
    #[serde(default)]
    pub enabled: bool,

    /// NARs smaller than this are stored whole even when CDC is enabled.
    #[serde(rename = "nar-size-threshold", default = "default_nar_size_threshold")]
    pub nar_size_threshold: usize,

    /// Preferred minimum chunk size, in bytes.
    #[serde(rename = "min-size", default = "default_min_size")]
    pub min_size: usize,

    /// Preferred average (target) chunk size, in bytes.
    #[serde(rename = "avg-size", default = "default_avg_size")]
    pub avg_size: usize,

    /// Preferred maximum chunk size, in bytes.
    #[serde(rename = "max-size", default = "default_max_size")]
    pub max_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nar_size_threshold: default_nar_size_threshold(),
            min_size: default_min_size(),
            avg_size: default_avg_size(),
            max_size: default_max_size(),
        }
    }
}

/// Narinfo re-signing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Whether to strip upstream signatures under our key name and append
    /// a fresh one when serving narinfos.
    #[serde(rename = "sign-narinfo", default = "default_true")]
    pub sign_narinfo: bool,

    /// Path to the local Ed25519 secret key. Generated on first use if
    /// missing.
    #[serde(rename = "key-path", default = "default_key_path")]
    pub key_path: PathBuf,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            sign_narinfo: true,
            key_path: default_key_path(),
        }
    }
}

/// Distributed lock service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: LockBackendKind,

    /// Falls back to the in-process backend (breaking cross-replica
    /// exclusion) if the configured distributed backend can't be reached
    /// at startup, instead of refusing to start.
    #[serde(rename = "allow-degraded-mode", default)]
    pub allow_degraded_mode: bool,

    /// Initial retry delay.
    #[serde(rename = "retry-initial-delay", with = "humantime_serde", default = "default_retry_initial_delay")]
    pub retry_initial_delay: Duration,

    /// Maximum retry delay.
    #[serde(rename = "retry-max-delay", with = "humantime_serde", default = "default_retry_max_delay")]
    pub retry_max_delay: Duration,

    /// Maximum number of acquire attempts before surfacing `LockContended`.
    #[serde(rename = "retry-max-attempts", default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            allow_degraded_mode: false,
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

/// Lock backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LockBackendKind {
    /// Single-process in-memory locking. Only correct with one replica.
    #[default]
    InProcess,

    /// A row in the metadata database's `dlock` table. Works across
    /// SQLite, PostgreSQL, and MySQL.
    Database,

    /// Redis, single-instance Redlock-style locking.
    Redis { url: String },
}

/// LRU eviction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EvictionConfig {
    /// Cron schedule the evictor runs on. Empty disables automatic
    /// eviction (it can still be run once via `ncpsadm gc-once`).
    #[serde(default = "default_eviction_schedule")]
    pub schedule: String,

    /// Total resident payload size budget, in bytes. `None` disables
    /// size-based eviction.
    #[serde(rename = "budget-bytes", default)]
    pub budget_bytes: Option<u64>,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            schedule: default_eviction_schedule(),
            budget_bytes: None,
        }
    }
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/nix/store")
}

fn default_priority() -> i32 {
    40
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_nar_size_threshold() -> usize {
    128 * 1024
}

fn default_min_size() -> usize {
    256 * 1024
}

fn default_avg_size() -> usize {
    1024 * 1024
}

fn default_max_size() -> usize {
    4 * 1024 * 1024
}

fn default_key_path() -> PathBuf {
    get_xdg_data_path()
        .map(|p| p.join("cache.key"))
        .unwrap_or_else(|_| PathBuf::from("cache.key"))
}

fn default_retry_initial_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_max_attempts() -> u32 {
    20
}

fn default_eviction_schedule() -> String {
    // Every 15 minutes.
    "0 */15 * * * *".to_string()
}

fn read_non_empty_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn load_upstream_caches_from_env() -> Vec<String> {
    read_non_empty_var("NCPS_UPSTREAM_CACHES")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn load_netrc_path_from_env() -> Option<PathBuf> {
    read_non_empty_var("NCPS_NETRC_PATH").map(PathBuf::from)
}

fn load_database_url_from_env() -> String {
    read_non_empty_var("NCPS_DATABASE_URL")
        .unwrap_or_else(|| "sqlite://./ncps.db?mode=rwc".to_string())
}

/// Parses a config file, dispatching the format on its extension.
fn load_config_from_path(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path:?}"))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            Ok(serde_yaml::from_str(&text).with_context(|| format!("parsing {path:?} as YAML"))?)
        }
        Some("json") => {
            Ok(serde_json::from_str(&text).with_context(|| format!("parsing {path:?} as JSON"))?)
        }
        _ => Ok(toml::from_str(&text).with_context(|| format!("parsing {path:?} as TOML"))?),
    }
}

fn load_config_from_base64(encoded: &str) -> Result<Config> {
    let decoded = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .context("decoding NCPS_CONFIG_BASE64")?;
    let text = String::from_utf8(decoded).context("NCPS_CONFIG_BASE64 is not valid UTF-8")?;
    Ok(toml::from_str(&text).context("parsing NCPS_CONFIG_BASE64 as TOML")?)
}

/// Loads configuration in precedence order: explicit `--config` path,
/// `NCPS_CONFIG_BASE64`, then the XDG default path. Returns `Ok(None)` (not
/// an error) if nothing is configured anywhere, so callers can print a
/// friendly "no config found" message.
pub fn load_config(config_path: Option<&Path>) -> Result<Option<Config>> {
    if let Some(path) = config_path {
        return Ok(Some(load_config_from_path(path)?));
    }

    if let Some(encoded) = read_non_empty_var(ENV_CONFIG_BASE64) {
        return Ok(Some(load_config_from_base64(&encoded)?));
    }

    let xdg_path = get_xdg_config_path()?;
    if xdg_path.exists() {
        return Ok(Some(load_config_from_path(&xdg_path)?));
    }

    Ok(None)
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

pub fn get_xdg_data_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    Ok(xdg_dirs.create_data_directory("")?)
}

/// Checks that the configuration is internally consistent beyond what
/// serde's field-level validation covers.
pub fn validate(config: &Config) -> Result<()> {
    if config.upstream.caches.is_empty() {
        return Err(anyhow!(
            "at least one upstream cache must be configured (`upstream.caches`)"
        ));
    }

    let c = &config.chunking;
    if c.enabled && !(c.min_size < c.avg_size && c.avg_size < c.max_size) {
        return Err(anyhow!(
            "chunking.min-size < chunking.avg-size < chunking.max-size must hold"
        ));
    }

    Ok(())
}
