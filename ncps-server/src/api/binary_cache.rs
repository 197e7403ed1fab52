//! Nix Binary Cache server.
//!
//! Implements the resource shapes described at
//! <https://github.com/fzakaria/nix-http-binary-cache-api-spec>: cache
//! info, narinfo records, and NAR payloads, each gated on `PUT`/`DELETE`
//! by the matching `allow-*-verb` config flag. `HEAD` falls back to the
//! `GET` handler with the body discarded, axum's default for routes with
//! no explicit `HEAD` registered.

use std::path::PathBuf;

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::StreamExt;
use serde::Serialize;
use tracing::instrument;

use crate::cache;
use crate::database::entity::narinfo;
use crate::error::{ServerError, ServerResult};
use crate::eviction::LRU_LOCK_KEY;
use crate::narinfo::NarInfo;
use crate::nix_manifest;
use crate::State;

/// Generous relative to any single download: held only for the lifetime
/// of one streamed response, renewed by nothing, so it must outlast the
/// slowest transfer this server expects to serve.
const READ_LOCK_TTL: Duration = Duration::from_secs(900);

/// `nix-cache-info`, advertising this server's store dir and priority.
#[derive(Debug, Clone, Serialize)]
struct NixCacheInfo {
    #[serde(rename = "WantMassQuery")]
    want_mass_query: bool,
    #[serde(rename = "StoreDir")]
    store_dir: PathBuf,
    #[serde(rename = "Priority")]
    priority: i32,
}

impl IntoResponse for NixCacheInfo {
    fn into_response(self) -> Response {
        match nix_manifest::to_string(&self) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", ncps_core::mime::NIX_CACHE_INFO)
                .body(body)
                .unwrap()
                .into_response(),
            Err(e) => e.into_response(),
        }
    }
}

#[instrument(skip_all)]
async fn get_nix_cache_info(Extension(state): Extension<State>) -> NixCacheInfo {
    NixCacheInfo {
        want_mass_query: true,
        store_dir: state.config.store_dir.clone(),
        priority: state.config.priority,
    }
}

/// Splits a `{name}.{ext}` path component, rejecting anything else.
fn split_suffix<'a>(path: &'a str, suffix: &str) -> ServerResult<&'a str> {
    path.strip_suffix(suffix).ok_or(ServerError::NotFound)
}

#[instrument(skip_all, fields(path))]
async fn get_narinfo(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
) -> ServerResult<NarInfo> {
    let store_path_hash = split_suffix(&path, ".narinfo")?;
    let details = cache::get_or_fetch_narinfo(&state, store_path_hash).await?;
    cache::narinfo_from_row(&state, &details).await
}

#[instrument(skip_all, fields(path))]
async fn put_narinfo(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
    body: Bytes,
) -> ServerResult<StatusCode> {
    if !state.config.allow_put_verb {
        return Err(ServerError::Unauthorized);
    }

    let store_path_hash = split_suffix(&path, ".narinfo")?;
    let text = String::from_utf8(body.to_vec()).map_err(ServerError::request_error)?;
    let parsed = NarInfo::from_str(&text)?;

    use ncps_core::hash::Hash;
    let model = narinfo::ActiveModel {
        store_path_hash: sea_orm::Set(store_path_hash.to_string()),
        store_path: sea_orm::Set(parsed.store_path.to_string_lossy().into_owned()),
        url: sea_orm::Set(parsed.url.clone()),
        compression: sea_orm::Set(parsed.compression.as_str().to_string()),
        file_hash: sea_orm::Set(
            parsed
                .file_hash
                .as_ref()
                .map(Hash::to_typed_base16)
                .unwrap_or_default(),
        ),
        file_size: sea_orm::Set(parsed.file_size.unwrap_or(0) as i64),
        nar_hash: sea_orm::Set(parsed.nar_hash.to_typed_base16()),
        nar_size: sea_orm::Set(parsed.nar_size as i64),
        narfile_id: sea_orm::Set(None),
        deriver: sea_orm::Set(parsed.deriver.clone()),
        system: sea_orm::Set(parsed.system.clone()),
        ca: sea_orm::Set(parsed.ca.clone()),
        created_at: sea_orm::Set(chrono::Utc::now()),
        last_accessed_at: sea_orm::Set(chrono::Utc::now()),
        ..Default::default()
    };

    match state
        .database
        .insert_narinfo(model, &parsed.references, &parsed.signatures)
        .await
    {
        Ok(_) | Err(ServerError::DuplicateKey) => Ok(StatusCode::CREATED),
        Err(e) => Err(e),
    }
}

#[instrument(skip_all, fields(path))]
async fn delete_narinfo(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
) -> ServerResult<StatusCode> {
    if !state.config.allow_delete_verb {
        return Err(ServerError::Unauthorized);
    }

    let store_path_hash = split_suffix(&path, ".narinfo")?;
    let Some(details) = state.database.get_narinfo_by_hash(store_path_hash).await? else {
        return Ok(StatusCode::NO_CONTENT);
    };

    if let Some(narfile_id) = details.narinfo.narfile_id {
        cache::release_narfile_holder(&state, narfile_id).await?;
    }
    state.database.delete_narinfo(details.narinfo.id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Splits `{storePathHash}.nar[.ext]` into the hash and the raw
/// remainder, tolerating the bare `.nar` (no compression suffix) case.
fn parse_nar_path(path: &str) -> ServerResult<&str> {
    let stripped = path.strip_prefix("nar/").ok_or(ServerError::NotFound)?;
    let hash = stripped.split('.').next().ok_or(ServerError::NotFound)?;
    if hash.is_empty() {
        return Err(ServerError::NotFound);
    }
    Ok(hash)
}

#[instrument(skip_all, fields(path))]
async fn get_nar(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
) -> ServerResult<Response> {
    let store_path_hash = parse_nar_path(&path)?;

    let details = state
        .database
        .get_narinfo_by_hash(store_path_hash)
        .await?
        .ok_or(ServerError::NoSuchNarinfo)?;

    let narfile = cache::ensure_narfile(&state, &details.narinfo).await?;
    if !cache::narfile_is_complete(&state, &narfile).await? {
        return Err(ServerError::NoSuchNar);
    }

    // Held for the whole transfer so eviction's exclusive lock on the same
    // key can't delete this narfile's payload out from under us.
    let read_guard = state.lock_service.rlock(LRU_LOCK_KEY, READ_LOCK_TTL).await?;

    state
        .database
        .touch_narfile_last_accessed(narfile.id)
        .await?;

    let stream = cache::stream_nar(&state, &narfile).await?;
    let stream = stream.map(move |item| {
        let _keep_alive = &read_guard;
        item
    });
    let body = Body::wrap_stream(stream);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", ncps_core::mime::NAR)
        .header("Content-Length", narfile.file_size)
        .body(body)
        .unwrap())
}

#[instrument(skip_all, fields(path))]
async fn put_nar(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
    body: Bytes,
) -> ServerResult<StatusCode> {
    if !state.config.allow_put_verb {
        return Err(ServerError::Unauthorized);
    }

    let name = path.strip_prefix("nar/").ok_or(ServerError::NotFound)?;
    state
        .blob_store
        .put_blob(name, &mut std::io::Cursor::new(body.as_ref()))
        .await?;

    Ok(StatusCode::CREATED)
}

#[instrument(skip_all, fields(path))]
async fn delete_nar(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
) -> ServerResult<StatusCode> {
    if !state.config.allow_delete_verb {
        return Err(ServerError::Unauthorized);
    }

    let store_path_hash = parse_nar_path(&path)?;
    if let Some(narfile) = state.database.get_narfile_by_nar_hash(store_path_hash).await? {
        cache::release_narfile_holder(&state, narfile.id).await?;
    } else {
        let name = path.strip_prefix("nar/").unwrap_or(&path);
        state.blob_store.delete_blob(name).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn get_metrics(Extension(state): Extension<State>) -> Response {
    if !state.config.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.analytics.render().into_response()
}

pub fn get_router() -> Router {
    Router::new()
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route(
            "/:path",
            get(get_narinfo).put(put_narinfo).delete(delete_narinfo),
        )
        .route(
            "/nar/:path",
            get(get_nar).put(put_nar).delete(delete_nar),
        )
        .route("/metrics", get(get_metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_suffix_rejects_mismatched_extensions() {
        assert_eq!(
            split_suffix("abc123.narinfo", ".narinfo").unwrap(),
            "abc123"
        );
        assert!(split_suffix("abc123.nar", ".narinfo").is_err());
    }

    #[test]
    fn parse_nar_path_handles_compression_suffixes() {
        assert_eq!(parse_nar_path("nar/abc123.nar.xz").unwrap(), "abc123");
        assert_eq!(parse_nar_path("nar/abc123.nar").unwrap(), "abc123");
        assert!(parse_nar_path("nar/.nar").is_err());
        assert!(parse_nar_path("abc123.nar").is_err());
    }
}
