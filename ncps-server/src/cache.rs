//! The proxying cache core.
//!
//! Two independent things are coalesced under the per-hash lock so that
//! concurrent requests for the same path don't cause redundant upstream
//! fetches or storage writes: the narinfo row itself (cheap — metadata
//! only) and the narfile payload (expensive — the actual NAR bytes).
//! Narinfo ingestion never blocks on fetching the NAR; that only happens
//! the first time a client actually asks to download it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_compression::tokio::bufread::{BrotliDecoder, XzDecoder, ZstdDecoder};
use digest::Digest;
use futures::stream::{BoxStream, StreamExt};
use sha2::Sha256;
use tokio::io::{AsyncRead, BufReader};

use ncps_core::chunking::chunk_stream;
use ncps_core::hash::Hash;
use ncps_core::stream::{merge_chunks, StreamHasher};

use crate::database::entity::{chunk, narfile};
use crate::database::NarinfoWithDetails;
use crate::error::{ServerError, ServerResult};
use crate::narinfo::{Compression, NarInfo};
use crate::State;

const LOCK_TTL: Duration = Duration::from_secs(120);

/// Rebuilds a [`NarInfo`] from its database rows, signing it with the
/// local key if it doesn't already carry a signature under our name.
///
/// The advertised `Compression`/`FileHash`/`FileSize` must match what
/// [`stream_nar`] will actually put on the wire, not necessarily what the
/// narinfo was originally ingested with: once a narfile has been split
/// into chunks it is always reassembled decompressed (see
/// [`crate::database::Database::link_narfile_to_chunks`]), so a chunked
/// narfile's narinfo advertises no compression regardless of what the
/// upstream served.
pub async fn narinfo_from_row(state: &State, details: &NarinfoWithDetails) -> ServerResult<NarInfo> {
    let chunked = match details.narinfo.narfile_id {
        Some(narfile_id) => state
            .database
            .get_narfile_by_id(narfile_id)
            .await?
            .map(|narfile| narfile.total_chunks > 0)
            .unwrap_or(false),
        None => false,
    };

    let (compression, file_hash, file_size) = if chunked {
        (
            Compression::None,
            Hash::from_typed(&details.narinfo.nar_hash)?,
            details.narinfo.nar_size as usize,
        )
    } else {
        (
            Compression::from_str(&details.narinfo.compression)?,
            Hash::from_typed(&details.narinfo.file_hash)?,
            details.narinfo.file_size as usize,
        )
    };

    let mut narinfo = NarInfo {
        store_path: PathBuf::from(&details.narinfo.store_path),
        url: format!("nar/{}.nar", details.narinfo.store_path_hash),
        compression,
        file_hash: Some(file_hash),
        file_size: Some(file_size),
        nar_hash: Hash::from_typed(&details.narinfo.nar_hash)?,
        nar_size: details.narinfo.nar_size as usize,
        references: details.references.clone(),
        system: details.narinfo.system.clone(),
        deriver: details.narinfo.deriver.clone(),
        ca: details.narinfo.ca.clone(),
        signatures: details.signatures.clone(),
    };

    if state.config.signing.sign_narinfo {
        narinfo.strip_signatures_by(state.keypair.name());
        narinfo.sign(&state.keypair);
    }

    Ok(narinfo)
}

/// Looks up a narinfo by store path hash, fetching it from upstream (and
/// persisting it) on a cache miss.
pub async fn get_or_fetch_narinfo(
    state: &State,
    store_path_hash: &str,
) -> ServerResult<NarinfoWithDetails> {
    if let Some(details) = state.database.get_narinfo_by_hash(store_path_hash).await? {
        state
            .database
            .touch_narinfo_last_accessed(details.narinfo.id)
            .await?;
        return Ok(details);
    }

    let lock_key = format!("narinfo:{store_path_hash}");
    let _guard = match state.lock_service.try_lock(&lock_key, LOCK_TTL).await? {
        Some(guard) => guard,
        None => {
            state.analytics.record_coalesced_wait("narinfo");
            state.lock_service.lock(&lock_key, LOCK_TTL).await?
        }
    };

    // Re-check: another request may have filled this in while we waited.
    if let Some(details) = state.database.get_narinfo_by_hash(store_path_hash).await? {
        return Ok(details);
    }

    state.analytics.record_upstream_fetch("narinfo");
    let Some(text) = state.upstream.fetch_narinfo(store_path_hash).await? else {
        return Err(ServerError::NoSuchNarinfo);
    };

    let upstream_narinfo = NarInfo::from_str(&text)?;
    let model = crate::database::entity::narinfo::ActiveModel {
        store_path_hash: sea_orm::Set(store_path_hash.to_string()),
        store_path: sea_orm::Set(
            upstream_narinfo
                .store_path
                .to_string_lossy()
                .into_owned(),
        ),
        url: sea_orm::Set(upstream_narinfo.url.clone()),
        compression: sea_orm::Set(upstream_narinfo.compression.as_str().to_string()),
        file_hash: sea_orm::Set(
            upstream_narinfo
                .file_hash
                .as_ref()
                .map(Hash::to_typed_base16)
                .unwrap_or_default(),
        ),
        file_size: sea_orm::Set(upstream_narinfo.file_size.unwrap_or(0) as i64),
        nar_hash: sea_orm::Set(upstream_narinfo.nar_hash.to_typed_base16()),
        nar_size: sea_orm::Set(upstream_narinfo.nar_size as i64),
        narfile_id: sea_orm::Set(None),
        deriver: sea_orm::Set(upstream_narinfo.deriver.clone()),
        system: sea_orm::Set(upstream_narinfo.system.clone()),
        ca: sea_orm::Set(upstream_narinfo.ca.clone()),
        created_at: sea_orm::Set(chrono::Utc::now()),
        last_accessed_at: sea_orm::Set(chrono::Utc::now()),
        ..Default::default()
    };

    let inserted = match state
        .database
        .insert_narinfo(model, &upstream_narinfo.references, &upstream_narinfo.signatures)
        .await
    {
        Ok(m) => m,
        Err(ServerError::DuplicateKey) => state
            .database
            .get_narinfo_by_hash(store_path_hash)
            .await?
            .ok_or(ServerError::NoSuchNarinfo)?
            .narinfo,
        Err(e) => return Err(e),
    };

    state
        .database
        .get_narinfo_by_hash(&inserted.store_path_hash)
        .await?
        .ok_or(ServerError::NoSuchNarinfo)
}

/// Ensures the narfile backing `narinfo` is present locally, fetching it
/// from upstream under the coalescing lock if this is the first request
/// for it. Returns the narfile row once it's `Valid`.
pub async fn ensure_narfile(
    state: &State,
    narinfo: &crate::database::entity::narinfo::Model,
) -> ServerResult<narfile::Model> {
    if let Some(narfile_id) = narinfo.narfile_id {
        if let Some(model) = state.database.get_narfile_by_id(narfile_id).await? {
            state.database.touch_narfile_last_accessed(model.id).await?;
            return Ok(model);
        }
    }

    let lock_key = format!("download:nar:{}", narinfo.nar_hash);
    let _guard = match state.lock_service.try_lock(&lock_key, LOCK_TTL).await? {
        Some(guard) => guard,
        None => {
            state.analytics.record_coalesced_wait("narfile");
            state.lock_service.lock(&lock_key, LOCK_TTL).await?
        }
    };

    // Re-check after acquiring the lock: either a concurrent request for
    // this exact store path filled it in, or a narfile with the same NAR
    // hash (deduplicated build output) already exists.
    if let Some(narfile_id) = refresh_narfile_id(state, narinfo.id).await? {
        if let Some(model) = state.database.get_narfile_by_id(narfile_id).await? {
            return Ok(model);
        }
    }

    if let Some(existing) = state.database.get_narfile_by_nar_hash(&narinfo.nar_hash).await? {
        link_narinfo_to_narfile(state, narinfo.id, existing.id).await?;
        increment_narfile_holders(state, existing.id).await?;
        return Ok(existing);
    }

    state.analytics.record_upstream_fetch("nar");
    let stream = state.upstream.fetch_nar(&narinfo.url).await?;
    let reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(tokio_util::io::StreamReader::new(
        stream.map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
    ));

    let narfile = ingest_nar(state, narinfo, reader).await?;
    link_narinfo_to_narfile(state, narinfo.id, narfile.id).await?;

    Ok(narfile)
}

/// Wraps a reader of compressed bytes with the matching decompressor.
pub(crate) fn decompressing_reader(
    compression: Compression,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> ServerResult<Box<dyn AsyncRead + Unpin + Send>> {
    let buffered = BufReader::new(reader);
    Ok(match compression {
        Compression::None => Box::new(buffered),
        Compression::Xz => Box::new(XzDecoder::new(buffered)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buffered)),
        Compression::Brotli => Box::new(BrotliDecoder::new(buffered)),
        Compression::Bzip2 => {
            return Err(ServerError::InvalidCompressionType {
                name: "bzip2 (unsupported for chunked ingestion)".to_string(),
            })
        }
    })
}

async fn refresh_narfile_id(state: &State, narinfo_id: i64) -> ServerResult<Option<i64>> {
    let conn = state.database.connection();
    use sea_orm::EntityTrait;
    let row = crate::database::entity::narinfo::Entity::find_by_id(narinfo_id)
        .one(conn)
        .await
        .map_err(ServerError::database_error)?
        .ok_or(ServerError::NoSuchNarinfo)?;
    Ok(row.narfile_id)
}

/// Adds one to a narfile's holders count, as a fresh narinfo row starts
/// pointing at it. Read-then-write like [`release_narfile_holder`]; the
/// row lock callers hold around ingestion makes the race window benign.
async fn increment_narfile_holders(state: &State, narfile_id: i64) -> ServerResult<()> {
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    let Some(model) = crate::database::entity::narfile::Entity::find_by_id(narfile_id)
        .one(state.database.connection())
        .await
        .map_err(ServerError::database_error)?
    else {
        return Ok(());
    };

    let mut active: narfile::ActiveModel = model.clone().into();
    active.holders_count = Set(model.holders_count + 1);
    active
        .update(state.database.connection())
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}

async fn link_narinfo_to_narfile(state: &State, narinfo_id: i64, narfile_id: i64) -> ServerResult<()> {
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    let mut model: crate::database::entity::narinfo::ActiveModel =
        crate::database::entity::narinfo::Entity::find_by_id(narinfo_id)
            .one(state.database.connection())
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchNarinfo)?
            .into();
    model.narfile_id = Set(Some(narfile_id));
    model
        .update(state.database.connection())
        .await
        .map_err(ServerError::database_error)?;
    Ok(())
}

/// Streams the upstream NAR into local storage (whole or chunked,
/// depending on configuration and size), verifying its hash and size
/// against what the narinfo promised along the way.
async fn ingest_nar(
    state: &State,
    narinfo: &crate::database::entity::narinfo::Model,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> ServerResult<narfile::Model> {
    let use_chunking = state.config.chunking.enabled
        && narinfo.nar_size as usize >= state.config.chunking.nar_size_threshold;

    if use_chunking {
        let compression = Compression::from_str(&narinfo.compression)?;
        ingest_nar_chunked(state, narinfo, compression, reader).await
    } else {
        ingest_nar_whole(state, narinfo, reader).await
    }
}

async fn ingest_nar_whole(
    state: &State,
    narinfo: &crate::database::entity::narinfo::Model,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> ServerResult<narfile::Model> {
    let (mut hashed, finalized) = StreamHasher::new(reader, Sha256::new());

    let blob_name = format!("{}.{}", narinfo.nar_hash.replace(':', "-"), narinfo.compression);
    state.blob_store.put_blob(&blob_name, &mut hashed).await?;

    let (digest, size) = finalized
        .get()
        .cloned()
        .ok_or(ServerError::InternalServerError)?;

    if !narinfo.file_hash.is_empty() {
        let expected = Hash::from_typed(&narinfo.file_hash)?;
        if expected.to_hex() != hex::encode(digest) {
            return Err(ServerError::IntegrityViolation {
                reason: format!("file hash mismatch for {}", narinfo.store_path_hash),
            });
        }
    }
    if size as i64 != narinfo.file_size {
        return Err(ServerError::IntegrityViolation {
            reason: format!("file size mismatch for {}", narinfo.store_path_hash),
        });
    }

    let model = crate::database::entity::narfile::ActiveModel {
        state: sea_orm::Set(narfile::NarfileState::Valid),
        nar_hash: sea_orm::Set(narinfo.nar_hash.clone()),
        nar_size: sea_orm::Set(narinfo.nar_size),
        compression: sea_orm::Set(narinfo.compression.clone()),
        file_size: sea_orm::Set(size as i64),
        total_chunks: sea_orm::Set(0),
        chunking_started_at: sea_orm::Set(None),
        holders_count: sea_orm::Set(1),
        created_at: sea_orm::Set(chrono::Utc::now()),
        updated_at: sea_orm::Set(chrono::Utc::now()),
        last_accessed_at: sea_orm::Set(chrono::Utc::now()),
        verified_at: sea_orm::Set(None),
        ..Default::default()
    };

    match state.database.insert_narfile(model).await {
        Ok(m) => Ok(m),
        Err(ServerError::DuplicateKey) => {
            let existing = state
                .database
                .get_narfile_by_nar_hash(&narinfo.nar_hash)
                .await?
                .ok_or(ServerError::NoSuchNar)?;
            increment_narfile_holders(state, existing.id).await?;
            Ok(existing)
        }
        Err(e) => Err(e),
    }
}

async fn ingest_nar_chunked(
    state: &State,
    narinfo: &crate::database::entity::narinfo::Model,
    compression: Compression,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> ServerResult<narfile::Model> {
    let decompressed = decompressing_reader(compression, reader)?;
    let (mut hashed, finalized) = StreamHasher::new(decompressed, Sha256::new());

    let model = crate::database::entity::narfile::ActiveModel {
        state: sea_orm::Set(narfile::NarfileState::PendingUpload),
        nar_hash: sea_orm::Set(narinfo.nar_hash.clone()),
        nar_size: sea_orm::Set(narinfo.nar_size),
        compression: sea_orm::Set("none".to_string()),
        file_size: sea_orm::Set(narinfo.nar_size),
        total_chunks: sea_orm::Set(0),
        chunking_started_at: sea_orm::Set(Some(chrono::Utc::now())),
        holders_count: sea_orm::Set(1),
        created_at: sea_orm::Set(chrono::Utc::now()),
        updated_at: sea_orm::Set(chrono::Utc::now()),
        last_accessed_at: sea_orm::Set(chrono::Utc::now()),
        verified_at: sea_orm::Set(None),
        ..Default::default()
    };

    let narfile_row = match state.database.insert_narfile(model).await {
        Ok(m) => m,
        Err(ServerError::DuplicateKey) => {
            let existing = state
                .database
                .get_narfile_by_nar_hash(&narinfo.nar_hash)
                .await?
                .ok_or(ServerError::NoSuchNar)?;
            increment_narfile_holders(state, existing.id).await?;
            return Ok(existing);
        }
        Err(e) => return Err(e),
    };

    let (chunk_ids, chunk_hashes) = ingest_chunks(
        state,
        &mut hashed,
        state.config.chunking.min_size,
        state.config.chunking.avg_size,
        state.config.chunking.max_size,
    )
    .await?;

    let (digest, size) = finalized
        .get()
        .cloned()
        .ok_or(ServerError::InternalServerError)?;

    let expected = Hash::from_typed(&narinfo.nar_hash)?;
    if expected.to_hex() != hex::encode(digest) || size as i64 != narinfo.nar_size {
        return Err(ServerError::IntegrityViolation {
            reason: format!("NAR hash/size mismatch for {}", narinfo.store_path_hash),
        });
    }

    state
        .database
        .link_narfile_to_chunks(narfile_row.id, &chunk_ids, &chunk_hashes)
        .await?;

    mark_narfile_valid(state, narfile_row.id).await
}

/// Splits `reader` into content-defined chunks, storing each one
/// (deduplicating against chunks that already exist) and returning the
/// ordered list of chunk IDs and hashes.
pub async fn ingest_chunks(
    state: &State,
    reader: &mut (dyn AsyncRead + Unpin + Send),
    min_size: usize,
    avg_size: usize,
    max_size: usize,
) -> ServerResult<(Vec<i64>, Vec<String>)> {
    let mut chunks = Box::pin(chunk_stream(reader, min_size, avg_size, max_size));
    let mut chunk_ids = Vec::new();
    let mut chunk_hashes = Vec::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(ServerError::storage_error)?;
        let hash_hex = chunk.hash.to_hex();

        if let Some(existing) = state.database.get_chunk_by_hash(&hash_hex).await? {
            state.analytics.record_chunk_dedup(false);
            increment_chunk_holders(state, existing.id).await?;
            chunk_ids.push(existing.id);
        } else {
            let put_result = state
                .chunk_store
                .put_chunk(&hash_hex, &mut std::io::Cursor::new(chunk.bytes.as_ref()))
                .await?;
            state.analytics.record_chunk_dedup(put_result.is_new);

            let model = crate::database::entity::chunk::ActiveModel {
                state: sea_orm::Set(chunk::ChunkState::Valid),
                chunk_hash: sea_orm::Set(hash_hex.clone()),
                chunk_size: sea_orm::Set(chunk.size as i64),
                compressed_size: sea_orm::Set(Some(put_result.compressed_size as i64)),
                holders_count: sea_orm::Set(1),
                created_at: sea_orm::Set(chrono::Utc::now()),
                ..Default::default()
            };

            let inserted = match state.database.insert_chunk(model).await {
                Ok(m) => m,
                Err(ServerError::DuplicateKey) => {
                    let existing = state
                        .database
                        .get_chunk_by_hash(&hash_hex)
                        .await?
                        .ok_or(ServerError::NoSuchNar)?;
                    increment_chunk_holders(state, existing.id).await?;
                    existing
                }
                Err(e) => return Err(e),
            };
            chunk_ids.push(inserted.id);
        }

        chunk_hashes.push(hash_hex);
    }

    Ok((chunk_ids, chunk_hashes))
}

/// Adds one to a chunk's holders count, as a fresh narfile starts
/// referencing it.
async fn increment_chunk_holders(state: &State, chunk_id: i64) -> ServerResult<()> {
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    let Some(model) = chunk::Entity::find_by_id(chunk_id)
        .one(state.database.connection())
        .await
        .map_err(ServerError::database_error)?
    else {
        return Ok(());
    };

    let mut active: chunk::ActiveModel = model.clone().into();
    active.holders_count = Set(model.holders_count + 1);
    active
        .update(state.database.connection())
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}

async fn mark_narfile_valid(state: &State, narfile_id: i64) -> ServerResult<narfile::Model> {
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    let mut model: crate::database::entity::narfile::ActiveModel =
        crate::database::entity::narfile::Entity::find_by_id(narfile_id)
            .one(state.database.connection())
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchNar)?
            .into();
    model.state = Set(narfile::NarfileState::Valid);
    model.updated_at = Set(chrono::Utc::now());
    Ok(model
        .update(state.database.connection())
        .await
        .map_err(ServerError::database_error)?)
}

/// A NAR payload ready to be streamed to a client: either a whole blob or
/// the lazily-reassembled concatenation of its chunks.
pub async fn stream_nar(
    state: &State,
    narfile: &narfile::Model,
) -> ServerResult<BoxStream<'static, ServerResult<bytes::Bytes>>> {
    if narfile.total_chunks == 0 {
        let blob_name = format!("{}.{}", narfile.nar_hash.replace(':', "-"), narfile.compression);
        let reader = state.blob_store.get_blob(&blob_name).await?;
        let stream = tokio_util::io::ReaderStream::new(reader)
            .map(|r| r.map_err(ServerError::storage_error));
        return Ok(Box::pin(stream));
    }

    let links = state.database.get_narfile_chunks(narfile.id).await?;
    let hashes: VecDeque<String> = links.into_iter().map(|l| l.chunk_hash).collect();

    let streamer = |hash: String, store: std::sync::Arc<dyn crate::storage::ChunkStore>| async move {
        let reader = store.get_chunk(&hash).await?;
        let stream: BoxStream<'static, ServerResult<bytes::Bytes>> =
            Box::pin(tokio_util::io::ReaderStream::new(reader).map(|r| r.map_err(ServerError::storage_error)));
        Ok(stream)
    };

    let merged = merge_chunks(hashes, streamer, state.chunk_store.clone(), 4);
    Ok(Box::pin(merged))
}

/// True when the narfile's chunk links form a complete, contiguous
/// sequence with every chunk present — the precondition for serving it.
pub async fn narfile_is_complete(state: &State, narfile: &narfile::Model) -> ServerResult<bool> {
    if narfile.total_chunks == 0 {
        let blob_name = format!("{}.{}", narfile.nar_hash.replace(':', "-"), narfile.compression);
        return state.blob_store.has_blob(&blob_name).await;
    }

    let links = state.database.get_narfile_chunks(narfile.id).await?;
    if links.len() as i32 != narfile.total_chunks {
        return Ok(false);
    }

    for link in &links {
        if link.chunk_id.is_none() {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Decrements the holders count on a narinfo's deletion, leaving the
/// underlying narfile and its chunks for eviction/fsck to reap once their
/// holders count reaches zero.
pub async fn release_narfile_holder(state: &State, narfile_id: i64) -> ServerResult<()> {
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    let Some(model) = crate::database::entity::narfile::Entity::find_by_id(narfile_id)
        .one(state.database.connection())
        .await
        .map_err(ServerError::database_error)?
    else {
        return Ok(());
    };

    let mut active: narfile::ActiveModel = model.clone().into();
    active.holders_count = Set((model.holders_count - 1).max(0));
    active
        .update(state.database.connection())
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}
