//! Migration pipelines: carrying legacy filesystem state into the
//! database, and whole narfiles into the chunked store, while the cache
//! keeps serving.
//!
//! Both pipelines bound their concurrency with a semaphore (the same
//! shape `eviction.rs` uses for orphan-chunk deletion) and report
//! progress on a 5-second ticker (shortened from the teacher's
//! 60-second database heartbeat). They reuse the cache core's per-hash
//! lock keys so they can't race a live fill for the same artifact.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use digest::Digest;
use futures::stream::StreamExt;
use sha2::Sha256;
use tokio::sync::Semaphore;

use ncps_core::hash::Hash;
use ncps_core::stream::StreamHasher;

use crate::cache::{decompressing_reader, ingest_chunks};
use crate::database::entity::narfile;
use crate::error::{ServerError, ServerResult};
use crate::narinfo::{Compression, NarInfo};
use crate::State;

const DEFAULT_CONCURRENCY: usize = 8;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const LOCK_TTL: Duration = Duration::from_secs(120);

/// Walks the blob store's narinfo namespace, inserting a narinfo (and
/// its narfile) row for each one found that isn't in the database yet.
///
/// Idempotent: a `DuplicateKey` from a racing live fill just means
/// another writer already did this row; the source blob is still
/// deleted on success.
#[tracing::instrument(skip(state))]
pub async fn migrate_narinfo_to_database(state: &State, concurrency: Option<usize>) -> ServerResult<usize> {
    let semaphore = Arc::new(Semaphore::new(concurrency.unwrap_or(DEFAULT_CONCURRENCY)));
    let done = Arc::new(AtomicUsize::new(0));

    let mut names = state.blob_store.walk_nars().await?;
    let mut names_to_migrate = Vec::new();
    while let Some(name) = names.next().await {
        let name = name?;
        if name.ends_with(".narinfo") {
            names_to_migrate.push(name);
        }
    }
    let total = names_to_migrate.len();

    let ticker = spawn_progress_ticker(done.clone(), total, "narinfo migration");

    let mut tasks = Vec::with_capacity(names_to_migrate.len());
    for name in names_to_migrate {
        let state = state.clone();
        let semaphore = semaphore.clone();
        let done = done.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let result = migrate_one_narinfo(&state, &name).await;
            done.fetch_add(1, Ordering::Relaxed);
            if let Err(error) = &result {
                tracing::warn!(%error, name, "narinfo migration failed for this entry");
            }
            result
        }));
    }

    let mut migrated = 0usize;
    for task in tasks {
        if matches!(task.await, Ok(Ok(true))) {
            migrated += 1;
        }
    }

    ticker.abort();
    tracing::info!(migrated, total, "narinfo migration complete");
    Ok(migrated)
}

async fn migrate_one_narinfo(state: &State, blob_name: &str) -> ServerResult<bool> {
    let store_path_hash = blob_name.trim_end_matches(".narinfo").to_string();

    if state
        .database
        .get_narinfo_by_hash(&store_path_hash)
        .await?
        .is_some()
    {
        return Ok(false);
    }

    let lock_key = format!("narinfo:{store_path_hash}");
    let _guard = state.lock_service.lock(&lock_key, LOCK_TTL).await?;

    if state
        .database
        .get_narinfo_by_hash(&store_path_hash)
        .await?
        .is_some()
    {
        return Ok(false);
    }

    let mut reader = state.blob_store.get_blob(blob_name).await?;
    let mut text = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut text)
        .await
        .map_err(ServerError::storage_error)?;

    let parsed = NarInfo::from_str(&text)?;

    use ncps_core::hash::Hash;
    let model = crate::database::entity::narinfo::ActiveModel {
        store_path_hash: sea_orm::Set(store_path_hash.clone()),
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

    let inserted = match state
        .database
        .insert_narinfo(model, &parsed.references, &parsed.signatures)
        .await
    {
        Ok(m) => m,
        Err(ServerError::DuplicateKey) => return Ok(false),
        Err(e) => return Err(e),
    };

    if let Some(existing) = state.database.get_narfile_by_nar_hash(&inserted.nar_hash).await? {
        link_narfile(state, inserted.id, existing.id).await?;
    } else {
        let narfile_model = crate::database::entity::narfile::ActiveModel {
            state: sea_orm::Set(narfile::NarfileState::PendingUpload),
            nar_hash: sea_orm::Set(inserted.nar_hash.clone()),
            nar_size: sea_orm::Set(inserted.nar_size),
            compression: sea_orm::Set(inserted.compression.clone()),
            file_size: sea_orm::Set(inserted.file_size),
            total_chunks: sea_orm::Set(0),
            chunking_started_at: sea_orm::Set(None),
            holders_count: sea_orm::Set(1),
            created_at: sea_orm::Set(chrono::Utc::now()),
            updated_at: sea_orm::Set(chrono::Utc::now()),
            last_accessed_at: sea_orm::Set(chrono::Utc::now()),
            verified_at: sea_orm::Set(None),
            ..Default::default()
        };

        match state.database.insert_narfile(narfile_model).await {
            Ok(m) => link_narfile(state, inserted.id, m.id).await?,
            Err(ServerError::DuplicateKey) => {
                let existing = state
                    .database
                    .get_narfile_by_nar_hash(&inserted.nar_hash)
                    .await?
                    .ok_or(ServerError::NoSuchNar)?;
                link_narfile(state, inserted.id, existing.id).await?;
            }
            Err(e) => return Err(e),
        }
    }

    state.blob_store.delete_blob(blob_name).await?;
    Ok(true)
}

async fn link_narfile(state: &State, narinfo_id: i64, narfile_id: i64) -> ServerResult<()> {
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

/// Splits every whole (`total_chunks == 0`) narfile into chunks,
/// refusing to start if any narinfo hasn't been migrated into the
/// database yet (the precondition spec.md requires, since a narfile's
/// payload must have at least one narinfo already pointing at it to be
/// worth chunking).
#[tracing::instrument(skip(state))]
pub async fn migrate_narfiles_to_chunks(state: &State, concurrency: Option<usize>) -> ServerResult<usize> {
    if !state.database.get_narinfos_without_narfiles().await?.is_empty() {
        return Err(ServerError::ConfigInvalid(
            "refusing to chunk narfiles while unmigrated narinfos remain".to_string(),
        ));
    }

    let candidates = state.database.get_narinfo_hashes_to_chunk().await?;
    let total = candidates.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.unwrap_or(DEFAULT_CONCURRENCY)));
    let done = Arc::new(AtomicUsize::new(0));
    let ticker = spawn_progress_ticker(done.clone(), total, "chunk migration");

    let mut tasks = Vec::with_capacity(candidates.len());
    for narfile in candidates {
        let state = state.clone();
        let semaphore = semaphore.clone();
        let done = done.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let result = migrate_one_narfile(&state, &narfile).await;
            done.fetch_add(1, Ordering::Relaxed);
            if let Err(error) = &result {
                tracing::warn!(%error, nar_hash = %narfile.nar_hash, "chunk migration failed for this narfile");
            }
            result
        }));
    }

    let mut migrated = 0usize;
    for task in tasks {
        if matches!(task.await, Ok(Ok(true))) {
            migrated += 1;
        }
    }

    ticker.abort();
    tracing::info!(migrated, total, "chunk migration complete");
    Ok(migrated)
}

async fn migrate_one_narfile(state: &State, narfile: &narfile::Model) -> ServerResult<bool> {
    if narfile.total_chunks > 0 {
        return Ok(false);
    }

    let lock_key = format!("download:nar:{}", narfile.nar_hash);
    let _guard = state.lock_service.lock(&lock_key, LOCK_TTL).await?;

    let Some(current) = state.database.get_narfile_by_id(narfile.id).await? else {
        return Ok(false);
    };
    if current.total_chunks > 0 {
        return Ok(false);
    }

    let blob_name = format!(
        "{}.{}",
        current.nar_hash.replace(':', "-"),
        current.compression
    );
    let reader = state.blob_store.get_blob(&blob_name).await?;

    // Chunks always hold decompressed bytes, the same representation the
    // live ingestion path produces, so a narfile chunks identically
    // regardless of which path split it.
    let compression = Compression::from_str(&current.compression)?;
    let decompressed = decompressing_reader(compression, reader)?;
    let (mut hashed, finalized) = StreamHasher::new(decompressed, Sha256::new());

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
    let expected = Hash::from_typed(&current.nar_hash)?;
    if expected.to_hex() != hex::encode(digest) || size as i64 != current.nar_size {
        return Err(ServerError::IntegrityViolation {
            reason: format!("NAR hash/size mismatch while chunking narfile {}", current.id),
        });
    }

    state
        .database
        .link_narfile_to_chunks(current.id, &chunk_ids, &chunk_hashes)
        .await?;

    state.blob_store.delete_blob(&blob_name).await?;
    Ok(true)
}

fn spawn_progress_ticker(
    done: Arc<AtomicUsize>,
    total: usize,
    label: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
        loop {
            interval.tick().await;
            let done = done.load(Ordering::Relaxed);
            tracing::info!(done, total, "{label} progress");
            if done >= total {
                break;
            }
        }
    })
}
