//! LRU-driven payload eviction.
//!
//! Runs on a cron schedule under a single global write lock
//! (`lru:exclusive`) so eviction never races itself across replicas, and
//! against the read lock every serving path takes on the same key (see
//! `api::binary_cache::get_nar`) so a download in flight keeps its
//! payload until it's done. Narinfos are never evicted on their own —
//! only the narfile payload they reference, once its holders count
//! reaches zero: the row and its payload are deleted in one step, there
//! is no intermediate "marked for deletion" state to observe. Orphaned
//! chunks left behind by that deletion are reaped in a bounded-
//! concurrency second pass, the shape the teacher's garbage collector
//! uses for its own orphan sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::instrument;

use crate::database::entity::{chunk, narfile};
use crate::error::ServerResult;
use crate::State;

/// Every serving path takes this key's read lock around the transfer, and
/// eviction takes its write lock around a whole pass, so eviction can
/// never delete a narfile payload out from under an in-flight download —
/// see `api::binary_cache::get_nar`.
pub(crate) const LRU_LOCK_KEY: &str = "lru:exclusive";
const LRU_LOCK_TTL: Duration = Duration::from_secs(300);
const DELETE_CONCURRENCY: usize = 20;

/// Installs the cron-scheduled evictor. Disabled (returns immediately,
/// scheduling nothing) if `eviction.schedule` is empty.
pub async fn spawn_scheduled_eviction(state: State) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    if state.config.eviction.schedule.is_empty() {
        tracing::info!("automatic eviction disabled (empty schedule)");
        return Ok(scheduler);
    }

    let schedule = state.config.eviction.schedule.clone();
    let job = Job::new_async(schedule.as_str(), move |_uuid, _scheduler| {
        let state = state.clone();
        Box::pin(async move {
            if let Err(error) = run_eviction_once(&state).await {
                tracing::error!(%error, "scheduled eviction failed");
                state.analytics.record_task_panic("eviction");
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    Ok(scheduler)
}

/// Runs one eviction pass: LRU budget enforcement, then reaping whatever
/// that (or earlier narinfo deletions) left orphaned.
#[instrument(skip_all)]
pub async fn run_eviction_once(state: &State) -> ServerResult<()> {
    let _guard = state
        .lock_service
        .lock(LRU_LOCK_KEY, LRU_LOCK_TTL)
        .await?;

    if let Some(budget) = state.config.eviction.budget_bytes {
        run_budget_eviction(state, budget).await?;
    }

    reap_orphan_narfiles(state).await?;
    reap_orphan_chunks(state).await?;

    Ok(())
}

/// Walks narfiles oldest-accessed-first, dropping holders (and reaping
/// once a narfile's holders reach zero) until resident size is back
/// under `budget_bytes`.
#[instrument(skip(state))]
async fn run_budget_eviction(state: &State, budget_bytes: u64) -> ServerResult<()> {
    let narfiles = state.database.get_narfiles_by_last_accessed().await?;

    let total: u64 = narfiles.iter().map(|n| n.nar_size as u64).sum();
    if total <= budget_bytes {
        tracing::debug!(total, budget_bytes, "within budget, nothing to evict");
        return Ok(());
    }

    let mut resident = total;
    let mut evicted = 0usize;

    for narfile in narfiles {
        if resident <= budget_bytes {
            break;
        }

        resident = resident.saturating_sub(narfile.nar_size as u64);
        evict_narfile_payload(state, &narfile).await?;
        evicted += 1;
    }

    tracing::info!(evicted, "evicted narfiles to stay under budget");
    Ok(())
}

/// Deletes a narfile's payload (blob or every chunk it referenced) and
/// the narfile row itself, decrementing chunk holders counts along the
/// way so orphaned chunks become visible to [`reap_orphan_chunks`].
async fn evict_narfile_payload(state: &State, narfile: &narfile::Model) -> ServerResult<()> {
    if narfile.total_chunks == 0 {
        let blob_name = format!("{}.{}", narfile.nar_hash.replace(':', "-"), narfile.compression);
        state.blob_store.delete_blob(&blob_name).await?;
    } else {
        let links = state.database.get_narfile_chunks(narfile.id).await?;
        for link in links {
            if let Some(chunk_id) = link.chunk_id {
                decrement_chunk_holders(state, chunk_id).await?;
            }
        }
    }

    state.database.delete_narfile(narfile.id).await?;
    state.analytics.record_eviction(1, narfile.nar_size as u64);

    Ok(())
}

async fn decrement_chunk_holders(state: &State, chunk_id: i64) -> ServerResult<()> {
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    let Some(model) = chunk::Entity::find_by_id(chunk_id)
        .one(state.database.connection())
        .await
        .map_err(crate::error::ServerError::database_error)?
    else {
        return Ok(());
    };

    let mut active: chunk::ActiveModel = model.clone().into();
    active.holders_count = Set((model.holders_count - 1).max(0));
    active
        .update(state.database.connection())
        .await
        .map_err(crate::error::ServerError::database_error)?;

    Ok(())
}

/// Narfiles whose last narinfo holder has been deleted (`holders_count`
/// reached zero without going through budget eviction, e.g. a `DELETE
/// .narinfo` request): drop their payload and row the same way.
#[instrument(skip_all)]
async fn reap_orphan_narfiles(state: &State) -> ServerResult<()> {
    let orphans = state.database.get_orphaned_narfiles().await?;
    let mut reaped = 0usize;

    for narfile in orphans {
        evict_narfile_payload(state, &narfile).await?;
        reaped += 1;
    }

    tracing::info!(reaped, "reaped orphaned narfiles");
    Ok(())
}

/// Deletes chunks with zero holders from the chunk store and the
/// database, bounding concurrency the way the teacher's garbage
/// collector bounds its remote-storage deletes.
#[instrument(skip_all)]
async fn reap_orphan_chunks(state: &State) -> ServerResult<()> {
    let orphans = state.database.get_orphaned_chunks().await?;
    if orphans.is_empty() {
        return Ok(());
    }

    let delete_limit = Arc::new(Semaphore::new(DELETE_CONCURRENCY));
    let futures: Vec<_> = orphans
        .into_iter()
        .map(|chunk| {
            let delete_limit = delete_limit.clone();
            let chunk_store = state.chunk_store.clone();
            async move {
                let _permit = delete_limit.acquire().await?;
                chunk_store.delete_chunk(&chunk.chunk_hash).await?;
                Result::<_, anyhow::Error>::Ok(chunk.id)
            }
        })
        .collect();

    let deleted_ids: Vec<i64> = join_all(futures)
        .await
        .into_iter()
        .filter_map(|r| match r {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::warn!(%error, "chunk deletion failed, will retry next pass");
                None
            }
        })
        .collect();

    for id in &deleted_ids {
        state.database.delete_chunk(*id).await?;
    }

    tracing::info!(reaped = deleted_ids.len(), "reaped orphaned chunks");
    Ok(())
}
