//! Consistency checker and repairer.
//!
//! Runs over the four-corner state space (metadata row present/absent ×
//! payload present/absent) in three phases: collect suspects with cheap
//! database queries and a storage walk, re-verify each suspect
//! individually (closing the window between collection and now), then
//! optionally repair. Repair order matters: the narfile row goes first,
//! then narinfos left dangling by that deletion, then chunks left
//! orphaned by it — mirroring the anti-join-then-delete shape
//! `eviction.rs` uses for its own orphan sweeps.

use std::collections::HashSet;
use std::io::IsTerminal;

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use crate::database::entity::{chunk, narfile, narinfo};
use crate::error::{ServerError, ServerResult};
use crate::State;

/// One occurrence of a deviation found during the sweep.
#[derive(Debug, Clone)]
pub enum Issue {
    /// A narinfo's `narfile_id` points at a row that no longer exists.
    NarinfoDanglingNarfile { narinfo_id: i64 },
    /// A narfile has no narinfo pointing at it anymore.
    NarfileOrphaned { narfile_id: i64 },
    /// A whole narfile's blob is missing from the blob store.
    NarfileBlobMissing { narfile_id: i64 },
    /// A blob exists in storage with no narfile row referencing it.
    OrphanBlobFile { name: String },
    /// A chunk row has no narfile_chunk links pointing at it.
    OrphanChunkRow { chunk_id: i64 },
    /// A chunk exists in the chunk store with no database row.
    OrphanChunkFile { hash: String },
    /// A chunked narfile's link set is short, has a hole, or points at a
    /// chunk missing from the chunk store.
    NarfileChunksIncomplete { narfile_id: i64 },
}

impl Issue {
    fn class_name(&self) -> &'static str {
        match self {
            Self::NarinfoDanglingNarfile { .. } => "narinfo-dangling-narfile",
            Self::NarfileOrphaned { .. } => "narfile-orphaned",
            Self::NarfileBlobMissing { .. } => "narfile-blob-missing",
            Self::OrphanBlobFile { .. } => "orphan-blob-file",
            Self::OrphanChunkRow { .. } => "orphan-chunk-row",
            Self::OrphanChunkFile { .. } => "orphan-chunk-file",
            Self::NarfileChunksIncomplete { .. } => "narfile-chunks-incomplete",
        }
    }
}

/// Skip narfiles whose `verified_at` is newer than this when set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsckOptions {
    pub mode_repair: bool,
    pub mode_dry_run: bool,
    pub verified_since: Option<DateTime<Utc>>,
}

/// Final tally, printed as a boxed summary and used to pick the process
/// exit code.
#[derive(Debug, Default)]
pub struct FsckSummary {
    pub found: Vec<(&'static str, usize)>,
    pub repaired: usize,
    pub remaining: usize,
}

impl FsckSummary {
    /// Renders the boxed terminal summary the teacher's `config.rs`
    /// startup banners use.
    pub fn render(&self) -> String {
        let mut lines = vec!["ncps fsck summary".to_string()];
        if self.found.is_empty() {
            lines.push("no issues found".to_string());
        } else {
            for (class, count) in &self.found {
                lines.push(format!("{class}: {count}"));
            }
            lines.push(format!("repaired: {}", self.repaired));
            lines.push(format!("remaining: {}", self.remaining));
        }

        let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
        let border = format!("+{}+", "-".repeat(width - 2));
        let mut out = vec![border.clone()];
        for line in &lines {
            out.push(format!("| {line:<pad$} |", pad = width - 4));
        }
        out.push(border);
        out.join("\n")
    }
}

/// Runs the full three-phase sweep and returns the summary.
///
/// Returns `Err(ServerError::IssuesFound)` when issues remain unrepaired
/// and the caller isn't attached to a TTY (or is in dry-run mode).
#[tracing::instrument(skip_all)]
pub async fn run_fsck(state: &State, options: FsckOptions) -> ServerResult<FsckSummary> {
    let repair = if options.mode_dry_run {
        false
    } else if options.mode_repair {
        true
    } else if std::io::stdin().is_terminal() {
        confirm_interactively()
    } else {
        false
    };

    let suspects = collect_suspects(state, options.verified_since).await?;
    let confirmed = reverify(state, suspects).await?;

    let mut found: Vec<(&'static str, usize)> = Vec::new();
    let mut by_class: std::collections::HashMap<&'static str, usize> = std::collections::HashMap::new();
    for issue in &confirmed {
        *by_class.entry(issue.class_name()).or_insert(0) += 1;
    }
    for (class, count) in by_class {
        found.push((class, count));
    }
    found.sort_by_key(|(c, _)| *c);

    let mut summary = FsckSummary {
        found,
        repaired: 0,
        remaining: confirmed.len(),
    };

    if repair && !confirmed.is_empty() {
        let repaired = repair_issues(state, confirmed).await?;
        summary.repaired = repaired;
        summary.remaining = summary.remaining.saturating_sub(repaired);
    }

    if summary.remaining > 0 && !repair {
        tracing::warn!(remaining = summary.remaining, "fsck found unrepaired issues");
        return Err(ServerError::IssuesFound);
    }

    Ok(summary)
}

fn confirm_interactively() -> bool {
    eprintln!("fsck found issues attached to a terminal; repair now? [y/N]");
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Phase 1: run the cheap queries and storage walks, skipping narfiles
/// verified more recently than `verified_since`.
async fn collect_suspects(
    state: &State,
    verified_since: Option<DateTime<Utc>>,
) -> ServerResult<Vec<Issue>> {
    let mut issues = Vec::new();

    let narinfos = narinfo::Entity::find()
        .all(state.database.connection())
        .await
        .map_err(ServerError::database_error)?;
    for row in &narinfos {
        if let Some(narfile_id) = row.narfile_id {
            if state.database.get_narfile_by_id(narfile_id).await?.is_none() {
                issues.push(Issue::NarinfoDanglingNarfile { narinfo_id: row.id });
            }
        }
    }

    let narfiles = state.database.get_all_narfiles().await?;
    for row in &narfiles {
        if let Some(since) = verified_since {
            if row.verified_at.map(|v| v > since).unwrap_or(false) {
                continue;
            }
        }

        let holders = narinfo::Entity::find()
            .filter(narinfo::Column::NarfileId.eq(row.id))
            .all(state.database.connection())
            .await
            .map_err(ServerError::database_error)?;
        if holders.is_empty() {
            issues.push(Issue::NarfileOrphaned { narfile_id: row.id });
            continue;
        }

        if row.total_chunks == 0 {
            let blob_name = format!("{}.{}", row.nar_hash.replace(':', "-"), row.compression);
            if !state.blob_store.has_blob(&blob_name).await? {
                issues.push(Issue::NarfileBlobMissing { narfile_id: row.id });
            }
        } else {
            let links = state.database.get_narfile_chunks(row.id).await?;
            let incomplete = links.len() as i32 != row.total_chunks
                || links.iter().any(|l| l.chunk_id.is_none());
            if incomplete {
                issues.push(Issue::NarfileChunksIncomplete { narfile_id: row.id });
            } else {
                for link in &links {
                    if !state.chunk_store.has_chunk(&link.chunk_hash).await? {
                        issues.push(Issue::NarfileChunksIncomplete { narfile_id: row.id });
                        break;
                    }
                }
            }
        }
    }

    let orphan_chunks = state.database.get_orphaned_chunks().await?;
    for row in orphan_chunks {
        issues.push(Issue::OrphanChunkRow { chunk_id: row.id });
    }

    walk_storage_for_orphans(state, &narfiles, &mut issues).await;

    Ok(issues)
}

/// Cross-references what's actually in the blob and chunk stores against
/// the database, tolerating backends that can't enumerate their contents
/// (`StorageIterationUnsupported`) by skipping that half of the sweep.
async fn walk_storage_for_orphans(state: &State, narfiles: &[narfile::Model], issues: &mut Vec<Issue>) {
    let known_blobs: HashSet<String> = narfiles
        .iter()
        .filter(|n| n.total_chunks == 0)
        .map(|n| format!("{}.{}", n.nar_hash.replace(':', "-"), n.compression))
        .collect();

    match state.blob_store.walk_nars().await {
        Ok(mut stream) => {
            while let Some(name) = stream.next().await {
                match name {
                    Ok(name) if !known_blobs.contains(&name) => {
                        issues.push(Issue::OrphanBlobFile { name });
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "error walking blob store"),
                }
            }
        }
        Err(ServerError::StorageIterationUnsupported) => {
            tracing::debug!("blob store does not support enumeration, skipping orphan-file sweep");
        }
        Err(error) => tracing::warn!(%error, "could not walk blob store"),
    }

    let known_chunks: HashSet<String> = match chunk::Entity::find()
        .all(state.database.connection())
        .await
    {
        Ok(rows) => rows.into_iter().map(|c| c.chunk_hash).collect(),
        Err(error) => {
            tracing::warn!(%error, "could not load chunk hashes for orphan-file sweep");
            return;
        }
    };

    match state.chunk_store.walk_chunks().await {
        Ok(mut stream) => {
            while let Some(hash) = stream.next().await {
                match hash {
                    Ok(hash) if !known_chunks.contains(&hash) => {
                        issues.push(Issue::OrphanChunkFile { hash });
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "error walking chunk store"),
                }
            }
        }
        Err(ServerError::StorageIterationUnsupported) => {
            tracing::debug!("chunk store does not support enumeration, skipping orphan-file sweep");
        }
        Err(error) => tracing::warn!(%error, "could not walk chunk store"),
    }
}

/// Phase 2: re-check each suspect individually, dropping any that were
/// resolved (by a concurrent fill, eviction, or another fsck run) between
/// collection and now.
async fn reverify(state: &State, suspects: Vec<Issue>) -> ServerResult<Vec<Issue>> {
    let mut confirmed = Vec::with_capacity(suspects.len());

    for issue in suspects {
        let still_broken = match &issue {
            Issue::NarinfoDanglingNarfile { narinfo_id } => {
                match narinfo::Entity::find_by_id(*narinfo_id)
                    .one(state.database.connection())
                    .await
                    .map_err(ServerError::database_error)?
                {
                    Some(row) => match row.narfile_id {
                        Some(narfile_id) => {
                            state.database.get_narfile_by_id(narfile_id).await?.is_none()
                        }
                        None => false,
                    },
                    None => false,
                }
            }
            Issue::NarfileOrphaned { narfile_id } => {
                let holders = narinfo::Entity::find()
                    .filter(narinfo::Column::NarfileId.eq(*narfile_id))
                    .all(state.database.connection())
                    .await
                    .map_err(ServerError::database_error)?;
                holders.is_empty() && state.database.get_narfile_by_id(*narfile_id).await?.is_some()
            }
            Issue::NarfileBlobMissing { narfile_id } => {
                match state.database.get_narfile_by_id(*narfile_id).await? {
                    Some(row) => {
                        let blob_name =
                            format!("{}.{}", row.nar_hash.replace(':', "-"), row.compression);
                        !state.blob_store.has_blob(&blob_name).await?
                    }
                    None => false,
                }
            }
            Issue::OrphanBlobFile { name } => {
                let present = state.blob_store.has_blob(name).await?;
                let referenced = state
                    .database
                    .get_all_narfiles()
                    .await?
                    .iter()
                    .filter(|n| n.total_chunks == 0)
                    .any(|n| format!("{}.{}", n.nar_hash.replace(':', "-"), n.compression) == *name);
                present && !referenced
            }
            Issue::OrphanChunkRow { chunk_id } => {
                match chunk::Entity::find_by_id(*chunk_id)
                    .one(state.database.connection())
                    .await
                    .map_err(ServerError::database_error)?
                {
                    Some(row) => row.holders_count <= 0,
                    None => false,
                }
            }
            Issue::OrphanChunkFile { hash } => state.chunk_store.has_chunk(hash).await?,
            Issue::NarfileChunksIncomplete { narfile_id } => {
                match state.database.get_narfile_by_id(*narfile_id).await? {
                    Some(row) if row.total_chunks > 0 => {
                        let links = state.database.get_narfile_chunks(row.id).await?;
                        links.len() as i32 != row.total_chunks
                            || links.iter().any(|l| l.chunk_id.is_none())
                    }
                    _ => false,
                }
            }
        };

        if still_broken {
            confirmed.push(issue);
        }
    }

    Ok(confirmed)
}

/// Phase 3: apply the prescribed repair for each surviving issue, in an
/// order that keeps the state consistent for any concurrent reader:
/// narfile rows first, then the narinfos that drop out because of it,
/// then the chunks that drop out because of those.
async fn repair_issues(state: &State, issues: Vec<Issue>) -> ServerResult<usize> {
    let mut repaired = 0usize;
    let mut broken_narfile_ids = HashSet::new();

    for issue in &issues {
        match issue {
            Issue::NarfileOrphaned { narfile_id }
            | Issue::NarfileBlobMissing { narfile_id }
            | Issue::NarfileChunksIncomplete { narfile_id } => {
                broken_narfile_ids.insert(*narfile_id);
            }
            _ => {}
        }
    }

    for narfile_id in &broken_narfile_ids {
        delete_narfile_and_cascade(state, *narfile_id).await?;
        repaired += 1;
    }

    for issue in &issues {
        match issue {
            Issue::NarinfoDanglingNarfile { narinfo_id } => {
                state.database.delete_narinfo(*narinfo_id).await?;
                repaired += 1;
            }
            Issue::OrphanBlobFile { name } => {
                state.blob_store.delete_blob(name).await?;
                repaired += 1;
            }
            Issue::OrphanChunkRow { chunk_id } => {
                if let Some(row) = chunk::Entity::find_by_id(*chunk_id)
                    .one(state.database.connection())
                    .await
                    .map_err(ServerError::database_error)?
                {
                    let _ = state.chunk_store.delete_chunk(&row.chunk_hash).await;
                }
                state.database.delete_chunk(*chunk_id).await?;
                repaired += 1;
            }
            Issue::OrphanChunkFile { hash } => {
                state.chunk_store.delete_chunk(hash).await?;
                repaired += 1;
            }
            _ => {}
        }
    }

    // Narinfos orphaned by the narfile deletions above: any narinfo still
    // pointing at one of the now-gone ids.
    for narfile_id in &broken_narfile_ids {
        let dangling = narinfo::Entity::find()
            .filter(narinfo::Column::NarfileId.eq(*narfile_id))
            .all(state.database.connection())
            .await
            .map_err(ServerError::database_error)?;
        for row in dangling {
            state.database.delete_narinfo(row.id).await?;
        }
    }

    // Chunks orphaned by the above: same query `reap_orphan_chunks` uses.
    for chunk_row in state.database.get_orphaned_chunks().await? {
        let _ = state.chunk_store.delete_chunk(&chunk_row.chunk_hash).await;
        state.database.delete_chunk(chunk_row.id).await?;
    }

    Ok(repaired)
}

async fn delete_narfile_and_cascade(state: &State, narfile_id: i64) -> ServerResult<()> {
    let Some(narfile) = state.database.get_narfile_by_id(narfile_id).await? else {
        return Ok(());
    };

    if narfile.total_chunks > 0 {
        for link in state.database.get_narfile_chunks(narfile_id).await? {
            if let Some(chunk_id) = link.chunk_id {
                decrement_chunk_holders(state, chunk_id).await?;
            }
        }
    } else {
        let blob_name = format!("{}.{}", narfile.nar_hash.replace(':', "-"), narfile.compression);
        let _ = state.blob_store.delete_blob(&blob_name).await;
    }

    state.database.delete_narfile(narfile_id).await?;
    Ok(())
}

async fn decrement_chunk_holders(state: &State, chunk_id: i64) -> ServerResult<()> {
    use sea_orm::{ActiveModelTrait, Set};
    let Some(model) = chunk::Entity::find_by_id(chunk_id)
        .one(state.database.connection())
        .await
        .map_err(ServerError::database_error)?
    else {
        return Ok(());
    };

    let mut active: chunk::ActiveModel = model.clone().into();
    active.holders_count = Set((model.holders_count - 1).max(0));
    active
        .update(state.database.connection())
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}
