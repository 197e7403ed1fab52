//! Metadata database.
//!
//! One operation set, three dialects (SQLite, PostgreSQL, MySQL) through a
//! single [`sea_orm::DatabaseConnection`]. All multi-table mutations run in
//! a transaction; the join-writes in [`Database::link_narfile_to_chunks`] in
//! particular are atomic with the narfile they attach to.

pub mod entity;
pub mod migration;

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};

use chrono::Duration as ChronoDuration;

use crate::error::{ServerError, ServerResult};
use entity::{
    chunk, config, dlock, narfile, narfile_chunk, narinfo, narinfo_reference, narinfo_signature,
};

/// Wraps the raw connection with the operation set the cache core, fsck,
/// and migration pipelines depend on.
#[derive(Debug, Clone)]
pub struct Database {
    conn: DatabaseConnection,
}

/// A narinfo row together with its references and signatures, as needed
/// to reconstruct a full `.narinfo` response or feed the fingerprint.
#[derive(Debug, Clone)]
pub struct NarinfoWithDetails {
    pub narinfo: narinfo::Model,
    pub references: Vec<String>,
    pub signatures: Vec<String>,
}

/// Returns whether a database error represents a unique-key violation,
/// across SQLite, PostgreSQL, and MySQL error message formats.
fn is_duplicate_key(err: &DbErr) -> bool {
    let msg = err.to_string();
    msg.contains("UNIQUE constraint failed")
        || msg.contains("duplicate key value")
        || msg.contains("Duplicate entry")
}

impl Database {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    // ---- Config ----------------------------------------------------

    pub async fn get_config(&self, key: &str) -> ServerResult<Option<String>> {
        let row = config::Entity::find_by_id(key.to_string())
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)?;
        Ok(row.map(|r| r.value))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> ServerResult<()> {
        let model = config::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
        };

        config::Entity::insert(model)
            .on_conflict(
                OnConflict::column(config::Column::Key)
                    .update_column(config::Column::Value)
                    .to_owned(),
            )
            .exec(&self.conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    // ---- Narinfo -----------------------------------------------------

    pub async fn get_narinfo_by_hash(
        &self,
        store_path_hash: &str,
    ) -> ServerResult<Option<NarinfoWithDetails>> {
        let Some(model) = narinfo::Entity::find()
            .filter(narinfo::Column::StorePathHash.eq(store_path_hash))
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)?
        else {
            return Ok(None);
        };

        let references = narinfo_reference::Entity::find()
            .filter(narinfo_reference::Column::NarinfoId.eq(model.id))
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)?
            .into_iter()
            .map(|r| r.reference)
            .collect();

        let signatures = narinfo_signature::Entity::find()
            .filter(narinfo_signature::Column::NarinfoId.eq(model.id))
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)?
            .into_iter()
            .map(|s| s.signature)
            .collect();

        Ok(Some(NarinfoWithDetails {
            narinfo: model,
            references,
            signatures,
        }))
    }

    /// Inserts a narinfo row together with its references and signatures in
    /// a single transaction.
    pub async fn insert_narinfo(
        &self,
        model: narinfo::ActiveModel,
        references: &[String],
        signatures: &[String],
    ) -> ServerResult<narinfo::Model> {
        let txn = self
            .conn
            .begin()
            .await
            .map_err(ServerError::database_error)?;

        let inserted = match model.insert(&txn).await {
            Ok(m) => m,
            Err(e) if is_duplicate_key(&e) => return Err(ServerError::DuplicateKey),
            Err(e) => return Err(ServerError::database_error(e)),
        };

        for reference in references {
            narinfo_reference::ActiveModel {
                narinfo_id: Set(inserted.id),
                reference: Set(reference.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServerError::database_error)?;
        }

        for signature in signatures {
            narinfo_signature::ActiveModel {
                narinfo_id: Set(inserted.id),
                signature: Set(signature.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServerError::database_error)?;
        }

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(inserted)
    }

    pub async fn touch_narinfo_last_accessed(&self, id: i64) -> ServerResult<()> {
        let mut model: narinfo::ActiveModel = narinfo::Entity::find_by_id(id)
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchNarinfo)?
            .into();

        model.last_accessed_at = Set(Utc::now());
        model
            .update(&self.conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    pub async fn delete_narinfo(&self, id: i64) -> ServerResult<()> {
        narinfo::Entity::delete_by_id(id)
            .exec(&self.conn)
            .await
            .map_err(ServerError::database_error)?;
        Ok(())
    }

    /// Narinfo rows awaiting their first upstream fetch.
    pub async fn get_narinfos_without_narfiles(&self) -> ServerResult<Vec<narinfo::Model>> {
        narinfo::Entity::find()
            .filter(narinfo::Column::NarfileId.is_null())
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    // ---- Narfile -----------------------------------------------------

    pub async fn get_narfile_by_id(&self, id: i64) -> ServerResult<Option<narfile::Model>> {
        narfile::Entity::find_by_id(id)
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    pub async fn get_narfile_by_nar_hash(
        &self,
        nar_hash: &str,
    ) -> ServerResult<Option<narfile::Model>> {
        narfile::Entity::find()
            .filter(narfile::Column::NarHash.eq(nar_hash))
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    pub async fn insert_narfile(
        &self,
        model: narfile::ActiveModel,
    ) -> ServerResult<narfile::Model> {
        match model.insert(&self.conn).await {
            Ok(m) => Ok(m),
            Err(e) if is_duplicate_key(&e) => Err(ServerError::DuplicateKey),
            Err(e) => Err(ServerError::database_error(e)),
        }
    }

    pub async fn touch_narfile_last_accessed(&self, id: i64) -> ServerResult<()> {
        let mut model: narfile::ActiveModel = narfile::Entity::find_by_id(id)
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchNar)?
            .into();

        model.last_accessed_at = Set(Utc::now());
        model
            .update(&self.conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    /// Advances the "last seen consistent" timestamp so fsck can skip this
    /// narfile under `--verified-since`.
    pub async fn update_narfile_verified_at(&self, id: i64) -> ServerResult<()> {
        let mut model: narfile::ActiveModel = narfile::Entity::find_by_id(id)
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchNar)?
            .into();

        model.verified_at = Set(Some(Utc::now()));
        model
            .update(&self.conn)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    pub async fn delete_narfile(&self, id: i64) -> ServerResult<()> {
        narfile::Entity::delete_by_id(id)
            .exec(&self.conn)
            .await
            .map_err(ServerError::database_error)?;
        Ok(())
    }

    /// Narfiles with zero holders: candidates for reaping.
    pub async fn get_orphaned_narfiles(&self) -> ServerResult<Vec<narfile::Model>> {
        narfile::Entity::find()
            .filter(narfile::Column::HoldersCount.lte(0))
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    /// Full scan for fsck and migrations.
    pub async fn get_all_narfiles(&self) -> ServerResult<Vec<narfile::Model>> {
        narfile::Entity::find()
            .order_by_asc(narfile::Column::Id)
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    /// Narfiles least-recently accessed first, for LRU eviction.
    pub async fn get_narfiles_by_last_accessed(&self) -> ServerResult<Vec<narfile::Model>> {
        narfile::Entity::find()
            .filter(narfile::Column::HoldersCount.gt(0))
            .order_by_asc(narfile::Column::LastAccessedAt)
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    /// Whole narfiles (`total_chunks == 0`) not yet split by the CDC
    /// migration pipeline.
    pub async fn get_narinfo_hashes_to_chunk(&self) -> ServerResult<Vec<narfile::Model>> {
        narfile::Entity::find()
            .filter(narfile::Column::TotalChunks.eq(0))
            .filter(narfile::Column::State.eq(narfile::NarfileState::Valid))
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    /// CDC-mode fallback detection for fsck when the `cdc.enabled` config
    /// key is missing: whether any narfile has ever been chunked.
    pub async fn has_any_chunked_narfiles(&self) -> ServerResult<bool> {
        let count = narfile::Entity::find()
            .filter(narfile::Column::TotalChunks.gt(0))
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)?
            .len();
        Ok(count > 0)
    }

    // ---- Chunk ---------------------------------------------------------

    pub async fn get_chunk_by_hash(&self, chunk_hash: &str) -> ServerResult<Option<chunk::Model>> {
        chunk::Entity::find()
            .filter(chunk::Column::ChunkHash.eq(chunk_hash))
            .one(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    pub async fn insert_chunk(&self, model: chunk::ActiveModel) -> ServerResult<chunk::Model> {
        match model.insert(&self.conn).await {
            Ok(m) => Ok(m),
            Err(e) if is_duplicate_key(&e) => Err(ServerError::DuplicateKey),
            Err(e) => Err(ServerError::database_error(e)),
        }
    }

    pub async fn delete_chunk(&self, id: i64) -> ServerResult<()> {
        chunk::Entity::delete_by_id(id)
            .exec(&self.conn)
            .await
            .map_err(ServerError::database_error)?;
        Ok(())
    }

    /// Full scan for fsck and migrations.
    pub async fn get_all_chunks(&self) -> ServerResult<Vec<chunk::Model>> {
        chunk::Entity::find()
            .order_by_asc(chunk::Column::Id)
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    /// Chunks with zero link rows: candidates for reaping.
    pub async fn get_orphaned_chunks(&self) -> ServerResult<Vec<chunk::Model>> {
        chunk::Entity::find()
            .filter(chunk::Column::HoldersCount.lte(0))
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    // ---- narfile <-> chunk join -----------------------------------------

    /// Atomically links a narfile to its ordered sequence of chunks.
    ///
    /// `chunk_ids`/`chunk_hashes` must be parallel and in chunk order.
    pub async fn link_narfile_to_chunks(
        &self,
        narfile_id: i64,
        chunk_ids: &[i64],
        chunk_hashes: &[String],
    ) -> ServerResult<()> {
        assert_eq!(chunk_ids.len(), chunk_hashes.len());

        let txn = self
            .conn
            .begin()
            .await
            .map_err(ServerError::database_error)?;

        for (idx, (chunk_id, chunk_hash)) in chunk_ids.iter().zip(chunk_hashes.iter()).enumerate() {
            narfile_chunk::ActiveModel {
                narfile_id: Set(narfile_id),
                idx: Set(idx as i32),
                chunk_id: Set(Some(*chunk_id)),
                chunk_hash: Set(chunk_hash.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServerError::database_error)?;
        }

        let found = narfile::Entity::find_by_id(narfile_id)
            .one(&txn)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchNar)?;
        let nar_size = found.nar_size;
        let mut narfile_model: narfile::ActiveModel = found.into();
        narfile_model.total_chunks = Set(chunk_ids.len() as i32);
        // Chunked narfiles are always reassembled from their decompressed
        // bytes, so the as-served representation is always "none" /
        // nar_size from here on, regardless of what it was stored as
        // before chunking.
        narfile_model.compression = Set("none".to_string());
        narfile_model.file_size = Set(nar_size);
        narfile_model.updated_at = Set(Utc::now());
        narfile_model
            .update(&txn)
            .await
            .map_err(ServerError::database_error)?;

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(())
    }

    pub async fn get_narfile_chunks(
        &self,
        narfile_id: i64,
    ) -> ServerResult<Vec<narfile_chunk::Model>> {
        narfile_chunk::Entity::find()
            .filter(narfile_chunk::Column::NarfileId.eq(narfile_id))
            .order_by_asc(narfile_chunk::Column::Idx)
            .all(&self.conn)
            .await
            .map_err(ServerError::database_error)
    }

    // ---- Row-backed distributed lock -------------------------------------

    /// Tries to acquire (or renew, as the same owner) the row lock `key`.
    ///
    /// Succeeds if the row doesn't exist, is held by `owner` already, or has
    /// expired. Implemented as a transaction rather than a single upsert
    /// because the "is it expired" check has to read-then-write atomically
    /// and `ON CONFLICT` alone can't express "skip the update if the
    /// existing row is still live and owned by someone else".
    pub async fn try_acquire_row_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: std::time::Duration,
    ) -> ServerResult<bool> {
        let txn = self
            .conn
            .begin()
            .await
            .map_err(ServerError::database_error)?;

        let now = Utc::now();
        let existing = dlock::Entity::find_by_id(key.to_string())
            .one(&txn)
            .await
            .map_err(ServerError::database_error)?;

        if let Some(row) = &existing {
            if row.owner != owner && row.expires_at > now {
                return Ok(false);
            }
        }

        let expires_at = now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(30));
        let model = dlock::ActiveModel {
            key: Set(key.to_string()),
            owner: Set(owner.to_string()),
            expires_at: Set(expires_at),
        };

        dlock::Entity::insert(model)
            .on_conflict(
                OnConflict::column(dlock::Column::Key)
                    .update_columns([dlock::Column::Owner, dlock::Column::ExpiresAt])
                    .to_owned(),
            )
            .exec(&txn)
            .await
            .map_err(ServerError::database_error)?;

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(true)
    }

    /// Releases `key` if and only if it's still held by `owner`.
    pub async fn release_row_lock(&self, key: &str, owner: &str) -> ServerResult<()> {
        dlock::Entity::delete_many()
            .filter(dlock::Column::Key.eq(key.to_string()))
            .filter(dlock::Column::Owner.eq(owner.to_string()))
            .exec(&self.conn)
            .await
            .map_err(ServerError::database_error)?;
        Ok(())
    }
}
