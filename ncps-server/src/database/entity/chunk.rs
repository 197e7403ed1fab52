//! A content-addressed chunk in the local chunk store.
//!
//! Unlike the upstream `narfile`, a chunk's backing file location is never
//! stored in the database: the chunk store is fully content-addressed, so
//! the path is always derivable from `chunk_hash` (see
//! `crate::storage::shard_path`).

use sea_orm::entity::prelude::*;

pub type ChunkModel = Model;

/// The state of a chunk.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(1))")]
pub enum ChunkState {
    /// The chunk's bytes are present in the chunk store and it has readers.
    #[sea_orm(string_value = "V")]
    Valid,

    /// The chunk is in the middle of being written by an ingestion worker.
    #[sea_orm(string_value = "P")]
    PendingUpload,
}

/// A content-addressed chunk in the local chunk store.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "chunk")]
pub struct Model {
    /// Unique numeric ID of the chunk.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The state of the chunk.
    pub state: ChunkState,

    /// BLAKE3-256 hash of the uncompressed chunk, hex-encoded.
    #[sea_orm(unique)]
    pub chunk_hash: String,

    /// Size in bytes of the uncompressed chunk.
    pub chunk_size: i64,

    /// Size in bytes of the zstd-compressed chunk as stored on disk/S3.
    ///
    /// Absent while the chunk is still `PendingUpload`.
    pub compressed_size: Option<i64>,

    /// Number of narfiles currently holding a reference to this chunk.
    ///
    /// Used to prevent fsck/eviction from deleting a chunk a migration
    /// worker is about to link into a narfile.
    pub holders_count: i32,

    /// Timestamp when the chunk row was created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::narfile_chunk::Entity")]
    NarfileChunk,
}

impl Related<super::narfile_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarfileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
