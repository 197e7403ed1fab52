//! A content-addressed NAR payload, possibly split into chunks.
//!
//! A `narfile` is identified by the NAR hash (the hash of the decompressed
//! NAR stream). Several `narinfo` rows with different store paths can point
//! at the same `narfile` when their build outputs happen to produce
//! byte-identical NARs.

use sea_orm::entity::prelude::*;

pub type NarfileModel = Model;

/// The state of a narfile.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(1))")]
pub enum NarfileState {
    /// The narfile is fully present (either as a single blob or fully
    /// chunked) and can be served.
    #[sea_orm(string_value = "V")]
    Valid,

    /// A fetch from upstream, or a chunking pass, is in progress.
    #[sea_orm(string_value = "P")]
    PendingUpload,
}

/// A content-addressed NAR payload.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "narfile")]
pub struct Model {
    /// Unique numeric ID of the narfile.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The state of the narfile.
    pub state: NarfileState,

    /// SHA-256 hash of the decompressed NAR, typed (`sha256:...`, hex).
    #[sea_orm(unique)]
    pub nar_hash: String,

    /// Size in bytes of the decompressed NAR.
    pub nar_size: i64,

    /// Compression used for the as-stored representation. Always `none`
    /// once `total_chunks > 0`: chunked narfiles are always reassembled
    /// from their decompressed bytes, never re-compressed.
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// Size in bytes of the as-stored representation: the compressed
    /// blob's length while whole (`total_chunks == 0`), or `nar_size`
    /// once chunked. This, not `nar_size`, is what `Content-Length` and
    /// the served narinfo's `FileSize` must agree with.
    pub file_size: i64,

    /// Number of chunks this narfile has been split into.
    ///
    /// Zero means the narfile is stored whole in the blob store rather than
    /// chunked (e.g. it predates a chunking migration, or is below the
    /// chunking size threshold).
    pub total_chunks: i32,

    /// When a chunking migration worker began splitting this narfile.
    ///
    /// Used to detect and resume/retry stalled chunking attempts.
    pub chunking_started_at: Option<ChronoDateTimeUtc>,

    /// Number of narinfo rows currently holding a reference to this narfile.
    pub holders_count: i32,

    /// Timestamp when the narfile row was created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp of the last modification (e.g. completion of chunking).
    pub updated_at: ChronoDateTimeUtc,

    /// Timestamp this narfile's payload was last served to a client.
    ///
    /// Drives LRU eviction.
    pub last_accessed_at: ChronoDateTimeUtc,

    /// Timestamp fsck last confirmed this narfile's payload matches its
    /// recorded hash and size.
    ///
    /// `None` means it has never been re-verified since ingestion.
    pub verified_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::narinfo::Entity")]
    Narinfo,

    #[sea_orm(has_many = "super::narfile_chunk::Entity")]
    NarfileChunk,
}

impl Related<super::narinfo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Narinfo.def()
    }
}

impl Related<super::narfile_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarfileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
