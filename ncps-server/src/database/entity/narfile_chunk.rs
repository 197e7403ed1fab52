//! An ordered link between a narfile and one of its constituent chunks.
//!
//! `chunk_hash` is denormalized from `chunk` so that a narfile's expected
//! chunk sequence survives even if the matching `chunk` row has been
//! reaped; fsck uses this to tell "missing chunk" apart from "never had
//! this chunk" when repairing.

use sea_orm::entity::prelude::*;

pub type NarfileChunkModel = Model;

/// An ordered link between a narfile and a chunk.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "narfile_chunk")]
pub struct Model {
    /// Unique numeric ID of the link.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The narfile this chunk belongs to.
    #[sea_orm(indexed)]
    pub narfile_id: i64,

    /// Zero-based position of this chunk within the narfile.
    pub idx: i32,

    /// The chunk, if it still exists.
    ///
    /// `None` is a fsck deviation: the narfile expects a chunk at this
    /// position but it has been lost.
    pub chunk_id: Option<i64>,

    /// BLAKE3-256 hash of the chunk at this position, hex-encoded.
    ///
    /// Kept even if `chunk_id` becomes `None` so repair can re-fetch by
    /// hash without re-deriving the chunk boundaries from upstream.
    pub chunk_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::narfile::Entity",
        from = "Column::NarfileId",
        to = "super::narfile::Column::Id"
    )]
    Narfile,

    #[sea_orm(
        belongs_to = "super::chunk::Entity",
        from = "Column::ChunkId",
        to = "super::chunk::Column::Id"
    )]
    Chunk,
}

impl Related<super::narfile::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Narfile.def()
    }
}

impl Related<super::chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
