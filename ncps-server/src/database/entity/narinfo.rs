//! Metadata for a single Nix store path, mirroring a `.narinfo` file.

use sea_orm::entity::prelude::*;

pub type NarinfoModel = Model;

/// Metadata for a single Nix store path.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "narinfo")]
pub struct Model {
    /// Unique numeric ID of the narinfo.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The 32-character Nix store path hash, e.g. `fiwsv60kgwrfvib2nf9dkq9q8bk1h7qh`.
    #[sea_orm(unique)]
    pub store_path_hash: String,

    /// The full store path, e.g. `/nix/store/fiwsv6...-hello-2.12.1`.
    pub store_path: String,

    /// Relative URL of the NAR on the upstream cache, as recorded in the
    /// upstream narinfo's `URL` field. Retained for re-fetching on a cache
    /// miss after eviction.
    pub url: String,

    /// Compression the upstream NAR is encoded with.
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// SHA-256 hash of the as-stored (possibly compressed) NAR bytes.
    pub file_hash: String,

    /// Size in bytes of the as-stored NAR bytes.
    pub file_size: i64,

    /// SHA-256 hash of the decompressed NAR bytes, typed (`sha256:...`).
    ///
    /// Matches `narfile.nar_hash` of the linked narfile.
    pub nar_hash: String,

    /// Size in bytes of the decompressed NAR bytes.
    pub nar_size: i64,

    /// The narfile backing this store path's payload bytes.
    ///
    /// `None` until the fill path has finished fetching from upstream.
    pub narfile_id: Option<i64>,

    /// The store path of the deriver, if known.
    pub deriver: Option<String>,

    /// The target system tuple, if known (e.g. `x86_64-linux`).
    pub system: Option<String>,

    /// Content-addressing field, if the path is content-addressed.
    pub ca: Option<String>,

    /// Timestamp when this narinfo was first fetched from upstream.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp this narinfo was last served to a client.
    pub last_accessed_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::narfile::Entity",
        from = "Column::NarfileId",
        to = "super::narfile::Column::Id"
    )]
    Narfile,

    #[sea_orm(has_many = "super::narinfo_reference::Entity")]
    NarinfoReference,

    #[sea_orm(has_many = "super::narinfo_signature::Entity")]
    NarinfoSignature,
}

impl Related<super::narfile::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Narfile.def()
    }
}

impl Related<super::narinfo_reference::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarinfoReference.def()
    }
}

impl Related<super::narinfo_signature::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarinfoSignature.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
