//! A single entry in a narinfo's `References:` list.
//!
//! Stored as its own table (rather than a space-joined column) because the
//! upstream narinfo's reference list is a set with no useful ordering
//! constraint of its own, and splitting it out lets fsck and migration
//! queries join against it directly.

use sea_orm::entity::prelude::*;

pub type NarinfoReferenceModel = Model;

/// A single store path reference belonging to a narinfo.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "narinfo_reference")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The narinfo this reference belongs to.
    #[sea_orm(indexed)]
    pub narinfo_id: i64,

    /// The base name of the referenced store path (no `/nix/store/` prefix).
    pub reference: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::narinfo::Entity",
        from = "Column::NarinfoId",
        to = "super::narinfo::Column::Id"
    )]
    Narinfo,
}

impl Related<super::narinfo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Narinfo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
