//! A single signature attached to a narinfo.
//!
//! Nix narinfos carry a *set* of `Sig:` lines, one per signing key that has
//! vouched for the path. We keep our own re-signature alongside whatever
//! upstream signatures we chose to preserve, so this is a proper one-to-many
//! table rather than the single `Option<String>` column the single-signer
//! assumption would suggest.

use sea_orm::entity::prelude::*;

pub type NarinfoSignatureModel = Model;

/// A single signature belonging to a narinfo.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "narinfo_signature")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The narinfo this signature belongs to.
    #[sea_orm(indexed)]
    pub narinfo_id: i64,

    /// The signature in canonical `keyName:base64Payload` form.
    pub signature: String,
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
