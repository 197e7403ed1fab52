//! Row-backed lock table used by the PostgreSQL/MySQL/SQLite lock backend.
//!
//! A lock is a single row keyed by its name. Acquisition is a conditional
//! upsert (`INSERT ... ON CONFLICT DO UPDATE WHERE` the existing row is
//! unheld or expired); release is a conditional delete keyed by owner so a
//! stale holder can never clobber someone else's lock.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "dlock")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub owner: String,
    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
