//! Cluster-wide configuration persisted in the database rather than a config
//! file, because it must never change across restarts once set (e.g. the
//! chunking parameters, which determine chunk boundaries and therefore
//! dedup correctness).

use sea_orm::entity::prelude::*;

pub type ConfigModel = Model;

/// A single cluster configuration key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "config")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    pub value: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Well-known configuration keys.
pub mod keys {
    /// Randomly-generated UUID identifying this cluster's on-disk layout.
    pub const CLUSTER_ID: &str = "cluster.id";

    /// Whether CDC chunking is enabled cluster-wide.
    pub const CDC_ENABLED: &str = "cdc.enabled";

    /// Minimum chunk size in bytes, fixed at cluster creation time.
    pub const CDC_MIN_SIZE: &str = "cdc.min_size";

    /// Average (target) chunk size in bytes, fixed at cluster creation time.
    pub const CDC_AVG_SIZE: &str = "cdc.avg_size";

    /// Maximum chunk size in bytes, fixed at cluster creation time.
    pub const CDC_MAX_SIZE: &str = "cdc.max_size";
}
