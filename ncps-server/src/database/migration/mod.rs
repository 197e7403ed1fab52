//! Database migrations.

pub use sea_orm_migration::*;

mod m20260101_000001_create_config_table;
mod m20260101_000002_create_chunk_table;
mod m20260101_000003_create_narfile_table;
mod m20260101_000004_create_narinfo_table;
mod m20260101_000005_create_narinfo_reference_table;
mod m20260101_000006_create_narinfo_signature_table;
mod m20260101_000007_create_narfile_chunk_table;
mod m20260101_000008_create_dlock_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_config_table::Migration),
            Box::new(m20260101_000002_create_chunk_table::Migration),
            Box::new(m20260101_000003_create_narfile_table::Migration),
            Box::new(m20260101_000004_create_narinfo_table::Migration),
            Box::new(m20260101_000005_create_narinfo_reference_table::Migration),
            Box::new(m20260101_000006_create_narinfo_signature_table::Migration),
            Box::new(m20260101_000007_create_narfile_chunk_table::Migration),
            Box::new(m20260101_000008_create_dlock_table::Migration),
        ]
    }
}
