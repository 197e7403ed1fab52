use sea_orm_migration::prelude::*;

use crate::database::entity::narfile;
use crate::database::entity::narinfo::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260101_000004_create_narinfo_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Column::StorePathHash)
                            .string_len(32)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::StorePath).text().not_null())
                    .col(ColumnDef::new(Column::Url).text().not_null())
                    .col(
                        ColumnDef::new(Column::Compression)
                            .string_len(10)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::FileHash).string_len(80).not_null())
                    .col(ColumnDef::new(Column::FileSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::NarHash).string_len(80).not_null())
                    .col(ColumnDef::new(Column::NarSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::NarfileId).big_integer().null())
                    .col(ColumnDef::new(Column::Deriver).text().null())
                    .col(ColumnDef::new(Column::System).string_len(64).null())
                    .col(ColumnDef::new(Column::Ca).text().null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-narinfo-narfile")
                            .from(Entity, Column::NarfileId)
                            .to(narfile::Entity, narfile::Column::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narinfo-last-accessed")
                    .table(Entity)
                    .col(Column::LastAccessedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narinfo-narfile")
                    .table(Entity)
                    .col(Column::NarfileId)
                    .to_owned(),
            )
            .await
    }
}
