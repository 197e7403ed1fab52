use sea_orm_migration::prelude::*;

use crate::database::entity::chunk;
use crate::database::entity::narfile;
use crate::database::entity::narfile_chunk::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260101_000007_create_narfile_chunk_table"
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
                    .col(ColumnDef::new(Column::NarfileId).big_integer().not_null())
                    .col(ColumnDef::new(Column::Idx).integer().not_null())
                    .col(ColumnDef::new(Column::ChunkId).big_integer().null())
                    .col(
                        ColumnDef::new(Column::ChunkHash)
                            .string_len(80)
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-narfile-chunk-narfile")
                            .from(Entity, Column::NarfileId)
                            .to(narfile::Entity, narfile::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-narfile-chunk-chunk")
                            .from(Entity, Column::ChunkId)
                            .to(chunk::Entity, chunk::Column::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narfile-chunk-narfile")
                    .table(Entity)
                    .col(Column::NarfileId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narfile-chunk-chunk")
                    .table(Entity)
                    .col(Column::ChunkId)
                    .to_owned(),
            )
            .await
    }
}
