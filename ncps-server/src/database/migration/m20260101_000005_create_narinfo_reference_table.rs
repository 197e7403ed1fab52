use sea_orm_migration::prelude::*;

use crate::database::entity::narinfo;
use crate::database::entity::narinfo_reference::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260101_000005_create_narinfo_reference_table"
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
                    .col(ColumnDef::new(Column::NarinfoId).big_integer().not_null())
                    .col(ColumnDef::new(Column::Reference).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-narinfo-reference-narinfo")
                            .from(Entity, Column::NarinfoId)
                            .to(narinfo::Entity, narinfo::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narinfo-reference-narinfo")
                    .table(Entity)
                    .col(Column::NarinfoId)
                    .to_owned(),
            )
            .await
    }
}
