use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Bots::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Bots::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Bots::UserId).uuid().not_null())
                    .col(ColumnDef::new(Bots::BotName).string().not_null())
                    .col(
                        ColumnDef::new(Bots::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bots_user_id")
                    .table(Bots::Table)
                    .col(Bots::UserId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bots::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Bots {
    Table,
    Id,
    UserId,
    BotName,
    CreatedAt,
}
