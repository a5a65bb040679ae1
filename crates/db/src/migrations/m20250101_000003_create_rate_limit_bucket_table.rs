//! Create rate limit bucket table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RateLimitBucket::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RateLimitBucket::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RateLimitBucket::Count)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateLimitBucket::ResetAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Expired bucket sweeps scan by reset time
        manager
            .create_index(
                Index::create()
                    .name("idx_rate_limit_bucket_reset_at")
                    .table(RateLimitBucket::Table)
                    .col(RateLimitBucket::ResetAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RateLimitBucket::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum RateLimitBucket {
    Table,
    Key,
    Count,
    ResetAt,
}
