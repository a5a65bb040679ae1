//! Create email message table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EmailMessage::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EmailMessage::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EmailMessage::ToEmail).string().not_null())
                    .col(ColumnDef::new(EmailMessage::ToUserId).string().null())
                    .col(ColumnDef::new(EmailMessage::Provider).string().not_null())
                    .col(ColumnDef::new(EmailMessage::TemplateKey).string().not_null())
                    .col(
                        ColumnDef::new(EmailMessage::MessageType)
                            .string_len(32)
                            .not_null()
                            .default("transactional"),
                    )
                    .col(ColumnDef::new(EmailMessage::Topic).string().not_null())
                    .col(
                        ColumnDef::new(EmailMessage::Status)
                            .string_len(32)
                            .not_null()
                            .default("queued"),
                    )
                    .col(ColumnDef::new(EmailMessage::Subject).string().not_null())
                    .col(ColumnDef::new(EmailMessage::FromEmail).string().not_null())
                    .col(ColumnDef::new(EmailMessage::ReplyTo).string().null())
                    .col(ColumnDef::new(EmailMessage::Html).text().not_null())
                    .col(ColumnDef::new(EmailMessage::Text).text().not_null())
                    .col(ColumnDef::new(EmailMessage::CorrelationKey).string().null())
                    .col(
                        ColumnDef::new(EmailMessage::IdempotencyKey)
                            .string()
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::ScheduledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::Payload)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::Metadata)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::ProviderMessageId)
                            .string()
                            .null(),
                    )
                    .col(ColumnDef::new(EmailMessage::LastError).text().null())
                    .col(
                        ColumnDef::new(EmailMessage::SentAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::StatusUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(EmailMessage::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Webhook reconciliation looks messages up by provider id
        manager
            .create_index(
                Index::create()
                    .name("idx_email_message_provider_message_id")
                    .table(EmailMessage::Table)
                    .col(EmailMessage::ProviderMessageId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_message_status_created_at")
                    .table(EmailMessage::Table)
                    .col(EmailMessage::Status)
                    .col(EmailMessage::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailMessage::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum EmailMessage {
    Table,
    Id,
    ToEmail,
    ToUserId,
    Provider,
    TemplateKey,
    MessageType,
    Topic,
    Status,
    Subject,
    FromEmail,
    ReplyTo,
    Html,
    Text,
    CorrelationKey,
    IdempotencyKey,
    ScheduledAt,
    Payload,
    Metadata,
    Attempts,
    ProviderMessageId,
    LastError,
    SentAt,
    StatusUpdatedAt,
    CreatedAt,
    UpdatedAt,
}
