//! Create email event table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EmailEvent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EmailEvent::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EmailEvent::MessageId).string().null())
                    .col(ColumnDef::new(EmailEvent::Type).string().not_null())
                    .col(ColumnDef::new(EmailEvent::ProviderEventId).string().null())
                    .col(ColumnDef::new(EmailEvent::Email).string().null())
                    .col(
                        ColumnDef::new(EmailEvent::OccurredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailEvent::Payload)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(EmailEvent::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_email_event_message")
                            .from(EmailEvent::Table, EmailEvent::MessageId)
                            .to(EmailMessage::Table, EmailMessage::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_event_message_id_occurred_at")
                    .table(EmailEvent::Table)
                    .col(EmailEvent::MessageId)
                    .col(EmailEvent::OccurredAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailEvent::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum EmailEvent {
    Table,
    Id,
    MessageId,
    #[iden = "type"]
    Type,
    ProviderEventId,
    Email,
    OccurredAt,
    Payload,
    CreatedAt,
}

#[derive(Iden)]
pub enum EmailMessage {
    Table,
    Id,
}
