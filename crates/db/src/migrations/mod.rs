//! Database migrations.
//!
//! Schema migrations for the email and rate-limit tables. The background task
//! table is created on demand by the task repository.

#![allow(missing_docs)]

use sea_orm_migration::prelude::*;

mod m20250101_000001_create_email_message_table;
mod m20250101_000002_create_email_event_table;
mod m20250101_000003_create_rate_limit_bucket_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_email_message_table::Migration),
            Box::new(m20250101_000002_create_email_event_table::Migration),
            Box::new(m20250101_000003_create_rate_limit_bucket_table::Migration),
        ]
    }
}
