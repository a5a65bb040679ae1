//! Rate limit bucket repository.

use std::sync::Arc;

use crate::entities::{RateLimitBucket, rate_limit_bucket};
use atelier_common::{AppError, AppResult};
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait, sea_query::{Expr, OnConflict},
};

/// Rate limit bucket repository for database operations.
#[derive(Clone)]
pub struct RateLimitBucketRepository {
    db: Arc<DatabaseConnection>,
}

impl RateLimitBucketRepository {
    /// Create a new rate limit bucket repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Read-modify-write a bucket under a row lock.
    ///
    /// A missing bucket is created with `count = 0` and `reset_at = now`
    /// (an already expired window). `update` receives the locked row and
    /// returns the row to store plus a caller-defined result.
    pub async fn update_locked<T, F>(&self, key: &str, now: DateTime<Utc>, update: F) -> AppResult<T>
    where
        F: FnOnce(rate_limit_bucket::Model) -> (rate_limit_bucket::Model, T) + Send,
        T: Send,
    {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let seed = rate_limit_bucket::ActiveModel {
            key: Set(key.to_string()),
            count: Set(0),
            reset_at: Set(now.fixed_offset()),
        };
        RateLimitBucket::insert(seed)
            .on_conflict(
                OnConflict::column(rate_limit_bucket::Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let current = RateLimitBucket::find_by_id(key)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?
            .ok_or_else(|| AppError::Database(format!("Rate limit bucket vanished: {key}")))?;

        let (next, result) = update(current);

        RateLimitBucket::update_many()
            .col_expr(rate_limit_bucket::Column::Count, Expr::value(next.count))
            .col_expr(rate_limit_bucket::Column::ResetAt, Expr::value(next.reset_at))
            .filter(rate_limit_bucket::Column::Key.eq(key))
            .exec(&txn)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        txn.commit()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result)
    }

    /// Delete buckets whose window ended before `now`.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = RateLimitBucket::delete_many()
            .filter(rate_limit_bucket::Column::ResetAt.lt(now.fixed_offset()))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(result.rows_affected)
    }
}
