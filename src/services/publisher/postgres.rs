use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Instant;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{ItemId, ListSource, RecommendationList, UserId},
    services::publisher::{ensure_unique_users, RecommendationWriter},
};

/// Rows per INSERT statement, four binds each
const INSERT_CHUNK_ROWS: usize = 5_000;

/// Versioned-pointer writer over `recommendation_snapshots`
///
/// A publish inserts a fresh snapshot, flips the singleton pointer row to it
/// and drops every superseded snapshot, all inside one transaction.
#[derive(Clone)]
pub struct PgRecommendationWriter {
    pool: PgPool,
}

impl PgRecommendationWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lists currently visible to readers, ordered by user
    pub async fn published(&self) -> AppResult<Vec<RecommendationList>> {
        let rows: Vec<(UserId, Vec<ItemId>, String)> = sqlx::query_as(
            "SELECT r.user_id, r.items, r.source \
             FROM recommendations r \
             JOIN recommendation_pointer p ON r.snapshot_version = p.active_version \
             ORDER BY r.user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, items, source)| {
                let source = ListSource::parse(&source).ok_or_else(|| {
                    AppError::InvalidData(format!("Unknown list source '{}'", source))
                })?;
                Ok(RecommendationList::new(user_id, items, source))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl RecommendationWriter for PgRecommendationWriter {
    async fn replace_all(&self, run_id: Uuid, lists: &[RecommendationList]) -> AppResult<i64> {
        ensure_unique_users(lists)?;
        let start = Instant::now();

        let mut tx = self.pool.begin().await?;

        // Serializes concurrent publishers on the pointer row
        let previous: Option<i64> = sqlx::query_scalar(
            "SELECT active_version FROM recommendation_pointer WHERE id FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await?;

        let user_count = i32::try_from(lists.len())
            .map_err(|_| AppError::InvalidData("Too many recommendation lists".to_string()))?;

        let version: i64 = sqlx::query_scalar(
            "INSERT INTO recommendation_snapshots (run_id, user_count) \
             VALUES ($1, $2) RETURNING version",
        )
        .bind(run_id)
        .bind(user_count)
        .fetch_one(&mut *tx)
        .await?;

        for chunk in lists.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO recommendations (snapshot_version, user_id, items, source) ",
            );
            builder.push_values(chunk, |mut row, list| {
                row.push_bind(version)
                    .push_bind(list.user_id)
                    .push_bind(list.items.as_slice())
                    .push_bind(list.source.as_str());
            });
            builder.build().execute(&mut *tx).await?;
        }

        sqlx::query(
            "UPDATE recommendation_pointer \
             SET active_version = $1, published_at = NOW() \
             WHERE id",
        )
        .bind(version)
        .execute(&mut *tx)
        .await?;

        let superseded = sqlx::query("DELETE FROM recommendation_snapshots WHERE version <> $1")
            .bind(version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::info!(
            %run_id,
            version,
            previous_version = ?previous,
            superseded,
            rows = lists.len(),
            publish_time_ms = start.elapsed().as_millis(),
            "Published recommendation snapshot"
        );

        Ok(version)
    }

    async fn active_version(&self) -> AppResult<Option<i64>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT active_version FROM recommendation_pointer WHERE id")
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        Ok(version)
    }
}
