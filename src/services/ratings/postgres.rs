use sqlx::PgPool;
use std::time::Instant;

use crate::{
    error::{AppError, AppResult},
    models::{ItemId, Rating, RatingSnapshot, UserId},
    services::ratings::{quote_identifier, RatingStore, SourceSchema},
};

/// Reads ratings straight from the review application's tables
#[derive(Clone)]
pub struct PgRatingStore {
    pool: PgPool,
    ratings_sql: String,
    zero_rating_users_sql: String,
    catalog_sql: String,
}

impl PgRatingStore {
    pub fn new(pool: PgPool, schema: &SourceSchema) -> AppResult<Self> {
        let quote = |name: &str| quote_identifier(name).map_err(AppError::InvalidData);

        let reviews = quote(&schema.reviews_table)?;
        let user = quote(&schema.review_user_column)?;
        let item = quote(&schema.review_item_column)?;
        let score = quote(&schema.review_score_column)?;
        let users = quote(&schema.users_table)?;
        let items = quote(&schema.items_table)?;

        let ratings_sql = format!(
            "SELECT {user}::BIGINT, {item}::BIGINT, {score}::DOUBLE PRECISION \
             FROM {reviews} \
             WHERE {score}::DOUBLE PRECISION >= $1"
        );
        let zero_rating_users_sql = format!(
            "SELECT u.id::BIGINT FROM {users} u \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM {reviews} r \
                 WHERE r.{user} = u.id AND r.{score}::DOUBLE PRECISION >= $1 \
             )"
        );
        let catalog_sql = format!("SELECT id::BIGINT FROM {items}");

        Ok(Self {
            pool,
            ratings_sql,
            zero_rating_users_sql,
            catalog_sql,
        })
    }
}

#[async_trait::async_trait]
impl RatingStore for PgRatingStore {
    async fn load_snapshot(&self, min_rating: f64) -> AppResult<RatingSnapshot> {
        let start = Instant::now();

        // All three reads see the same database state
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let ratings: Vec<(UserId, ItemId, f64)> = sqlx::query_as(&self.ratings_sql)
            .bind(min_rating)
            .fetch_all(&mut *tx)
            .await?;

        let zero_rating_users: Vec<(UserId,)> = sqlx::query_as(&self.zero_rating_users_sql)
            .bind(min_rating)
            .fetch_all(&mut *tx)
            .await?;

        let catalog: Vec<(ItemId,)> = sqlx::query_as(&self.catalog_sql)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            ratings = ratings.len(),
            zero_rating_users = zero_rating_users.len(),
            catalog = catalog.len(),
            load_time_ms = start.elapsed().as_millis(),
            "Loaded rating snapshot"
        );

        Ok(RatingSnapshot::new(
            ratings
                .into_iter()
                .map(|(user_id, item_id, score)| Rating::new(user_id, item_id, score))
                .collect(),
            zero_rating_users.into_iter().map(|(id,)| id),
            catalog.into_iter().map(|(id,)| id),
        ))
    }
}
