use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::AppResult;

/// Creates a PostgreSQL connection pool
///
/// The same pool serves the rating snapshot reads and the publish
/// transaction, so it never needs more than a handful of connections.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Applies the recommendation snapshot schema
pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
