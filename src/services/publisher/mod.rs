use std::collections::BTreeSet;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::RecommendationList,
    services::retry::{with_retry, RetryConfig},
};

pub mod memory;
pub mod postgres;

pub use memory::{Fault, FaultKind, MemoryRecommendationWriter};
pub use postgres::PgRecommendationWriter;

/// Destination of the published recommendation snapshot
///
/// `replace_all` is all-or-nothing: on success the given lists are the
/// only published rows, on failure the previous snapshot is untouched.
/// Readers never observe a mix of the two or an empty table in between.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RecommendationWriter: Send + Sync {
    /// Publishes `lists` as the new snapshot and returns its version
    async fn replace_all(&self, run_id: Uuid, lists: &[RecommendationList]) -> AppResult<i64>;

    /// Version currently served to readers
    async fn active_version(&self) -> AppResult<Option<i64>>;
}

/// Rejects batches that name the same user twice
pub(crate) fn ensure_unique_users(lists: &[RecommendationList]) -> AppResult<()> {
    let mut seen = BTreeSet::new();
    for list in lists {
        if !seen.insert(list.user_id) {
            return Err(AppError::InvalidData(format!(
                "User {} appears more than once in the batch",
                list.user_id
            )));
        }
    }
    Ok(())
}

/// Publishes with bounded retries around transient failures
///
/// Each attempt is a complete replace, so a retried attempt never builds on
/// a half-written predecessor.
pub async fn publish(
    writer: &dyn RecommendationWriter,
    retry: &RetryConfig,
    run_id: Uuid,
    lists: &[RecommendationList],
) -> AppResult<i64> {
    with_retry(retry, "publish_recommendations", || writer.replace_all(run_id, lists)).await
}
