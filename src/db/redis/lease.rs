use redis::AsyncCommands;
use redis::Client;
use redis::Script;
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;
use crate::error::AppResult;
use crate::models::JobReport;
use crate::services::lease::{LeaseToken, RunLock};

/// How long the last run report stays readable
const LAST_RUN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

// Deletes the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RedisKey {
    Lease(String),
    LastRun(String),
}

impl Display for RedisKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisKey::Lease(job) => write!(f, "lease:{}", job),
            RedisKey::LastRun(job) => write!(f, "lastrun:{}", job),
        }
    }
}

/// Creates a Redis client for the run lease
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Redis-backed run lease and run bookkeeping for one job
#[derive(Clone)]
pub struct RedisRunLock {
    redis_client: Client,
    job: String,
}

impl RedisRunLock {
    pub fn new(redis_client: Client, job: impl Into<String>) -> Self {
        Self {
            redis_client,
            job: job.into(),
        }
    }

    /// Stores the report of the latest run for operators to inspect
    pub async fn record_last_run(&self, report: &JobReport) -> AppResult<()> {
        let json = serde_json::to_string(report)
            .map_err(|e| AppError::Internal(format!("Report serialization error: {}", e)))?;

        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .set_ex(
                RedisKey::LastRun(self.job.clone()).to_string(),
                json,
                LAST_RUN_TTL_SECS,
            )
            .await?;
        Ok(())
    }

    /// Report of the latest successful run, if it has not expired
    pub async fn last_run(&self) -> AppResult<Option<JobReport>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let stored: Option<String> = conn
            .get(RedisKey::LastRun(self.job.clone()).to_string())
            .await?;

        match stored {
            Some(json) => {
                let report = serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Report deserialization error: {}", e))
                })?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl RunLock for RedisRunLock {
    async fn try_acquire(&self, ttl: Duration) -> AppResult<Option<LeaseToken>> {
        let token = Uuid::new_v4();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(RedisKey::Lease(self.job.clone()).to_string())
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| LeaseToken {
            job: self.job.clone(),
            token,
        }))
    }

    async fn release(&self, token: &LeaseToken) -> AppResult<bool> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let removed: i64 = Script::new(RELEASE_SCRIPT)
            .key(RedisKey::Lease(token.job.clone()).to_string())
            .arg(token.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    #[test]
    fn test_redis_key_display() {
        assert_eq!(
            RedisKey::Lease("beer-recs".to_string()).to_string(),
            "lease:beer-recs"
        );
        assert_eq!(
            RedisKey::LastRun("beer-recs".to_string()).to_string(),
            "lastrun:beer-recs"
        );
    }

    #[tokio::test]
    #[ignore = "requires a Redis instance at REDIS_URL"]
    async fn test_lease_is_exclusive() {
        let client = create_redis_client(&redis_url()).unwrap();
        let job = format!("test-{}", Uuid::new_v4());
        let first = RedisRunLock::new(client.clone(), job.clone());
        let second = RedisRunLock::new(client, job);

        let token = first
            .try_acquire(Duration::from_secs(30))
            .await
            .unwrap()
            .expect("first acquire should succeed");
        assert!(second
            .try_acquire(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        assert!(first.release(&token).await.unwrap());
        // Releasing twice is a no-op
        assert!(!first.release(&token).await.unwrap());

        let again = second.try_acquire(Duration::from_secs(30)).await.unwrap();
        assert!(again.is_some());
        second.release(&again.unwrap()).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a Redis instance at REDIS_URL"]
    async fn test_foreign_token_does_not_release() {
        let client = create_redis_client(&redis_url()).unwrap();
        let job = format!("test-{}", Uuid::new_v4());
        let lock = RedisRunLock::new(client, job.clone());

        let token = lock
            .try_acquire(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let foreign = LeaseToken {
            job,
            token: Uuid::new_v4(),
        };

        assert!(!lock.release(&foreign).await.unwrap());
        assert!(lock.release(&token).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a Redis instance at REDIS_URL"]
    async fn test_last_run_reads_back_recorded_report() {
        let client = create_redis_client(&redis_url()).unwrap();
        let lock = RedisRunLock::new(client, format!("test-{}", Uuid::new_v4()));
        assert!(lock.last_run().await.unwrap().is_none());

        let now = chrono::Utc::now();
        let report = JobReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            snapshot_version: 4,
            users_published: 3,
            complete: 1,
            filled: 1,
            cold_start: 1,
            omitted: 0,
            underfilled_users: vec![2],
            shortfalls: Vec::new(),
            cold_start_items: vec![1, 2, 3],
        };
        lock.record_last_run(&report).await.unwrap();

        let stored = lock.last_run().await.unwrap().unwrap();
        assert_eq!(stored.run_id, report.run_id);
        assert_eq!(stored.snapshot_version, 4);
    }
}
