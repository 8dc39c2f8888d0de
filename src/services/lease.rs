use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppResult;

/// Proof of holding the run lease, needed to release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub job: String,
    pub token: Uuid,
}

/// Mutual exclusion between refresh runs of the same job
///
/// The lease expires on its own after the TTL so a crashed run cannot block
/// later ones forever. Releasing only succeeds for the holder's token.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RunLock: Send + Sync {
    /// Returns `None` when another run already holds the lease
    async fn try_acquire(&self, ttl: Duration) -> AppResult<Option<LeaseToken>>;

    /// Returns whether the lease was still held by `token`
    async fn release(&self, token: &LeaseToken) -> AppResult<bool>;
}

/// Process-local lease, for tests and single-node runs without Redis
#[derive(Debug)]
pub struct MemoryRunLock {
    job: String,
    held: Mutex<Option<(Uuid, Instant)>>,
}

impl MemoryRunLock {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            held: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl RunLock for MemoryRunLock {
    async fn try_acquire(&self, ttl: Duration) -> AppResult<Option<LeaseToken>> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = *held {
            if expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4();
        *held = Some((token, now + ttl));
        Ok(Some(LeaseToken {
            job: self.job.clone(),
            token,
        }))
    }

    async fn release(&self, token: &LeaseToken) -> AppResult<bool> {
        let mut held = self.held.lock().await;
        match *held {
            Some((current, _)) if current == token.token => {
                *held = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
