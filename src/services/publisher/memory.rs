use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{RecommendationList, UserId},
    services::publisher::{ensure_unique_users, RecommendationWriter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fails like a dropped connection and is retried
    Transient,
    /// Fails like a rejected statement and is not
    Permanent,
}

/// Injected write failure, used to exercise rollback and retry paths
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    /// Index of the row whose write fails
    pub at_row: usize,
    pub kind: FaultKind,
    /// Number of publishes that hit the fault before it clears
    pub times: u32,
}

impl Fault {
    fn error(&self) -> AppError {
        match self.kind {
            FaultKind::Transient => AppError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected connection reset",
            ))),
            FaultKind::Permanent => {
                AppError::Database(sqlx::Error::Protocol("injected write failure".to_string()))
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    active_version: Option<i64>,
    next_version: i64,
    rows: BTreeMap<UserId, RecommendationList>,
    fault: Option<Fault>,
    attempts: u32,
}

/// In-process publication target with the same all-or-nothing contract as
/// the Postgres writer
#[derive(Debug, Default)]
pub struct MemoryRecommendationWriter {
    state: RwLock<State>,
}

impl MemoryRecommendationWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `lists` already published as version 1
    pub fn with_published(lists: Vec<RecommendationList>) -> Self {
        let rows = lists.into_iter().map(|l| (l.user_id, l)).collect();
        Self {
            state: RwLock::new(State {
                active_version: Some(1),
                next_version: 1,
                rows,
                ..Default::default()
            }),
        }
    }

    pub async fn inject_fault(&self, fault: Fault) {
        self.state.write().await.fault = Some(fault);
    }

    /// Published lists ordered by user
    pub async fn published(&self) -> Vec<RecommendationList> {
        self.state.read().await.rows.values().cloned().collect()
    }

    /// Calls to `replace_all`, successful or not
    pub async fn attempts(&self) -> u32 {
        self.state.read().await.attempts
    }
}

#[async_trait::async_trait]
impl RecommendationWriter for MemoryRecommendationWriter {
    async fn replace_all(&self, run_id: Uuid, lists: &[RecommendationList]) -> AppResult<i64> {
        // Holding the write lock for the whole publish mirrors the row lock
        let mut state = self.state.write().await;
        state.attempts += 1;
        ensure_unique_users(lists)?;

        let mut staged = BTreeMap::new();
        for (row, list) in lists.iter().enumerate() {
            if let Some(fault) = state.fault.as_mut() {
                if fault.at_row == row && fault.times > 0 {
                    fault.times -= 1;
                    let err = fault.error();
                    tracing::debug!(%run_id, row, "Injected publish failure");
                    return Err(err);
                }
            }
            staged.insert(list.user_id, list.clone());
        }

        state.next_version += 1;
        let version = state.next_version;
        state.rows = staged;
        state.active_version = Some(version);

        Ok(version)
    }

    async fn active_version(&self) -> AppResult<Option<i64>> {
        Ok(self.state.read().await.active_version)
    }
}
