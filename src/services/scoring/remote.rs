//! Remote scoring service client
//!
//! Ships the rating snapshot to an external factorization service and reads
//! back ranked candidates.
//!
//! Request: `POST {base_url}/score`
//! ```json
//! { "ratings": [{"user_id": 1, "item_id": 2, "score": 4.5}],
//!   "users": [1], "per_user": 10,
//!   "rank": 10, "iterations": 15, "regularization": 0.1 }
//! ```
//! Response: `{ "candidates": [{"user_id": 1, "item_id": 7, "score": 4.1}] }`
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    error::{AppError, AppResult},
    models::{Candidate, Rating, RatingSnapshot, UserId},
    services::scoring::{AlsParams, CandidateScorer},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    ratings: &'a [Rating],
    users: &'a [UserId],
    per_user: usize,
    rank: usize,
    iterations: usize,
    regularization: f64,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    candidates: Vec<ScoredItem>,
}

#[derive(Debug, Deserialize)]
struct ScoredItem {
    user_id: UserId,
    item_id: i64,
    score: f64,
}

impl From<ScoredItem> for Candidate {
    fn from(item: ScoredItem) -> Self {
        Candidate::new(item.user_id, item.item_id, item.score)
    }
}

#[derive(Clone)]
pub struct RemoteScorer {
    http_client: HttpClient,
    base_url: String,
    params: AlsParams,
}

impl RemoteScorer {
    pub fn new(base_url: String, params: AlsParams) -> AppResult<Self> {
        let http_client = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            params,
        })
    }

    fn parse_response(body: &str) -> AppResult<Vec<Candidate>> {
        let response: ScoreResponse = serde_json::from_str(body).map_err(|e| {
            AppError::ExternalApi(format!("Malformed scoring response: {}", e))
        })?;
        Ok(response.candidates.into_iter().map(Candidate::from).collect())
    }
}

#[async_trait::async_trait]
impl CandidateScorer for RemoteScorer {
    async fn score(
        &self,
        snapshot: Arc<RatingSnapshot>,
        users: Vec<UserId>,
        per_user: usize,
    ) -> AppResult<Vec<Candidate>> {
        let url = format!("{}/score", self.base_url);
        let request = ScoreRequest {
            ratings: snapshot.ratings(),
            users: &users,
            per_user,
            rank: self.params.rank,
            iterations: self.params.iterations,
            regularization: self.params.regularization,
        };

        tracing::debug!(
            url = %url,
            ratings = snapshot.ratings().len(),
            users = users.len(),
            "Requesting candidates from scoring service"
        );

        let response = self.http_client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %body,
                "Scoring service request failed"
            );
            return Err(AppError::ExternalApi(format!(
                "Scoring service returned status {}: {}",
                status, body
            )));
        }

        let body = response.text().await?;
        let candidates = Self::parse_response(&body)?;

        tracing::info!(
            candidates = candidates.len(),
            "Received candidates from scoring service"
        );

        Ok(candidates)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
