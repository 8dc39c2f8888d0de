//! In-process alternating least squares scorer
//!
//! Explicit-feedback matrix factorization with non-negative factors. Each
//! half-step holds one side fixed and solves the other with cyclic
//! coordinate descent, clamping every coordinate at zero. Regularization is
//! scaled by the number of observations of the row being solved.
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AppError, AppResult},
    models::{Candidate, ItemId, RatingSnapshot, UserId},
    services::scoring::CandidateScorer,
};

/// Model hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlsParams {
    pub rank: usize,
    pub iterations: usize,
    pub regularization: f64,
    /// Seed for factor initialisation; entropy-seeded when `None`
    pub seed: Option<u64>,
}

impl Default for AlsParams {
    fn default() -> Self {
        Self {
            rank: 10,
            iterations: 15,
            regularization: 0.1,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlsScorer {
    params: AlsParams,
}

impl AlsScorer {
    pub fn new(params: AlsParams) -> Self {
        Self { params }
    }

    /// Fits user and item factors to every rating in the snapshot
    ///
    /// Returns `None` once `cancel` fires; the token is polled between rows.
    pub fn fit(&self, snapshot: &RatingSnapshot, cancel: &CancellationToken) -> Option<AlsModel> {
        let user_ids: Vec<UserId> = snapshot.rated_users().collect();
        let item_ids: Vec<ItemId> = snapshot
            .ratings()
            .iter()
            .map(|r| r.item_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let user_index: HashMap<UserId, usize> =
            user_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let item_index: HashMap<ItemId, usize> =
            item_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let mut by_user: Vec<Vec<(usize, f32)>> = vec![Vec::new(); user_ids.len()];
        let mut by_item: Vec<Vec<(usize, f32)>> = vec![Vec::new(); item_ids.len()];
        for rating in snapshot.ratings() {
            let u = user_index[&rating.user_id];
            let i = item_index[&rating.item_id];
            by_user[u].push((i, rating.score as f32));
            by_item[i].push((u, rating.score as f32));
        }

        let mut rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let rank = self.params.rank;
        let scale = 1.0 / (rank as f32).sqrt();
        let mut user_factors = Array2::from_shape_fn((user_ids.len(), rank), |_| rng.gen::<f32>() * scale);
        let mut item_factors = Array2::from_shape_fn((item_ids.len(), rank), |_| rng.gen::<f32>() * scale);

        let regularization = self.params.regularization as f32;
        for _ in 0..self.params.iterations {
            if !update_factors(&mut user_factors, &item_factors, &by_user, regularization, cancel)
                || !update_factors(&mut item_factors, &user_factors, &by_item, regularization, cancel)
            {
                return None;
            }
        }

        Some(AlsModel {
            user_index,
            item_ids,
            user_factors,
            item_factors,
        })
    }
}

/// One half-step: re-solves every row of `target` against `fixed`
///
/// Returns `false` if cancelled part way through.
fn update_factors(
    target: &mut Array2<f32>,
    fixed: &Array2<f32>,
    observations: &[Vec<(usize, f32)>],
    regularization: f32,
    cancel: &CancellationToken,
) -> bool {
    let rank = target.ncols();

    for (row, observed) in observations.iter().enumerate() {
        if cancel.is_cancelled() {
            return false;
        }
        if observed.is_empty() {
            continue;
        }

        let lambda = regularization * observed.len() as f32;
        let mut residuals: Vec<f32> = observed
            .iter()
            .map(|&(col, score)| score - target.row(row).dot(&fixed.row(col)))
            .collect();

        for f in 0..rank {
            let current = target[[row, f]];
            let mut numerator = 0.0f32;
            let mut denominator = lambda;
            for (&(col, _), residual) in observed.iter().zip(&residuals) {
                let y = fixed[[col, f]];
                numerator += (residual + current * y) * y;
                denominator += y * y;
            }

            let updated = if denominator > 0.0 {
                (numerator / denominator).max(0.0)
            } else {
                0.0
            };

            let delta = updated - current;
            if delta != 0.0 {
                for (&(col, _), residual) in observed.iter().zip(residuals.iter_mut()) {
                    *residual -= delta * fixed[[col, f]];
                }
                target[[row, f]] = updated;
            }
        }
    }

    true
}

/// Fitted factors
pub struct AlsModel {
    user_index: HashMap<UserId, usize>,
    item_ids: Vec<ItemId>,
    user_factors: Array2<f32>,
    item_factors: Array2<f32>,
}

impl AlsModel {
    pub fn predict(&self, user_id: UserId, item_id: ItemId) -> Option<f32> {
        let u = *self.user_index.get(&user_id)?;
        let i = self.item_ids.binary_search(&item_id).ok()?;
        Some(self.user_factors.row(u).dot(&self.item_factors.row(i)))
    }

    /// Top `k` items for the user outside `exclude`, best first
    ///
    /// Unknown users get nothing.
    pub fn recommend(&self, user_id: UserId, exclude: &BTreeSet<ItemId>, k: usize) -> Vec<(ItemId, f32)> {
        let Some(&u) = self.user_index.get(&user_id) else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let scores = self.item_factors.dot(&self.user_factors.row(u));
        let mut scored: Vec<(ItemId, f32)> = self
            .item_ids
            .iter()
            .zip(scores.iter())
            .filter(|(item, _)| !exclude.contains(item))
            .map(|(&item, &score)| (item, score))
            .collect();

        let by_rank = |a: &(ItemId, f32), b: &(ItemId, f32)| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        };
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_by(by_rank);
        scored
    }
}

#[async_trait::async_trait]
impl CandidateScorer for AlsScorer {
    async fn score(
        &self,
        snapshot: Arc<RatingSnapshot>,
        users: Vec<UserId>,
        per_user: usize,
    ) -> AppResult<Vec<Candidate>> {
        let scorer = self.clone();
        let cancel = CancellationToken::new();
        // The blocking task outlives this future unless told to stop
        let _stop_on_drop = cancel.clone().drop_guard();

        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let model = scorer
                .fit(&snapshot, &cancel)
                .ok_or_else(|| AppError::Internal("ALS fit cancelled".to_string()))?;

            tracing::info!(
                users = model.user_index.len(),
                items = model.item_ids.len(),
                rank = scorer.params.rank,
                iterations = scorer.params.iterations,
                fit_time_ms = start.elapsed().as_millis(),
                "ALS model fitted"
            );

            let empty = BTreeSet::new();
            let mut per_user_candidates: BTreeMap<UserId, Vec<Candidate>> = BTreeMap::new();
            for user_id in users {
                if cancel.is_cancelled() {
                    return Err(AppError::Internal("ALS scoring cancelled".to_string()));
                }
                let rated = snapshot.rated_items(user_id).unwrap_or(&empty);
                let candidates = model
                    .recommend(user_id, rated, per_user)
                    .into_iter()
                    .map(|(item_id, score)| Candidate::new(user_id, item_id, score as f64))
                    .collect();
                per_user_candidates.insert(user_id, candidates);
            }

            Ok(per_user_candidates.into_values().flatten().collect())
        })
        .await
        .map_err(|e| AppError::Internal(format!("ALS scoring task failed: {}", e)))?
    }

    fn name(&self) -> &'static str {
        "als"
    }
}
