//! Candidate scoring abstraction
//!
//! The pipeline only relies on the shape of scorer output: per target user,
//! a ranked list of unrated items with finite scores. Scores are not
//! expected to be reproducible between runs.
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    models::{Candidate, RatingSnapshot, UserId},
};

pub mod als;
pub mod remote;

pub use als::{AlsParams, AlsScorer};
pub use remote::RemoteScorer;

/// Trait for candidate scorers
///
/// Implementations may return fewer than `per_user` candidates for a user,
/// or none at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CandidateScorer: Send + Sync {
    /// Scores unrated items for each of `users`
    async fn score(
        &self,
        snapshot: Arc<RatingSnapshot>,
        users: Vec<UserId>,
        per_user: usize,
    ) -> AppResult<Vec<Candidate>>;

    /// Scorer name for logging
    fn name(&self) -> &'static str;
}

/// Rejects scorer output the rest of the pipeline cannot trust
///
/// Items the user already rated are not rejected here; the assembler
/// strips them.
pub fn validate_candidates(
    candidates: &[Candidate],
    snapshot: &RatingSnapshot,
    users: &BTreeSet<UserId>,
) -> AppResult<()> {
    for candidate in candidates {
        if !users.contains(&candidate.user_id) {
            return Err(AppError::InvalidData(format!(
                "candidate for user {} who was not scored",
                candidate.user_id
            )));
        }
        if !snapshot.catalog().contains(&candidate.item_id) {
            return Err(AppError::InvalidData(format!(
                "candidate item {} is not in the catalog",
                candidate.item_id
            )));
        }
        if !candidate.predicted_score.is_finite() {
            return Err(AppError::InvalidData(format!(
                "non-finite score for user {} item {}",
                candidate.user_id, candidate.item_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Rating;

    fn fixture() -> (RatingSnapshot, BTreeSet<UserId>) {
        let snapshot = RatingSnapshot::new(vec![Rating::new(1, 10, 4.0)], vec![], vec![10, 11]);
        (snapshot, BTreeSet::from([1]))
    }

    #[test]
    fn test_accepts_well_formed_candidates() {
        let (snapshot, users) = fixture();
        let candidates = vec![Candidate::new(1, 11, 3.2), Candidate::new(1, 10, 1.0)];
        assert!(validate_candidates(&candidates, &snapshot, &users).is_ok());
    }

    #[test]
    fn test_rejects_unknown_user() {
        let (snapshot, users) = fixture();
        let result = validate_candidates(&[Candidate::new(2, 11, 3.0)], &snapshot, &users);
        assert!(result.unwrap_err().to_string().contains("user 2"));
    }

    #[test]
    fn test_rejects_item_outside_catalog() {
        let (snapshot, users) = fixture();
        let result = validate_candidates(&[Candidate::new(1, 99, 3.0)], &snapshot, &users);
        assert!(result.unwrap_err().to_string().contains("not in the catalog"));
    }

    #[test]
    fn test_rejects_nan_score() {
        let (snapshot, users) = fixture();
        let result = validate_candidates(&[Candidate::new(1, 11, f64::NAN)], &snapshot, &users);
        assert!(result.is_err());
    }
}
