use std::collections::BTreeSet;

use crate::{
    error::AppResult,
    models::{ItemId, Rating, RatingSnapshot, UserId},
    services::ratings::RatingStore,
};

/// Rating store backed by plain vectors
///
/// Applies the same filtering as the Postgres store: ratings below the
/// threshold are dropped, and any known user left without a qualifying
/// rating is a zero-rating user.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRatingStore {
    ratings: Vec<Rating>,
    users: Vec<UserId>,
    items: Vec<ItemId>,
}

impl InMemoryRatingStore {
    pub fn new(ratings: Vec<Rating>, users: Vec<UserId>, items: Vec<ItemId>) -> Self {
        Self {
            ratings,
            users,
            items,
        }
    }
}

#[async_trait::async_trait]
impl RatingStore for InMemoryRatingStore {
    async fn load_snapshot(&self, min_rating: f64) -> AppResult<RatingSnapshot> {
        let ratings: Vec<Rating> = self
            .ratings
            .iter()
            .filter(|r| r.score >= min_rating)
            .copied()
            .collect();

        let rated: BTreeSet<UserId> = ratings.iter().map(|r| r.user_id).collect();
        let zero_rating_users: Vec<UserId> = self
            .users
            .iter()
            .copied()
            .filter(|user| !rated.contains(user))
            .collect();

        Ok(RatingSnapshot::new(
            ratings,
            zero_rating_users,
            self.items.iter().copied(),
        ))
    }
}
