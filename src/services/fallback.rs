use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::FillPolicy;
use crate::models::{FillShortfall, ItemId, ListSource, RatingSnapshot, RecommendationList};
use crate::services::assembler::Underfilled;

/// Result of topping up the underfilled users
#[derive(Debug, Clone, Default)]
pub struct FillOutcome {
    pub lists: Vec<RecommendationList>,
    pub shortfalls: Vec<FillShortfall>,
}

impl FillOutcome {
    pub fn omitted(&self) -> usize {
        self.shortfalls.iter().filter(|s| s.omitted).count()
    }
}

/// Pads short lists with random items the user has neither rated nor been given
pub struct FallbackSampler {
    target_len: usize,
    policy: FillPolicy,
}

impl FallbackSampler {
    pub fn new(target_len: usize, policy: FillPolicy) -> Self {
        Self { target_len, policy }
    }

    /// Fills every underfilled user, in the order given
    ///
    /// The eligible pool is walked in ascending item order so a seeded
    /// generator reproduces the same picks.
    pub fn fill<R: Rng + ?Sized>(
        &self,
        underfilled: Vec<Underfilled>,
        snapshot: &RatingSnapshot,
        rng: &mut R,
    ) -> FillOutcome {
        let mut outcome = FillOutcome::default();

        for user in underfilled {
            let user_id = user.user_id;
            let items = self.top_up(user, snapshot, rng);

            if items.len() < self.target_len {
                let shortfall = FillShortfall {
                    user_id,
                    filled: items.len(),
                    missing: self.target_len - items.len(),
                    omitted: self.policy == FillPolicy::OmitUser,
                };

                tracing::warn!(
                    user_id,
                    filled = shortfall.filled,
                    missing = shortfall.missing,
                    omitted = shortfall.omitted,
                    "Unseen item pool exhausted before list was full"
                );

                outcome.shortfalls.push(shortfall);
                if self.policy == FillPolicy::OmitUser {
                    continue;
                }
            }

            outcome
                .lists
                .push(RecommendationList::new(user_id, items, ListSource::Filled));
        }

        outcome
    }

    fn top_up<R: Rng + ?Sized>(
        &self,
        user: Underfilled,
        snapshot: &RatingSnapshot,
        rng: &mut R,
    ) -> Vec<ItemId> {
        let mut items = user.items;
        let needed = self.target_len.saturating_sub(items.len());
        if needed == 0 {
            return items;
        }

        let rated = snapshot.rated_items(user.user_id);
        let mut pool: Vec<ItemId> = snapshot
            .catalog()
            .iter()
            .copied()
            .filter(|item| !rated.is_some_and(|r| r.contains(item)) && !items.contains(item))
            .collect();

        let take = needed.min(pool.len());
        let (drawn, _) = pool.partial_shuffle(rng, take);
        items.extend_from_slice(drawn);
        items
    }
}
