use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{ItemId, UserId};

/// A user's recorded score for one item
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub score: f64,
}

impl Rating {
    pub fn new(user_id: UserId, item_id: ItemId, score: f64) -> Self {
        Self {
            user_id,
            item_id,
            score,
        }
    }
}

/// Immutable view of the rating data for one run
///
/// Built once during staging and shared by every later stage. Ordered
/// collections keep iteration deterministic, which seeded fallback sampling
/// relies on.
#[derive(Debug, Clone, Default)]
pub struct RatingSnapshot {
    ratings: Vec<Rating>,
    rated_items: BTreeMap<UserId, BTreeSet<ItemId>>,
    zero_rating_users: BTreeSet<UserId>,
    catalog: BTreeSet<ItemId>,
}

impl RatingSnapshot {
    /// Builds the snapshot from already-filtered ratings
    ///
    /// The catalog is the union of `catalog_items` and every rated item.
    /// Users listed as zero-rating that do appear in `ratings` are dropped
    /// from the zero-rating set.
    pub fn new(
        ratings: Vec<Rating>,
        zero_rating_users: impl IntoIterator<Item = UserId>,
        catalog_items: impl IntoIterator<Item = ItemId>,
    ) -> Self {
        let mut rated_items: BTreeMap<UserId, BTreeSet<ItemId>> = BTreeMap::new();
        let mut catalog: BTreeSet<ItemId> = catalog_items.into_iter().collect();

        for rating in &ratings {
            rated_items
                .entry(rating.user_id)
                .or_default()
                .insert(rating.item_id);
            catalog.insert(rating.item_id);
        }

        let mut conflicting = 0usize;
        let zero_rating_users: BTreeSet<UserId> = zero_rating_users
            .into_iter()
            .filter(|user| {
                let has_ratings = rated_items.contains_key(user);
                if has_ratings {
                    conflicting += 1;
                }
                !has_ratings
            })
            .collect();

        if conflicting > 0 {
            tracing::warn!(
                count = conflicting,
                "Users listed without ratings have qualifying ratings, treating them as rated"
            );
        }

        Self {
            ratings,
            rated_items,
            zero_rating_users,
            catalog,
        }
    }

    pub fn ratings(&self) -> &[Rating] {
        &self.ratings
    }

    /// Users with at least one qualifying rating, ascending
    pub fn rated_users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.rated_items.keys().copied()
    }

    pub fn rated_user_count(&self) -> usize {
        self.rated_items.len()
    }

    pub fn is_rated_user(&self, user_id: UserId) -> bool {
        self.rated_items.contains_key(&user_id)
    }

    /// Items the user has rated; empty for unknown users
    pub fn rated_items(&self, user_id: UserId) -> Option<&BTreeSet<ItemId>> {
        self.rated_items.get(&user_id)
    }

    pub fn has_rated(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.rated_items
            .get(&user_id)
            .is_some_and(|items| items.contains(&item_id))
    }

    pub fn zero_rating_users(&self) -> &BTreeSet<UserId> {
        &self.zero_rating_users
    }

    pub fn catalog(&self) -> &BTreeSet<ItemId> {
        &self.catalog
    }
}
