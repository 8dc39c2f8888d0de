use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::models::{Candidate, ItemId, ListSource, RatingSnapshot, RecommendationList, UserId};

/// A rated user whose cleaned candidate list is shorter than the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Underfilled {
    pub user_id: UserId,
    /// Scored items already selected, best first
    pub items: Vec<ItemId>,
    /// Items still needed to reach the target length
    pub deficit: usize,
}

/// Output of the assembly stage, both halves ascending by user
#[derive(Debug, Clone, Default)]
pub struct AssembledLists {
    pub complete: Vec<RecommendationList>,
    pub underfilled: Vec<Underfilled>,
    /// Candidates dropped because the user already rated the item
    pub stripped: usize,
    /// Candidates dropped as duplicates of a better-scored entry
    pub duplicates: usize,
}

/// Cleans raw scorer output into capped, ordered per-user lists
pub struct CandidateAssembler {
    target_len: usize,
}

impl CandidateAssembler {
    pub fn new(target_len: usize) -> Self {
        Self { target_len }
    }

    /// Builds one entry per rated user in the snapshot
    ///
    /// Rated users the scorer said nothing about come out underfilled with
    /// an empty head, so every rated user is accounted for.
    pub fn assemble(&self, candidates: Vec<Candidate>, snapshot: &RatingSnapshot) -> AssembledLists {
        let mut by_user: BTreeMap<UserId, HashMap<ItemId, f64>> = BTreeMap::new();
        let mut stripped = 0;
        let mut duplicates = 0;

        for candidate in candidates {
            if snapshot.has_rated(candidate.user_id, candidate.item_id) {
                stripped += 1;
                continue;
            }

            let scores = by_user.entry(candidate.user_id).or_default();
            match scores.get_mut(&candidate.item_id) {
                Some(best) => {
                    duplicates += 1;
                    if candidate.predicted_score > *best {
                        *best = candidate.predicted_score;
                    }
                }
                None => {
                    scores.insert(candidate.item_id, candidate.predicted_score);
                }
            }
        }

        let mut assembled = AssembledLists {
            stripped,
            duplicates,
            ..AssembledLists::default()
        };

        for user_id in snapshot.rated_users() {
            let items = by_user
                .remove(&user_id)
                .map(|scores| self.rank(scores))
                .unwrap_or_default();

            if items.len() >= self.target_len {
                assembled
                    .complete
                    .push(RecommendationList::new(user_id, items, ListSource::Scored));
            } else {
                assembled.underfilled.push(Underfilled {
                    user_id,
                    deficit: self.target_len - items.len(),
                    items,
                });
            }
        }

        assembled
    }

    /// Orders by score descending, item id ascending on ties, then caps
    fn rank(&self, scores: HashMap<ItemId, f64>) -> Vec<ItemId> {
        let mut ranked: Vec<(ItemId, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        ranked.truncate(self.target_len);
        ranked.into_iter().map(|(item_id, _)| item_id).collect()
    }
}
