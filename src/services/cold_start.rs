use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ItemId, RatingSnapshot};

/// Per-item rating aggregate
#[derive(Debug, Clone, Copy, PartialEq)]
struct ItemStats {
    item_id: ItemId,
    count: u64,
    mean: f64,
}

/// The shared list handed to every user without ratings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColdStartList {
    pub items: Vec<ItemId>,
    /// Items that met the popularity threshold
    pub qualifying: usize,
    /// Trailing items taken from below the threshold
    pub padded: usize,
}

/// Ranks popular items by mean score
pub struct ColdStartRanker {
    popularity_threshold: u64,
    target_len: usize,
}

impl ColdStartRanker {
    pub fn new(popularity_threshold: u64, target_len: usize) -> Self {
        Self {
            popularity_threshold,
            target_len,
        }
    }

    /// Top items with at least `popularity_threshold` ratings, best mean first
    ///
    /// Equal means are ordered by ascending item id. When too few items
    /// qualify the list is padded from the remaining rated items (most rated
    /// first), then from never-rated catalog items in id order.
    pub fn rank(&self, snapshot: &RatingSnapshot) -> ColdStartList {
        let (mut qualifying, mut rest): (Vec<ItemStats>, Vec<ItemStats>) = aggregate(snapshot)
            .into_iter()
            .partition(|stats| stats.count >= self.popularity_threshold);

        qualifying.sort_by(|a, b| match b.mean.total_cmp(&a.mean) {
            Ordering::Equal => a.item_id.cmp(&b.item_id),
            other => other,
        });

        let mut items: Vec<ItemId> = qualifying
            .iter()
            .take(self.target_len)
            .map(|stats| stats.item_id)
            .collect();
        let qualifying_count = qualifying.len();

        if items.len() < self.target_len {
            rest.sort_by(|a, b| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| b.mean.total_cmp(&a.mean))
                    .then_with(|| a.item_id.cmp(&b.item_id))
            });
            let rated: BTreeSet<ItemId> = snapshot.ratings().iter().map(|r| r.item_id).collect();
            let unrated = snapshot
                .catalog()
                .iter()
                .copied()
                .filter(|item| !rated.contains(item));

            let missing = self.target_len - items.len();
            let padding: Vec<ItemId> = rest
                .iter()
                .map(|stats| stats.item_id)
                .chain(unrated)
                .take(missing)
                .collect();

            tracing::warn!(
                qualifying = qualifying_count,
                threshold = self.popularity_threshold,
                padded = padding.len(),
                "Too few items meet the popularity threshold, padding cold-start list"
            );

            items.extend(padding);
        }

        ColdStartList {
            padded: items.len() - qualifying_count.min(self.target_len),
            qualifying: qualifying_count,
            items,
        }
    }
}

fn aggregate(snapshot: &RatingSnapshot) -> Vec<ItemStats> {
    let mut totals: BTreeMap<ItemId, (u64, f64)> = BTreeMap::new();
    for rating in snapshot.ratings() {
        let entry = totals.entry(rating.item_id).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += rating.score;
    }

    totals
        .into_iter()
        .map(|(item_id, (count, sum))| ItemStats {
            item_id,
            count,
            mean: sum / count as f64,
        })
        .collect()
}
