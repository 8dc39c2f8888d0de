use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::{ItemId, UserId};

/// An item proposed by the scorer for a user
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub predicted_score: f64,
}

impl Candidate {
    pub fn new(user_id: UserId, item_id: ItemId, predicted_score: f64) -> Self {
        Self {
            user_id,
            item_id,
            predicted_score,
        }
    }
}

/// Which regime produced a published list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSource {
    /// Entirely model-scored
    Scored,
    /// Model-scored head topped up with random unseen items
    Filled,
    /// Shared list for users without ratings
    ColdStart,
}

impl ListSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListSource::Scored => "scored",
            ListSource::Filled => "filled",
            ListSource::ColdStart => "cold_start",
        }
    }

    pub fn parse(value: &str) -> Option<ListSource> {
        match value {
            "scored" => Some(ListSource::Scored),
            "filled" => Some(ListSource::Filled),
            "cold_start" => Some(ListSource::ColdStart),
            _ => None,
        }
    }
}

impl Display for ListSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered recommendations for one user, most relevant first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationList {
    pub user_id: UserId,
    pub items: Vec<ItemId>,
    pub source: ListSource,
}

impl RecommendationList {
    pub fn new(user_id: UserId, items: Vec<ItemId>, source: ListSource) -> Self {
        Self {
            user_id,
            items,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.items.contains(&item_id)
    }
}
