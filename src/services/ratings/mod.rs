use crate::{error::AppResult, models::RatingSnapshot};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRatingStore;
pub use postgres::PgRatingStore;

/// Source of the rating snapshot
///
/// A snapshot is read once per run and never refreshed mid-run.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RatingStore: Send + Sync {
    /// Ratings with `score >= min_rating`, users without any such rating,
    /// and the item catalog
    async fn load_snapshot(&self, min_rating: f64) -> AppResult<RatingSnapshot>;
}

/// Where the review application keeps its data
///
/// The users and items tables are keyed by an `id` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSchema {
    pub reviews_table: String,
    pub review_user_column: String,
    pub review_item_column: String,
    pub review_score_column: String,
    pub users_table: String,
    pub items_table: String,
}

impl SourceSchema {
    /// Every name must be a plain (optionally schema-qualified) SQL identifier
    pub fn validate(&self) -> Result<(), String> {
        for name in [
            &self.reviews_table,
            &self.review_user_column,
            &self.review_item_column,
            &self.review_score_column,
            &self.users_table,
            &self.items_table,
        ] {
            quote_identifier(name)?;
        }
        Ok(())
    }
}

/// Double-quotes each dot-separated part of an identifier
pub(crate) fn quote_identifier(name: &str) -> Result<String, String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(format!("'{}' has too many qualifiers", name));
    }

    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("'{}' is not a valid SQL identifier", name));
        }
        quoted.push(format!("\"{}\"", part));
    }

    Ok(quoted.join("."))
}
