pub mod job;
pub mod rating;
pub mod recommendation;

pub use job::{FillShortfall, JobReport, JobState};
pub use rating::{Rating, RatingSnapshot};
pub use recommendation::{Candidate, ListSource, RecommendationList};

/// Identifier of a user in the review application
pub type UserId = i64;

/// Identifier of a catalog item (a beer)
pub type ItemId = i64;

/// Item columns exposed by the published recommendation view
pub const PUBLISHED_COLUMNS: usize = 10;
