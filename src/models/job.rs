use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

use super::{ItemId, UserId};

/// Stage of a refresh run
///
/// Runs move strictly forward:
/// `STAGING → SCORING → ASSEMBLING → FILLING → COLD_START → WRITING → DONE`.
/// `FAILED` is reachable only from the stages that touch external systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Staging,
    Scoring,
    Assembling,
    Filling,
    ColdStart,
    Writing,
    Done,
    Failed,
}

impl JobState {
    /// The stage that follows this one on the success path
    pub fn next(&self) -> Option<JobState> {
        match self {
            JobState::Staging => Some(JobState::Scoring),
            JobState::Scoring => Some(JobState::Assembling),
            JobState::Assembling => Some(JobState::Filling),
            JobState::Filling => Some(JobState::ColdStart),
            JobState::ColdStart => Some(JobState::Writing),
            JobState::Writing => Some(JobState::Done),
            JobState::Done | JobState::Failed => None,
        }
    }

    pub fn can_fail(&self) -> bool {
        matches!(
            self,
            JobState::Staging | JobState::Scoring | JobState::Writing
        )
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        if target == JobState::Failed {
            return self.can_fail();
        }
        self.next() == Some(target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Staging => "STAGING",
            JobState::Scoring => "SCORING",
            JobState::Assembling => "ASSEMBLING",
            JobState::Filling => "FILLING",
            JobState::ColdStart => "COLD_START",
            JobState::Writing => "WRITING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user whose unseen-item pool ran dry before the list was full
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillShortfall {
    pub user_id: UserId,
    /// Items the user ended up with
    pub filled: usize,
    /// Items still missing to reach the target length
    pub missing: usize,
    /// Whether the user was left out of the snapshot
    pub omitted: bool,
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Version that is now active in the store
    pub snapshot_version: i64,
    pub users_published: usize,
    /// Users whose list came entirely from the scorer
    pub complete: usize,
    /// Users topped up by fallback sampling
    pub filled: usize,
    pub cold_start: usize,
    pub omitted: usize,
    /// Users the scorer left short, ascending
    pub underfilled_users: Vec<UserId>,
    pub shortfalls: Vec<FillShortfall>,
    pub cold_start_items: Vec<ItemId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path_is_linear() {
        let mut state = JobState::Staging;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            visited.push(state);
        }

        assert_eq!(
            visited,
            vec![
                JobState::Staging,
                JobState::Scoring,
                JobState::Assembling,
                JobState::Filling,
                JobState::ColdStart,
                JobState::Writing,
                JobState::Done,
            ]
        );
    }

    #[test]
    fn test_failure_only_from_external_stages() {
        assert!(JobState::Staging.can_transition_to(JobState::Failed));
        assert!(JobState::Scoring.can_transition_to(JobState::Failed));
        assert!(JobState::Writing.can_transition_to(JobState::Failed));

        assert!(!JobState::Assembling.can_transition_to(JobState::Failed));
        assert!(!JobState::Filling.can_transition_to(JobState::Failed));
        assert!(!JobState::ColdStart.can_transition_to(JobState::Failed));
        assert!(!JobState::Done.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!JobState::Staging.can_transition_to(JobState::Assembling));
        assert!(!JobState::Writing.can_transition_to(JobState::Scoring));
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn test_state_serializes_like_display() {
        let json = serde_json::to_string(&JobState::ColdStart).unwrap();
        assert_eq!(json, "\"COLD_START\"");
        assert_eq!(JobState::ColdStart.to_string(), "COLD_START");
    }
}
