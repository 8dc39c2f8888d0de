use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::{Config, FillPolicy},
    error::JobError,
    models::{JobReport, JobState, ListSource, RecommendationList, UserId, PUBLISHED_COLUMNS},
    services::{
        assembler::CandidateAssembler,
        cold_start::ColdStartRanker,
        fallback::FallbackSampler,
        lease::RunLock,
        publisher::{self, RecommendationWriter},
        ratings::RatingStore,
        retry::RetryConfig,
        scoring::{validate_candidates, CandidateScorer},
    },
};

/// Tunables of a single refresh run
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_name: String,
    pub target_len: usize,
    pub popularity_threshold: u64,
    pub min_rating: f64,
    pub fill_policy: FillPolicy,
    pub fill_seed: Option<u64>,
    pub deadline: Option<Duration>,
    pub lease_ttl: Duration,
    pub publish_retry: RetryConfig,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            job_name: "beer-recs".to_string(),
            target_len: PUBLISHED_COLUMNS,
            popularity_threshold: 1000,
            min_rating: 1.0,
            fill_policy: FillPolicy::ShortList,
            fill_seed: None,
            deadline: None,
            lease_ttl: Duration::from_secs(3600),
            publish_retry: RetryConfig::default(),
        }
    }
}

impl From<&Config> for JobSettings {
    fn from(config: &Config) -> Self {
        Self {
            job_name: config.job_name.clone(),
            target_len: config.target_list_len,
            popularity_threshold: config.popularity_threshold,
            min_rating: config.min_rating,
            fill_policy: config.fill_policy,
            fill_seed: config.fill_seed,
            deadline: config.deadline(),
            lease_ttl: config.lease_ttl(),
            publish_retry: config.publish_retry(),
        }
    }
}

/// Monotonic time source for deadline checks
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Per-run bookkeeping threaded through the stages
struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    clock: Arc<dyn Clock>,
    state: JobState,
    progress: watch::Sender<JobState>,
}

impl RunContext {
    fn new(
        deadline: Option<Duration>,
        clock: Arc<dyn Clock>,
        progress: watch::Sender<JobState>,
    ) -> Self {
        progress.send_replace(JobState::Staging);
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            deadline: deadline.map(|d| clock.now() + d),
            clock,
            state: JobState::Staging,
            progress,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(from = %self.state, to = %next, "Stage transition");
        self.state = next;
        self.progress.send_replace(next);
    }

    fn fail(&mut self, err: JobError) -> JobError {
        tracing::error!(stage = %self.state, error = %err, "Refresh run failed");
        if self.state.can_fail() {
            self.state = JobState::Failed;
            self.progress.send_replace(JobState::Failed);
        }
        err
    }

    fn check_deadline(&mut self) -> Result<(), JobError> {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                let stage = self.state;
                Err(self.fail(JobError::DeadlineExceeded { stage }))
            }
            _ => Ok(()),
        }
    }
}

/// The batch job that rebuilds and republishes every user's list
pub struct RefreshJob {
    ratings: Arc<dyn RatingStore>,
    scorer: Arc<dyn CandidateScorer>,
    writer: Arc<dyn RecommendationWriter>,
    settings: JobSettings,
    clock: Arc<dyn Clock>,
}

impl RefreshJob {
    pub fn new(
        ratings: Arc<dyn RatingStore>,
        scorer: Arc<dyn CandidateScorer>,
        writer: Arc<dyn RecommendationWriter>,
        settings: JobSettings,
    ) -> Self {
        Self {
            ratings,
            scorer,
            writer,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the time source used for deadline checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs once without a lease or interruption handling
    pub async fn run(&self) -> Result<JobReport, JobError> {
        let (progress, _) = watch::channel(JobState::Staging);
        self.execute(progress).await
    }

    /// Runs once while holding the job lease
    ///
    /// Resolving `shutdown` before WRITING aborts the run at its next await
    /// point, with nothing written. Once WRITING has begun the publish runs
    /// to completion and its outcome is reported. The lease is released on
    /// every path.
    pub async fn run_exclusive<S>(&self, lock: &dyn RunLock, shutdown: S) -> Result<JobReport, JobError>
    where
        S: Future<Output = ()>,
    {
        let token = lock
            .try_acquire(self.settings.lease_ttl)
            .await
            .map_err(JobError::Staging)?
            .ok_or_else(|| JobError::AlreadyRunning(self.settings.job_name.clone()))?;

        let (progress, stage) = watch::channel(JobState::Staging);
        let execution = self.execute(progress);
        tokio::pin!(execution);

        let outcome = tokio::select! {
            biased;

            _ = shutdown => {
                let stage = *stage.borrow();
                if matches!(stage, JobState::Writing | JobState::Done) {
                    tracing::warn!(%stage, "Shutdown requested during publish, waiting for it to finish");
                    execution.await
                } else {
                    tracing::warn!(%stage, "Shutdown requested, abandoning refresh run");
                    Err(JobError::Interrupted { stage })
                }
            }
            result = &mut execution => result,
        };

        match lock.release(&token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                job = %token.job,
                "Lease expired before release; another run may have started"
            ),
            Err(e) => tracing::warn!(job = %token.job, error = %e, "Failed to release lease"),
        }

        outcome
    }

    async fn execute(&self, progress: watch::Sender<JobState>) -> Result<JobReport, JobError> {
        let mut ctx = RunContext::new(self.settings.deadline, self.clock.clone(), progress);
        let span = tracing::info_span!("refresh_run", run_id = %ctx.run_id);

        async move {
            let settings = &self.settings;
            let start = Instant::now();
            tracing::info!(
                scorer = self.scorer.name(),
                target_len = settings.target_len,
                fill_policy = ?settings.fill_policy,
                "Starting recommendation refresh"
            );

            // STAGING
            let snapshot = match self.ratings.load_snapshot(settings.min_rating).await {
                Ok(snapshot) => Arc::new(snapshot),
                Err(e) => return Err(ctx.fail(JobError::Staging(e))),
            };
            tracing::info!(
                ratings = snapshot.ratings().len(),
                rated_users = snapshot.rated_user_count(),
                zero_rating_users = snapshot.zero_rating_users().len(),
                catalog = snapshot.catalog().len(),
                "Rating snapshot staged"
            );
            ctx.check_deadline()?;

            // SCORING
            ctx.advance(JobState::Scoring);
            let users: Vec<UserId> = snapshot.rated_users().collect();
            let candidates = if users.is_empty() {
                Vec::new()
            } else {
                let targets: BTreeSet<UserId> = users.iter().copied().collect();
                let scored = self
                    .scorer
                    .score(snapshot.clone(), users, settings.target_len)
                    .await
                    .and_then(|candidates| {
                        validate_candidates(&candidates, &snapshot, &targets)?;
                        Ok(candidates)
                    });
                match scored {
                    Ok(candidates) => candidates,
                    Err(e) => return Err(ctx.fail(JobError::Scoring(e))),
                }
            };
            tracing::info!(candidates = candidates.len(), "Scoring complete");
            ctx.check_deadline()?;

            // ASSEMBLING
            ctx.advance(JobState::Assembling);
            let assembled = CandidateAssembler::new(settings.target_len).assemble(candidates, &snapshot);
            tracing::info!(
                complete = assembled.complete.len(),
                underfilled = assembled.underfilled.len(),
                stripped = assembled.stripped,
                duplicates = assembled.duplicates,
                "Candidates assembled"
            );
            if assembled.stripped > 0 {
                tracing::warn!(
                    stripped = assembled.stripped,
                    "Scorer proposed items users had already rated"
                );
            }

            // FILLING
            ctx.advance(JobState::Filling);
            let mut rng = match settings.fill_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let underfilled_users: Vec<UserId> =
                assembled.underfilled.iter().map(|u| u.user_id).collect();
            let complete = assembled.complete;
            let fill = FallbackSampler::new(settings.target_len, settings.fill_policy).fill(
                assembled.underfilled,
                &snapshot,
                &mut rng,
            );

            // COLD_START
            ctx.advance(JobState::ColdStart);
            let cold = ColdStartRanker::new(settings.popularity_threshold, settings.target_len)
                .rank(&snapshot);
            let cold_lists: Vec<RecommendationList> = snapshot
                .zero_rating_users()
                .iter()
                .map(|&user_id| RecommendationList::new(user_id, cold.items.clone(), ListSource::ColdStart))
                .collect();
            tracing::info!(
                users = cold_lists.len(),
                qualifying = cold.qualifying,
                padded = cold.padded,
                "Cold-start list ranked"
            );

            let complete_count = complete.len();
            let filled_count = fill.lists.len();
            let cold_count = cold_lists.len();
            let omitted = fill.omitted();

            let mut lists: Vec<RecommendationList> = complete
                .into_iter()
                .chain(fill.lists)
                .chain(cold_lists)
                .collect();
            lists.sort_by_key(|list| list.user_id);

            // WRITING
            ctx.advance(JobState::Writing);
            ctx.check_deadline()?;
            let version = match publisher::publish(
                self.writer.as_ref(),
                &settings.publish_retry,
                ctx.run_id,
                &lists,
            )
            .await
            {
                Ok(version) => version,
                Err(e) => return Err(ctx.fail(JobError::Persistence(e))),
            };

            ctx.advance(JobState::Done);

            let report = JobReport {
                run_id: ctx.run_id,
                started_at: ctx.started_at,
                finished_at: Utc::now(),
                snapshot_version: version,
                users_published: lists.len(),
                complete: complete_count,
                filled: filled_count,
                cold_start: cold_count,
                omitted,
                underfilled_users,
                shortfalls: fill.shortfalls,
                cold_start_items: cold.items,
            };

            tracing::info!(
                version,
                users = report.users_published,
                complete = report.complete,
                filled = report.filled,
                cold_start = report.cold_start,
                omitted = report.omitted,
                total_time_ms = start.elapsed().as_millis(),
                "Recommendation refresh complete"
            );

            Ok(report)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::models::{Candidate, Rating, RatingSnapshot};
    use crate::services::lease::MemoryRunLock;
    use crate::services::publisher::MemoryRecommendationWriter;
    use crate::services::ratings::MockRatingStore;
    use crate::services::scoring::MockCandidateScorer;

    fn snapshot() -> RatingSnapshot {
        RatingSnapshot::new(
            vec![
                Rating::new(1, 1, 5.0),
                Rating::new(1, 2, 4.0),
                Rating::new(2, 3, 3.0),
            ],
            vec![3],
            1..=20,
        )
    }

    fn ratings() -> MockRatingStore {
        let mut store = MockRatingStore::new();
        store
            .expect_load_snapshot()
            .returning(|_| Ok(snapshot()));
        store
    }

    fn settings() -> JobSettings {
        JobSettings {
            fill_seed: Some(7),
            publish_retry: RetryConfig::none(),
            ..Default::default()
        }
    }

    /// Scorer that takes `delay` and proposes nothing
    struct SlowScorer {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl CandidateScorer for SlowScorer {
        async fn score(
            &self,
            _snapshot: Arc<RatingSnapshot>,
            _users: Vec<UserId>,
            _per_user: usize,
        ) -> AppResult<Vec<Candidate>> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    /// Writer whose publish takes `delay` before it lands
    struct SlowWriter {
        inner: MemoryRecommendationWriter,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RecommendationWriter for SlowWriter {
        async fn replace_all(&self, run_id: Uuid, lists: &[RecommendationList]) -> AppResult<i64> {
            tokio::time::sleep(self.delay).await;
            self.inner.replace_all(run_id, lists).await
        }

        async fn active_version(&self) -> AppResult<Option<i64>> {
            self.inner.active_version().await
        }
    }

    fn empty_scorer() -> MockCandidateScorer {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer.expect_score().returning(|_, _, _| Ok(vec![]));
        scorer
    }

    fn previous_lists() -> Vec<RecommendationList> {
        vec![RecommendationList::new(9, vec![1, 2, 3], ListSource::Scored)]
    }

    fn job(
        ratings: MockRatingStore,
        scorer: MockCandidateScorer,
        writer: Arc<MemoryRecommendationWriter>,
        settings: JobSettings,
    ) -> RefreshJob {
        RefreshJob::new(Arc::new(ratings), Arc::new(scorer), writer, settings)
    }

    #[tokio::test]
    async fn test_publishes_every_known_user() {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer.expect_score().returning(|_, _, _| {
            Ok(vec![
                Candidate::new(1, 5, 0.9),
                Candidate::new(1, 6, 0.8),
                Candidate::new(2, 7, 0.7),
            ])
        });
        let writer = Arc::new(MemoryRecommendationWriter::new());

        let report = job(ratings(), scorer, writer.clone(), settings())
            .run()
            .await
            .unwrap();

        let published = writer.published().await;
        assert_eq!(
            published.iter().map(|l| l.user_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(published.iter().all(|l| l.len() == 10));
        assert_eq!(&published[0].items[..2], &[5, 6]);
        assert_eq!(published[2].source, ListSource::ColdStart);
        assert_eq!(report.snapshot_version, 1);
        assert_eq!(report.filled, 2);
        assert_eq!(report.cold_start, 1);
        assert_eq!(report.underfilled_users, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_staging_failure_touches_nothing() {
        let mut store = MockRatingStore::new();
        store
            .expect_load_snapshot()
            .returning(|_| Err(AppError::Database(sqlx::Error::PoolTimedOut)));
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer.expect_score().never();
        let writer = Arc::new(MemoryRecommendationWriter::new());

        let err = job(store, scorer, writer.clone(), settings())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Staging(_)));
        assert_eq!(writer.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_scorer_failure_keeps_previous_snapshot() {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer
            .expect_score()
            .returning(|_, _, _| Err(AppError::ExternalApi("scorer unavailable".to_string())));
        let previous = vec![RecommendationList::new(9, vec![1, 2, 3], ListSource::Scored)];
        let writer = Arc::new(MemoryRecommendationWriter::with_published(previous.clone()));

        let err = job(ratings(), scorer, writer.clone(), settings())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Scoring(_)));
        assert_eq!(writer.published().await, previous);
    }

    #[tokio::test]
    async fn test_malformed_scorer_output_is_a_scoring_error() {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer
            .expect_score()
            .returning(|_, _, _| Ok(vec![Candidate::new(1, 999, 0.5)]));
        let writer = Arc::new(MemoryRecommendationWriter::new());

        let err = job(ratings(), scorer, writer.clone(), settings())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Scoring(AppError::InvalidData(_))));
        assert_eq!(writer.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_stops_after_staging() {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer.expect_score().never();
        let writer = Arc::new(MemoryRecommendationWriter::new());
        let settings = JobSettings {
            deadline: Some(Duration::ZERO),
            ..settings()
        };

        let err = job(ratings(), scorer, writer.clone(), settings)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JobError::DeadlineExceeded {
                stage: JobState::Staging
            }
        ));
        assert_eq!(writer.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_run_exclusive_refuses_when_lease_held() {
        let mut store = MockRatingStore::new();
        store.expect_load_snapshot().never();
        let scorer = MockCandidateScorer::new();
        let writer = Arc::new(MemoryRecommendationWriter::new());
        let lock = MemoryRunLock::new("beer-recs");
        let held = lock.try_acquire(Duration::from_secs(60)).await.unwrap();
        assert!(held.is_some());

        let err = job(store, scorer, writer, settings())
            .run_exclusive(&lock, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::AlreadyRunning(ref job) if job == "beer-recs"));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_and_releases_lease() {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer.expect_score().returning(|_, _, _| Ok(vec![]));
        let writer = Arc::new(MemoryRecommendationWriter::new());
        let lock = MemoryRunLock::new("beer-recs");

        let err = job(ratings(), scorer, writer.clone(), settings())
            .run_exclusive(&lock, std::future::ready(()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JobError::Interrupted {
                stage: JobState::Staging
            }
        ));
        assert!(writer.published().await.is_empty());
        assert!(lock
            .try_acquire(Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_lease_after_success() {
        let mut scorer = MockCandidateScorer::new();
        scorer.expect_name().return_const("mock");
        scorer.expect_score().returning(|_, _, _| Ok(vec![]));
        let writer = Arc::new(MemoryRecommendationWriter::new());
        let lock = MemoryRunLock::new("beer-recs");

        let report = job(ratings(), scorer, writer, settings())
            .run_exclusive(&lock, std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.users_published, 3);
        assert!(lock
            .try_acquire(Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_deadline_expiring_during_scoring() {
        let writer = Arc::new(MemoryRecommendationWriter::with_published(previous_lists()));
        let settings = JobSettings {
            deadline: Some(Duration::from_millis(50)),
            ..settings()
        };
        let job = RefreshJob::new(
            Arc::new(ratings()),
            Arc::new(SlowScorer {
                delay: Duration::from_millis(200),
            }),
            writer.clone(),
            settings,
        );

        let err = job.run().await.unwrap_err();

        assert!(matches!(
            err,
            JobError::DeadlineExceeded {
                stage: JobState::Scoring
            }
        ));
        assert_eq!(writer.attempts().await, 0);
        assert_eq!(writer.published().await, previous_lists());
    }

    #[tokio::test]
    async fn test_deadline_checked_before_writing() {
        // Start, end of staging, end of scoring, start of writing
        let base = Instant::now();
        let mut ticks = vec![
            base,
            base + Duration::from_secs(1),
            base + Duration::from_secs(2),
            base + Duration::from_secs(11),
        ]
        .into_iter();
        let mut clock = MockClock::new();
        clock
            .expect_now()
            .times(4)
            .returning(move || ticks.next().unwrap_or(base));

        let writer = Arc::new(MemoryRecommendationWriter::with_published(previous_lists()));
        let settings = JobSettings {
            deadline: Some(Duration::from_secs(10)),
            ..settings()
        };

        let err = job(ratings(), empty_scorer(), writer.clone(), settings)
            .with_clock(Arc::new(clock))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JobError::DeadlineExceeded {
                stage: JobState::Writing
            }
        ));
        assert_eq!(writer.attempts().await, 0);
        assert_eq!(writer.published().await, previous_lists());
    }

    #[tokio::test]
    async fn test_shutdown_during_scoring_returns_promptly() {
        let writer = Arc::new(MemoryRecommendationWriter::with_published(previous_lists()));
        let lock = MemoryRunLock::new("beer-recs");
        let job = RefreshJob::new(
            Arc::new(ratings()),
            Arc::new(SlowScorer {
                delay: Duration::from_secs(30),
            }),
            writer.clone(),
            settings(),
        );

        let start = Instant::now();
        let err = job
            .run_exclusive(&lock, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            JobError::Interrupted {
                stage: JobState::Scoring
            }
        ));
        assert_eq!(writer.attempts().await, 0);
        assert_eq!(writer.published().await, previous_lists());
        assert!(lock
            .try_acquire(Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_shutdown_during_publish_lets_it_finish() {
        let writer = Arc::new(SlowWriter {
            inner: MemoryRecommendationWriter::with_published(previous_lists()),
            delay: Duration::from_millis(300),
        });
        let lock = MemoryRunLock::new("beer-recs");
        let job = RefreshJob::new(
            Arc::new(ratings()),
            Arc::new(empty_scorer()),
            writer.clone(),
            settings(),
        );

        let report = job
            .run_exclusive(&lock, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(report.snapshot_version, 2);
        assert_eq!(writer.active_version().await.unwrap(), Some(2));
        let published = writer.inner.published().await;
        assert_eq!(published.len(), 3);
        assert!(!published.iter().any(|l| l.user_id == 9));
        assert!(lock
            .try_acquire(Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }
}
