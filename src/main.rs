use std::process::ExitCode;
use std::sync::Arc;

use beer_recs::{
    config::{Config, ScorerKind},
    db::{create_pool, create_redis_client, run_migrations, RedisRunLock},
    error::JobError,
    models::JobReport,
    services::{
        publisher::PgRecommendationWriter,
        ratings::PgRatingStore,
        scoring::{AlsParams, AlsScorer, CandidateScorer, RemoteScorer},
        JobSettings, RefreshJob,
    },
};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beer_recs=info".into()),
        )
        .init();

    match run().await {
        Ok(report) => {
            tracing::info!(
                run_id = %report.run_id,
                version = report.snapshot_version,
                users = report.users_published,
                "Refresh succeeded"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            match e.downcast_ref::<JobError>() {
                Some(JobError::AlreadyRunning(job)) => {
                    tracing::warn!(job = %job, "Another refresh is in progress, exiting")
                }
                _ => tracing::error!(error = %e, "Refresh failed"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<JobReport> {
    let config = Config::from_env().map_err(|e| JobError::Config(e.to_string()))?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis_client = create_redis_client(&config.redis_url)?;
    let lock = RedisRunLock::new(redis_client, config.job_name.clone());

    let params = AlsParams {
        rank: config.als_rank,
        iterations: config.als_iterations,
        regularization: config.als_regularization,
        seed: config.als_seed,
    };
    let scorer: Arc<dyn CandidateScorer> = match (config.scorer, config.scorer_url.clone()) {
        (ScorerKind::Remote, Some(url)) => Arc::new(RemoteScorer::new(url, params)?),
        (ScorerKind::Remote, None) => {
            return Err(JobError::Config("SCORER=remote requires SCORER_URL".to_string()).into())
        }
        (ScorerKind::Als, _) => Arc::new(AlsScorer::new(params)),
    };

    let job = RefreshJob::new(
        Arc::new(PgRatingStore::new(pool.clone(), &config.source_schema())?),
        scorer,
        Arc::new(PgRecommendationWriter::new(pool.clone())),
        JobSettings::from(&config),
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    let outcome = job.run_exclusive(&lock, shutdown).await;
    pool.close().await;
    let report = outcome?;

    // The snapshot is already live; bookkeeping failures only warn
    if let Some(path) = &config.report_path {
        match write_report(path, &report).await {
            Ok(()) => tracing::info!(path = %path, "Run report written"),
            Err(e) => tracing::warn!(path = %path, error = %e, "Failed to write run report"),
        }
    }

    if let Err(e) = lock.record_last_run(&report).await {
        tracing::warn!(error = %e, "Failed to record last run in Redis");
    }

    Ok(report)
}

async fn write_report(path: &str, report: &JobReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
