#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ClubPass Background Worker
//!
//! Handles scheduled jobs including:
//! - Autopay renewal of expired subscriptions (hourly)
//! - Group membership sync (every 10 minutes)
//! - Pending payment poll for lost webhooks (every 5 minutes)
//! - Loyalty sweep for tiers reached between payments (daily at 02:15 UTC)
//! - Ledger invariant check (daily at 03:30 UTC)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;

use clubpass_billing::{BillingService, InvariantChecker, JobLock, LocalJobLock, RedisJobLock};
use clubpass_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::jobs::Jobs;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,clubpass_billing=debug".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Redis when `REDIS_URL` is set so several workers never overlap a job
async fn job_lock() -> anyhow::Result<Arc<dyn JobLock>> {
    match std::env::var("REDIS_URL") {
        Ok(url) if !url.is_empty() => {
            let lock = RedisJobLock::connect(&url).await?;
            info!("Job locks backed by Redis");
            Ok(Arc::new(lock))
        }
        _ => {
            warn!("REDIS_URL not set - job locks are local to this process, run a single worker");
            Ok(Arc::new(LocalJobLock::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting ClubPass Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let billing = BillingService::from_env(pool.clone())?;
    let invariants = InvariantChecker::new(
        pool,
        billing.config.autopay_max_failures,
        jobs::EXPIRY_GRACE,
    );
    let jobs = Jobs::new(billing, Some(Arc::new(invariants)), job_lock().await?);

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Autopay renewals
    let autopay_jobs = jobs.clone();
    scheduler
        .add(Job::new_async(jobs::AUTOPAY_CRON, move |_uuid, _l| {
            let jobs = autopay_jobs.clone();
            Box::pin(async move {
                info!("Running scheduled autopay cycle");
                jobs.run_autopay().await;
            })
        })?)
        .await?;
    info!("Scheduled: Autopay renewals (hourly)");

    // Job 2: Group membership sync
    let sync_jobs = jobs.clone();
    scheduler
        .add(Job::new_async(jobs::GROUP_SYNC_CRON, move |_uuid, _l| {
            let jobs = sync_jobs.clone();
            Box::pin(async move {
                jobs.run_group_sync().await;
            })
        })?)
        .await?;
    info!("Scheduled: Group membership sync (every 10 minutes)");

    // Job 3: Payments whose webhook never arrived
    let poll_jobs = jobs.clone();
    scheduler
        .add(Job::new_async(jobs::PENDING_POLL_CRON, move |_uuid, _l| {
            let jobs = poll_jobs.clone();
            Box::pin(async move {
                jobs.run_pending_poll().await;
            })
        })?)
        .await?;
    info!("Scheduled: Pending payment poll (every 5 minutes)");

    // Job 4: Loyalty tiers reached by tenure
    let loyalty_jobs = jobs.clone();
    scheduler
        .add(Job::new_async(jobs::LOYALTY_CRON, move |_uuid, _l| {
            let jobs = loyalty_jobs.clone();
            Box::pin(async move {
                jobs.run_loyalty().await;
            })
        })?)
        .await?;
    info!("Scheduled: Loyalty sweep (daily at 02:15 UTC)");

    // Job 5: Ledger invariants
    let invariant_jobs = jobs.clone();
    scheduler
        .add(Job::new_async(jobs::INVARIANTS_CRON, move |_uuid, _l| {
            let jobs = invariant_jobs.clone();
            Box::pin(async move {
                info!("Running daily ledger invariant check");
                jobs.run_invariants().await;
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant check (daily at 03:30 UTC)");

    // Job 6: Heartbeat
    scheduler
        .add(Job::new_async(jobs::HEARTBEAT_CRON, |_uuid, _l| {
            Box::pin(async move {
                Jobs::heartbeat();
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("ClubPass Worker started successfully with {} scheduled jobs", 6);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
