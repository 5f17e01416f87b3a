//! The bounded pool of cooperative job consumers.
//!
//! Each worker runs an identical loop: pick the next job type in a
//! strictly uniform round-robin, block on the queue up to the poll
//! timeout, and run the typed handler under that type's deadline. The
//! pool owns all retry bookkeeping: backoff with jitter while attempts
//! remain, dead-lettering when they run out, and the compensating
//! rollback for deploys that die for good.

mod backoff;

use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use skyhook_common::deployment::Status;
use skyhook_common::job::{DeployPayload, RollbackPayload};
use skyhook_common::{Job, JobType, PREVIOUS_VERSION};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::jobs::{self, JobContext};
use crate::logger::DeploymentLogger;

/// Extra claim-marker lifetime beyond the handler deadline, so a
/// marker never expires under a live handler.
const PROCESSING_TTL_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub poll_timeout: Duration,
    pub base_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub jitter_percent: f64,
    pub build_deadline: Duration,
    pub provision_deadline: Duration,
    pub deploy_deadline: Duration,
    pub destroy_deadline: Duration,
    pub rollback_deadline: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_timeout: Duration::from_secs(5),
            base_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter_percent: 0.1,
            build_deadline: Duration::from_secs(30 * 60),
            provision_deadline: Duration::from_secs(20 * 60),
            deploy_deadline: Duration::from_secs(10 * 60),
            destroy_deadline: Duration::from_secs(10 * 60),
            rollback_deadline: Duration::from_secs(5 * 60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn deadline_for(&self, job_type: JobType) -> Duration {
        match job_type {
            JobType::Build => self.build_deadline,
            JobType::Provision => self.provision_deadline,
            JobType::Deploy => self.deploy_deadline,
            JobType::Destroy => self.destroy_deadline,
            JobType::Rollback => self.rollback_deadline,
        }
    }
}

pub struct WorkerPool {
    ctx: JobContext,
    config: WorkerPoolConfig,
}

/// Handle to a running pool; dropping it does not stop the workers,
/// `shutdown` does.
pub struct PoolHandle {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Cancels the root token and waits for every worker to finish its
    /// current job and exit.
    pub async fn shutdown(self) {
        self.token.cancel();

        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task did not shut down cleanly");
            }
        }
    }
}

impl WorkerPool {
    pub fn new(ctx: JobContext, config: WorkerPoolConfig) -> Self {
        Self { ctx, config }
    }

    /// Starts `concurrency` long-lived workers.
    pub fn start(&self) -> PoolHandle {
        let token = CancellationToken::new();
        let workers = (0..self.config.concurrency.max(1))
            .map(|ident| {
                let ctx = self.ctx.clone();
                let config = self.config.clone();
                let token = token.child_token();

                tokio::spawn(worker_loop(ident, ctx, config, token))
            })
            .collect();

        PoolHandle { token, workers }
    }
}

async fn worker_loop(
    ident: usize,
    ctx: JobContext,
    config: WorkerPoolConfig,
    token: CancellationToken,
) {
    debug!(worker = ident, "worker started");

    // Stagger the starting type per worker so a fresh pool does not
    // stampede one queue.
    let mut cursor = ident;

    loop {
        if token.is_cancelled() {
            break;
        }

        let job_type = JobType::ALL[cursor % JobType::ALL.len()];
        cursor = cursor.wrapping_add(1);

        let job = tokio::select! {
            _ = token.cancelled() => break,
            dequeued = ctx.queue.dequeue(job_type, config.poll_timeout) => match dequeued {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        worker = ident,
                        error = &err as &dyn std::error::Error,
                        "dequeue failed"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                    }
                }
            },
        };

        process(&ctx, &config, job, &token).await;
    }

    debug!(worker = ident, "worker stopped");
}

async fn process(ctx: &JobContext, config: &WorkerPoolConfig, job: Job, token: &CancellationToken) {
    let ttl = config.deadline_for(job.job_type) + PROCESSING_TTL_SLACK;
    if let Err(err) = ctx.queue.mark_processing(&job, ttl).await {
        warn!(
            job_id = %job.id,
            error = &err as &dyn std::error::Error,
            "failed to mark job as processing"
        );
    }

    match execute(ctx, config, &job, token).await {
        Ok(()) => {
            if let Err(err) = ctx.queue.mark_complete(&job.id).await {
                error!(
                    job_id = %job.id,
                    error = &err as &dyn std::error::Error,
                    "failed to acknowledge completed job"
                );
            }
        }
        Err(err) => handle_failure(ctx, config, job, err).await,
    }
}

/// Runs the typed handler under its deadline, catching panics so one
/// bad handler cannot take the worker with it, and bailing out
/// promptly when the pool shuts down.
async fn execute(
    ctx: &JobContext,
    config: &WorkerPoolConfig,
    job: &Job,
    token: &CancellationToken,
) -> Result<()> {
    let deadline = config.deadline_for(job.job_type);
    let work = std::panic::AssertUnwindSafe(jobs::handle(ctx, job)).catch_unwind();

    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(deadline, work) => match outcome {
            Err(_) => Err(Error::DeadlineExceeded(job.job_type)),
            Ok(Err(panic)) => Err(Error::HandlerPanicked(panic_message(panic))),
            Ok(Ok(result)) => result,
        },
    }
}

async fn handle_failure(ctx: &JobContext, config: &WorkerPoolConfig, mut job: Job, err: Error) {
    let logger = DeploymentLogger::new(
        ctx.persistence.clone(),
        job.deployment_id,
        Some(job.id),
        job.job_type.phase(),
    );
    let error_text = err.to_string();

    if job.attempts < job.max_attempts {
        let delay = backoff::retry_delay(config, job.attempts);
        job.last_error = Some(error_text.clone());
        job.next_retry_at = Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));

        logger
            .warn(
                format!(
                    "attempt {}/{} failed, retrying in {}s: {error_text}",
                    job.attempts,
                    job.max_attempts,
                    delay.as_secs(),
                ),
                json!({ "transient": err.is_transient() }),
            )
            .await;

        if let Err(requeue_err) = ctx.queue.requeue(&job).await {
            error!(
                job_id = %job.id,
                error = &requeue_err as &dyn std::error::Error,
                "failed to schedule retry; job will reappear when its claim lapses"
            );
        }
    } else {
        logger
            .error(
                format!(
                    "attempt {}/{} failed permanently: {error_text}",
                    job.attempts, job.max_attempts,
                ),
                json!({ "transient": err.is_transient() }),
            )
            .await;

        if let Err(failed_err) = ctx.queue.mark_failed(&job.id, &error_text).await {
            error!(
                job_id = %job.id,
                error = &failed_err as &dyn std::error::Error,
                "failed to dead-letter job"
            );
        }

        if job.job_type == JobType::Deploy {
            auto_rollback(ctx, &job).await;
        }
    }
}

/// Compensates a terminally failed deploy by rolling the release back
/// to whatever ran before. Best-effort: its own failures are logged
/// and never cascade.
async fn auto_rollback(ctx: &JobContext, job: &Job) {
    let payload: DeployPayload = match serde_json::from_value(job.payload.clone()) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(
                job_id = %job.id,
                error = %err,
                "cannot roll back a deploy whose payload does not parse"
            );
            return;
        }
    };

    let infrastructure = match ctx
        .persistence
        .get_infrastructure_by_deployment(&payload.deployment_id)
        .await
    {
        Ok(Some(infrastructure)) if infrastructure.has_release() => infrastructure,
        Ok(_) => {
            debug!(
                deployment_id = %payload.deployment_id,
                "no helm release recorded, nothing to roll back to"
            );
            return;
        }
        Err(err) => {
            warn!(
                deployment_id = %payload.deployment_id,
                error = &err as &dyn std::error::Error,
                "could not read infrastructure for auto-rollback"
            );
            return;
        }
    };

    if let Err(err) = ctx
        .persistence
        .update_deployment_status(&payload.deployment_id, Status::RollingBack)
        .await
    {
        warn!(
            deployment_id = %payload.deployment_id,
            error = &err as &dyn std::error::Error,
            "could not move deployment into rollback"
        );
    }

    match ctx
        .engine
        .enqueue_rollback(RollbackPayload {
            deployment_id: payload.deployment_id,
            target_version: PREVIOUS_VERSION.to_string(),
            target_tag: None,
        })
        .await
    {
        Ok(rollback_job) => {
            info!(
                deployment_id = %payload.deployment_id,
                rollback_job_id = %rollback_job.id,
                release_name = ?infrastructure.helm_release_name,
                "auto-rollback enqueued after terminal deploy failure"
            );
        }
        Err(err) => {
            warn!(
                deployment_id = %payload.deployment_id,
                error = &err as &dyn std::error::Error,
                "failed to enqueue auto-rollback"
            );
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}
