use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::worker::WorkerPoolConfig;

/// Program orchestrating deployments from source repository to a
/// publicly reachable URL: build, provision, deploy, destroy and roll
/// back, all driven through one durable job queue.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Address to bind the API to
    #[clap(long, default_value = "127.0.0.1:8001")]
    pub api_address: SocketAddr,

    /// Path of the state store database
    #[clap(long, default_value = "skyhook.sqlite")]
    pub state_db: PathBuf,

    /// Path of the queue database
    #[clap(long, default_value = "skyhook-queue.sqlite")]
    pub queue_db: PathBuf,

    /// Number of pool workers
    #[clap(long, default_value_t = 4)]
    pub workers: usize,

    /// Seconds a worker blocks on an empty queue before moving to the
    /// next job type
    #[clap(long, default_value_t = 5)]
    pub poll_timeout_secs: u64,

    /// Attempts a job gets before it is dead-lettered
    #[clap(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Base retry delay in seconds
    #[clap(long, default_value_t = 5)]
    pub base_backoff_secs: u64,

    /// Multiplier applied to the retry delay per attempt
    #[clap(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Upper bound on the retry delay in seconds
    #[clap(long, default_value_t = 300)]
    pub max_backoff_secs: u64,

    /// Uniform jitter applied to retry delays, as a fraction
    #[clap(long, default_value_t = 0.1)]
    pub jitter_percent: f64,

    /// Per-phase handler deadlines in seconds
    #[clap(long, default_value_t = 1800)]
    pub build_deadline_secs: u64,
    #[clap(long, default_value_t = 1200)]
    pub provision_deadline_secs: u64,
    #[clap(long, default_value_t = 600)]
    pub deploy_deadline_secs: u64,
    #[clap(long, default_value_t = 600)]
    pub destroy_deadline_secs: u64,
    #[clap(long, default_value_t = 300)]
    pub rollback_deadline_secs: u64,
}

impl Args {
    pub fn worker_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.workers.max(1),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            base_backoff: Duration::from_secs(self.base_backoff_secs),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            jitter_percent: self.jitter_percent,
            build_deadline: Duration::from_secs(self.build_deadline_secs),
            provision_deadline: Duration::from_secs(self.provision_deadline_secs),
            deploy_deadline: Duration::from_secs(self.deploy_deadline_secs),
            destroy_deadline: Duration::from_secs(self.destroy_deadline_secs),
            rollback_deadline: Duration::from_secs(self.rollback_deadline_secs),
        }
    }
}
