pub mod deployment;
pub mod job;
pub mod log;
pub mod models;

use uuid::Uuid;

pub use deployment::{BuildStatus, InfrastructureStatus, Phase, Status};
pub use job::{Job, JobType};
pub use log::Item as LogItem;

pub type DeploymentId = Uuid;
pub type JobId = Uuid;

/// Default application port when a deployment does not declare one.
pub const DEFAULT_PORT: u16 = 8080;

/// Default replica count for exposed workloads.
pub const DEFAULT_REPLICAS: u32 = 2;

/// Default worker node count for provisioned clusters.
pub const DEFAULT_NODE_COUNT: u32 = 2;

/// Version sentinel used by auto-rollback to mean "whatever ran before".
pub const PREVIOUS_VERSION: &str = "previous";
