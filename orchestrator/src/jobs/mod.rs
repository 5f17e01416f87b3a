//! The five job handlers and the context they run against.
//!
//! Handlers share one skeleton: parse the payload with the strict
//! schema for the job type, load the deployment, create a
//! phase-scoped logger, advance the phase, do the work, write the
//! outcome, and where the pipeline continues, enqueue the next-stage
//! job. Errors are recorded and returned; the worker pool owns all
//! retry bookkeeping.

mod build;
mod deploy;
mod destroy;
mod provision;
mod rollback;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use skyhook_common::{Job, JobType};
use uuid::Uuid;

use crate::builder::ImageBuildService;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::persistence::{Deployment, Persistence};
use crate::queue::Queue;
use crate::stages::{Deployer, Provisioner};

/// Everything a handler may touch, shared by every worker.
#[derive(Clone)]
pub struct JobContext {
    pub persistence: Persistence,
    pub queue: Queue,
    pub engine: Engine,
    pub build_service: ImageBuildService,
    pub provisioner: Arc<dyn Provisioner>,
    pub deployer: Arc<dyn Deployer>,
}

/// Routes a job to the handler for its type.
pub async fn handle(ctx: &JobContext, job: &Job) -> Result<()> {
    match job.job_type {
        JobType::Build => build::handle(ctx, job).await,
        JobType::Provision => provision::handle(ctx, job).await,
        JobType::Deploy => deploy::handle(ctx, job).await,
        JobType::Destroy => destroy::handle(ctx, job).await,
        JobType::Rollback => rollback::handle(ctx, job).await,
    }
}

/// The deterministic provisioning stack name for a deployment.
pub fn stack_name(deployment_id: &Uuid) -> String {
    let id = deployment_id.simple().to_string();

    format!("skyhook-{}", &id[..8])
}

fn parse_payload<T: DeserializeOwned>(job: &Job) -> Result<T> {
    serde_json::from_value(job.payload.clone())
        .map_err(|err| Error::Validation(format!("{} payload: {err}", job.job_type)))
}

async fn load_deployment(ctx: &JobContext, id: &Uuid) -> Result<Deployment> {
    ctx.persistence
        .get_deployment(id)
        .await?
        .ok_or(Error::DeploymentNotFound(*id))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skyhook_common::job::DestroyPayload;

    use super::*;

    #[test]
    fn stack_names_are_deterministic() {
        let id = Uuid::new_v4();

        assert_eq!(stack_name(&id), stack_name(&id));
        assert!(stack_name(&id).starts_with("skyhook-"));
        assert_eq!(stack_name(&id).len(), "skyhook-".len() + 8);
    }

    #[test]
    fn parse_rejects_schema_drift() {
        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::Destroy,
            deployment_id: Uuid::new_v4(),
            payload: json!({
                "deployment_id": Uuid::new_v4(),
                "infrastructure_id": Uuid::new_v4(),
                "force": true,
            }),
            created_at: chrono::Utc::now(),
            attempts: 1,
            max_attempts: 3,
            last_error: None,
            next_retry_at: None,
        };

        let err = parse_payload::<DestroyPayload>(&job).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("force"));
    }
}
