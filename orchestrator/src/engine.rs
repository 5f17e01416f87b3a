//! The single producer-side funnel onto the queue.
//!
//! HTTP handlers and completing job handlers never build `Job`
//! envelopes themselves; everything goes through one typed `enqueue_*`
//! per job type so that id minting, defaulting and payload validation
//! live in one place.

use chrono::Utc;
use serde_json::json;
use skyhook_common::deployment::Phase;
use skyhook_common::job::{
    BuildPayload, DeployPayload, DestroyPayload, ProvisionPayload, RollbackPayload,
};
use skyhook_common::{Job, JobType, DEFAULT_NODE_COUNT, DEFAULT_PORT, DEFAULT_REPLICAS};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::logger::DeploymentLogger;
use crate::persistence::Persistence;
use crate::queue::Queue;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_CLOUD: &str = "aws";
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct Engine {
    queue: Queue,
    persistence: Persistence,
    max_attempts: u32,
}

impl Engine {
    pub fn new(queue: Queue, persistence: Persistence) -> Self {
        Self {
            queue,
            persistence,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn enqueue_build(&self, mut payload: BuildPayload) -> Result<Job> {
        require(!payload.app_name.is_empty(), "app_name is required")?;
        require(!payload.version.is_empty(), "version is required")?;
        require(!payload.repo_url.is_empty(), "repo_url is required")?;

        if payload.branch.is_empty() {
            payload.branch = "main".to_string();
        }
        default_placement(&mut payload.cloud, &mut payload.region);

        let deployment_id = payload.deployment_id;
        self.push(JobType::Build, deployment_id, serde_json::to_value(payload)?)
            .await
    }

    pub async fn enqueue_provision(&self, mut payload: ProvisionPayload) -> Result<Job> {
        require(!payload.app_name.is_empty(), "app_name is required")?;
        require(!payload.image_tag.is_empty(), "image_tag is required")?;

        default_placement(&mut payload.cloud, &mut payload.region);
        payload.node_count = Some(payload.node_count.unwrap_or(DEFAULT_NODE_COUNT).max(1));
        payload.replicas = Some(payload.replicas.unwrap_or(DEFAULT_REPLICAS).max(1));

        let deployment_id = payload.deployment_id;
        self.push(
            JobType::Provision,
            deployment_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    pub async fn enqueue_deploy(&self, mut payload: DeployPayload) -> Result<Job> {
        require(!payload.image_tag.is_empty(), "image_tag is required")?;

        if payload.port == 0 {
            payload.port = DEFAULT_PORT;
        }
        if payload.replicas == 0 {
            payload.replicas = DEFAULT_REPLICAS;
        }

        let deployment_id = payload.deployment_id;
        self.push(
            JobType::Deploy,
            deployment_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    pub async fn enqueue_destroy(&self, payload: DestroyPayload) -> Result<Job> {
        let deployment_id = payload.deployment_id;
        self.push(
            JobType::Destroy,
            deployment_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    pub async fn enqueue_rollback(&self, payload: RollbackPayload) -> Result<Job> {
        require(
            !payload.target_version.is_empty(),
            "target_version is required",
        )?;

        let deployment_id = payload.deployment_id;
        self.push(
            JobType::Rollback,
            deployment_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    async fn push(
        &self,
        job_type: JobType,
        deployment_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Job> {
        if deployment_id.is_nil() {
            return Err(Error::Validation("deployment_id is required".to_string()));
        }

        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            deployment_id,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            next_retry_at: None,
        };

        self.queue.enqueue(&job).await?;

        DeploymentLogger::new(
            self.persistence.clone(),
            deployment_id,
            Some(job.id),
            Phase::Queued,
        )
        .info(
            format!("{job_type} job queued"),
            json!({ "max_attempts": job.max_attempts }),
        )
        .await;

        Ok(job)
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Validation(message.to_string()))
    }
}

fn default_placement(cloud: &mut String, region: &mut String) {
    if cloud.is_empty() {
        *cloud = DEFAULT_CLOUD.to_string();
    }
    if region.is_empty() {
        *region = DEFAULT_REGION.to_string();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn test_engine() -> (Engine, Queue) {
        let queue = Queue::new_in_memory().await.unwrap();
        let persistence = Persistence::new_in_memory().await.unwrap();

        (Engine::new(queue.clone(), persistence), queue)
    }

    fn build_payload() -> BuildPayload {
        BuildPayload {
            deployment_id: Uuid::new_v4(),
            app_name: "app".to_string(),
            version: "1.0.0".to_string(),
            repo_url: "https://example.com/app.git".to_string(),
            branch: String::new(),
            commit_sha: None,
            build_strategy: None,
            dockerfile: None,
            cloud: String::new(),
            region: String::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_enqueue_applies_defaults() {
        let (engine, queue) = test_engine().await;

        let job = engine.enqueue_build(build_payload()).await.unwrap();
        assert_eq!(job.job_type, JobType::Build);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.attempts, 0);

        let payload: BuildPayload = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.branch, "main");
        assert_eq!(payload.cloud, DEFAULT_CLOUD);
        assert_eq!(payload.region, DEFAULT_REGION);

        assert_eq!(queue.queue_length(JobType::Build).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validation_failures_never_reach_the_queue() {
        let (engine, queue) = test_engine().await;

        let mut missing_repo = build_payload();
        missing_repo.repo_url.clear();
        let err = engine.enqueue_build(missing_repo).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut nil_id = build_payload();
        nil_id.deployment_id = Uuid::nil();
        let err = engine.enqueue_build(nil_id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(queue.queue_length(JobType::Build).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provision_enqueue_fills_capacity_defaults() {
        let (engine, _) = test_engine().await;

        let job = engine
            .enqueue_provision(ProvisionPayload {
                deployment_id: Uuid::new_v4(),
                app_name: "app".to_string(),
                version: "1.0.0".to_string(),
                cloud: String::new(),
                region: String::new(),
                image_tag: "app:1.0.0".to_string(),
                build_id: None,
                node_count: None,
                machine_type: None,
                replicas: None,
            })
            .await
            .unwrap();

        let payload: ProvisionPayload = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.node_count, Some(DEFAULT_NODE_COUNT));
        assert_eq!(payload.replicas, Some(DEFAULT_REPLICAS));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_writes_a_queued_log_row() {
        let queue = Queue::new_in_memory().await.unwrap();
        let persistence = Persistence::new_in_memory().await.unwrap();
        let engine = Engine::new(queue, persistence.clone());

        let job = engine.enqueue_build(build_payload()).await.unwrap();

        let rows = persistence
            .get_deployment_logs(&job.deployment_id, Some(Phase::Queued), 10, 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, Some(job.id));
        assert_eq!(rows[0].message, "build job queued");
    }
}
