use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::deployment::Phase;

/// The five kinds of work the orchestration core knows how to do.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum JobType {
    Build,
    Provision,
    Deploy,
    Destroy,
    Rollback,
}

impl JobType {
    /// All types, in the order the worker pool round-robins over them.
    pub const ALL: [JobType; 5] = [
        JobType::Build,
        JobType::Provision,
        JobType::Deploy,
        JobType::Destroy,
        JobType::Rollback,
    ];

    /// The phase tag a handler for this job type logs under.
    pub fn phase(self) -> Phase {
        match self {
            JobType::Build => Phase::Building,
            JobType::Provision => Phase::Provisioning,
            JobType::Deploy => Phase::Deploying,
            JobType::Destroy => Phase::Destroying,
            JobType::Rollback => Phase::RollingBack,
        }
    }
}

/// Queue envelope for one unit of work.
///
/// The payload is an opaque JSON map until a handler parses it with
/// the strict schema for its own type.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub deployment_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Payload for a build job.
///
/// Unknown fields are rejected on purpose so that schema drift between
/// producers and handlers surfaces as a parse error instead of a
/// silently dropped field.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPayload {
    pub deployment_id: Uuid,
    pub app_name: String,
    pub version: String,
    pub repo_url: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    pub cloud: String,
    pub region: String,
}

/// Payload for a provision job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionPayload {
    pub deployment_id: Uuid,
    pub app_name: String,
    pub version: String,
    pub cloud: String,
    pub region: String,
    pub image_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

/// Payload for a deploy job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeployPayload {
    pub deployment_id: Uuid,
    pub infrastructure_id: Uuid,
    pub image_tag: String,
    pub port: u16,
    pub replicas: u32,
}

/// Payload for a destroy job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DestroyPayload {
    pub deployment_id: Uuid,
    pub infrastructure_id: Uuid,
}

/// Payload for a rollback job.
///
/// Auto-rollback enqueues the sentinel pair
/// (`target_version = "previous"`, `target_tag = None`); the handler
/// maps the sentinel to the previous Helm revision. Both fields stay
/// on the wire for forward compatibility.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackPayload {
    pub deployment_id: Uuid,
    pub target_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tag: Option<String>,
}
