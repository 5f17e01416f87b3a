//! Response shapes served by the orchestrator's HTTP surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::Status;
use crate::job::JobType;
use crate::log::Item as LogItem;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentResponse {
    pub id: Uuid,
    pub name: String,
    pub app_name: String,
    pub version: String,
    pub cloud: String,
    pub region: String,
    pub port: u16,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Returned by the enqueue endpoints once the job is durable.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EnqueuedResponse {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub deployment_id: Uuid,
}

/// One page of the deployment log stream plus the unpaged total.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<LogItem>,
    pub total: i64,
}

/// Queue depth per job type.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueueStatsResponse {
    pub lengths: BTreeMap<JobType, i64>,
}
