use chrono::{DateTime, Utc};
use skyhook_common::deployment::Status;
use skyhook_common::models::DeploymentResponse;
use uuid::Uuid;

/// One user-visible application deployment.
///
/// The link to its Infrastructure is derived through
/// `infrastructures.deployment_id`, not stored here.
#[derive(Clone, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub name: String,
    pub app_name: String,
    pub version: String,
    pub cloud: String,
    pub region: String,
    pub port: u16,
    pub external_ip: Option<String>,
    pub external_url: Option<String>,
    pub status: Status,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl From<Deployment> for DeploymentResponse {
    fn from(deployment: Deployment) -> Self {
        DeploymentResponse {
            id: deployment.id,
            name: deployment.name,
            app_name: deployment.app_name,
            version: deployment.version,
            cloud: deployment.cloud,
            region: deployment.region,
            port: deployment.port,
            status: deployment.status,
            external_ip: deployment.external_ip,
            external_url: deployment.external_url,
            last_error: deployment.last_error,
            created_at: deployment.created_at,
            updated_at: deployment.updated_at,
        }
    }
}
