use chrono::{DateTime, Utc};
use skyhook_common::deployment::BuildStatus;
use uuid::Uuid;

/// A single container-image build attempt for a deployment.
#[derive(Clone, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct Build {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub version: String,
    pub image_tag: Option<String>,
    pub status: BuildStatus,
    pub build_log: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn started(deployment_id: Uuid, version: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment_id,
            version,
            image_tag: None,
            status: BuildStatus::Building,
            build_log: String::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}
