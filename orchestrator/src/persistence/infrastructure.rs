use chrono::{DateTime, Utc};
use skyhook_common::deployment::InfrastructureStatus;
use uuid::Uuid;

/// The cloud and Kubernetes resources backing one deployment.
///
/// `deployment_id` is the single authoritative foreign key; a
/// deployment finds its infrastructure by looking this table up, never
/// the other way round. Rows are never reused across deployments.
#[derive(Clone, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct Infrastructure {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub stack_name: String,
    pub cluster_name: Option<String>,
    pub cluster_endpoint: Option<String>,
    pub cluster_ca_cert: Option<String>,
    pub namespace: Option<String>,
    pub helm_release_name: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub status: InfrastructureStatus,
    pub last_error: Option<String>,
    pub provision_log: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Infrastructure {
    /// A fresh record in `Provisioning`, before the provisioner has
    /// reported any cluster facts.
    pub fn new(deployment_id: Uuid, stack_name: String) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            deployment_id,
            stack_name,
            cluster_name: None,
            cluster_endpoint: None,
            cluster_ca_cert: None,
            namespace: None,
            helm_release_name: None,
            vpc_id: None,
            subnet_id: None,
            status: InfrastructureStatus::Provisioning,
            last_error: None,
            provision_log: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a Helm release has been recorded for this cluster.
    pub fn has_release(&self) -> bool {
        self.helm_release_name
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }
}
