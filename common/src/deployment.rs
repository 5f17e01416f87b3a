use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States a deployment can be in.
///
/// External IP and URL are populated only in `Exposed` and
/// `RollingBack`; every other state clears them.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Status {
    /// Created by the API layer, nothing enqueued yet
    #[default]
    Pending,

    /// A build job has been enqueued but no worker has taken it
    Queued,

    /// Source is being cloned, analyzed and built into an image
    Building,

    /// Cluster and network resources are being created
    Provisioning,

    /// The image is being released into the cluster
    Deploying,

    /// Reachable at its external URL
    Exposed,

    /// A compensating rollback is in flight
    RollingBack,

    /// Cluster resources are being torn down
    Destroying,

    /// All backing resources are gone; terminal
    Destroyed,

    /// A job exhausted its attempts; recoverable via rollback or destroy
    Failed,
}

impl Status {
    /// Whether `next` is a legal move in the deployment lifecycle.
    ///
    /// This is the transition table the handlers obey. The state store
    /// itself stays last-writer-wins; callers outside the handlers are
    /// expected to check here first.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;

        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Building) => true,
            (Building, Provisioning) | (Building, Failed) => true,
            (Provisioning, Deploying) | (Provisioning, Failed) => true,
            // A deploy retry re-enters the same state
            (Deploying, Deploying) | (Deploying, Exposed) | (Deploying, Failed) => true,
            // A retried job re-enters its phase from the failure it recorded
            (Failed, Building) | (Failed, Provisioning) | (Failed, Deploying) => true,
            (Failed, RollingBack) => true,
            (Exposed, RollingBack) => true,
            (RollingBack, Exposed) | (RollingBack, Failed) => true,
            (Exposed, Destroying) | (Failed, Destroying) => true,
            (Destroying, Destroyed) => true,
            _ => false,
        }
    }

    /// Terminal states never move again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Destroyed)
    }
}

/// States an infrastructure record can be in.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum InfrastructureStatus {
    #[default]
    Provisioning,
    Ready,
    Destroying,
    Destroyed,
    Failed,
}

/// States a container image build can be in.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum BuildStatus {
    #[default]
    Building,
    Completed,
    Failed,
}

/// Phase tag attached to every deployment log row.
///
/// `Queued` is written by the enqueue facade; the rest map one-to-one
/// onto the five job types.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Phase {
    Queued,
    Building,
    Provisioning,
    Deploying,
    Destroying,
    RollingBack,
}
