use chrono::{DateTime, Utc};
use skyhook_common::deployment::Phase;
use skyhook_common::log::{Item, Level};
use uuid::Uuid;

/// One stored row of the deployment log stream.
///
/// `id` is the insertion-order tie-breaker for rows sharing a
/// timestamp.
#[derive(Clone, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct Log {
    pub id: i64,
    pub deployment_id: Uuid,
    pub job_id: Option<Uuid>,
    pub phase: Phase,
    pub level: Level,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl From<Log> for Item {
    fn from(log: Log) -> Self {
        Item {
            deployment_id: log.deployment_id,
            job_id: log.job_id,
            phase: log.phase,
            level: log.level,
            message: log.message,
            details: log.details,
            timestamp: log.timestamp,
        }
    }
}
