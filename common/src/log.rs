use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::deployment::Phase;

/// Severity of a deployment log row.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// One row of the deployment-scoped log stream.
///
/// Rows are append-only and returned to readers in non-decreasing
/// timestamp order, ties broken by insertion order.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Item {
    pub deployment_id: Uuid,
    pub job_id: Option<Uuid>,
    pub phase: Phase,
    pub level: Level,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
