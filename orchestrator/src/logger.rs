use skyhook_common::deployment::Phase;
use skyhook_common::log::Level;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::persistence::Persistence;

/// A logger scoped to one (deployment, job, phase) triple.
///
/// Every call appends one row to the deployment log stream and mirrors
/// it to the process log. The stream is the authoritative progress
/// feed; losing a row to a store hiccup must never fail the handler,
/// so write errors are reported to the process log and swallowed.
#[derive(Clone)]
pub struct DeploymentLogger {
    persistence: Persistence,
    deployment_id: Uuid,
    job_id: Option<Uuid>,
    phase: Phase,
}

impl DeploymentLogger {
    pub fn new(
        persistence: Persistence,
        deployment_id: Uuid,
        job_id: Option<Uuid>,
        phase: Phase,
    ) -> Self {
        Self {
            persistence,
            deployment_id,
            job_id,
            phase,
        }
    }

    /// The same bind-points under a different phase tag.
    pub fn for_phase(&self, phase: Phase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }

    pub async fn debug(&self, message: impl AsRef<str>, details: serde_json::Value) {
        self.write(Level::Debug, message.as_ref(), details).await;
    }

    pub async fn info(&self, message: impl AsRef<str>, details: serde_json::Value) {
        self.write(Level::Info, message.as_ref(), details).await;
    }

    pub async fn warn(&self, message: impl AsRef<str>, details: serde_json::Value) {
        self.write(Level::Warn, message.as_ref(), details).await;
    }

    pub async fn error(&self, message: impl AsRef<str>, details: serde_json::Value) {
        self.write(Level::Error, message.as_ref(), details).await;
    }

    async fn write(&self, level: Level, message: &str, details: serde_json::Value) {
        match level {
            Level::Debug => debug!(
                deployment_id = %self.deployment_id,
                job_id = ?self.job_id,
                phase = %self.phase,
                "{message}"
            ),
            Level::Info => info!(
                deployment_id = %self.deployment_id,
                job_id = ?self.job_id,
                phase = %self.phase,
                "{message}"
            ),
            Level::Warn => warn!(
                deployment_id = %self.deployment_id,
                job_id = ?self.job_id,
                phase = %self.phase,
                "{message}"
            ),
            Level::Error => error!(
                deployment_id = %self.deployment_id,
                job_id = ?self.job_id,
                phase = %self.phase,
                "{message}"
            ),
        }

        if let Err(err) = self
            .persistence
            .insert_log(
                &self.deployment_id,
                self.job_id,
                self.phase,
                level,
                message,
                &details,
            )
            .await
        {
            error!(
                error = &err as &dyn std::error::Error,
                deployment_id = %self.deployment_id,
                "failed to record deployment log row"
            );
        }
    }
}
