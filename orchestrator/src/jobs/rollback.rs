use serde_json::json;
use skyhook_common::deployment::{Phase, Status};
use skyhook_common::job::RollbackPayload;
use skyhook_common::{Job, PREVIOUS_VERSION};
use tracing::instrument;

use super::JobContext;
use crate::error::Result;
use crate::logger::DeploymentLogger;

/// Helm's sentinel for "the revision before this one".
const PREVIOUS_REVISION: u32 = 0;

#[instrument(skip(ctx, job), fields(deployment_id = %job.deployment_id, job_id = %job.id, phase = %Phase::RollingBack))]
pub(super) async fn handle(ctx: &JobContext, job: &Job) -> Result<()> {
    let payload: RollbackPayload = super::parse_payload(job)?;
    let deployment = super::load_deployment(ctx, &payload.deployment_id).await?;
    let logger = DeploymentLogger::new(
        ctx.persistence.clone(),
        deployment.id,
        Some(job.id),
        Phase::RollingBack,
    );

    let infrastructure = ctx
        .persistence
        .get_infrastructure_by_deployment(&deployment.id)
        .await?
        .filter(|infrastructure| infrastructure.has_release());

    let Some(infrastructure) = infrastructure else {
        let message = "rollback failed: deployment has no helm release";
        ctx.persistence
            .fail_deployment(&deployment.id, message)
            .await?;
        logger.error(message, json!({})).await;

        return Err(crate::error::Error::Validation(message.to_string()));
    };

    ctx.persistence
        .update_deployment_status(&deployment.id, Status::RollingBack)
        .await?;
    logger
        .info(
            format!("rolling back to {}", payload.target_version),
            json!({
                "target_tag": payload.target_tag,
                "attempt": job.attempts,
            }),
        )
        .await;

    let namespace = infrastructure.namespace.as_deref().unwrap_or_default();
    let release_name = infrastructure.helm_release_name.as_deref().unwrap_or_default();

    match ctx
        .deployer
        .rollback(namespace, release_name, PREVIOUS_REVISION)
        .await
    {
        Ok(()) => {
            // The "previous" sentinel names a revision only Helm can
            // resolve, so the stored version stays as it was.
            let version = (payload.target_version != PREVIOUS_VERSION)
                .then_some(payload.target_version.as_str());
            ctx.persistence
                .mark_deployment_rolled_back(&deployment.id, version)
                .await?;
            logger
                .info(
                    "rollback complete",
                    json!({ "release_name": release_name }),
                )
                .await;

            Ok(())
        }
        Err(err) => {
            let message = format!("rollback failed: {err}");
            ctx.persistence
                .fail_deployment(&deployment.id, &message)
                .await?;
            logger
                .error(&message, json!({ "attempt": job.attempts }))
                .await;

            Err(err.into())
        }
    }
}
