use serde_json::json;
use skyhook_common::deployment::{InfrastructureStatus, Phase, Status};
use skyhook_common::job::DestroyPayload;
use skyhook_common::Job;
use tracing::instrument;

use super::JobContext;
use crate::error::Result;
use crate::logger::DeploymentLogger;
use crate::stages::TeardownRequest;

#[instrument(skip(ctx, job), fields(deployment_id = %job.deployment_id, job_id = %job.id, phase = %Phase::Destroying))]
pub(super) async fn handle(ctx: &JobContext, job: &Job) -> Result<()> {
    let payload: DestroyPayload = super::parse_payload(job)?;
    let deployment = super::load_deployment(ctx, &payload.deployment_id).await?;
    let logger = DeploymentLogger::new(
        ctx.persistence.clone(),
        deployment.id,
        Some(job.id),
        Phase::Destroying,
    );

    ctx.persistence
        .update_deployment_status(&deployment.id, Status::Destroying)
        .await?;
    logger
        .info(
            "destroying deployment",
            json!({
                "infrastructure_id": payload.infrastructure_id,
                "attempt": job.attempts,
            }),
        )
        .await;

    let Some(infrastructure) = ctx
        .persistence
        .get_infrastructure(&payload.infrastructure_id)
        .await?
    else {
        // A missing stack counts as destroyed.
        ctx.persistence
            .mark_deployment_destroyed(&deployment.id)
            .await?;
        logger.info("no infrastructure left to destroy", json!({})).await;

        return Ok(());
    };

    ctx.persistence
        .update_infrastructure_status(&infrastructure.id, InfrastructureStatus::Destroying)
        .await?;

    // Helm teardown is best-effort; a dangling release dies with the
    // cluster anyway.
    if infrastructure.has_release() {
        let namespace = infrastructure.namespace.as_deref().unwrap_or_default();
        let release_name = infrastructure.helm_release_name.as_deref().unwrap_or_default();

        if let Err(err) = ctx.deployer.destroy(namespace, release_name).await {
            logger
                .warn(
                    format!("helm release teardown failed: {err}"),
                    json!({ "release_name": release_name }),
                )
                .await;
        }
    }

    let request = TeardownRequest {
        deployment_id: deployment.id,
        infrastructure_id: infrastructure.id,
        stack_name: infrastructure.stack_name.clone(),
    };

    match ctx.provisioner.destroy(request).await {
        Ok(()) => {
            ctx.persistence
                .mark_infrastructure_destroyed(&infrastructure.id)
                .await?;
            ctx.persistence
                .mark_deployment_destroyed(&deployment.id)
                .await?;
            logger
                .info(
                    "deployment destroyed",
                    json!({ "stack_name": infrastructure.stack_name }),
                )
                .await;

            Ok(())
        }
        Err(err) => {
            ctx.persistence
                .set_infrastructure_error(&infrastructure.id, &err.to_string())
                .await?;
            ctx.persistence
                .fail_deployment(&deployment.id, &err.to_string())
                .await?;
            logger
                .error(
                    format!("stack teardown failed: {err}"),
                    json!({ "attempt": job.attempts }),
                )
                .await;

            Err(err.into())
        }
    }
}
