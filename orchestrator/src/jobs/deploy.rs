use serde_json::json;
use skyhook_common::deployment::{Phase, Status};
use skyhook_common::job::DeployPayload;
use skyhook_common::Job;
use tracing::instrument;

use super::JobContext;
use crate::error::{Error, Result};
use crate::logger::DeploymentLogger;
use crate::stages::ReleaseRequest;

#[instrument(skip(ctx, job), fields(deployment_id = %job.deployment_id, job_id = %job.id, phase = %Phase::Deploying))]
pub(super) async fn handle(ctx: &JobContext, job: &Job) -> Result<()> {
    let payload: DeployPayload = super::parse_payload(job)?;
    let deployment = super::load_deployment(ctx, &payload.deployment_id).await?;
    let infrastructure = ctx
        .persistence
        .get_infrastructure(&payload.infrastructure_id)
        .await?
        .ok_or(Error::InfrastructureNotFound(payload.infrastructure_id))?;
    let logger = DeploymentLogger::new(
        ctx.persistence.clone(),
        deployment.id,
        Some(job.id),
        Phase::Deploying,
    );

    ctx.persistence
        .update_deployment_status(&deployment.id, Status::Deploying)
        .await?;
    logger
        .info(
            format!("releasing {}", payload.image_tag),
            json!({
                "infrastructure_id": infrastructure.id,
                "replicas": payload.replicas,
                "attempt": job.attempts,
            }),
        )
        .await;

    // Deterministic (namespace, release) pair: repeating this job
    // upgrades the same release in place.
    let namespace = infrastructure
        .namespace
        .clone()
        .unwrap_or_else(|| format!("{}-ns", deployment.app_name));
    let release_name = infrastructure.helm_release_name.clone().unwrap_or_else(|| {
        let id = deployment.id.simple().to_string();

        format!("{}-{}", deployment.app_name, &id[..8])
    });

    let request = ReleaseRequest {
        deployment_id: deployment.id,
        infrastructure_id: infrastructure.id,
        namespace,
        release_name,
        image_tag: payload.image_tag.clone(),
        port: payload.port,
        replicas: payload.replicas,
    };

    match ctx.deployer.deploy(request).await {
        Ok(release) => {
            ctx.persistence
                .update_infrastructure_release(
                    &infrastructure.id,
                    &release.namespace,
                    &release.release_name,
                )
                .await?;

            let external_url = format!("http://{}:{}", release.external_ip, payload.port);
            ctx.persistence
                .mark_deployment_as_deployed(&deployment.id, &release.external_ip, &external_url)
                .await?;
            logger
                .info(
                    "deployment exposed",
                    json!({
                        "release_name": release.release_name,
                        "external_ip": release.external_ip,
                        "external_url": external_url,
                    }),
                )
                .await;

            Ok(())
        }
        Err(err) => {
            // The cluster stays up so a retry can upgrade in place.
            // A failed attempt with retries left stays in Deploying;
            // only the last one marks the deployment failed, right
            // before the pool considers the compensating rollback.
            if job.attempts >= job.max_attempts {
                ctx.persistence
                    .fail_deployment(&deployment.id, &err.to_string())
                    .await?;
            } else {
                ctx.persistence
                    .set_deployment_last_error(&deployment.id, &err.to_string())
                    .await?;
            }
            logger
                .error(
                    format!("deploy failed: {err}"),
                    json!({ "attempt": job.attempts }),
                )
                .await;

            Err(err.into())
        }
    }
}
