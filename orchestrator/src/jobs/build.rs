use serde_json::json;
use skyhook_common::deployment::{BuildStatus, Phase, Status};
use skyhook_common::job::{BuildPayload, ProvisionPayload};
use skyhook_common::Job;
use tracing::instrument;

use super::JobContext;
use crate::error::Result;
use crate::logger::DeploymentLogger;

#[instrument(skip(ctx, job), fields(deployment_id = %job.deployment_id, job_id = %job.id, phase = %Phase::Building))]
pub(super) async fn handle(ctx: &JobContext, job: &Job) -> Result<()> {
    let payload: BuildPayload = super::parse_payload(job)?;
    let deployment = super::load_deployment(ctx, &payload.deployment_id).await?;
    let logger = DeploymentLogger::new(
        ctx.persistence.clone(),
        deployment.id,
        Some(job.id),
        Phase::Building,
    );

    ctx.persistence
        .update_deployment_status(&deployment.id, Status::Building)
        .await?;
    logger
        .info(
            format!("building {} {}", payload.app_name, payload.version),
            json!({
                "repo_url": payload.repo_url,
                "branch": payload.branch,
                "attempt": job.attempts,
            }),
        )
        .await;

    // A completed build of this exact version makes cloning and
    // building redundant; hand its image straight to provisioning.
    if let Some(build) = ctx
        .persistence
        .get_latest_build_for_version(&deployment.id, &payload.version)
        .await?
    {
        if build.status == BuildStatus::Completed {
            if let Some(image_tag) = build.image_tag.clone() {
                logger
                    .info(
                        "reusing completed build",
                        json!({ "build_id": build.id, "image_tag": image_tag }),
                    )
                    .await;

                ctx.engine
                    .enqueue_provision(ProvisionPayload {
                        deployment_id: deployment.id,
                        app_name: payload.app_name,
                        version: payload.version,
                        cloud: payload.cloud,
                        region: payload.region,
                        image_tag,
                        build_id: Some(build.id),
                        node_count: None,
                        machine_type: None,
                        replicas: None,
                    })
                    .await?;

                return Ok(());
            }
        }
    }

    match ctx.build_service.run(&payload, &logger).await {
        Ok(built) => {
            logger
                .info(
                    "image built",
                    json!({
                        "image_tag": built.image_tag,
                        "image_digest": built.image_digest,
                    }),
                )
                .await;

            Ok(())
        }
        Err(err) => {
            ctx.persistence
                .fail_deployment(&deployment.id, &err.to_string())
                .await?;
            logger
                .error(
                    format!("build failed: {err}"),
                    json!({ "attempt": job.attempts }),
                )
                .await;

            Err(err)
        }
    }
}
