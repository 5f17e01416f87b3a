use serde_json::json;
use skyhook_common::deployment::{InfrastructureStatus, Phase, Status};
use skyhook_common::job::{DeployPayload, ProvisionPayload};
use skyhook_common::{Job, DEFAULT_NODE_COUNT, DEFAULT_PORT, DEFAULT_REPLICAS};
use tracing::instrument;

use super::JobContext;
use crate::error::Result;
use crate::logger::DeploymentLogger;
use crate::persistence::{ClusterFacts, Deployment, Infrastructure};
use crate::stages::ProvisionRequest;

#[instrument(skip(ctx, job), fields(deployment_id = %job.deployment_id, job_id = %job.id, phase = %Phase::Provisioning))]
pub(super) async fn handle(ctx: &JobContext, job: &Job) -> Result<()> {
    let payload: ProvisionPayload = super::parse_payload(job)?;
    let deployment = super::load_deployment(ctx, &payload.deployment_id).await?;
    let logger = DeploymentLogger::new(
        ctx.persistence.clone(),
        deployment.id,
        Some(job.id),
        Phase::Provisioning,
    );

    ctx.persistence
        .update_deployment_status(&deployment.id, Status::Provisioning)
        .await?;

    let stack_name = super::stack_name(&deployment.id);
    logger
        .info(
            "provisioning infrastructure",
            json!({
                "stack_name": stack_name,
                "cloud": payload.cloud,
                "region": payload.region,
                "attempt": job.attempts,
            }),
        )
        .await;

    // Idempotency on stack name: a previous delivery of this job may
    // already have built the stack.
    let infrastructure = match ctx
        .persistence
        .get_infrastructure_by_stack_name(&stack_name)
        .await?
    {
        Some(infrastructure) if infrastructure.status == InfrastructureStatus::Ready => {
            logger
                .info(
                    "infrastructure already ready, reusing",
                    json!({ "infrastructure_id": infrastructure.id }),
                )
                .await;

            ctx.persistence
                .update_deployment_status(&deployment.id, Status::Deploying)
                .await?;
            enqueue_deploy(ctx, &payload, &deployment, &infrastructure).await?;

            return Ok(());
        }
        // A half-provisioned record from an earlier attempt; the
        // provisioner is idempotent on stack name, so retry onto it.
        Some(infrastructure) => infrastructure,
        None => {
            let infrastructure = Infrastructure::new(deployment.id, stack_name.clone());
            ctx.persistence
                .insert_infrastructure(&infrastructure)
                .await?;
            infrastructure
        }
    };

    let request = ProvisionRequest {
        deployment_id: deployment.id,
        infrastructure_id: infrastructure.id,
        app_name: payload.app_name.clone(),
        cloud: payload.cloud.clone(),
        region: payload.region.clone(),
        stack_name,
        node_count: payload.node_count.unwrap_or(DEFAULT_NODE_COUNT),
        machine_type: payload.machine_type.clone(),
    };

    match ctx.provisioner.provision(request).await {
        Ok(cluster) => {
            ctx.persistence
                .append_provision_log(&infrastructure.id, &cluster.provision_log)
                .await?;
            ctx.persistence
                .mark_infrastructure_ready(
                    &infrastructure.id,
                    &ClusterFacts {
                        cluster_name: cluster.cluster_name.clone(),
                        cluster_endpoint: cluster.cluster_endpoint,
                        cluster_ca_cert: cluster.cluster_ca_cert,
                        namespace: cluster.namespace,
                        vpc_id: cluster.vpc_id,
                        subnet_id: cluster.subnet_id,
                    },
                )
                .await?;
            ctx.persistence
                .update_deployment_status(&deployment.id, Status::Deploying)
                .await?;
            logger
                .info(
                    "infrastructure ready",
                    json!({
                        "infrastructure_id": infrastructure.id,
                        "cluster_name": cluster.cluster_name,
                    }),
                )
                .await;

            enqueue_deploy(ctx, &payload, &deployment, &infrastructure).await?;

            Ok(())
        }
        Err(err) => {
            ctx.persistence
                .update_infrastructure_status(&infrastructure.id, InfrastructureStatus::Failed)
                .await?;
            ctx.persistence
                .set_infrastructure_error(&infrastructure.id, &err.to_string())
                .await?;
            ctx.persistence
                .fail_deployment(&deployment.id, &err.to_string())
                .await?;
            logger
                .error(
                    format!("provisioning failed: {err}"),
                    json!({ "attempt": job.attempts }),
                )
                .await;

            Err(err.into())
        }
    }
}

async fn enqueue_deploy(
    ctx: &JobContext,
    payload: &ProvisionPayload,
    deployment: &Deployment,
    infrastructure: &Infrastructure,
) -> Result<()> {
    let port = if deployment.port == 0 {
        DEFAULT_PORT
    } else {
        deployment.port
    };

    ctx.engine
        .enqueue_deploy(DeployPayload {
            deployment_id: deployment.id,
            infrastructure_id: infrastructure.id,
            image_tag: payload.image_tag.clone(),
            port,
            replicas: payload.replicas.unwrap_or(DEFAULT_REPLICAS),
        })
        .await
        .map(|_| ())
}
