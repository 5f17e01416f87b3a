//! The producer-facing HTTP surface of the core: job triggers, queue
//! stats and the deployment log feed. Everything else about the
//! control plane's API (CRUD, auth, rate limiting) lives outside this
//! crate.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, Router};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use skyhook_common::deployment::{Phase, Status};
use skyhook_common::job::{
    BuildPayload, DeployPayload, DestroyPayload, ProvisionPayload, RollbackPayload,
};
use skyhook_common::models::{
    DeploymentResponse, EnqueuedResponse, LogsResponse, QueueStatsResponse,
};
use skyhook_common::{Job, DEFAULT_PORT};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::engine::{Engine, DEFAULT_CLOUD, DEFAULT_REGION};
use crate::error::Error;
use crate::persistence::{Deployment, Persistence};
use crate::queue::Queue;

#[derive(Debug)]
pub struct ApiError(Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::DeploymentNotFound(_) | Error::InfrastructureNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn make_router(persistence: Persistence, engine: Engine, queue: Queue) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/queue/stats", get(get_queue_stats))
        .route("/deployments", post(create_deployment))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/logs", get(get_deployment_logs))
        .route("/deployments/:id/build", post(trigger_build))
        .route("/deployments/:id/provision", post(trigger_provision))
        .route("/deployments/:id/deploy", post(trigger_deploy))
        .route("/deployments/:id/destroy", post(trigger_destroy))
        .route("/deployments/:id/rollback", post(trigger_rollback))
        .layer(Extension(persistence))
        .layer(Extension(engine))
        .layer(Extension(queue))
        .layer(TraceLayer::new_for_http())
}

async fn get_status(
    Extension(persistence): Extension<Persistence>,
    Extension(queue): Extension<Queue>,
) -> ApiResult<&'static str> {
    persistence.ping().await?;
    queue.ping().await?;

    Ok("ok")
}

async fn get_queue_stats(
    Extension(queue): Extension<Queue>,
) -> ApiResult<Json<QueueStatsResponse>> {
    let lengths = queue.queue_lengths().await?.into_iter().collect();

    Ok(Json(QueueStatsResponse { lengths }))
}

async fn get_deployment(
    Extension(persistence): Extension<Persistence>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeploymentResponse>> {
    let deployment = persistence
        .get_deployment(&id)
        .await?
        .ok_or(Error::DeploymentNotFound(id))?;

    Ok(Json(deployment.into()))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    phase: Option<Phase>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_deployment_logs(
    Extension(persistence): Extension<Persistence>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    let logs = persistence
        .get_deployment_logs(&id, query.phase, limit, offset)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = persistence.count_deployment_logs(&id, query.phase).await?;

    Ok(Json(LogsResponse { logs, total }))
}

#[derive(Debug, Deserialize)]
struct CreateDeploymentBody {
    app_name: String,
    version: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cloud: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

/// Every deployment starts here, in `Pending`; the trigger routes
/// below only advance rows this one created.
async fn create_deployment(
    Extension(persistence): Extension<Persistence>,
    Json(body): Json<CreateDeploymentBody>,
) -> ApiResult<Json<DeploymentResponse>> {
    if body.app_name.is_empty() {
        return Err(Error::Validation("app_name is required".to_string()).into());
    }
    if body.version.is_empty() {
        return Err(Error::Validation("version is required".to_string()).into());
    }

    let now = Utc::now();
    let deployment = Deployment {
        id: Uuid::new_v4(),
        name: body.name.unwrap_or_else(|| body.app_name.clone()),
        app_name: body.app_name,
        version: body.version,
        cloud: body
            .cloud
            .filter(|cloud| !cloud.is_empty())
            .unwrap_or_else(|| DEFAULT_CLOUD.to_string()),
        region: body
            .region
            .filter(|region| !region.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        port: body.port.unwrap_or(DEFAULT_PORT),
        external_ip: None,
        external_url: None,
        status: Status::Pending,
        last_error: None,
        created_at: now,
        updated_at: now,
        deployed_at: None,
    };

    persistence.insert_deployment(&deployment).await?;

    Ok(Json(deployment.into()))
}

#[derive(Debug, Deserialize)]
struct BuildBody {
    repo_url: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    commit_sha: Option<String>,
    #[serde(default)]
    build_strategy: Option<String>,
    #[serde(default)]
    dockerfile: Option<String>,
}

async fn trigger_build(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Path(id): Path<Uuid>,
    Json(body): Json<BuildBody>,
) -> ApiResult<Json<EnqueuedResponse>> {
    let deployment = persistence
        .get_deployment(&id)
        .await?
        .ok_or(Error::DeploymentNotFound(id))?;

    let job = engine
        .enqueue_build(BuildPayload {
            deployment_id: deployment.id,
            app_name: deployment.app_name,
            version: body.version.unwrap_or(deployment.version),
            repo_url: body.repo_url,
            branch: body.branch.unwrap_or_default(),
            commit_sha: body.commit_sha,
            build_strategy: body.build_strategy,
            dockerfile: body.dockerfile,
            cloud: deployment.cloud,
            region: deployment.region,
        })
        .await?;

    persistence
        .update_deployment_status(&id, Status::Queued)
        .await?;

    Ok(Json(enqueued(job)))
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    image_tag: String,
    #[serde(default)]
    node_count: Option<u32>,
    #[serde(default)]
    machine_type: Option<String>,
    #[serde(default)]
    replicas: Option<u32>,
}

async fn trigger_provision(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Path(id): Path<Uuid>,
    Json(body): Json<ProvisionBody>,
) -> ApiResult<Json<EnqueuedResponse>> {
    let deployment = persistence
        .get_deployment(&id)
        .await?
        .ok_or(Error::DeploymentNotFound(id))?;

    let job = engine
        .enqueue_provision(ProvisionPayload {
            deployment_id: deployment.id,
            app_name: deployment.app_name,
            version: deployment.version,
            cloud: deployment.cloud,
            region: deployment.region,
            image_tag: body.image_tag,
            build_id: None,
            node_count: body.node_count,
            machine_type: body.machine_type,
            replicas: body.replicas,
        })
        .await?;

    Ok(Json(enqueued(job)))
}

#[derive(Debug, Deserialize)]
struct DeployBody {
    image_tag: String,
    #[serde(default)]
    infrastructure_id: Option<Uuid>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    replicas: Option<u32>,
}

async fn trigger_deploy(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Path(id): Path<Uuid>,
    Json(body): Json<DeployBody>,
) -> ApiResult<Json<EnqueuedResponse>> {
    let deployment = persistence
        .get_deployment(&id)
        .await?
        .ok_or(Error::DeploymentNotFound(id))?;

    let infrastructure_id = match body.infrastructure_id {
        Some(infrastructure_id) => infrastructure_id,
        None => persistence
            .get_infrastructure_by_deployment(&id)
            .await?
            .map(|infrastructure| infrastructure.id)
            .ok_or_else(|| {
                Error::Validation("deployment has no infrastructure to deploy into".to_string())
            })?,
    };

    let job = engine
        .enqueue_deploy(DeployPayload {
            deployment_id: deployment.id,
            infrastructure_id,
            image_tag: body.image_tag,
            port: body.port.unwrap_or(deployment.port),
            replicas: body.replicas.unwrap_or(0),
        })
        .await?;

    Ok(Json(enqueued(job)))
}

async fn trigger_destroy(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EnqueuedResponse>> {
    let deployment = persistence
        .get_deployment(&id)
        .await?
        .ok_or(Error::DeploymentNotFound(id))?;

    // A deployment that never provisioned still destroys cleanly; the
    // handler treats the missing record as already gone.
    let infrastructure_id = persistence
        .get_infrastructure_by_deployment(&id)
        .await?
        .map(|infrastructure| infrastructure.id)
        .unwrap_or_else(Uuid::new_v4);

    let job = engine
        .enqueue_destroy(DestroyPayload {
            deployment_id: deployment.id,
            infrastructure_id,
        })
        .await?;

    Ok(Json(enqueued(job)))
}

#[derive(Debug, Deserialize)]
struct RollbackBody {
    target_version: String,
    #[serde(default)]
    target_tag: Option<String>,
}

async fn trigger_rollback(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Path(id): Path<Uuid>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<Json<EnqueuedResponse>> {
    let deployment = persistence
        .get_deployment(&id)
        .await?
        .ok_or(Error::DeploymentNotFound(id))?;

    let job = engine
        .enqueue_rollback(RollbackPayload {
            deployment_id: deployment.id,
            target_version: body.target_version,
            target_tag: body.target_tag,
        })
        .await?;

    Ok(Json(enqueued(job)))
}

fn enqueued(job: Job) -> EnqueuedResponse {
    EnqueuedResponse {
        job_id: job.id,
        job_type: job.job_type,
        deployment_id: job.deployment_id,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn create_body(app_name: &str) -> CreateDeploymentBody {
        CreateDeploymentBody {
            app_name: app_name.to_string(),
            version: "1.0.0".to_string(),
            name: None,
            cloud: None,
            region: None,
            port: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn created_deployments_start_pending() {
        let persistence = Persistence::new_in_memory().await.unwrap();

        let Json(created) =
            create_deployment(Extension(persistence.clone()), Json(create_body("app")))
                .await
                .unwrap();

        assert_eq!(created.status, Status::Pending);
        assert_eq!(created.name, "app");
        assert_eq!(created.cloud, DEFAULT_CLOUD);
        assert_eq!(created.region, DEFAULT_REGION);
        assert_eq!(created.port, DEFAULT_PORT);
        assert_eq!(created.external_ip, None);

        let stored = persistence
            .get_deployment(&created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, Status::Pending);
        assert_eq!(stored.version, "1.0.0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn creation_requires_app_name_and_version() {
        let persistence = Persistence::new_in_memory().await.unwrap();

        let err = create_deployment(Extension(persistence.clone()), Json(create_body("")))
            .await
            .unwrap_err();
        assert!(matches!(err.0, Error::Validation(_)));

        let mut body = create_body("app");
        body.version.clear();
        let err = create_deployment(Extension(persistence), Json(body))
            .await
            .unwrap_err();
        assert!(matches!(err.0, Error::Validation(_)));
    }
}
