mod build;
mod deployment;
mod error;
mod infrastructure;
mod log;

use std::path::Path;

use chrono::Utc;
use skyhook_common::deployment::{BuildStatus, InfrastructureStatus, Phase, Status};
use skyhook_common::log::Level;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use tracing::warn;
use uuid::Uuid;

pub use self::build::Build;
pub use self::deployment::Deployment;
pub use self::error::Error as PersistenceError;
use self::error::Result;
pub use self::infrastructure::Infrastructure;
pub use self::log::Log;

/// Cluster facts reported by the provisioner, applied onto an
/// Infrastructure row when it becomes ready.
#[derive(Clone, Debug, Default)]
pub struct ClusterFacts {
    pub cluster_name: String,
    pub cluster_endpoint: String,
    pub cluster_ca_cert: String,
    pub namespace: String,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
}

/// The state store: persistent records for deployments,
/// infrastructures, builds and the deployment log stream.
///
/// Creates all necessary tables on startup and hands out cheap clones
/// sharing one connection pool, the same way new connections should be
/// made by cloning rather than reconnecting.
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", db_path.display());

        if !Sqlite::database_exists(&url).await.unwrap_or(false) {
            Sqlite::create_database(&url).await?;
        }

        Self::from_pool(SqlitePool::connect(&url).await?).await
    }

    /// A throwaway store for tests. Pinned to a single connection so
    /// that every caller sees the same in-memory database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,  -- Identifier of the deployment.
                name TEXT,            -- Human readable deployment name.
                app_name TEXT,        -- Application the deployment serves.
                version TEXT,         -- Version currently rolled out (or rolling out).
                cloud TEXT,           -- Target cloud provider.
                region TEXT,          -- Target region.
                port INTEGER,         -- Application port exposed behind the external URL.
                external_ip TEXT,     -- Populated once the deployment is exposed.
                external_url TEXT,    -- Populated once the deployment is exposed.
                status TEXT,          -- Phase state machine position.
                last_error TEXT,      -- Final error text of the most recent failure.
                created_at TEXT,
                updated_at TEXT,
                deployed_at TEXT      -- When the deployment last became exposed.
            );

            CREATE TABLE IF NOT EXISTS infrastructures (
                id TEXT PRIMARY KEY,      -- Identifier of the infrastructure.
                deployment_id TEXT,       -- Owning deployment; the authoritative link.
                stack_name TEXT UNIQUE,   -- Deterministic provisioning stack name.
                cluster_name TEXT,
                cluster_endpoint TEXT,
                cluster_ca_cert TEXT,
                namespace TEXT,
                helm_release_name TEXT,
                vpc_id TEXT,
                subnet_id TEXT,
                status TEXT,
                last_error TEXT,
                provision_log TEXT,       -- Append-only provisioner output.
                created_at TEXT,
                updated_at TEXT,
                FOREIGN KEY(deployment_id) REFERENCES deployments(id)
            );

            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,  -- Identifier of the build.
                deployment_id TEXT,   -- Deployment this image was built for.
                version TEXT,         -- Source version that was built.
                image_tag TEXT,       -- Resulting image tag, set on completion.
                status TEXT,
                build_log TEXT,       -- Append-only builder output.
                started_at TEXT,
                completed_at TEXT,
                FOREIGN KEY(deployment_id) REFERENCES deployments(id)
            );

            CREATE TABLE IF NOT EXISTS deployment_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT, -- Insertion order; breaks timestamp ties.
                deployment_id TEXT,   -- Deployment this row pertains to.
                job_id TEXT,          -- Job that produced the row, if any.
                phase TEXT,           -- Phase tag of the producing handler.
                level TEXT,
                message TEXT,
                details TEXT,         -- Structured JSON details.
                timestamp TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_deployment_logs_stream
                ON deployment_logs(deployment_id, timestamp, id);
            CREATE INDEX IF NOT EXISTS idx_infrastructures_deployment
                ON infrastructures(deployment_id);
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(())
    }

    // Deployments

    pub async fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployments
                (id, name, app_name, version, cloud, region, port, external_ip, external_url,
                 status, last_error, created_at, updated_at, deployed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id)
        .bind(&deployment.name)
        .bind(&deployment.app_name)
        .bind(&deployment.version)
        .bind(&deployment.cloud)
        .bind(&deployment.region)
        .bind(deployment.port)
        .bind(&deployment.external_ip)
        .bind(&deployment.external_url)
        .bind(deployment.status)
        .bind(&deployment.last_error)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .bind(deployment.deployed_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn get_deployment(&self, id: &Uuid) -> Result<Option<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistenceError::from)
    }

    /// The primary transition primitive: a cheap single-row status
    /// update. Last-writer-wins; a transition outside the lifecycle
    /// table is performed anyway but flagged in the process log.
    ///
    /// The external address is only meaningful while the deployment is
    /// exposed or rolling back; any other status clears it, so a
    /// redeploy or failure never keeps serving a stale URL.
    pub async fn update_deployment_status(&self, id: &Uuid, status: Status) -> Result<()> {
        if let Some(current) = self.get_deployment(id).await? {
            if current.status != status && !current.status.can_transition_to(status) {
                warn!(
                    deployment_id = %id,
                    from = %current.status,
                    to = %status,
                    "deployment status moved outside the lifecycle table"
                );
            }
        }

        let query = match status {
            Status::Exposed | Status::RollingBack => {
                sqlx::query("UPDATE deployments SET status = ?, updated_at = ? WHERE id = ?")
            }
            _ => sqlx::query(
                "UPDATE deployments
                 SET status = ?, external_ip = NULL, external_url = NULL, updated_at = ?
                 WHERE id = ?",
            ),
        };

        query
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    /// Atomically flips a deployment to `Exposed` with its reachable
    /// address.
    pub async fn mark_deployment_as_deployed(&self, id: &Uuid, ip: &str, url: &str) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            "UPDATE deployments
             SET status = ?, external_ip = ?, external_url = ?, last_error = NULL,
                 deployed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(Status::Exposed)
        .bind(ip)
        .bind(url)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn mark_deployment_destroyed(&self, id: &Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE deployments
             SET status = ?, external_ip = NULL, external_url = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(Status::Destroyed)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    /// Records a rolled back deployment as exposed again. The version
    /// is only rewritten when the rollback targeted a concrete one;
    /// the "previous" sentinel leaves it untouched.
    pub async fn mark_deployment_rolled_back(
        &self,
        id: &Uuid,
        version: Option<&str>,
    ) -> Result<()> {
        match version {
            Some(version) => sqlx::query(
                "UPDATE deployments
                 SET status = ?, version = ?, last_error = NULL, updated_at = ?
                 WHERE id = ?",
            )
            .bind(Status::Exposed)
            .bind(version)
            .bind(Utc::now())
            .bind(id),
            None => sqlx::query(
                "UPDATE deployments SET status = ?, last_error = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(Status::Exposed)
            .bind(Utc::now())
            .bind(id),
        }
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn fail_deployment(&self, id: &Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deployments
             SET status = ?, last_error = ?, external_ip = NULL, external_url = NULL,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(Status::Failed)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn set_deployment_last_error(&self, id: &Uuid, error: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    /// Deleting a deployment requires its infrastructure to be gone.
    /// Destroyed infrastructure records and old builds go with it.
    pub async fn delete_deployment(&self, id: &Uuid) -> Result<()> {
        if let Some(infrastructure) = self.get_infrastructure_by_deployment(id).await? {
            if infrastructure.status != InfrastructureStatus::Destroyed {
                return Err(PersistenceError::LiveInfrastructure);
            }
        }

        sqlx::query("DELETE FROM infrastructures WHERE deployment_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM builds WHERE deployment_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    // Infrastructures

    pub async fn insert_infrastructure(&self, infrastructure: &Infrastructure) -> Result<()> {
        sqlx::query(
            "INSERT INTO infrastructures
                (id, deployment_id, stack_name, cluster_name, cluster_endpoint, cluster_ca_cert,
                 namespace, helm_release_name, vpc_id, subnet_id, status, last_error,
                 provision_log, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(infrastructure.id)
        .bind(infrastructure.deployment_id)
        .bind(&infrastructure.stack_name)
        .bind(&infrastructure.cluster_name)
        .bind(&infrastructure.cluster_endpoint)
        .bind(&infrastructure.cluster_ca_cert)
        .bind(&infrastructure.namespace)
        .bind(&infrastructure.helm_release_name)
        .bind(&infrastructure.vpc_id)
        .bind(&infrastructure.subnet_id)
        .bind(infrastructure.status)
        .bind(&infrastructure.last_error)
        .bind(&infrastructure.provision_log)
        .bind(infrastructure.created_at)
        .bind(infrastructure.updated_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn get_infrastructure(&self, id: &Uuid) -> Result<Option<Infrastructure>> {
        sqlx::query_as("SELECT * FROM infrastructures WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistenceError::from)
    }

    /// Idempotency lookup for the provision handler.
    pub async fn get_infrastructure_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<Infrastructure>> {
        sqlx::query_as("SELECT * FROM infrastructures WHERE stack_name = ?")
            .bind(stack_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistenceError::from)
    }

    /// The derived reverse side of Deployment -> Infrastructure.
    pub async fn get_infrastructure_by_deployment(
        &self,
        deployment_id: &Uuid,
    ) -> Result<Option<Infrastructure>> {
        sqlx::query_as(
            "SELECT * FROM infrastructures WHERE deployment_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistenceError::from)
    }

    pub async fn update_infrastructure_status(
        &self,
        id: &Uuid,
        status: InfrastructureStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE infrastructures SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    /// Applies the provisioner's output and marks the record ready.
    pub async fn mark_infrastructure_ready(&self, id: &Uuid, facts: &ClusterFacts) -> Result<()> {
        sqlx::query(
            "UPDATE infrastructures
             SET cluster_name = ?, cluster_endpoint = ?, cluster_ca_cert = ?, namespace = ?,
                 vpc_id = ?, subnet_id = ?, status = ?, last_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(&facts.cluster_name)
        .bind(&facts.cluster_endpoint)
        .bind(&facts.cluster_ca_cert)
        .bind(&facts.namespace)
        .bind(&facts.vpc_id)
        .bind(&facts.subnet_id)
        .bind(InfrastructureStatus::Ready)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    /// Records which Helm release serves this cluster.
    pub async fn update_infrastructure_release(
        &self,
        id: &Uuid,
        namespace: &str,
        release_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE infrastructures SET namespace = ?, helm_release_name = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(namespace)
        .bind(release_name)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn set_infrastructure_error(&self, id: &Uuid, error: &str) -> Result<()> {
        sqlx::query("UPDATE infrastructures SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    /// Append-only concatenation used for streaming provisioner output.
    pub async fn append_provision_log(&self, id: &Uuid, chunk: &str) -> Result<()> {
        sqlx::query(
            "UPDATE infrastructures SET provision_log = provision_log || ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(chunk)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn mark_infrastructure_destroyed(&self, id: &Uuid) -> Result<()> {
        self.update_infrastructure_status(id, InfrastructureStatus::Destroyed)
            .await
    }

    pub async fn delete_infrastructure(&self, id: &Uuid) -> Result<()> {
        sqlx::query("DELETE FROM infrastructures WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    // Builds

    pub async fn insert_build(&self, build: &Build) -> Result<()> {
        sqlx::query(
            "INSERT INTO builds
                (id, deployment_id, version, image_tag, status, build_log, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(build.id)
        .bind(build.deployment_id)
        .bind(&build.version)
        .bind(&build.image_tag)
        .bind(build.status)
        .bind(&build.build_log)
        .bind(build.started_at)
        .bind(build.completed_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn get_build(&self, id: &Uuid) -> Result<Option<Build>> {
        sqlx::query_as("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistenceError::from)
    }

    /// Idempotency lookup for the build handler: the most recent build
    /// of this (deployment, version) pair.
    pub async fn get_latest_build_for_version(
        &self,
        deployment_id: &Uuid,
        version: &str,
    ) -> Result<Option<Build>> {
        sqlx::query_as(
            "SELECT * FROM builds WHERE deployment_id = ? AND version = ?
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(deployment_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistenceError::from)
    }

    pub async fn complete_build(&self, id: &Uuid, image_tag: &str) -> Result<()> {
        sqlx::query(
            "UPDATE builds SET status = ?, image_tag = ?, completed_at = ? WHERE id = ?",
        )
        .bind(BuildStatus::Completed)
        .bind(image_tag)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    pub async fn fail_build(&self, id: &Uuid) -> Result<()> {
        sqlx::query("UPDATE builds SET status = ?, completed_at = ? WHERE id = ?")
            .bind(BuildStatus::Failed)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    /// Append-only concatenation for streaming builder output.
    pub async fn append_build_log(&self, id: &Uuid, chunk: &str) -> Result<()> {
        sqlx::query("UPDATE builds SET build_log = build_log || ? WHERE id = ?")
            .bind(chunk)
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PersistenceError::from)
    }

    // Deployment log stream

    pub async fn insert_log(
        &self,
        deployment_id: &Uuid,
        job_id: Option<Uuid>,
        phase: Phase,
        level: Level,
        message: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployment_logs
                (deployment_id, job_id, phase, level, message, details, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment_id)
        .bind(job_id)
        .bind(phase)
        .bind(level)
        .bind(message)
        .bind(details)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(PersistenceError::from)
    }

    /// One page of a deployment's log stream in non-decreasing
    /// timestamp order, insertion order breaking ties.
    pub async fn get_deployment_logs(
        &self,
        deployment_id: &Uuid,
        phase: Option<Phase>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Log>> {
        match phase {
            Some(phase) => sqlx::query_as(
                "SELECT * FROM deployment_logs WHERE deployment_id = ? AND phase = ?
                 ORDER BY timestamp, id LIMIT ? OFFSET ?",
            )
            .bind(deployment_id)
            .bind(phase)
            .bind(limit)
            .bind(offset),
            None => sqlx::query_as(
                "SELECT * FROM deployment_logs WHERE deployment_id = ?
                 ORDER BY timestamp, id LIMIT ? OFFSET ?",
            )
            .bind(deployment_id)
            .bind(limit)
            .bind(offset),
        }
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::from)
    }

    pub async fn count_deployment_logs(
        &self,
        deployment_id: &Uuid,
        phase: Option<Phase>,
    ) -> Result<i64> {
        let (count,): (i64,) = match phase {
            Some(phase) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM deployment_logs WHERE deployment_id = ? AND phase = ?",
                )
                .bind(deployment_id)
                .bind(phase)
            }
            None => sqlx::query_as("SELECT COUNT(*) FROM deployment_logs WHERE deployment_id = ?")
                .bind(deployment_id),
        }
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
