//! Interfaces to the external systems each pipeline stage drives.
//!
//! The core never talks to a registry, a cloud API, Kubernetes or Helm
//! directly; it goes through these traits. Every implementation must
//! be idempotent: the queue delivers at least once, so a stage may be
//! asked to redo work it already finished.

pub mod mock;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use uuid::Uuid;

/// Errors reported by external collaborators.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("malformed source: {0}")]
    MalformedSource(String),
    #[error("transient infrastructure failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;

/// What the analyzer learned about a source tree.
#[derive(Clone, Debug, Default)]
pub struct SourceAnalysis {
    pub language: String,
    pub framework: Option<String>,
    pub build_tool: Option<String>,
    pub port: Option<u16>,
    pub dependencies: Vec<String>,
    pub has_dockerfile: bool,
}

/// Pure inspection of a local source directory.
pub trait SourceAnalyzer: Send + Sync {
    fn analyze(&self, path: &Path) -> StageResult<SourceAnalysis>;
}

/// Brings a source revision onto local disk.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        commit_sha: Option<&str>,
        dest: &Path,
    ) -> StageResult<()>;
}

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub deployment_id: Uuid,
    pub app_name: String,
    pub version: String,
    pub source_path: PathBuf,
    pub analysis: SourceAnalysis,
    pub build_strategy: Option<String>,
    pub dockerfile: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BuiltImage {
    pub image_tag: String,
    pub image_digest: String,
    pub build_log: String,
}

/// Turns a source tree into a pushed container image.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(&self, request: BuildRequest) -> StageResult<BuiltImage>;
}

#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub deployment_id: Uuid,
    pub infrastructure_id: Uuid,
    pub app_name: String,
    pub cloud: String,
    pub region: String,
    pub stack_name: String,
    pub node_count: u32,
    pub machine_type: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ProvisionedCluster {
    pub cluster_name: String,
    pub cluster_endpoint: String,
    pub cluster_ca_cert: String,
    pub namespace: String,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub provision_log: String,
}

#[derive(Clone, Debug)]
pub struct TeardownRequest {
    pub deployment_id: Uuid,
    pub infrastructure_id: Uuid,
    pub stack_name: String,
}

/// Creates and destroys the cloud stack backing a deployment.
/// Idempotent on stack name in both directions.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: ProvisionRequest) -> StageResult<ProvisionedCluster>;
    async fn destroy(&self, request: TeardownRequest) -> StageResult<()>;
}

#[derive(Clone, Debug)]
pub struct ReleaseRequest {
    pub deployment_id: Uuid,
    pub infrastructure_id: Uuid,
    pub namespace: String,
    pub release_name: String,
    pub image_tag: String,
    pub port: u16,
    pub replicas: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ReleaseInfo {
    pub release_name: String,
    pub namespace: String,
    pub external_ip: String,
    pub external_hostname: Option<String>,
}

/// Installs, removes and rewinds Helm releases inside a provisioned
/// cluster. Deploys are idempotent on (namespace, release name):
/// repeating one upgrades in place.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, request: ReleaseRequest) -> StageResult<ReleaseInfo>;
    async fn destroy(&self, namespace: &str, release_name: &str) -> StageResult<()>;
    /// Revision 0 means the previous revision.
    async fn rollback(&self, namespace: &str, release_name: &str, revision: u32)
        -> StageResult<()>;
}

/// Shallow, single-branch clone through the git CLI.
#[derive(Clone, Copy, Debug, Default)]
pub struct GitFetcher;

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        commit_sha: Option<&str>,
        dest: &Path,
    ) -> StageResult<()> {
        let dest_arg = dest.to_string_lossy();
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));

        run_git(
            &[
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                branch,
                repo_url,
                &dest_arg,
            ],
            parent,
        )
        .await?;

        if let Some(sha) = commit_sha {
            run_git(&["fetch", "--depth", "1", "origin", sha], dest).await?;
            run_git(&["checkout", sha], dest).await?;
        }

        Ok(())
    }
}

async fn run_git(args: &[&str], workdir: &Path) -> StageResult<()> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| StageError::Transient(format!("failed to spawn git: {err}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(StageError::Transient(format!(
            "git {} exited with {}: {}",
            args[0],
            output.status,
            stderr.trim()
        )))
    }
}
