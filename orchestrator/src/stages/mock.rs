//! Scripted in-memory collaborators.
//!
//! Used by the test suites and by the dev-mode binary, where the real
//! registries, cloud APIs and clusters are not reachable. Each mock
//! records the calls it receives so tests can assert on side effects.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BuildRequest, BuiltImage, Deployer, ImageBuilder, ProvisionRequest, ProvisionedCluster,
    Provisioner, ReleaseInfo, ReleaseRequest, SourceAnalysis, SourceAnalyzer, SourceFetcher,
    StageError, StageResult, TeardownRequest,
};

fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Pretends to clone by materializing an empty source tree.
#[derive(Debug, Default)]
pub struct MockFetcher {
    pub fetches: AtomicU32,
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch(
        &self,
        _repo_url: &str,
        _branch: &str,
        _commit_sha: Option<&str>,
        dest: &Path,
    ) -> StageResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|err| StageError::Transient(err.to_string()))?;
        tokio::fs::write(dest.join("main.go"), "package main\n")
            .await
            .map_err(|err| StageError::Transient(err.to_string()))?;

        Ok(())
    }
}

/// Always reports the same analysis.
#[derive(Debug)]
pub struct MockAnalyzer {
    pub analysis: SourceAnalysis,
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self {
            analysis: SourceAnalysis {
                language: "go".to_string(),
                framework: None,
                build_tool: Some("go build".to_string()),
                port: Some(8080),
                dependencies: Vec::new(),
                has_dockerfile: false,
            },
        }
    }
}

impl SourceAnalyzer for MockAnalyzer {
    fn analyze(&self, _path: &Path) -> StageResult<SourceAnalysis> {
        Ok(self.analysis.clone())
    }
}

/// Produces `<app>:<version>` image tags without touching a registry.
#[derive(Debug, Default)]
pub struct MockImageBuilder {
    pub calls: AtomicU32,
    pub fail_remaining: AtomicU32,
}

impl MockImageBuilder {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ImageBuilder for MockImageBuilder {
    async fn build_image(&self, request: BuildRequest) -> StageResult<BuiltImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.fail_remaining) {
            return Err(StageError::Transient("image registry unavailable".into()));
        }

        let image_tag = format!("{}:{}", request.app_name, request.version);

        Ok(BuiltImage {
            image_digest: format!("sha256:{:064x}", image_tag.len()),
            build_log: format!("step 1/1: built {image_tag}\n"),
            image_tag,
        })
    }
}

/// Hands out clusters derived from the request, instantly or after a
/// configurable delay.
#[derive(Debug, Default)]
pub struct MockProvisioner {
    pub provision_calls: Mutex<Vec<ProvisionRequest>>,
    pub destroy_calls: Mutex<Vec<TeardownRequest>>,
    pub fail_remaining: AtomicU32,
    pub fail_destroy_remaining: AtomicU32,
    pub delay: Option<Duration>,
}

impl MockProvisioner {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            fail_remaining: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn provision_call_count(&self) -> usize {
        self.provision_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, request: ProvisionRequest) -> StageResult<ProvisionedCluster> {
        self.provision_calls.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if take_failure(&self.fail_remaining) {
            return Err(StageError::Transient("cloud api returned 503".into()));
        }

        Ok(ProvisionedCluster {
            cluster_name: format!("{}-cluster", request.stack_name),
            cluster_endpoint: "https://198.51.100.1".to_string(),
            cluster_ca_cert: "-----BEGIN CERTIFICATE-----\n".to_string(),
            namespace: format!("{}-ns", request.app_name),
            vpc_id: Some(format!("vpc-{}", request.stack_name)),
            subnet_id: Some(format!("subnet-{}", request.stack_name)),
            provision_log: format!("created stack {}\n", request.stack_name),
        })
    }

    async fn destroy(&self, request: TeardownRequest) -> StageResult<()> {
        self.destroy_calls.lock().unwrap().push(request);

        if take_failure(&self.fail_destroy_remaining) {
            return Err(StageError::Transient("stack deletion conflicted".into()));
        }

        Ok(())
    }
}

/// Installs releases into thin air and remembers everything asked of
/// it.
#[derive(Debug)]
pub struct MockDeployer {
    pub deploy_calls: Mutex<Vec<ReleaseRequest>>,
    pub destroy_calls: Mutex<Vec<(String, String)>>,
    pub rollback_calls: Mutex<Vec<(String, String, u32)>>,
    pub fail_remaining: AtomicU32,
    pub panic_remaining: AtomicU32,
    pub fail_destroy_remaining: AtomicU32,
    pub fail_rollback: AtomicBool,
    pub external_ip: String,
}

impl Default for MockDeployer {
    fn default() -> Self {
        Self {
            deploy_calls: Mutex::new(Vec::new()),
            destroy_calls: Mutex::new(Vec::new()),
            rollback_calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
            panic_remaining: AtomicU32::new(0),
            fail_destroy_remaining: AtomicU32::new(0),
            fail_rollback: AtomicBool::new(false),
            external_ip: "203.0.113.10".to_string(),
        }
    }
}

impl MockDeployer {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            fail_remaining: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn panicking_times(panics: u32) -> Self {
        Self {
            panic_remaining: AtomicU32::new(panics),
            ..Self::default()
        }
    }

    pub fn deploy_call_count(&self) -> usize {
        self.deploy_calls.lock().unwrap().len()
    }

    pub fn rollbacks(&self) -> Vec<(String, String, u32)> {
        self.rollback_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    async fn deploy(&self, request: ReleaseRequest) -> StageResult<ReleaseInfo> {
        self.deploy_calls.lock().unwrap().push(request.clone());

        if take_failure(&self.panic_remaining) {
            panic!("deployer exploded");
        }

        if take_failure(&self.fail_remaining) {
            return Err(StageError::Transient("kubernetes api unavailable".into()));
        }

        Ok(ReleaseInfo {
            release_name: request.release_name,
            namespace: request.namespace,
            external_ip: self.external_ip.clone(),
            external_hostname: None,
        })
    }

    async fn destroy(&self, namespace: &str, release_name: &str) -> StageResult<()> {
        self.destroy_calls
            .lock()
            .unwrap()
            .push((namespace.to_string(), release_name.to_string()));

        if take_failure(&self.fail_destroy_remaining) {
            return Err(StageError::Transient("release stuck in uninstalling".into()));
        }

        Ok(())
    }

    async fn rollback(
        &self,
        namespace: &str,
        release_name: &str,
        revision: u32,
    ) -> StageResult<()> {
        self.rollback_calls.lock().unwrap().push((
            namespace.to_string(),
            release_name.to_string(),
            revision,
        ));

        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(StageError::Transient("helm rollback timed out".into()));
        }

        Ok(())
    }
}
