//! The build pipeline behind the build handler.
//!
//! The handler owns phase advancement; this service owns the Build row
//! lifecycle: fetch the source into a scoped working directory,
//! analyze it, drive the image builder, stream its output into the
//! build log, and on success hand the pipeline over to provisioning.

use std::sync::Arc;

use serde_json::json;
use skyhook_common::job::{BuildPayload, ProvisionPayload};

use crate::engine::Engine;
use crate::error::Result;
use crate::logger::DeploymentLogger;
use crate::persistence::{Build, Persistence};
use crate::stages::{BuildRequest, BuiltImage, ImageBuilder, SourceAnalyzer, SourceFetcher};

#[derive(Clone)]
pub struct ImageBuildService {
    persistence: Persistence,
    engine: Engine,
    fetcher: Arc<dyn SourceFetcher>,
    analyzer: Arc<dyn SourceAnalyzer>,
    image_builder: Arc<dyn ImageBuilder>,
}

impl ImageBuildService {
    pub fn new(
        persistence: Persistence,
        engine: Engine,
        fetcher: Arc<dyn SourceFetcher>,
        analyzer: Arc<dyn SourceAnalyzer>,
        image_builder: Arc<dyn ImageBuilder>,
    ) -> Self {
        Self {
            persistence,
            engine,
            fetcher,
            analyzer,
            image_builder,
        }
    }

    /// Runs the full source-to-image pipeline for one build payload.
    ///
    /// The working directory is dropped on every exit path. On success
    /// the provision job for the produced image is already enqueued by
    /// the time this returns.
    pub async fn run(
        &self,
        payload: &BuildPayload,
        logger: &DeploymentLogger,
    ) -> Result<BuiltImage> {
        let workdir = tempfile::tempdir()?;
        let source_path = workdir.path().join("source");

        logger
            .info(
                "fetching source",
                json!({ "repo_url": payload.repo_url, "branch": payload.branch }),
            )
            .await;
        self.fetcher
            .fetch(
                &payload.repo_url,
                &payload.branch,
                payload.commit_sha.as_deref(),
                &source_path,
            )
            .await?;

        let analysis = self.analyzer.analyze(&source_path)?;
        logger
            .info(
                "source analyzed",
                json!({
                    "language": analysis.language,
                    "framework": analysis.framework,
                    "port": analysis.port,
                    "has_dockerfile": analysis.has_dockerfile,
                }),
            )
            .await;

        let build = Build::started(payload.deployment_id, payload.version.clone());
        self.persistence.insert_build(&build).await?;

        let request = BuildRequest {
            deployment_id: payload.deployment_id,
            app_name: payload.app_name.clone(),
            version: payload.version.clone(),
            source_path,
            analysis,
            build_strategy: payload.build_strategy.clone(),
            dockerfile: payload.dockerfile.clone(),
        };

        match self.image_builder.build_image(request).await {
            Ok(built) => {
                self.persistence
                    .append_build_log(&build.id, &built.build_log)
                    .await?;
                self.persistence
                    .complete_build(&build.id, &built.image_tag)
                    .await?;

                self.engine
                    .enqueue_provision(ProvisionPayload {
                        deployment_id: payload.deployment_id,
                        app_name: payload.app_name.clone(),
                        version: payload.version.clone(),
                        cloud: payload.cloud.clone(),
                        region: payload.region.clone(),
                        image_tag: built.image_tag.clone(),
                        build_id: Some(build.id),
                        node_count: None,
                        machine_type: None,
                        replicas: None,
                    })
                    .await?;

                Ok(built)
            }
            Err(err) => {
                // Keep whatever the builder managed to log before dying.
                let _ = self
                    .persistence
                    .append_build_log(&build.id, &format!("build failed: {err}\n"))
                    .await;
                self.persistence.fail_build(&build.id).await?;

                Err(err.into())
            }
        }
    }
}
