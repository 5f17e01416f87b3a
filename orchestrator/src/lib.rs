pub mod api;
pub mod args;
pub mod builder;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod logger;
pub mod persistence;
pub mod queue;
pub mod stages;
pub mod worker;

use std::sync::Arc;

pub use error::{Error, Result};

use builder::ImageBuildService;
use engine::Engine;
use jobs::JobContext;
use persistence::Persistence;
use queue::Queue;
use stages::{Deployer, ImageBuilder, Provisioner, SourceAnalyzer, SourceFetcher};
use worker::{PoolHandle, WorkerPool, WorkerPoolConfig};

/// The external systems the pipeline stages drive.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub analyzer: Arc<dyn SourceAnalyzer>,
    pub image_builder: Arc<dyn ImageBuilder>,
    pub provisioner: Arc<dyn Provisioner>,
    pub deployer: Arc<dyn Deployer>,
}

/// Wires the queue, state store, enqueue facade, handlers and worker
/// pool into one runnable core.
pub struct Orchestrator {
    persistence: Persistence,
    queue: Queue,
    engine: Engine,
    ctx: JobContext,
    config: WorkerPoolConfig,
}

impl Orchestrator {
    pub fn new(
        persistence: Persistence,
        queue: Queue,
        engine: Engine,
        collaborators: Collaborators,
        config: WorkerPoolConfig,
    ) -> Self {
        let build_service = ImageBuildService::new(
            persistence.clone(),
            engine.clone(),
            collaborators.fetcher,
            collaborators.analyzer,
            collaborators.image_builder,
        );
        let ctx = JobContext {
            persistence: persistence.clone(),
            queue: queue.clone(),
            engine: engine.clone(),
            build_service,
            provisioner: collaborators.provisioner,
            deployer: collaborators.deployer,
        };

        Self {
            persistence,
            queue,
            engine,
            ctx,
            config,
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Starts the worker pool; returns the handle that shuts it down.
    pub fn start_workers(&self) -> PoolHandle {
        WorkerPool::new(self.ctx.clone(), self.config.clone()).start()
    }

    pub fn router(&self) -> axum::Router {
        api::make_router(
            self.persistence.clone(),
            self.engine.clone(),
            self.queue.clone(),
        )
    }
}
