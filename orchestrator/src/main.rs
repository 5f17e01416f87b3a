use std::sync::Arc;

use clap::Parser;
use skyhook_orchestrator::args::Args;
use skyhook_orchestrator::engine::Engine;
use skyhook_orchestrator::persistence::Persistence;
use skyhook_orchestrator::queue::Queue;
use skyhook_orchestrator::stages::mock::{MockAnalyzer, MockDeployer, MockImageBuilder, MockProvisioner};
use skyhook_orchestrator::stages::GitFetcher;
use skyhook_orchestrator::{Collaborators, Orchestrator};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let persistence = Persistence::new(&args.state_db)
        .await
        .expect("failed to open the state store");
    let queue = Queue::new(&args.queue_db)
        .await
        .expect("failed to open the queue store");
    let engine =
        Engine::new(queue.clone(), persistence.clone()).with_max_attempts(args.max_attempts);

    // Real registries, cloud APIs and clusters are wired in by the
    // deployment-specific builds; the stock binary runs the simulated
    // collaborators so the pipeline can be exercised end to end.
    warn!("no stage collaborators configured, running with simulated build/provision/deploy");
    let collaborators = Collaborators {
        fetcher: Arc::new(GitFetcher),
        analyzer: Arc::new(MockAnalyzer::default()),
        image_builder: Arc::new(MockImageBuilder::default()),
        provisioner: Arc::new(MockProvisioner::default()),
        deployer: Arc::new(MockDeployer::default()),
    };

    let orchestrator = Orchestrator::new(
        persistence,
        queue,
        engine,
        collaborators,
        args.worker_config(),
    );
    let pool = orchestrator.start_workers();

    let router = orchestrator.router();
    info!(address = %args.api_address, "binding api");

    axum::Server::bind(&args.api_address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .unwrap_or_else(|_| panic!("failed to serve on {}", args.api_address));

    pool.shutdown().await;
}
