//! End-to-end pipeline scenarios driven through the queue, the worker
//! pool and the real handlers, with scripted collaborators standing in
//! for the registries, cloud APIs and clusters.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skyhook_common::deployment::{BuildStatus, InfrastructureStatus, Phase, Status};
use skyhook_common::job::{BuildPayload, DeployPayload, DestroyPayload, ProvisionPayload};
use skyhook_common::log::Level;
use skyhook_common::{JobType, DEFAULT_PORT};
use skyhook_orchestrator::engine::Engine;
use skyhook_orchestrator::persistence::{Deployment, Infrastructure, Persistence};
use skyhook_orchestrator::queue::Queue;
use skyhook_orchestrator::stages::mock::{
    MockAnalyzer, MockDeployer, MockFetcher, MockImageBuilder, MockProvisioner,
};
use skyhook_orchestrator::worker::WorkerPoolConfig;
use skyhook_orchestrator::{Collaborators, Orchestrator};
use uuid::Uuid;

struct Harness {
    orchestrator: Orchestrator,
    persistence: Persistence,
    queue: Queue,
    engine: Engine,
    provisioner: Arc<MockProvisioner>,
    deployer: Arc<MockDeployer>,
}

async fn harness(provisioner: MockProvisioner, deployer: MockDeployer) -> Harness {
    let persistence = Persistence::new_in_memory().await.unwrap();
    let queue = Queue::new_in_memory().await.unwrap();
    let engine = Engine::new(queue.clone(), persistence.clone());

    let provisioner = Arc::new(provisioner);
    let deployer = Arc::new(deployer);
    let collaborators = Collaborators {
        fetcher: Arc::new(MockFetcher::default()),
        analyzer: Arc::new(MockAnalyzer::default()),
        image_builder: Arc::new(MockImageBuilder::default()),
        provisioner: provisioner.clone(),
        deployer: deployer.clone(),
    };

    let orchestrator = Orchestrator::new(
        persistence.clone(),
        queue.clone(),
        engine.clone(),
        collaborators,
        test_config(2),
    );

    Harness {
        orchestrator,
        persistence,
        queue,
        engine,
        provisioner,
        deployer,
    }
}

fn test_config(concurrency: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency,
        poll_timeout: Duration::from_millis(100),
        base_backoff: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        max_backoff: Duration::from_millis(200),
        jitter_percent: 0.1,
        build_deadline: Duration::from_secs(5),
        provision_deadline: Duration::from_secs(5),
        deploy_deadline: Duration::from_secs(5),
        destroy_deadline: Duration::from_secs(5),
        rollback_deadline: Duration::from_secs(5),
    }
}

async fn insert_deployment(persistence: &Persistence, app_name: &str) -> Deployment {
    insert_deployment_with_version(persistence, app_name, "1.0.0").await
}

async fn insert_deployment_with_version(
    persistence: &Persistence,
    app_name: &str,
    version: &str,
) -> Deployment {
    let now = Utc::now();
    let deployment = Deployment {
        id: Uuid::new_v4(),
        name: format!("{app_name}-deployment"),
        app_name: app_name.to_string(),
        version: version.to_string(),
        cloud: "aws".to_string(),
        region: "us-east-1".to_string(),
        port: DEFAULT_PORT,
        external_ip: None,
        external_url: None,
        status: Status::Pending,
        last_error: None,
        created_at: now,
        updated_at: now,
        deployed_at: None,
    };
    persistence.insert_deployment(&deployment).await.unwrap();

    deployment
}

async fn insert_ready_infrastructure(
    persistence: &Persistence,
    deployment: &Deployment,
    release: Option<&str>,
) -> Infrastructure {
    let mut infrastructure = Infrastructure::new(
        deployment.id,
        format!("stack-{}", &deployment.id.simple().to_string()[..8]),
    );
    infrastructure.status = InfrastructureStatus::Ready;
    infrastructure.namespace = Some(format!("{}-ns", deployment.app_name));
    infrastructure.helm_release_name = release.map(str::to_string);
    persistence.insert_infrastructure(&infrastructure).await.unwrap();

    infrastructure
}

fn build_payload(deployment: &Deployment) -> BuildPayload {
    BuildPayload {
        deployment_id: deployment.id,
        app_name: deployment.app_name.clone(),
        version: deployment.version.clone(),
        repo_url: "file:///tmp/noop-repo".to_string(),
        branch: "main".to_string(),
        commit_sha: None,
        build_strategy: None,
        dockerfile: None,
        cloud: deployment.cloud.clone(),
        region: deployment.region.clone(),
    }
}

async fn wait_for_status(
    persistence: &Persistence,
    id: &Uuid,
    status: Status,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        let current = persistence.get_deployment(id).await.unwrap().unwrap();
        if current.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    false
}

async fn wait_for_drained(queue: &Queue, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        let lengths = queue.queue_lengths().await.unwrap();
        if lengths.values().all(|length| *length == 0) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    false
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_walks_every_phase() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;
    let deployment = insert_deployment(&h.persistence, "app").await;

    h.engine
        .enqueue_build(build_payload(&deployment))
        .await
        .unwrap();
    h.persistence
        .update_deployment_status(&deployment.id, Status::Queued)
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();
    assert!(
        wait_for_status(&h.persistence, &deployment.id, Status::Exposed, Duration::from_secs(15))
            .await,
        "deployment never reached EXPOSED"
    );
    pool.shutdown().await;

    let exposed = h
        .persistence
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exposed.external_ip.as_deref(), Some("203.0.113.10"));
    assert_eq!(
        exposed.external_url.as_deref(),
        Some("http://203.0.113.10:8080")
    );

    let build = h
        .persistence
        .get_latest_build_for_version(&deployment.id, "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(build.status, BuildStatus::Completed);
    assert_eq!(build.image_tag.as_deref(), Some("app:1.0.0"));

    let infrastructure = h
        .persistence
        .get_infrastructure_by_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(infrastructure.status, InfrastructureStatus::Ready);
    assert!(infrastructure.has_release());

    // The log stream is the authoritative progress feed: phases appear
    // in pipeline order and every stage reports at least one INFO row.
    let logs = h
        .persistence
        .get_deployment_logs(&deployment.id, None, 1000, 0)
        .await
        .unwrap();
    let info_rows = logs.iter().filter(|log| log.level == Level::Info).count();
    assert!(info_rows >= 5, "expected at least 5 INFO rows, got {info_rows}");

    let first_index = |phase: Phase| logs.iter().position(|log| log.phase == phase);
    let queued = first_index(Phase::Queued).expect("no QUEUED rows");
    let building = first_index(Phase::Building).expect("no BUILDING rows");
    let provisioning = first_index(Phase::Provisioning).expect("no PROVISIONING rows");
    let deploying = first_index(Phase::Deploying).expect("no DEPLOYING rows");
    assert!(queued < building && building < provisioning && provisioning < deploying);
}

#[tokio::test(flavor = "multi_thread")]
async fn flaky_deploy_succeeds_on_third_attempt() {
    let h = harness(MockProvisioner::default(), MockDeployer::failing_times(2)).await;
    let deployment = insert_deployment(&h.persistence, "app").await;
    let infrastructure = insert_ready_infrastructure(&h.persistence, &deployment, None).await;

    h.engine
        .enqueue_deploy(DeployPayload {
            deployment_id: deployment.id,
            infrastructure_id: infrastructure.id,
            image_tag: "app:1.0.0".to_string(),
            port: DEFAULT_PORT,
            replicas: 2,
        })
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();

    // An attempt with retries left must never surface as FAILED; the
    // deployment stays in DEPLOYING until it recovers.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let current = h
            .persistence
            .get_deployment(&deployment.id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(current.status, Status::Failed, "retryable attempts leaked FAILED");
        if current.status == Status::Exposed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deployment never recovered from the flakes"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    pool.shutdown().await;

    assert_eq!(h.deployer.deploy_call_count(), 3);

    let deploying_logs = h
        .persistence
        .get_deployment_logs(&deployment.id, Some(Phase::Deploying), 1000, 0)
        .await
        .unwrap();
    let errors = deploying_logs
        .iter()
        .filter(|log| log.level == Level::Error)
        .count();
    let entries = deploying_logs
        .iter()
        .filter(|log| log.level == Level::Info && log.message.starts_with("releasing"))
        .count();
    assert_eq!(errors, 2, "one ERROR row per failed attempt");
    assert_eq!(entries, 3, "one entry INFO row per attempt");
    assert!(deploying_logs
        .iter()
        .any(|log| log.level == Level::Info && log.message == "deployment exposed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_deploy_failure_triggers_exactly_one_rollback() {
    let h = harness(MockProvisioner::default(), MockDeployer::failing_times(u32::MAX)).await;
    let deployment = insert_deployment(&h.persistence, "app").await;
    let infrastructure =
        insert_ready_infrastructure(&h.persistence, &deployment, Some("app-r1")).await;

    let deploy_job = h
        .engine
        .enqueue_deploy(DeployPayload {
            deployment_id: deployment.id,
            infrastructure_id: infrastructure.id,
            image_tag: "app:2.0.0".to_string(),
            port: DEFAULT_PORT,
            replicas: 2,
        })
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while h.deployer.rollbacks().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Let any spurious second rollback surface before asserting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    pool.shutdown().await;

    assert_eq!(h.deployer.deploy_call_count(), 3, "attempt ceiling is 3");
    assert_eq!(
        h.deployer.rollbacks(),
        vec![("app-ns".to_string(), "app-r1".to_string(), 0)],
        "exactly one rollback, against the previous revision"
    );
    assert!(
        h.queue
            .get_failed_error(&deploy_job.id)
            .await
            .unwrap()
            .is_some(),
        "terminal error is dead-lettered for operators"
    );

    // The compensating rollback succeeded, so the deployment is
    // serving its previous release again.
    let rolled_back = h
        .persistence
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rolled_back.status, Status::Exposed);

    let rollback_logs = h
        .persistence
        .get_deployment_logs(&deployment.id, Some(Phase::RollingBack), 100, 0)
        .await
        .unwrap();
    assert!(!rollback_logs.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn provision_is_idempotent_on_stack_name() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;
    let deployment = insert_deployment(&h.persistence, "app").await;

    let payload = ProvisionPayload {
        deployment_id: deployment.id,
        app_name: deployment.app_name.clone(),
        version: deployment.version.clone(),
        cloud: deployment.cloud.clone(),
        region: deployment.region.clone(),
        image_tag: "app:1.0.0".to_string(),
        build_id: None,
        node_count: None,
        machine_type: None,
        replicas: None,
    };
    let first = h.engine.enqueue_provision(payload.clone()).await.unwrap();
    let second = h.engine.enqueue_provision(payload).await.unwrap();

    let orchestrator = Orchestrator::new(
        h.persistence.clone(),
        h.queue.clone(),
        h.engine.clone(),
        Collaborators {
            fetcher: Arc::new(MockFetcher::default()),
            analyzer: Arc::new(MockAnalyzer::default()),
            image_builder: Arc::new(MockImageBuilder::default()),
            provisioner: h.provisioner.clone(),
            deployer: h.deployer.clone(),
        },
        test_config(1),
    );
    let pool = orchestrator.start_workers();
    assert!(
        wait_for_drained(&h.queue, Duration::from_secs(20)).await,
        "queues never drained"
    );
    pool.shutdown().await;

    assert_eq!(
        h.provisioner.provision_call_count(),
        1,
        "the second job must observe READY and short-circuit"
    );
    assert!(h.queue.get_failed_error(&first.id).await.unwrap().is_none());
    assert!(h.queue.get_failed_error(&second.id).await.unwrap().is_none());

    let by_stack = h
        .persistence
        .get_infrastructure_by_stack_name(&format!(
            "skyhook-{}",
            &deployment.id.simple().to_string()[..8]
        ))
        .await
        .unwrap()
        .unwrap();
    let by_deployment = h
        .persistence
        .get_infrastructure_by_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_stack.id, by_deployment.id, "one infrastructure row");
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_is_not_starved_by_a_build_flood() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;

    for index in 0..30 {
        let deployment = insert_deployment(&h.persistence, &format!("flood{index}")).await;
        h.engine
            .enqueue_build(build_payload(&deployment))
            .await
            .unwrap();
    }

    let victim = insert_deployment(&h.persistence, "victim").await;
    let infrastructure = insert_ready_infrastructure(&h.persistence, &victim, None).await;
    h.engine
        .enqueue_destroy(DestroyPayload {
            deployment_id: victim.id,
            infrastructure_id: infrastructure.id,
        })
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(
        h.persistence.clone(),
        h.queue.clone(),
        h.engine.clone(),
        Collaborators {
            fetcher: Arc::new(MockFetcher::default()),
            analyzer: Arc::new(MockAnalyzer::default()),
            image_builder: Arc::new(MockImageBuilder::default()),
            provisioner: h.provisioner.clone(),
            deployer: h.deployer.clone(),
        },
        test_config(1),
    );
    let pool = orchestrator.start_workers();

    assert!(
        wait_for_status(&h.persistence, &victim.id, Status::Destroyed, Duration::from_secs(15))
            .await,
        "the single destroy job starved behind the build flood"
    );

    // Round-robin means the destroy ran long before the flood drained.
    assert!(h.queue.queue_length(JobType::Build).await.unwrap() > 0);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn saturated_types_both_drain() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;

    let mut build_ids = Vec::new();
    for index in 0..10 {
        let deployment = insert_deployment(&h.persistence, &format!("build{index}")).await;
        h.engine
            .enqueue_build(build_payload(&deployment))
            .await
            .unwrap();
        build_ids.push(deployment.id);
    }

    let mut destroy_ids = Vec::new();
    for index in 0..10 {
        let deployment = insert_deployment(&h.persistence, &format!("destroy{index}")).await;
        let infrastructure =
            insert_ready_infrastructure(&h.persistence, &deployment, None).await;
        h.engine
            .enqueue_destroy(DestroyPayload {
                deployment_id: deployment.id,
                infrastructure_id: infrastructure.id,
            })
            .await
            .unwrap();
        destroy_ids.push(deployment.id);
    }

    let pool = h.orchestrator.start_workers();
    assert!(
        wait_for_drained(&h.queue, Duration::from_secs(60)).await,
        "queues never drained"
    );

    for id in &build_ids {
        assert!(
            wait_for_status(&h.persistence, id, Status::Exposed, Duration::from_secs(10)).await,
            "a build pipeline stalled"
        );
    }
    for id in &destroy_ids {
        assert!(
            wait_for_status(&h.persistence, id, Status::Destroyed, Duration::from_secs(10)).await,
            "a destroy stalled"
        );
    }

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_mid_handler_requeues_the_job() {
    let h = harness(
        MockProvisioner::with_delay(Duration::from_secs(30)),
        MockDeployer::default(),
    )
    .await;
    let deployment = insert_deployment(&h.persistence, "app").await;

    h.engine
        .enqueue_provision(ProvisionPayload {
            deployment_id: deployment.id,
            app_name: deployment.app_name.clone(),
            version: deployment.version.clone(),
            cloud: deployment.cloud.clone(),
            region: deployment.region.clone(),
            image_tag: "app:1.0.0".to_string(),
            build_id: None,
            node_count: None,
            machine_type: None,
            replicas: None,
        })
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(
        h.persistence.clone(),
        h.queue.clone(),
        h.engine.clone(),
        Collaborators {
            fetcher: Arc::new(MockFetcher::default()),
            analyzer: Arc::new(MockAnalyzer::default()),
            image_builder: Arc::new(MockImageBuilder::default()),
            provisioner: h.provisioner.clone(),
            deployer: h.deployer.clone(),
        },
        test_config(1),
    );
    let pool = orchestrator.start_workers();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.provisioner.provision_call_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.provisioner.provision_call_count(), 1, "handler in flight");

    let started = tokio::time::Instant::now();
    pool.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown must not wait out the handler's 30s sleep"
    );

    // The interrupted attempt was rescheduled with its error recorded;
    // once the backoff lapses another worker can claim it as attempt 2.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let requeued = h
        .queue
        .dequeue(JobType::Provision, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("job must survive shutdown");
    assert_eq!(requeued.attempts, 2);
    assert!(requeued
        .last_error
        .as_deref()
        .unwrap()
        .contains("cancelled"));
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_tears_down_release_and_stack() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;
    let deployment = insert_deployment(&h.persistence, "app").await;
    let infrastructure =
        insert_ready_infrastructure(&h.persistence, &deployment, Some("app-r1")).await;
    h.persistence
        .mark_deployment_as_deployed(&deployment.id, "203.0.113.10", "http://203.0.113.10:8080")
        .await
        .unwrap();

    h.engine
        .enqueue_destroy(DestroyPayload {
            deployment_id: deployment.id,
            infrastructure_id: infrastructure.id,
        })
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();
    assert!(
        wait_for_status(&h.persistence, &deployment.id, Status::Destroyed, Duration::from_secs(15))
            .await,
        "deployment never reached DESTROYED"
    );
    pool.shutdown().await;

    assert_eq!(
        h.deployer.destroy_calls.lock().unwrap().clone(),
        vec![("app-ns".to_string(), "app-r1".to_string())]
    );
    assert_eq!(h.provisioner.destroy_calls.lock().unwrap().len(), 1);

    let destroyed = h
        .persistence
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(destroyed.external_ip, None);
    assert_eq!(destroyed.external_url, None);

    let gone = h
        .persistence
        .get_infrastructure(&infrastructure.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone.status, InfrastructureStatus::Destroyed);
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_proceeds_past_a_failed_release_teardown() {
    let deployer = MockDeployer::default();
    deployer
        .fail_destroy_remaining
        .store(u32::MAX, std::sync::atomic::Ordering::SeqCst);

    let h = harness(MockProvisioner::default(), deployer).await;
    let deployment = insert_deployment(&h.persistence, "app").await;
    let infrastructure =
        insert_ready_infrastructure(&h.persistence, &deployment, Some("app-r1")).await;

    h.engine
        .enqueue_destroy(DestroyPayload {
            deployment_id: deployment.id,
            infrastructure_id: infrastructure.id,
        })
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();
    assert!(
        wait_for_status(&h.persistence, &deployment.id, Status::Destroyed, Duration::from_secs(15))
            .await,
        "a stuck helm release must not block the stack teardown"
    );
    pool.shutdown().await;

    // The helm failure is in the log as a warning, not a job failure.
    let destroying_logs = h
        .persistence
        .get_deployment_logs(&deployment.id, Some(Phase::Destroying), 100, 0)
        .await
        .unwrap();
    assert!(destroying_logs
        .iter()
        .any(|log| log.level == Level::Warn && log.message.contains("helm release teardown")));
    assert_eq!(h.provisioner.destroy_calls.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn requested_rollback_restores_a_concrete_version() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;
    // The live release is 2.0.0; the rollback targets 1.0.0.
    let deployment = insert_deployment_with_version(&h.persistence, "app", "2.0.0").await;
    insert_ready_infrastructure(&h.persistence, &deployment, Some("app-r1")).await;
    h.persistence
        .mark_deployment_as_deployed(&deployment.id, "203.0.113.10", "http://203.0.113.10:8080")
        .await
        .unwrap();

    h.engine
        .enqueue_rollback(skyhook_common::job::RollbackPayload {
            deployment_id: deployment.id,
            target_version: "1.0.0".to_string(),
            target_tag: Some("app:1.0.0".to_string()),
        })
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while h.deployer.rollbacks().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(
        wait_for_status(&h.persistence, &deployment.id, Status::Exposed, Duration::from_secs(10))
            .await
    );
    pool.shutdown().await;

    assert_eq!(
        h.deployer.rollbacks(),
        vec![("app-ns".to_string(), "app-r1".to_string(), 0)]
    );

    let rolled = h
        .persistence
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rolled.version, "1.0.0", "a concrete target rewrites the version");
    assert_eq!(rolled.last_error, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_without_a_release_fails_the_deployment() {
    let h = harness(MockProvisioner::default(), MockDeployer::default()).await;
    let deployment = insert_deployment(&h.persistence, "app").await;

    h.engine
        .enqueue_rollback(skyhook_common::job::RollbackPayload {
            deployment_id: deployment.id,
            target_version: "1.0.0".to_string(),
            target_tag: None,
        })
        .await
        .unwrap();

    let pool = h.orchestrator.start_workers();
    assert!(
        wait_for_status(&h.persistence, &deployment.id, Status::Failed, Duration::from_secs(15))
            .await
    );
    pool.shutdown().await;

    let failed = h
        .persistence
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .unwrap();
    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .contains("no helm release"));
    assert!(h.deployer.rollbacks().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_handler_does_not_kill_the_worker() {
    let h = harness(MockProvisioner::default(), MockDeployer::panicking_times(1)).await;
    let deployment = insert_deployment(&h.persistence, "app").await;
    let infrastructure = insert_ready_infrastructure(&h.persistence, &deployment, None).await;

    h.engine
        .enqueue_deploy(DeployPayload {
            deployment_id: deployment.id,
            infrastructure_id: infrastructure.id,
            image_tag: "app:1.0.0".to_string(),
            port: DEFAULT_PORT,
            replicas: 2,
        })
        .await
        .unwrap();

    // A single worker: if the panic killed it, nothing would ever
    // retry the job.
    let orchestrator = Orchestrator::new(
        h.persistence.clone(),
        h.queue.clone(),
        h.engine.clone(),
        Collaborators {
            fetcher: Arc::new(MockFetcher::default()),
            analyzer: Arc::new(MockAnalyzer::default()),
            image_builder: Arc::new(MockImageBuilder::default()),
            provisioner: h.provisioner.clone(),
            deployer: h.deployer.clone(),
        },
        test_config(1),
    );
    let pool = orchestrator.start_workers();
    assert!(
        wait_for_status(&h.persistence, &deployment.id, Status::Exposed, Duration::from_secs(15))
            .await,
        "the worker must survive the panic and retry the job"
    );
    pool.shutdown().await;

    assert_eq!(h.deployer.deploy_call_count(), 2);

    let logs = h
        .persistence
        .get_deployment_logs(&deployment.id, Some(Phase::Deploying), 100, 0)
        .await
        .unwrap();
    assert!(logs
        .iter()
        .any(|log| log.level == Level::Warn && log.message.contains("panicked")));
}
