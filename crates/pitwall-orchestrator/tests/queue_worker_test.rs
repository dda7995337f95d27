//! Queue worker dispositions and the worker loop.

use pitwall_orchestrator::{
    Collaborators, InMemoryComputeUsage, InMemoryJobQueue, InMemoryJobStore, JobDispatcher, JobStatus, JobStore,
    MessageDisposition, Orchestrator, OrchestratorConfig, QueueWorker, QueueWorkerConfig, TerminalStatus,
};
use pitwall_training::{JobId, SimulatedBackend, SimulatedStreams};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Setup {
    queue: Arc<InMemoryJobQueue>,
    store: Arc<InMemoryJobStore>,
    backend: Arc<SimulatedBackend>,
    orchestrator: Orchestrator,
    worker: Arc<QueueWorker>,
}

fn setup(backend: SimulatedBackend) -> Setup {
    let store = Arc::new(InMemoryJobStore::new());
    let backend = Arc::new(backend);
    let config = OrchestratorConfig::default();
    let orchestrator = Orchestrator::new(
        Collaborators {
            store: store.clone(),
            backend: backend.clone(),
            streams: Arc::new(SimulatedStreams::new()),
            usage: Arc::new(InMemoryComputeUsage::new()),
        },
        &config,
    );
    let dispatcher = Arc::new(JobDispatcher::new(
        store.clone(),
        backend.clone(),
        Arc::new(orchestrator.clone()),
        config.dispatcher,
    ));
    let queue = Arc::new(InMemoryJobQueue::new());
    let worker = Arc::new(QueueWorker::new(
        queue.clone(),
        dispatcher,
        QueueWorkerConfig {
            idle_poll: Duration::from_millis(100),
            retry_delay: Duration::from_secs(30),
        },
    ));
    Setup { queue, store, backend, orchestrator, worker }
}

fn body(job_id: &str) -> String {
    json!({
        "jobId": job_id,
        "modelId": "model-1",
        "profileId": "profile-1",
        "raceType": "OBJECT_AVOIDANCE",
        "trackConfig": { "trackId": "reinvent_base", "trackDirection": "CLOCKWISE" },
        "terminationConditions": { "maxTimeInMinutes": 30 },
        "objectAvoidanceConfig": {
            "numberOfObjects": 2,
            "objectPositions": [
                { "laneNumber": 1, "trackPercentage": 0.2 },
                { "laneNumber": -1, "trackPercentage": 0.6 }
            ]
        },
        "requestedAt": "2026-03-01T12:00:00Z"
    })
    .to_string()
}

fn id(job_id: &str) -> JobId {
    JobId::parse(job_id).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_invalid_message_is_dead_lettered() {
    let s = setup(SimulatedBackend::new());
    s.queue.send("{\"jobId\": \"broken\"").await;

    assert_eq!(s.worker.process_next().await.unwrap(), Some(MessageDisposition::DeadLetter));
    assert_eq!(s.worker.process_next().await.unwrap(), None);

    let dead = s.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.starts_with("validation error"));
    assert!(s.store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_over_quota_message_is_redelivered() {
    let s = setup(SimulatedBackend::new().with_ceiling(1).with_polls_to_complete(3));
    s.queue.send(body("job-q1")).await;
    s.queue.send(body("job-q2")).await;

    assert_eq!(s.worker.process_next().await.unwrap(), Some(MessageDisposition::Ack));
    assert_eq!(s.worker.process_next().await.unwrap(), Some(MessageDisposition::Retry));
    assert!(s.store.get(&id("job-q2")).await.unwrap().is_none());
    assert_eq!(s.queue.pending_len().await, 1);

    assert_eq!(s.orchestrator.wait_for(&id("job-q1")).await.unwrap(), TerminalStatus::Completed);
    assert_eq!(s.worker.process_next().await.unwrap(), Some(MessageDisposition::Ack));
    assert_eq!(s.orchestrator.wait_for(&id("job-q2")).await.unwrap(), TerminalStatus::Completed);
    assert!(s.queue.is_drained().await);
    assert_eq!(s.backend.start_calls().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_message_is_idempotent() {
    let s = setup(SimulatedBackend::new().with_polls_to_complete(3));
    s.queue.send(body("job-q3")).await;

    assert_eq!(s.worker.process_next().await.unwrap(), Some(MessageDisposition::Ack));
    s.queue.send(body("job-q3")).await;
    assert_eq!(s.worker.process_next().await.unwrap(), Some(MessageDisposition::Ack));

    s.orchestrator.wait_for(&id("job-q3")).await.unwrap();
    assert_eq!(s.backend.start_calls().await, 1);
    assert_eq!(s.store.status_history(&id("job-q3")).await.last(), Some(&JobStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_worker_loop_drains_queue_until_shutdown() {
    let s = setup(SimulatedBackend::new().with_ceiling(4));
    for job in ["job-w1", "job-w2"] {
        s.queue.send(body(job)).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Arc::clone(&s.worker);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    for job in ["job-w1", "job-w2"] {
        assert_eq!(finished(&s.orchestrator, &id(job)).await, TerminalStatus::Completed);
    }
    assert!(s.queue.is_drained().await);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

/// Waits for the worker to start the job, then for it to finish.
async fn finished(orchestrator: &Orchestrator, job_id: &JobId) -> TerminalStatus {
    loop {
        if let Ok(status) = orchestrator.wait_for(job_id).await {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
