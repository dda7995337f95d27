//! Local end-to-end simulation.
//!
//! Runs the production queue worker, dispatcher and orchestrator against the
//! simulated training backend, stream service and quota.

use anyhow::Context;
use colored::Colorize;
use pitwall_orchestrator::{
    Collaborators, ComputeUsage, DeadLetter, InMemoryComputeUsage, InMemoryJobQueue, InMemoryJobStore,
    JobDispatcher, JobRecord, JobStatus, Orchestrator, OrchestratorConfig, QueueWorker, QueueWorkerConfig,
    WorkflowMetrics,
};
use pitwall_training::{JobRequest, SimulatedBackend, SimulatedStreams};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

const SETTLE_INTERVAL: Duration = Duration::from_millis(20);

/// Options for the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub ceiling: u32,
    pub polls_to_complete: u32,
    pub poll_interval_ms: Option<u64>,
    pub fail_with: Option<String>,
    pub json: bool,
}

/// Execute the simulate command.
pub async fn execute(path: &Path, options: SimulateOptions, mut config: OrchestratorConfig) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job requests from {}", path.display()))?;
    let messages: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if messages.is_empty() {
        anyhow::bail!("{} contains no job requests", path.display());
    }

    if let Some(ms) = options.poll_interval_ms {
        config.monitor.poll_interval_secs = 0;
        config.monitor.poll_interval_ms = Some(ms);
    }
    config.validate().context("Invalid configuration")?;

    let mut backend = SimulatedBackend::new()
        .with_ceiling(options.ceiling)
        .with_polls_to_complete(options.polls_to_complete);
    if let Some(message) = &options.fail_with {
        backend = backend.with_failure(message.clone());
    }
    let backend = Arc::new(backend);
    let streams = Arc::new(SimulatedStreams::new());
    let store = Arc::new(InMemoryJobStore::new());
    let usage = Arc::new(InMemoryComputeUsage::new());

    let orchestrator = Orchestrator::new(
        Collaborators {
            store: store.clone(),
            backend: backend.clone(),
            streams: streams.clone(),
            usage: usage.clone(),
        },
        &config,
    );
    let dispatcher = Arc::new(JobDispatcher::new(
        store.clone(),
        backend.clone(),
        Arc::new(orchestrator.clone()),
        config.dispatcher.clone(),
    ));
    let queue = Arc::new(InMemoryJobQueue::new());
    let worker = Arc::new(QueueWorker::new(
        queue.clone(),
        dispatcher,
        QueueWorkerConfig {
            idle_poll: SETTLE_INTERVAL,
            retry_delay: config.monitor.poll_interval(),
        },
    ));

    // Compute minutes are reserved when a job is requested, before it is queued.
    let mut profiles = BTreeSet::new();
    for body in &messages {
        if let Ok(request) = JobRequest::from_json(body) {
            usage
                .reserve(&request.profile_id, f64::from(request.termination.max_time_in_minutes))
                .await?;
            profiles.insert(request.profile_id);
        }
        queue.send(*body).await;
    }
    info!(messages = messages.len(), ceiling = options.ceiling, "Simulation started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_task = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    loop {
        tokio::time::sleep(SETTLE_INTERVAL).await;
        if queue.is_drained().await && orchestrator.progress().snapshot().await.active == 0 {
            break;
        }
    }
    debug!("Queue drained and no executions active");
    let _ = shutdown_tx.send(true);
    worker_task.await.context("Queue worker task failed")?;

    let records = store.all().await;
    let dead_letters = queue.dead_letters().await;
    let metrics = orchestrator.progress().snapshot().await;
    let mut usage_by_profile = Vec::new();
    for profile in profiles {
        let snapshot = usage.usage(&profile).await?;
        usage_by_profile.push((profile, snapshot));
    }

    if options.json {
        let output = json!({
            "jobs": records,
            "deadLetters": dead_letters
                .iter()
                .map(|d| json!({ "messageId": d.message.id, "reason": d.reason }))
                .collect::<Vec<_>>(),
            "metrics": {
                "completed": metrics.completed,
                "failed": metrics.failed,
                "canceled": metrics.canceled,
            },
            "usage": usage_by_profile
                .iter()
                .map(|(profile, u)| {
                    json!({ "profileId": profile, "minutesQueued": u.minutes_queued, "minutesUsed": u.minutes_used })
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        output_human(&records, &dead_letters, metrics);
    }
    Ok(())
}

fn output_human(records: &[JobRecord], dead_letters: &[DeadLetter], metrics: WorkflowMetrics) {
    println!();
    println!("{}", format!("Simulated Jobs ({})", records.len()).bold().cyan());
    println!();
    println!("{:<24} {:<11} {:>9}  {}", "Job", "Status", "Duration", "Detail");
    println!("{}", "─".repeat(72));
    for record in records {
        let status = record.status.to_string();
        let status = match record.status {
            JobStatus::Completed => status.green(),
            JobStatus::Failed => status.red(),
            _ => status.yellow(),
        };
        let duration = record.duration_seconds.map_or_else(|| "-".to_string(), |s| format!("{s}s"));
        let detail = record
            .error_message
            .clone()
            .or_else(|| record.artifact_location.clone())
            .unwrap_or_default();
        println!("{:<24} {:<11} {:>9}  {}", record.job_id.as_str(), status, duration, detail.dimmed());
    }

    if !dead_letters.is_empty() {
        println!();
        println!("{}", format!("Dead Letters ({})", dead_letters.len()).bold().red());
        for dead in dead_letters {
            println!("  message {}: {}", dead.message.id, dead.reason);
        }
    }

    println!();
    println!(
        "  {} completed, {} failed, {} canceled",
        metrics.completed.to_string().green(),
        metrics.failed.to_string().red(),
        metrics.canceled.to_string().yellow()
    );
    println!();
}
