//! Dispatch into real `foreman worker` processes spawned from the built
//! binary, sharing a SQLite file with the scheduler.

use std::sync::Arc;
use std::time::Duration;

use foreman::builtin::{builtin_registry, SLEEP_KIND};
use foreman::*;
use foreman_testkit::*;
use serde_json::json;

struct Harness {
    _store: TempStore,
    scheduler: Scheduler,
}

async fn harness() -> Harness {
    let store = temp_store().await;
    let config = SchedulerConfig::default()
        .with_poll_interval(50)
        .with_heartbeat_interval(1);
    let launcher = ProcessLauncher::new(env!("CARGO_BIN_EXE_foreman"), store.url.clone())
        .with_heartbeat_interval(config.heartbeat_interval())
        .with_retry(config.retry.clone());
    let scheduler = SchedulerBuilder::new(config)
        .with_store(store.store())
        .with_registry(Arc::new(builtin_registry().expect("builtin registry")))
        .with_gpu_probe(Arc::new(FixedGpuProbe::healthy(24_576, 20_000)))
        .with_launcher(Arc::new(launcher))
        .build()
        .expect("build scheduler");
    Harness {
        _store: store,
        scheduler,
    }
}

/// Tick until the job is terminal, or panic after thirty seconds.
async fn run_to_end(h: &Harness, id: JobId) -> JobRecord {
    let wait = async {
        loop {
            h.scheduler.tick().await.expect("tick");
            let job = h.scheduler.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("worker process finished the job")
}

#[tokio::test]
async fn worker_process_runs_sleep_job() {
    let h = harness().await;

    let id = h
        .scheduler
        .enqueue(SLEEP_KIND, json!({"seconds": 1}), 0, None)
        .await
        .unwrap();
    let job = run_to_end(&h, id).await;

    assert_eq!(job.status, JobStatus::Done, "{:?}", job.error_message);
    assert_eq!(job.attempts, 1);
    assert_eq!(
        h.scheduler.job_checkpoint(id).await.unwrap(),
        Some(json!({"slept": 1}))
    );

    let events = h.scheduler.job_events(id, 20).await.unwrap();
    let started = events
        .iter()
        .find(|e| e.code == EventCode::JOB_STARTED)
        .expect("start event");
    assert_ne!(started.data["pid"], json!(std::process::id()));
    assert!(events.iter().any(|e| e.code == EventCode::JOB_COMPLETED));
}

#[tokio::test]
async fn worker_process_reads_large_payload_from_store() {
    let h = harness().await;

    // Larger than a single argv entry may be on Linux.
    let padding = "x".repeat(200_000);
    let id = h
        .scheduler
        .enqueue(
            SLEEP_KIND,
            json!({"seconds": 0, "padding": padding}),
            0,
            None,
        )
        .await
        .unwrap();
    let job = run_to_end(&h, id).await;

    assert_eq!(job.status, JobStatus::Done, "{:?}", job.error_message);
    assert_eq!(job.payload["padding"].as_str().map(str::len), Some(200_000));
    assert!(h
        .scheduler
        .job_events(id, 20)
        .await
        .unwrap()
        .iter()
        .all(|e| e.code != EventCode::LAUNCH_FAILED));
}
