//! GPU lease lifecycle through `GpuManager` on a real store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use foreman::*;
use foreman_testkit::*;

fn manager(store: &TempStore) -> GpuManager {
    GpuManager::new(
        store.store(),
        Arc::new(FixedGpuProbe::healthy(24_576, 20_000)),
        GpuPolicy::default(),
        30,
    )
}

#[tokio::test]
async fn lease_round_trip_leaves_table_empty() {
    let store = temp_store().await;
    let gpu = manager(&store);

    assert!(gpu.acquire_exclusive("job-1-a").await.unwrap());
    for _ in 0..3 {
        assert!(gpu.refresh_lease("job-1-a").await.unwrap());
    }
    let lease = gpu.current_lease().await.unwrap().expect("lease held");
    assert_eq!(lease.owner, "job-1-a");
    assert_eq!(lease.ttl_secs, 30);

    gpu.release("job-1-a").await.unwrap();
    assert!(gpu.current_lease().await.unwrap().is_none());
    assert!(store.store().locks().await.unwrap().is_empty());

    assert!(gpu.acquire_exclusive("job-2-b").await.unwrap());
}

#[tokio::test]
async fn held_lease_excludes_other_owners() {
    let store = temp_store().await;
    let gpu = manager(&store);

    assert!(gpu.acquire_exclusive("job-1-a").await.unwrap());
    assert!(!gpu.acquire_exclusive("job-2-b").await.unwrap());
    assert!(!gpu.refresh_lease("job-2-b").await.unwrap());
    // Re-entrant for the same owner.
    assert!(gpu.acquire_exclusive("job-1-a").await.unwrap());
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let store = temp_store().await;
    let gpu = manager(&store);

    assert!(gpu.acquire_exclusive("job-1-a").await.unwrap());
    store
        .backdate_lock(GPU_RESOURCE, Utc::now() - Duration::seconds(120))
        .await
        .unwrap();

    assert!(gpu.acquire_exclusive("job-2-b").await.unwrap());
    let lease = gpu.current_lease().await.unwrap().unwrap();
    assert_eq!(lease.owner, "job-2-b");
    assert!(!gpu.refresh_lease("job-1-a").await.unwrap());
}

#[tokio::test]
async fn release_is_idempotent() {
    let store = temp_store().await;
    let gpu = manager(&store);

    gpu.release("nobody").await.unwrap();

    assert!(gpu.acquire_exclusive("job-1-a").await.unwrap());
    gpu.release("job-2-b").await.unwrap();
    assert!(gpu.current_lease().await.unwrap().is_some());

    gpu.release("job-1-a").await.unwrap();
    gpu.release("job-1-a").await.unwrap();
    assert!(gpu.current_lease().await.unwrap().is_none());
}

#[tokio::test]
async fn preflight_uses_probe_and_policy() {
    let store = temp_store().await;
    let probe = FixedGpuProbe::absent();
    let gpu = GpuManager::new(store.store(), Arc::new(probe.clone()), GpuPolicy::default(), 30);

    assert!(!gpu.preflight(1024).await.is_admitted());

    probe.set(GpuInfo {
        present: true,
        name: Some("Test GPU".into()),
        total_mb: 16_384,
        free_mb: 9_000,
        driver_version: None,
        cuda_version: None,
        cuda_available: true,
        source: "fixed".into(),
    });
    assert!(gpu.preflight(4096).await.is_admitted());
    assert!(!gpu.preflight(8192).await.is_admitted());
}
