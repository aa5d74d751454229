//! Foreman - GPU-aware job orchestration on a single host.
//!
//! A persistent scheduler that accepts heterogeneous background jobs,
//! enforces exclusive access to the GPU, runs each job in an isolated worker
//! process, watches liveness through heartbeats and recovers crashed work
//! from durable SQLite state.
//!
//! # Core Concepts
//!
//! - **Registry**: [`Registry`] maps a job kind to its [`JobSpec`]: resource
//!   class, estimators, precondition and the [`JobHandler`] that runs it.
//!
//! - **Store**: the [`JobStore`] trait is the durable state shared by the
//!   scheduler and its workers; [`SqliteStore`] implements it.
//!
//! - **Budget**: [`ClassBudget`] caps concurrent jobs per [`ResourceClass`].
//!
//! - **GPU**: [`GpuManager`] probes the device, preflights VRAM and holds the
//!   exclusive GPU lease.
//!
//! - **Runtime**: [`Scheduler`] runs the dispatch loop; [`WorkerRuntime`]
//!   executes a job inside a worker process.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use foreman::*;
//!
//! let store = Arc::new(SqliteStore::connect(&PersistenceConfig::new(url)).await?);
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::default())
//!     .with_store(store)
//!     .with_registry(Arc::new(builtin::builtin_registry()?))
//!     .with_launcher(Arc::new(ProcessLauncher::current_exe(url)?))
//!     .build()?;
//! let id = scheduler.enqueue("sleep", json!({"seconds": 3}), 5, None).await?;
//! ```

/// Per-resource-class concurrency limits.
///
/// [`BudgetConfig`] holds the limits; [`ClassBudget`] is the per-tick counter
/// seeded from the durable count of leased and running jobs.
pub mod budget;

/// Job kinds shipped with the `foreman` binary.
pub mod builtin;

/// Configuration structures for the scheduler and persistence.
pub mod config;

/// Durable structured events.
///
/// [`EventCode`] values, [`Severity`], bounded traces and the [`emit`]
/// helper that logs and appends in one step.
pub mod events;

/// GPU probing, preflight and the exclusive GPU lease.
pub mod gpu;

/// Core job types: [`JobId`], [`JobStatus`], [`ResourceClass`],
/// [`ErrorCode`] and the stored [`JobRecord`].
pub mod job;

/// Lease owners, resource leases, retry backoff and stale detection.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus collectors, enabled by the `metrics` feature.
pub mod metrics;

/// SQLite persistence.
pub mod persistence;

/// The [`JobStore`] trait and [`QueueSnapshot`].
pub mod queue;

/// Job-kind catalog and the [`JobHandler`] trait.
pub mod registry;

/// Scheduler loop, worker launcher and worker runtime.
pub mod runtime;

/// Tracing spans and `record_*` helpers.
pub mod telemetry;

pub use budget::*;
pub use config::*;
pub use events::*;
pub use gpu::*;
pub use job::*;
pub use lease::*;
pub use persistence::SqliteStore;
pub use queue::*;
pub use registry::*;
pub use runtime::*;
