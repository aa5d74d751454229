/// Builder for constructing a scheduler from its dependencies.
pub mod builder;
/// Worker launch seam and the OS-process launcher.
pub mod launcher;
/// The dispatch loop: reconciliation, stale recovery and dispatch.
pub mod supervisor;
/// Job execution inside a worker: heartbeats, classification, outcomes.
pub mod worker;

pub use builder::SchedulerBuilder;
pub use launcher::{LaunchRequest, ProcessHandle, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use supervisor::{CancelOutcome, Scheduler, ShutdownToken, TickReport};
pub use worker::{classify_failure, JobContext, WorkerOutcome, WorkerRuntime};
