/// Worker builder with explicit dependencies.
pub mod builder;
/// Renewal of the locks held by one worker.
pub mod lock_manager;
/// The processor contract and the per-job context.
pub mod processor;
/// Processors running behind a message channel.
pub mod sandbox;
/// The worker engine and shutdown signaling.
pub mod supervisor;
/// Delayed promotion and stalled-job recovery.
pub mod sweeper;
/// Worker configuration.
pub mod worker;

pub use builder::WorkerBuilder;
pub use lock_manager::LockManager;
pub use processor::{JobContext, Processor};
pub use sandbox::{Sandbox, SandboxJob, SandboxMessage, SandboxedProcessor};
pub use supervisor::{ShutdownToken, Worker};
pub use sweeper::{SweepReport, Sweeper};
pub use worker::{RateLimiterOptions, WorkerConfig};
