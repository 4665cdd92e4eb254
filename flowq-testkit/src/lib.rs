//! Test fixtures for flowq.
//!
//! - [`TestHarness`]: a queue over a [`MemoryStore`](flowq::MemoryStore)
//!   driven by a [`ManualClock`](flowq::ManualClock)
//! - [`RecordingProcessor`] and [`ScriptedProcessor`]: processors that
//!   record their calls and return configured outcomes
//! - [`assert_exclusive_state`]: checks that a job sits in exactly one
//!   state structure

pub mod harness;
pub mod mock;
pub mod state;

pub use harness::{START_MS, TestHarness};
pub use mock::{Outcome, ProcessRecord, RecordingProcessor, ScriptedProcessor};
pub use state::{assert_exclusive_state, state_memberships};
