//! The Convoy orchestrator: rollout state machines, strategy execution and
//! control operations.
//!
//! The [`Orchestrator`] owns one background rollout task per active
//! deployment. Tasks are detached from the request that started them; only
//! the cancel signal (or process death) stops a rollout.

pub mod orchestrator;
pub mod rollout;

pub use orchestrator::{EngineConfig, Orchestrator, StatusSummary};
pub use rollout::RolloutState;
