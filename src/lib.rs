//! seed-agent: local execution agent for remote-orchestrated database seeding.
//!
//! The agent holds one duplex gRPC session with the seeding service. The
//! service plans which tables to fill and streams SQL statements; the agent
//! repairs them against live schema metadata, runs them on the target
//! database with a bounded worker pool, and answers each one. Progress
//! events are reconciled into a single view of the run.

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod proto;
pub mod runner;
pub mod seeding;
pub mod sqlexec;
pub mod worker;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use runner::{SeedReport, SeedRun};
