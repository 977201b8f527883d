//! Session Bridge: owns the duplex seeding stream.
//!
//! A single receive loop turns server frames into two bounded, ordered
//! channels: SQL tasks for the worker pool and events for the progress
//! consumer. Responses go back through [`BridgeHandle::send_response`].
//!
//! ```text
//!   server ──frames──▶ receive loop ──▶ tasks  ──▶ WorkerPool
//!                                  └──▶ events ──▶ EventConsumer
//!   server ◀──────────── outbound ◀──── send_response()
//! ```

mod frames;
mod ledger;
mod session;
mod token;

pub use frames::{SqlResponse, SqlTask};
pub use session::{InboundStream, Session};
pub use token::BearerToken;

use async_trait::async_trait;

use crate::error::Result;

/// The outbound side of a session, as seen by workers and the event consumer.
#[async_trait]
pub trait BridgeHandle: Send + Sync {
    /// Send one response for an outstanding task or question id.
    async fn send_response(&self, response: SqlResponse) -> Result<()>;

    /// End the session. Idempotent.
    async fn close(&self) -> Result<()>;
}
