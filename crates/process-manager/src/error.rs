//! Library error taxonomy.
//!
//! Routing-local failures (invalid message, buffer full) are signaled via
//! events and operation-local rejection; only channel/process failures
//! escalate to `criticalError` and lifecycle teardown.

use crate::bridge::transport::SpawnError;
use crate::master::ProcessState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `init` was called twice on the same instance.
    #[error("already initialized")]
    AlreadyInitialized,

    /// A lifecycle operation was invoked in a state that does not permit it.
    #[error("invalid lifecycle call: {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: ProcessState,
    },

    /// The outbound buffer is at capacity; the send was rejected, not queued.
    #[error("outbound message buffer full")]
    BufferFull,

    /// The owning supervisor stopped or the worker crashed before a reply
    /// arrived.
    #[error("message lost: worker stopped before a reply arrived")]
    MessageLost,

    /// The worker never reported ready within the configured start timeout.
    #[error("timed out waiting for worker ready")]
    StartTimeout,

    /// The channel to the peer is gone.
    #[error("worker channel closed")]
    ChannelClosed,

    /// The emitter outlived its master process.
    #[error("master process handle dropped")]
    MasterDropped,

    /// No startup options block was found in the worker's environment.
    #[error("startup info not present in environment")]
    MissingStartupInfo,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("channel i/o error: {0}")]
    Channel(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}
