//! Master/worker process orchestration over framed JSON channels.
//!
//! A [`MasterProcess`] spawns a worker (a real subprocess or an in-process
//! stub), exchanges envelopes with it over a length-prefixed JSON channel,
//! and exposes:
//! - round-trip requests with correlation-id reply matching
//!   ([`MasterProcess::send_receive`])
//! - one-way messages and named events ([`MasterProcess::send_message`],
//!   [`MasterProcess::send`])
//! - outbound buffering while the worker starts, with overflow signaling
//! - a lifecycle state machine with crash detection and lost-message
//!   accounting
//!
//! The worker side runs a [`SlaveProcess`]: it installs one request listener,
//! reports ready, and serves the channel until stopped.

pub mod bridge;
pub mod constants;
pub mod error;
pub mod events;
pub mod master;
pub mod slave;

mod buffer;
mod correlation;

pub use bridge::protocol::{
    CorrelationId, Envelope, EnvelopeKind, buffer_payload, buffer_payload_bytes,
};
pub use bridge::transport::{
    AppliedOptions, ProcessSpawner, SpawnError, Spawner, StartOptions, WorkerFactory,
};
pub use error::Error;
pub use events::EventRouter;
pub use master::{
    MasterConfig, MasterEmitter, MasterProcess, ProcessInfo, ProcessState, StopResult,
};
pub use slave::{SlaveEmitter, SlaveListener, SlaveProcess};
