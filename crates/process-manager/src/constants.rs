//! Fixed channel names and reserved wire identifiers.

/// Lifecycle channel: unrecoverable channel/process failures.
pub const CRITICAL_ERROR: &str = "criticalError";

/// Lifecycle channel: an outbound send exceeded the buffer capacity.
pub const MESSAGE_BUFFER_FULL: &str = "messageBufferFull";

/// Lifecycle channel: an inbound envelope failed to parse or matched no
/// pending request.
pub const RECEIVED_INVALID_MESSAGE: &str = "ReceivedInvalidMessage";

/// Generic inbound-message channel on the master emitter; `init`'s one-way
/// receiver is registered here.
pub const EMIT_MESSAGE: &str = "emitMessage";

/// Channel the worker emitter fires for every non-correlated inbound
/// one-way message.
pub const MESSAGE: &str = "message";

/// Reserved wire event: sent by the worker's `finished_init` once its
/// listener is wired and it is safe to receive traffic. Not dispatched to
/// user handlers.
pub const WORKER_READY: &str = "processManager:workerReady";

/// Reserved wire event: sent by the master to request graceful worker exit.
/// Not dispatched to user handlers.
pub const STOP_WORKER: &str = "processManager:stopWorker";

/// Environment variable carrying the startup options block (JSON) to a
/// spawned worker process.
pub const STARTUP_INFO_ENV: &str = "PROCESS_MANAGER_STARTUP_INFO";
