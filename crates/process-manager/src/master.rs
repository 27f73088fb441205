//! Master-side process supervisor.
//!
//! Owns the spawned worker handle, the outbound buffer, the correlation
//! table, and the event router; drives the lifecycle state machine
//! `Idle -> Starting -> Running -> Stopping -> Stopped`.
//!
//! Flow:
//! 1. `init` wires the fixed lifecycle channels and the one-way receiver
//! 2. `start`/`q_start` spawns the worker and waits for its ready event
//! 3. sends issued while starting are buffered, then flushed FIFO on ready
//! 4. a reader task routes inbound envelopes (reply correlation, named
//!    events, one-way messages)
//! 5. on worker crash: pending requests resolve as lost, `criticalError`
//!    fires, state goes to `Stopped`

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};

use crate::bridge::protocol::{Envelope, EnvelopeKind};
use crate::bridge::transport::{
    AppliedOptions, ChildControl, EnvelopeReader, EnvelopeWriter, ProcessSpawner, SpawnError,
    SpawnRequest, Spawner, StartOptions, WorkerFactory, spawn_in_process,
};
use crate::buffer::OutboundBuffer;
use crate::constants;
use crate::correlation::{CorrelationTable, ReplyOutcome};
use crate::error::Error;
use crate::events::EventRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state and basic process metadata, answered locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub pid: Option<u32>,
}

/// Result of `stop`/`q_stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct StopResult {
    /// Pending round-trip requests that had to be force-resolved as lost
    /// during this lifecycle.
    #[serde(rename = "numLostMessages")]
    pub num_lost_messages: u64,
}

pub struct MasterConfig {
    /// Outbound buffer capacity while the worker is starting.
    pub buffer_capacity: usize,
    /// Bound on waiting for the worker's ready event.
    pub start_timeout: Duration,
    /// Grace period between the stop signal and forcible termination.
    pub stop_grace: Duration,
    pub spawner: Arc<dyn Spawner>,
    /// Builds in-process stub workers when `spawnChildProcess` is false.
    pub worker_factory: Option<WorkerFactory>,
}

impl MasterConfig {
    pub fn new() -> Self {
        Self {
            buffer_capacity: 64,
            start_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(3),
            spawner: Arc::new(ProcessSpawner),
            worker_factory: None,
        }
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_worker_factory(mut self, factory: WorkerFactory) -> Self {
        self.worker_factory = Some(factory);
        self
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    state: ProcessState,
    correlations: CorrelationTable,
    buffer: OutboundBuffer,
    lost_messages: u64,
    pid: Option<u32>,
    crashed: bool,
    stop_reported: bool,
    ready_tx: Option<oneshot::Sender<Result<Option<Value>, Error>>>,
}

struct Inner {
    config: MasterConfig,
    events: Arc<EventRouter>,
    emitter: StdMutex<Option<Arc<MasterEmitter>>>,
    shared: StdMutex<Shared>,
    writer: tokio::sync::Mutex<Option<EnvelopeWriter>>,
    control: tokio::sync::Mutex<Option<ChildControl>>,
    closed_tx: watch::Sender<bool>,
}

/// The supervising side of one master/worker pairing.
///
/// Clones share the same instance; one supervisor exclusively owns its
/// channel, correlation table, and buffer.
#[derive(Clone)]
pub struct MasterProcess {
    inner: Arc<Inner>,
}

impl Default for MasterProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterProcess {
    pub fn new() -> Self {
        Self::with_config(MasterConfig::new())
    }

    pub fn with_config(config: MasterConfig) -> Self {
        let buffer_capacity = config.buffer_capacity;
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                events: Arc::new(EventRouter::new()),
                emitter: StdMutex::new(None),
                shared: StdMutex::new(Shared {
                    state: ProcessState::Idle,
                    correlations: CorrelationTable::new(),
                    buffer: OutboundBuffer::new(buffer_capacity),
                    lost_messages: 0,
                    pid: None,
                    crashed: false,
                    stop_reported: false,
                    ready_tx: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                control: tokio::sync::Mutex::new(None),
                closed_tx,
            }),
        }
    }

    /// Register the default receiver for inbound one-way messages and wire
    /// the fixed lifecycle channels. Synchronous; fails if called twice.
    pub fn init(
        &self,
        receiver: impl FnMut(Value) + Send + 'static,
    ) -> Result<Arc<MasterEmitter>, Error> {
        let mut slot = lock_unpoisoned(&self.inner.emitter);
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let events = &self.inner.events;
        events.on(constants::CRITICAL_ERROR, |payload| {
            tracing::error!(%payload, "worker critical error");
        });
        events.on(constants::MESSAGE_BUFFER_FULL, |payload| {
            tracing::warn!(%payload, "outbound message buffer full");
        });
        events.on(constants::RECEIVED_INVALID_MESSAGE, |payload| {
            tracing::warn!(%payload, "received invalid message");
        });
        events.on(constants::EMIT_MESSAGE, receiver);

        let emitter = Arc::new(MasterEmitter {
            master: Arc::downgrade(&self.inner),
            events: Arc::clone(events),
        });
        *slot = Some(Arc::clone(&emitter));
        Ok(emitter)
    }

    /// Spawn the worker and wait for it to report ready.
    ///
    /// Resolves to the options that were effectively applied, with
    /// `cwd`/`exec_path` defaulted from the calling process when not
    /// supplied. Fails outside `Idle` and on spawn failure.
    pub async fn start(
        &self,
        entry: &str,
        options: StartOptions,
    ) -> Result<AppliedOptions, Error> {
        let applied = options.resolve().map_err(SpawnError::Io)?;

        let ready_rx = {
            let mut shared = self.lock_shared();
            if shared.state != ProcessState::Idle {
                return Err(Error::InvalidState {
                    op: "start",
                    state: shared.state,
                });
            }
            shared.state = ProcessState::Starting;
            let (tx, rx) = oneshot::channel();
            shared.ready_tx = Some(tx);
            rx
        };

        let spawned = if applied.spawn_child_process {
            self.inner.config.spawner.spawn(&SpawnRequest {
                entry,
                options: &applied,
            })
        } else {
            match &self.inner.config.worker_factory {
                Some(factory) => spawn_in_process(factory, &applied),
                None => Err(SpawnError::NoWorkerFactory),
            }
        };

        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let mut shared = self.lock_shared();
                shared.state = ProcessState::Stopped;
                shared.ready_tx = None;
                return Err(Error::Spawn(e));
            }
        };

        {
            let mut shared = self.lock_shared();
            shared.pid = spawned.pid;
        }
        *self.inner.writer.lock().await = Some(spawned.writer);
        *self.inner.control.lock().await = Some(spawned.control);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(read_loop(inner, spawned.reader));

        tracing::debug!(entry, pid = ?spawned.pid, "waiting for worker ready");
        match tokio::time::timeout(self.inner.config.start_timeout, ready_rx).await {
            Ok(Ok(Ok(info))) => {
                tracing::trace!(?info, "worker reported ready");
            }
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                tracing::error!(entry, "worker never reported ready");
                self.teardown_after_failure().await;
                return Err(Error::StartTimeout);
            }
        }

        // Flush everything queued while starting, in FIFO order, then flip
        // to Running under the same lock that gates buffering so nothing can
        // slip into the buffer afterwards.
        loop {
            let batch = {
                let mut shared = self.lock_shared();
                if shared.buffer.is_empty() {
                    shared.state = ProcessState::Running;
                    break;
                }
                shared.buffer.drain()
            };
            let mut writer = self.inner.writer.lock().await;
            let writer = writer.as_mut().ok_or(Error::ChannelClosed)?;
            for envelope in batch {
                writer.send(envelope).await.map_err(Error::Channel)?;
            }
        }

        tracing::info!(entry, pid = ?applied_pid(&self.inner), "worker running");
        Ok(applied)
    }

    /// Explicitly future-returning form of [`start`](Self::start).
    pub async fn q_start(
        &self,
        entry: &str,
        options: StartOptions,
    ) -> Result<AppliedOptions, Error> {
        self.start(entry, options).await
    }

    /// Request graceful termination: discard the buffer, signal the worker,
    /// wait out the grace period, then force-resolve anything still pending.
    ///
    /// After a worker crash, a single call reports the accumulated lost
    /// count; any further call fails with an invalid-state error.
    pub async fn stop(&self) -> Result<StopResult, Error> {
        enum Mode {
            Graceful,
            CrashReport(u64),
        }

        let mode = {
            let mut shared = self.lock_shared();
            match shared.state {
                ProcessState::Running => {
                    shared.state = ProcessState::Stopping;
                    let dropped = shared.buffer.clear();
                    if dropped > 0 {
                        tracing::debug!(dropped, "discarded buffered outbound messages");
                    }
                    Mode::Graceful
                }
                ProcessState::Stopped if shared.crashed && !shared.stop_reported => {
                    shared.stop_reported = true;
                    Mode::CrashReport(shared.lost_messages)
                }
                state => {
                    return Err(Error::InvalidState { op: "stop", state });
                }
            }
        };

        if let Mode::CrashReport(lost) = mode {
            tracing::debug!(num_lost_messages = lost, "reporting losses from earlier crash");
            return Ok(StopResult {
                num_lost_messages: lost,
            });
        }

        {
            let mut writer = self.inner.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                if let Err(e) = writer
                    .send(Envelope::event(constants::STOP_WORKER, None))
                    .await
                {
                    tracing::warn!(error = %e, "failed to send stop event");
                }
            }
        }

        let mut closed = self.inner.closed_tx.subscribe();
        let graceful = tokio::time::timeout(
            self.inner.config.stop_grace,
            closed.wait_for(|closed| *closed),
        )
        .await
        .is_ok();
        if !graceful {
            tracing::warn!("grace period expired, terminating worker");
        }

        if let Some(control) = self.inner.control.lock().await.take() {
            control.terminate().await;
        }
        // Dropping the writer closes the channel for in-process workers.
        *self.inner.writer.lock().await = None;

        let result = {
            let mut shared = self.lock_shared();
            let lost = shared.correlations.drain_as_lost();
            shared.lost_messages += lost as u64;
            shared.state = ProcessState::Stopped;
            shared.stop_reported = true;
            StopResult {
                num_lost_messages: shared.lost_messages,
            }
        };
        tracing::info!(
            num_lost_messages = result.num_lost_messages,
            graceful,
            "worker stopped"
        );
        Ok(result)
    }

    /// Explicitly future-returning form of [`stop`](Self::stop).
    pub async fn q_stop(&self) -> Result<StopResult, Error> {
        self.stop().await
    }

    /// Send a named event; no reply expected. Resolves once the write (or
    /// pre-ready buffering) has been accepted.
    pub async fn send(&self, name: &str, payload: Value) -> Result<(), Error> {
        self.enqueue(Envelope::event(name, Some(payload)), "send")
            .await
    }

    /// Send a generic one-way message with no name; same resolution contract
    /// as [`send`](Self::send).
    pub async fn send_message(&self, payload: Value) -> Result<(), Error> {
        self.enqueue(Envelope::one_way(Some(payload)), "sendMessage")
            .await
    }

    /// Round trip: resolves with the payload of the Reply matching this
    /// request's correlation id, in whatever order replies arrive.
    pub async fn send_receive(&self, payload: Value) -> Result<Option<Value>, Error> {
        let (id, rx) = {
            let mut shared = self.lock_shared();
            match shared.state {
                ProcessState::Running | ProcessState::Starting => {
                    shared.correlations.register()
                }
                state => {
                    return Err(Error::InvalidState {
                        op: "sendReceive",
                        state,
                    });
                }
            }
        };

        if let Err(e) = self
            .enqueue(Envelope::request(id, Some(payload)), "sendReceive")
            .await
        {
            self.lock_shared().correlations.remove(id);
            return Err(e);
        }

        match rx.await {
            Ok(ReplyOutcome::Reply(payload)) => Ok(payload),
            Ok(ReplyOutcome::Lost) | Err(_) => Err(Error::MessageLost),
        }
    }

    /// Current lifecycle state and pid, answered without a worker round trip.
    pub fn get_process_info(&self) -> ProcessInfo {
        let shared = self.lock_shared();
        ProcessInfo {
            state: shared.state,
            pid: shared.pid,
        }
    }

    /// The event router handle, once `init` has run.
    pub fn get_event_emitter(&self) -> Option<Arc<MasterEmitter>> {
        lock_unpoisoned(&self.inner.emitter).clone()
    }

    async fn enqueue(&self, envelope: Envelope, op: &'static str) -> Result<(), Error> {
        enum Outcome {
            Direct(Envelope),
            Buffered,
            Full,
        }

        let outcome = {
            let mut shared = self.lock_shared();
            match shared.state {
                ProcessState::Running => Outcome::Direct(envelope),
                ProcessState::Starting => match shared.buffer.offer(envelope) {
                    Ok(()) => Outcome::Buffered,
                    Err(_rejected) => Outcome::Full,
                },
                state => return Err(Error::InvalidState { op, state }),
            }
        };

        match outcome {
            Outcome::Buffered => Ok(()),
            Outcome::Full => {
                self.inner
                    .events
                    .emit(constants::MESSAGE_BUFFER_FULL, json!({ "op": op }));
                Err(Error::BufferFull)
            }
            Outcome::Direct(envelope) => {
                let mut writer = self.inner.writer.lock().await;
                match writer.as_mut() {
                    Some(writer) => writer.send(envelope).await.map_err(Error::Channel),
                    None => Err(Error::ChannelClosed),
                }
            }
        }
    }

    async fn teardown_after_failure(&self) {
        {
            let mut shared = self.lock_shared();
            let lost = shared.correlations.drain_as_lost();
            shared.lost_messages += lost as u64;
            shared.buffer.clear();
            shared.state = ProcessState::Stopped;
            shared.ready_tx = None;
        }
        *self.inner.writer.lock().await = None;
        if let Some(control) = self.inner.control.lock().await.take() {
            control.terminate().await;
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        lock_unpoisoned(&self.inner.shared)
    }
}

/// Emitter returned by `init`: event registration plus the wrapper surface
/// existing consumers drive the supervisor through.
pub struct MasterEmitter {
    master: Weak<Inner>,
    events: Arc<EventRouter>,
}

impl MasterEmitter {
    /// Register a listener for a named event or one of the fixed lifecycle
    /// channels; replaces any existing registration for that name.
    pub fn on(&self, name: impl Into<String>, handler: impl FnMut(Value) + Send + 'static) {
        self.events.on(name, handler);
    }

    /// Registered channel names, for diagnostics.
    pub fn registered_names(&self) -> Vec<String> {
        self.events.registered_names()
    }

    /// Metadata for the supervised subprocess.
    pub fn get_subprocess(&self) -> Result<ProcessInfo, Error> {
        Ok(self.master()?.get_process_info())
    }

    pub async fn start_child_process(
        &self,
        entry: &str,
        options: StartOptions,
    ) -> Result<AppliedOptions, Error> {
        self.master()?.start(entry, options).await
    }

    pub async fn q_send_internal_message(&self, payload: Value) -> Result<(), Error> {
        self.master()?.send_message(payload).await
    }

    pub async fn q_send_receive_message(&self, payload: Value) -> Result<Option<Value>, Error> {
        self.master()?.send_receive(payload).await
    }

    pub async fn send_receive_message(&self, payload: Value) -> Result<Option<Value>, Error> {
        self.master()?.send_receive(payload).await
    }

    pub async fn send_message(&self, name: &str, payload: Value) -> Result<(), Error> {
        self.master()?.send(name, payload).await
    }

    pub async fn emit_message(&self, payload: Value) -> Result<(), Error> {
        self.master()?.send_message(payload).await
    }

    pub async fn stop_child_process(&self) -> Result<StopResult, Error> {
        self.master()?.stop().await
    }

    fn master(&self) -> Result<MasterProcess, Error> {
        self.master
            .upgrade()
            .map(|inner| MasterProcess { inner })
            .ok_or(Error::MasterDropped)
    }
}

fn applied_pid(inner: &Inner) -> Option<u32> {
    lock_unpoisoned(&inner.shared).pid
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_loop(inner: Arc<Inner>, mut reader: EnvelopeReader) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(envelope) => route_inbound(&inner, envelope),
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode inbound frame");
                inner.events.emit(
                    constants::RECEIVED_INVALID_MESSAGE,
                    json!({ "error": e.to_string() }),
                );
            }
        }
    }
    on_channel_closed(&inner);
    let _ = inner.closed_tx.send(true);
    tracing::debug!("reader loop exiting");
}

fn route_inbound(inner: &Arc<Inner>, envelope: Envelope) {
    match envelope.kind {
        EnvelopeKind::Reply => {
            let resolved = match envelope.correlation_id {
                Some(id) => lock_unpoisoned(&inner.shared)
                    .correlations
                    .resolve(id, envelope.payload.clone()),
                None => false,
            };
            if !resolved {
                tracing::warn!(
                    correlation_id = ?envelope.correlation_id,
                    "reply matched no pending request"
                );
                inner.events.emit(
                    constants::RECEIVED_INVALID_MESSAGE,
                    serde_json::to_value(&envelope).unwrap_or(Value::Null),
                );
            }
        }
        EnvelopeKind::Event => match envelope.name.as_deref() {
            Some(name) if name == constants::WORKER_READY => {
                let ready_tx = lock_unpoisoned(&inner.shared).ready_tx.take();
                match ready_tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(envelope.payload));
                    }
                    None => tracing::warn!("unexpected worker ready event"),
                }
            }
            Some(name) => {
                inner
                    .events
                    .emit(name, envelope.payload.unwrap_or(Value::Null));
            }
            None => {
                inner.events.emit(
                    constants::RECEIVED_INVALID_MESSAGE,
                    serde_json::to_value(&envelope).unwrap_or(Value::Null),
                );
            }
        },
        EnvelopeKind::OneWay => {
            inner.events.emit(
                constants::EMIT_MESSAGE,
                envelope.payload.unwrap_or(Value::Null),
            );
        }
        EnvelopeKind::Request => {
            // The master does not serve requests.
            inner.events.emit(
                constants::RECEIVED_INVALID_MESSAGE,
                serde_json::to_value(&envelope).unwrap_or(Value::Null),
            );
        }
    }
}

fn on_channel_closed(inner: &Arc<Inner>) {
    let unexpected_loss = {
        let mut shared = lock_unpoisoned(&inner.shared);
        match shared.state {
            ProcessState::Stopping | ProcessState::Stopped => None,
            _ => {
                let lost = shared.correlations.drain_as_lost();
                shared.lost_messages += lost as u64;
                shared.buffer.clear();
                shared.crashed = true;
                shared.state = ProcessState::Stopped;
                if let Some(tx) = shared.ready_tx.take() {
                    let _ = tx.send(Err(Error::ChannelClosed));
                }
                Some(lost)
            }
        }
    };

    if let Some(lost) = unexpected_loss {
        tracing::error!(num_lost_messages = lost, "worker channel closed unexpectedly");
        inner.events.emit(
            constants::CRITICAL_ERROR,
            json!({
                "error": "worker channel closed unexpectedly",
                "numLostMessages": lost,
            }),
        );
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Some(control) = inner.control.lock().await.take() {
                control.terminate().await;
            }
            *inner.writer.lock().await = None;
        });
    }
}
