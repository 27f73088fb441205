//! Worker-side runtime.
//!
//! A worker attaches to the channel its master opened (framed stdin/stdout
//! for spawned processes, a duplex pair for in-process stubs), registers one
//! listener for round-trip requests, and reports ready via
//! [`finished_init`](SlaveProcess::finished_init). A single loop serializes
//! everything on the worker side: inbound handling (including awaiting
//! deferred listener results) and outbound writes never interleave.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Envelope, EnvelopeKind};
use crate::bridge::transport::{
    AppliedOptions, BoxedRead, BoxedWrite, EnvelopeReader, EnvelopeWriter, startup_info_from_env,
};
use crate::constants;
use crate::error::Error;
use crate::events::EventRouter;

/// Handler for round-trip requests. The returned value becomes the reply
/// payload; `None` replies with no value.
pub enum SlaveListener {
    /// Computes the reply synchronously.
    Immediate(Box<dyn FnMut(Value) -> Option<Value> + Send>),
    /// Computes the reply asynchronously; the reply is sent once the future
    /// resolves. Requests are still handled one at a time.
    Deferred(Box<dyn FnMut(Value) -> BoxFuture<'static, Option<Value>> + Send>),
}

impl SlaveListener {
    pub fn immediate(f: impl FnMut(Value) -> Option<Value> + Send + 'static) -> Self {
        Self::Immediate(Box::new(f))
    }

    pub fn deferred(
        f: impl FnMut(Value) -> BoxFuture<'static, Option<Value>> + Send + 'static,
    ) -> Self {
        Self::Deferred(Box::new(f))
    }
}

struct Outbound {
    envelope: Envelope,
    /// Resolved once the envelope has been written to the channel.
    ack: Option<oneshot::Sender<()>>,
}

/// The worker end of one master/worker pairing.
pub struct SlaveProcess {
    startup: AppliedOptions,
    io: Option<(EnvelopeReader, EnvelopeWriter)>,
    events: Arc<EventRouter>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    closed_tx: watch::Sender<bool>,
}

impl SlaveProcess {
    /// Attach to the channel of a spawned worker process: framed stdin as
    /// inbound, framed stdout as outbound, startup options from the
    /// environment.
    ///
    /// Anything else the worker prints must go to stderr; stdout is the wire.
    pub fn from_stdio() -> Result<Self, Error> {
        let startup = startup_info_from_env()?;
        let reader = FramedRead::new(
            Box::new(tokio::io::stdin()) as BoxedRead,
            JsonCodec::new(),
        );
        let writer = FramedWrite::new(
            Box::new(tokio::io::stdout()) as BoxedWrite,
            JsonCodec::new(),
        );
        Ok(Self::from_parts(reader, writer, startup))
    }

    /// Attach to the worker end of an in-process duplex channel (the
    /// [`WorkerFactory`](crate::bridge::transport::WorkerFactory) path).
    pub fn attach(io: DuplexStream, startup: AppliedOptions) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(Box::new(read_half) as BoxedRead, JsonCodec::new());
        let writer = FramedWrite::new(Box::new(write_half) as BoxedWrite, JsonCodec::new());
        Self::from_parts(reader, writer, startup)
    }

    fn from_parts(
        reader: EnvelopeReader,
        writer: EnvelopeWriter,
        startup: AppliedOptions,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        Self {
            startup,
            io: Some((reader, writer)),
            events: Arc::new(EventRouter::new()),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            closed_tx,
        }
    }

    /// The startup options the master applied when spawning this worker.
    pub fn get_slave_process_info(&self) -> AppliedOptions {
        self.startup.clone()
    }

    /// Install the request listener and start serving the channel.
    /// Fails if called twice.
    pub fn init(&mut self, listener: SlaveListener) -> Result<Arc<SlaveEmitter>, Error> {
        let (reader, writer) = self.io.take().ok_or(Error::AlreadyInitialized)?;
        let outbound_rx = self.outbound_rx.take().ok_or(Error::AlreadyInitialized)?;

        let emitter = Arc::new(SlaveEmitter {
            events: Arc::clone(&self.events),
            outbound_tx: self.outbound_tx.clone(),
        });

        let events = Arc::clone(&self.events);
        let closed_tx = self.closed_tx.clone();
        tokio::spawn(run_loop(
            events, listener, reader, writer, outbound_rx, closed_tx,
        ));
        Ok(emitter)
    }

    /// Report ready to the master, handing it `info` as the ready payload.
    /// Resolves once the ready event has been written to the channel.
    pub async fn finished_init(&self, info: Value) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound {
                envelope: Envelope::event(constants::WORKER_READY, Some(info)),
                ack: Some(ack_tx),
            })
            .map_err(|_| Error::ChannelClosed)?;
        ack_rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Resolves when the channel has closed: the master sent its stop signal
    /// or the channel dropped.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives on self, so wait_for only fails if the run loop
        // was never started; treat that as already closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Handle for named-event registration and worker-initiated sends.
pub struct SlaveEmitter {
    events: Arc<EventRouter>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl SlaveEmitter {
    /// Register a listener for a named event (or the generic message channel
    /// via [`constants::MESSAGE`]); replaces any existing registration.
    pub fn on(&self, name: impl Into<String>, handler: impl FnMut(Value) + Send + 'static) {
        self.events.on(name, handler);
    }

    /// Queue a named event for the master. Accepted immediately; the run
    /// loop writes it after the in-flight inbound handling completes.
    pub fn send(&self, name: &str, payload: Value) -> Result<(), Error> {
        self.outbound_tx
            .send(Outbound {
                envelope: Envelope::event(name, Some(payload)),
                ack: None,
            })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Queue a generic one-way message for the master, delivered to its
    /// default receiver.
    pub fn emit_message(&self, payload: Value) -> Result<(), Error> {
        self.outbound_tx
            .send(Outbound {
                envelope: Envelope::one_way(Some(payload)),
                ack: None,
            })
            .map_err(|_| Error::ChannelClosed)
    }
}

async fn run_loop(
    events: Arc<EventRouter>,
    mut listener: SlaveListener,
    mut reader: EnvelopeReader,
    mut writer: EnvelopeWriter,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    closed_tx: watch::Sender<bool>,
) {
    let mut outbound_open = true;
    loop {
        tokio::select! {
            biased;
            outbound = outbound_rx.recv(), if outbound_open => {
                match outbound {
                    Some(Outbound { envelope, ack }) => {
                        if let Err(e) = writer.send(envelope).await {
                            tracing::warn!(error = %e, "failed to write outbound envelope");
                            break;
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    None => outbound_open = false,
                }
            }
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(envelope)) => {
                        if !handle_inbound(&events, &mut listener, &mut writer, envelope).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "failed to decode inbound frame");
                    }
                    None => {
                        tracing::debug!("master channel closed");
                        break;
                    }
                }
            }
        }
    }
    let _ = closed_tx.send(true);
}

/// Returns false when the loop should stop serving.
async fn handle_inbound(
    events: &EventRouter,
    listener: &mut SlaveListener,
    writer: &mut EnvelopeWriter,
    envelope: Envelope,
) -> bool {
    match (envelope.kind, envelope.correlation_id) {
        (EnvelopeKind::Request, Some(id)) => {
            let payload = envelope.payload.unwrap_or(Value::Null);
            let result = match listener {
                SlaveListener::Immediate(f) => f(payload),
                SlaveListener::Deferred(f) => f(payload).await,
            };
            if let Err(e) = writer.send(Envelope::reply(id, result)).await {
                tracing::warn!(error = %e, "failed to write reply");
                return false;
            }
            true
        }
        (EnvelopeKind::Request, None) => {
            tracing::warn!("request without a correlation id, dropping");
            true
        }
        (EnvelopeKind::Event, _) => match envelope.name.as_deref() {
            Some(name) if name == constants::STOP_WORKER => {
                tracing::debug!("stop signal received");
                false
            }
            Some(name) => {
                events.emit(name, envelope.payload.unwrap_or(Value::Null));
                true
            }
            None => {
                tracing::warn!("event without a name, dropping");
                true
            }
        },
        (EnvelopeKind::OneWay, _) => {
            events.emit(constants::MESSAGE, envelope.payload.unwrap_or(Value::Null));
            true
        }
        (EnvelopeKind::Reply, _) => {
            tracing::warn!("unexpected reply envelope at worker, dropping");
            true
        }
    }
}
