#![allow(dead_code)]

//! Stub worker factories shared by the integration tests.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Value, json};
use tokio::io::DuplexStream;

use process_manager::bridge::transport::AppliedOptions;
use process_manager::{SlaveListener, SlaveProcess, WorkerFactory, buffer_payload, constants};

/// The fixed request/reply vocabulary also served by the worker binary.
pub fn answer(payload: Value) -> Option<Value> {
    if payload == json!("") {
        return Some(json!(""));
    }
    if payload == json!("generic") {
        return Some(json!("generic"));
    }
    match payload.get("dataMessage").and_then(Value::as_str) {
        Some("returnUndefined") => None,
        Some("returnBuffer") => Some(buffer_payload(&[13, 14, 10, 13, 11, 14, 14, 15])),
        _ => Some(json!({ "arbitraryData": "Arbitrary data from basic_test_slave.js" })),
    }
}

/// In-process worker with the standard vocabulary: answers requests via
/// [`answer`], echoes any generic message back as a `test` event, and
/// forwards `poke` events back as one-way messages.
pub fn stub_worker_factory() -> WorkerFactory {
    Arc::new(|io: DuplexStream, startup: AppliedOptions| {
        tokio::spawn(async move {
            let mut slave = SlaveProcess::attach(io, startup);
            let startup = slave.get_slave_process_info();
            let emitter = slave
                .init(SlaveListener::deferred(|payload| {
                    async move { answer(payload) }.boxed()
                }))
                .expect("init stub worker");

            let echo = emitter.clone();
            emitter.on(constants::MESSAGE, move |_| {
                echo.send("test", json!("Test Data")).expect("echo test event");
            });
            let back = emitter.clone();
            emitter.on("poke", move |payload| {
                back.emit_message(payload).expect("forward poke");
            });

            slave
                .finished_init(serde_json::to_value(&startup).expect("encode startup"))
                .await
                .expect("report ready");
            slave.closed().await;
        });
    })
}

/// In-process worker that replies to every request with its own payload.
pub fn echoing_worker_factory() -> WorkerFactory {
    Arc::new(|io: DuplexStream, startup: AppliedOptions| {
        tokio::spawn(async move {
            let mut slave = SlaveProcess::attach(io, startup);
            slave
                .init(SlaveListener::immediate(Some))
                .expect("init echoing worker");
            slave
                .finished_init(Value::Null)
                .await
                .expect("report ready");
            slave.closed().await;
        });
    })
}
