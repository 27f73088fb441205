//! Worker binary used by the spawned-subprocess integration tests.
//!
//! Serves a small fixed request/reply vocabulary and echoes one-way messages
//! back as a `test` event.

use anyhow::Result;
use futures::FutureExt;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use process_manager::{SlaveListener, SlaveProcess, buffer_payload, constants};

fn answer(payload: Value) -> Option<Value> {
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

#[tokio::main]
async fn main() -> Result<()> {
    let mut slave = SlaveProcess::from_stdio()?;
    let startup = slave.get_slave_process_info();

    // Stdout is the wire; diagnostics go to stderr.
    let level = if startup.debug_mode { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with_writer(std::io::stderr)
        .init();

    let emitter = slave.init(SlaveListener::deferred(|payload| {
        async move { answer(payload) }.boxed()
    }))?;

    let echo = emitter.clone();
    emitter.on(constants::MESSAGE, move |_| {
        if let Err(e) = echo.send("test", json!("Test Data")) {
            tracing::warn!(error = %e, "failed to echo test event");
        }
    });

    slave.finished_init(serde_json::to_value(&startup)?).await?;
    tracing::debug!("worker ready, serving");

    slave.closed().await;
    Ok(())
}
