//! The same exchange against a real spawned worker subprocess.
//!
//! Uses the `echo_worker` binary built alongside the tests; the channel is
//! the child's framed stdin/stdout and startup options travel through the
//! environment.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;

use process_manager::{
    Error, MasterProcess, ProcessState, StartOptions, buffer_payload_bytes,
};

fn worker_options() -> StartOptions {
    StartOptions {
        startup_info: Some(json!({ "run": "spawned" })),
        exec_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_echo_worker"))),
        ..StartOptions::default()
    }
}

#[tokio::test]
async fn full_exchange_with_spawned_worker() {
    let master = MasterProcess::new();

    let test_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&test_events);
    let emitter = master.init(|_| {}).unwrap();
    emitter.on("test", move |payload| sink.lock().unwrap().push(payload));

    let applied = master
        .q_start("spawned-worker", worker_options())
        .await
        .unwrap();
    assert!(applied.spawn_child_process);
    assert_eq!(applied.startup_info, Some(json!({ "run": "spawned" })));

    let info = master.get_process_info();
    assert_eq!(info.state, ProcessState::Running);
    assert!(info.pid.is_some());

    master.send_message(json!("ping")).await.unwrap();

    let reply = master
        .send_receive(json!({ "dataMessage": "aa" }))
        .await
        .unwrap();
    assert_eq!(
        reply,
        Some(json!({ "arbitraryData": "Arbitrary data from basic_test_slave.js" }))
    );

    let reply = master
        .send_receive(json!({ "dataMessage": "returnBuffer" }))
        .await
        .unwrap();
    let bytes = buffer_payload_bytes(&reply.unwrap()).unwrap();
    assert_eq!(bytes, vec![13, 14, 10, 13, 11, 14, 14, 15]);

    let reply = master
        .send_receive(json!({ "dataMessage": "returnUndefined" }))
        .await
        .unwrap();
    assert_eq!(reply, None);

    let stopped = master.q_stop().await.unwrap();
    assert_eq!(stopped.num_lost_messages, 0);
    assert_eq!(master.get_process_info().state, ProcessState::Stopped);

    assert_eq!(test_events.lock().unwrap().as_slice(), [json!("Test Data")]);
}

#[tokio::test]
async fn spawn_failure_stops_the_lifecycle() {
    let master = MasterProcess::new();
    master.init(|_| {}).unwrap();

    let options = StartOptions {
        exec_path: Some(PathBuf::from("/nonexistent/worker-binary")),
        ..StartOptions::default()
    };
    assert!(matches!(
        master.q_start("worker", options).await,
        Err(Error::Spawn(_))
    ));
    assert_eq!(master.get_process_info().state, ProcessState::Stopped);
}
