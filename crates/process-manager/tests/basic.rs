//! End-to-end master/worker exchange over an in-process stub worker.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use process_manager::{
    MasterConfig, MasterProcess, ProcessState, StartOptions, buffer_payload_bytes,
};

fn stub_options() -> StartOptions {
    StartOptions {
        startup_info: Some(json!("aa")),
        debug_mode: false,
        spawn_child_process: false,
        ..StartOptions::default()
    }
}

#[tokio::test]
async fn full_exchange_with_stub_worker() {
    let master = MasterProcess::with_config(
        MasterConfig::new().with_worker_factory(common::stub_worker_factory()),
    );

    let one_way_received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&one_way_received);
    let emitter = master
        .init(move |payload| sink.lock().unwrap().push(payload))
        .unwrap();
    let test_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&test_events);
    emitter.on("test", move |payload| sink.lock().unwrap().push(payload));

    let applied = master.q_start("./worker", stub_options()).await.unwrap();
    assert_eq!(applied.startup_info, Some(json!("aa")));
    assert!(!applied.debug_mode);
    assert!(!applied.spawn_child_process);
    assert_eq!(applied.cwd, std::env::current_dir().unwrap());
    assert_eq!(applied.exec_path, std::env::current_exe().unwrap());
    assert_eq!(master.get_process_info().state, ProcessState::Running);

    // Both the generic one-way message and the named `message` event land in
    // the worker's generic handler; each comes back as a `test` event.
    master
        .send_message(json!({ "dataMessage": "from master" }))
        .await
        .unwrap();
    master
        .send("message", json!({ "dataMessage": "noResponse" }))
        .await
        .unwrap();
    // The worker forwards `poke` payloads back as one-way messages.
    master.send("poke", json!({ "poked": true })).await.unwrap();

    let reply = master
        .send_receive(json!({ "dataMessage": "aa" }))
        .await
        .unwrap();
    assert_eq!(
        reply,
        Some(json!({ "arbitraryData": "Arbitrary data from basic_test_slave.js" }))
    );

    let reply = master
        .send_receive(json!({ "dataMessage": "returnUndefined" }))
        .await
        .unwrap();
    assert_eq!(reply, None);

    let reply = master
        .send_receive(json!({ "dataMessage": "returnBuffer" }))
        .await
        .unwrap();
    let bytes = buffer_payload_bytes(&reply.unwrap()).unwrap();
    assert_eq!(bytes, vec![13, 14, 10, 13, 11, 14, 14, 15]);

    let stopped = master.q_stop().await.unwrap();
    assert_eq!(stopped.num_lost_messages, 0);
    assert_eq!(master.get_process_info().state, ProcessState::Stopped);

    assert_eq!(
        test_events.lock().unwrap().as_slice(),
        [json!("Test Data"), json!("Test Data")]
    );
    assert_eq!(
        one_way_received.lock().unwrap().as_slice(),
        [json!({ "poked": true })]
    );
}

#[tokio::test]
async fn emitter_wrapper_drives_the_same_lifecycle() {
    let master = MasterProcess::with_config(
        MasterConfig::new().with_worker_factory(common::stub_worker_factory()),
    );
    let emitter = master.init(|_| {}).unwrap();
    assert_eq!(emitter.get_subprocess().unwrap().state, ProcessState::Idle);

    let applied = emitter
        .start_child_process("./worker", stub_options())
        .await
        .unwrap();
    assert!(!applied.spawn_child_process);
    assert_eq!(emitter.get_subprocess().unwrap().state, ProcessState::Running);

    let reply = emitter.q_send_receive_message(json!("generic")).await.unwrap();
    assert_eq!(reply, Some(json!("generic")));
    let reply = emitter.send_receive_message(json!("")).await.unwrap();
    assert_eq!(reply, Some(json!("")));

    emitter
        .q_send_internal_message(json!("fire and forget"))
        .await
        .unwrap();
    emitter.emit_message(json!("also one way")).await.unwrap();
    emitter.send_message("message", json!("named")).await.unwrap();

    let stopped = emitter.stop_child_process().await.unwrap();
    assert_eq!(stopped.num_lost_messages, 0);
    assert_eq!(emitter.get_subprocess().unwrap().state, ProcessState::Stopped);
}

#[tokio::test]
async fn startup_info_defaults_round_trip() {
    let master = MasterProcess::with_config(
        MasterConfig::new().with_worker_factory(common::stub_worker_factory()),
    );
    master.init(|_| {}).unwrap();

    // No explicit startup info: defaults still resolve and echo back.
    let options = StartOptions {
        spawn_child_process: false,
        ..StartOptions::default()
    };
    let applied = master.q_start("./worker", options).await.unwrap();
    assert_eq!(applied.startup_info, None);
    assert_eq!(applied.cwd, std::env::current_dir().unwrap());

    master.q_stop().await.unwrap();
}
