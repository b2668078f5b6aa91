use std::net::SocketAddr;
use std::time::Duration;

use binder_common::log::{Level, LogRecord};
use binder_common::storage::StateDir;
use binder_logd::protocol::{ModuleResponse, LOG_READER, LOG_WRITER};
use binder_logd::reader::LogReader;
use binder_logd::stream::{broker_request, fetch_logs};
use binder_logd::writer::LogWriter;
use binder_logd::{broker, module, AppLogStreamer, LogClient, Publisher};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;

struct Daemon {
    broker: SocketAddr,
    pubsub: SocketAddr,
    _state: tempfile::TempDir,
}

async fn start_daemon() -> Daemon {
    let state = tempfile::tempdir().unwrap();
    let dirs = StateDir::new(state.path());

    let broker_port = portpicker::pick_unused_port().unwrap();
    let pubsub_port = portpicker::pick_unused_port().unwrap();
    let broker_addr: SocketAddr = format!("127.0.0.1:{broker_port}").parse().unwrap();
    let pubsub_addr: SocketAddr = format!("127.0.0.1:{pubsub_port}").parse().unwrap();

    let broker_listener = TcpListener::bind(broker_addr).await.unwrap();
    let pubsub_listener = TcpListener::bind(pubsub_addr).await.unwrap();

    let publisher = Publisher::default();
    tokio::spawn(broker::serve(broker_listener));
    tokio::spawn(publisher.clone().serve(pubsub_listener));

    let writer = LogWriter::new(dirs.clone(), publisher).await.unwrap();
    tokio::spawn(module::serve(broker_addr, writer));
    tokio::spawn(module::serve(broker_addr, LogReader::new(dirs)));

    // Wait for both modules to register
    for service in [LOG_WRITER, LOG_READER] {
        for _ in 0..50 {
            let reply = broker_request(broker_addr, service, json!({"type": "noop"})).await;
            if let Ok(body) = reply {
                let response: ModuleResponse = serde_json::from_value(body).unwrap();
                let ModuleResponse::Error { msg } = response else {
                    panic!("noop should not succeed");
                };
                if !msg.starts_with("no worker registered") {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Daemon {
        broker: broker_addr,
        pubsub: pubsub_addr,
        _state: state,
    }
}

#[tokio::test]
async fn log_records_are_readable_back() {
    let daemon = start_daemon().await;
    let client = LogClient::connect(daemon.broker);

    client.info("builder", "cloning repository", Some("acme-demo"));
    client.error("builder", "push failed", Some("acme-demo"));
    client.flush().await;

    let logs = fetch_logs(daemon.broker, "acme-demo", None, false)
        .await
        .unwrap();
    let lines: Vec<&str> = logs.lines().collect();

    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("INFO: - builder: cloning repository"));
    assert!(lines[1].ends_with("ERROR: - builder: push failed"));
}

#[tokio::test]
async fn file_only_records_stay_out_of_the_filtered_view() {
    let daemon = start_daemon().await;
    let client = LogClient::connect(daemon.broker);

    client.info("builder", "public line", Some("acme-demo"));
    client.record(
        LogRecord::new(Level::Info, "builder", "builder chatter")
            .for_app("acme-demo")
            .file_only(),
    );
    client.flush().await;

    let raw = fetch_logs(daemon.broker, "acme-demo", None, false)
        .await
        .unwrap();
    assert!(raw.contains("builder chatter"));

    let filtered = fetch_logs(daemon.broker, "acme-demo", None, true)
        .await
        .unwrap();
    assert!(filtered.contains("public line"));
    assert!(!filtered.contains("builder chatter"));
}

#[tokio::test]
async fn streamer_yields_history_then_live() {
    let daemon = start_daemon().await;
    let client = LogClient::connect(daemon.broker);

    client.info("builder", "from history", Some("acme-demo"));
    client.flush().await;
    // The live gate is strictly-greater on the line timestamp
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut stream = AppLogStreamer::new(daemon.broker, daemon.pubsub, "acme-demo")
        .stream()
        .await
        .unwrap();

    let first = stream.next().await.unwrap();
    assert!(first.ends_with("builder: from history"));

    client.info("builder", "from the live feed", Some("acme-demo"));
    client.info("builder", "other app", Some("other-app"));
    client.flush().await;

    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(second.ends_with("builder: from the live feed"));
}

#[tokio::test]
async fn unknown_service_requests_get_an_error_reply() {
    let daemon = start_daemon().await;

    let body = broker_request(daemon.broker, "nonexistent", json!({"type": "log"}))
        .await
        .unwrap();
    let response: ModuleResponse = serde_json::from_value(body).unwrap();

    assert_eq!(
        response,
        ModuleResponse::error("no worker registered for nonexistent")
    );
}
