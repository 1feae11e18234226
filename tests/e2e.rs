//! Black-box HTTP/WS scenarios driven over real sockets against a daemon
//! spawned in-process, covering the end-to-end scenarios from the crate's
//! behavioral spec (S1-S6).

mod common;

use std::time::Duration;

use common::{client, TestDaemon};
use serde_json::{json, Value};

async fn create_session(base: &str, name: &str) -> Value {
    let resp = client()
        .post(format!("{base}/sessions"))
        .json(&json!({"name": name, "shell": "/bin/sh"}))
        .send()
        .await
        .expect("create session request");
    assert!(resp.status().is_success(), "create_session failed: {}", resp.status());
    resp.json().await.expect("create session body")
}

fn session_url(created: &Value, path: &str) -> String {
    let port = created["port"].as_u64().expect("port in create response");
    format!("http://127.0.0.1:{port}{path}")
}

#[tokio::test]
async fn s1_echo_roundtrips_through_out() {
    let daemon = TestDaemon::spawn().await;
    let created = create_session(&daemon.base_url, "proj-a").await;

    client()
        .post(session_url(&created, "/in"))
        .body("echo hello")
        .send()
        .await
        .expect("write stdin");

    let mut seen = String::new();
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let body: Value = client()
            .get(session_url(&created, "/out"))
            .send()
            .await
            .expect("get out")
            .json()
            .await
            .expect("out body");
        seen = body["output"].as_str().unwrap_or_default().to_string();
        if seen.contains("hello") {
            break;
        }
    }
    assert!(seen.contains("hello"), "expected /out to contain echoed text, got: {seen}");
}

#[tokio::test]
async fn s2_run_exit_code_is_reported() {
    let daemon = TestDaemon::spawn().await;
    let created = create_session(&daemon.base_url, "proj-b").await;

    let outcome: Value = client()
        .post(session_url(&created, "/run"))
        .json(&json!({"command": "exit 7"}))
        .send()
        .await
        .expect("run request")
        .json()
        .await
        .expect("run body");

    assert_eq!(outcome["status"], "completed");
    assert_eq!(outcome["exit_code"], 7);
}

#[tokio::test]
async fn s3_timeout_then_interrupt_unlocks_run() {
    let daemon = TestDaemon::spawn().await;
    let created = create_session(&daemon.base_url, "proj-c").await;

    let outcome: Value = client()
        .post(session_url(&created, "/run"))
        .json(&json!({"command": "sleep 30", "timeout": 1}))
        .send()
        .await
        .expect("run request")
        .json()
        .await
        .expect("run body");
    assert_eq!(outcome["status"], "timeout");

    client()
        .post(session_url(&created, "/interrupt"))
        .send()
        .await
        .expect("interrupt request");

    let mut unlocked = false;
    for _ in 0..10 {
        let status: Value = client()
            .get(session_url(&created, "/status"))
            .send()
            .await
            .expect("status request")
            .json()
            .await
            .expect("status body");
        if status["run_locked"] == false {
            unlocked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(unlocked, "expected run_locked to clear within 1s of interrupting");
}

#[tokio::test]
async fn s4_oversized_output_reports_buffer_overflow_and_stays_alive() {
    let daemon = TestDaemon::spawn().await;
    let created = create_session(&daemon.base_url, "proj-d").await;

    let outcome: Value = client()
        .post(session_url(&created, "/run"))
        .json(&json!({"command": "yes | head -c 6000000", "timeout": 10}))
        .send()
        .await
        .expect("run request")
        .json()
        .await
        .expect("run body");
    assert_eq!(outcome["status"], "error");

    let status: Value = client()
        .get(session_url(&created, "/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status body");
    assert_eq!(status["alive"], true);
}

#[tokio::test]
async fn s5_concurrent_runs_yield_one_completed_and_one_busy() {
    let daemon = TestDaemon::spawn().await;
    let created = create_session(&daemon.base_url, "proj-e").await;
    let url = session_url(&created, "/run");

    let first = client().post(&url).json(&json!({"command": "sleep 1"}));
    let second = client().post(&url).json(&json!({"command": "echo racing"}));

    let (a, b) = tokio::join!(first.send(), second.send());
    let a: Value = a.expect("first run request").json().await.expect("first run body");
    let b: Value = b.expect("second run request").json().await.expect("second run body");

    let statuses: Vec<&str> = [a["status"].as_str().unwrap(), b["status"].as_str().unwrap()].into();
    assert!(statuses.contains(&"busy"), "expected one busy outcome, got {statuses:?}");
    assert!(
        statuses.contains(&"completed") || statuses.contains(&"timeout"),
        "expected the other run to finish, got {statuses:?}"
    );
}

#[tokio::test]
async fn ws_load_history_echoes_start_offset() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let daemon = TestDaemon::spawn().await;
    let created = create_session(&daemon.base_url, "proj-ws").await;
    let port = created["port"].as_u64().unwrap();

    client()
        .post(session_url(&created, "/in"))
        .body("echo from-ws")
        .send()
        .await
        .expect("write stdin");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("connect ws");
    ws.send(Message::Text(r#"{"event":"load_history"}"#.to_string().into()))
        .await
        .expect("send load_history");

    let reply = ws.next().await.expect("ws closed unexpectedly").expect("ws read error");
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    let frame: Value = serde_json::from_str(&text).expect("parse history frame");
    assert_eq!(frame["event"], "history");
    assert!(frame.get("start_offset").is_some(), "history frame must carry start_offset");
    assert!(frame["data"].as_str().unwrap_or_default().contains("from-ws"));
}

#[tokio::test]
async fn s6_resurrect_restores_sessions_from_manifest_after_restart() {
    let daemon = TestDaemon::spawn().await;
    create_session(&daemon.base_url, "alpha").await;

    // Simulate restarting the daemon process: a fresh `Daemon` whose registry
    // starts empty, pointed at the same data dir so `sessions.json` survives.
    let restarted = daemon.spawn_restart().await;

    let resp: Value = client()
        .post(format!("{}/resurrect", restarted.base_url))
        .send()
        .await
        .expect("resurrect request")
        .json()
        .await
        .expect("resurrect body");
    assert!(!resp["restored"].as_array().unwrap().is_empty());
    assert!(resp["failed"].as_array().unwrap().is_empty());

    let sessions: Value = client()
        .get(format!("{}/sessions", restarted.base_url))
        .send()
        .await
        .expect("list sessions")
        .json()
        .await
        .expect("sessions body");
    let names: Vec<&str> = sessions
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"alpha"));
}
