//! Management HTTP server: the single well-known port clients use to create,
//! list, and control sessions by port or name.
//!
//! Grounded in the teacher's `routes/sessions.rs` REST handler style (one
//! function per route, `Json<T>` bodies, `SilcResult` responses) and
//! `main.rs`'s router-assembly pattern, restructured around the registry
//! instead of the teacher's single `SessionManager` map.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::daemon::{CreateRequest, CreateResponse, Daemon};
use crate::error::{SilcError, SilcResult};

pub async fn serve(daemon: Arc<Daemon>, listener: TcpListener) {
    let router = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/resolve/{name}", get(resolve))
        .route("/sessions/{port}/close", post(close_session))
        .route("/sessions/{port}/kill", post(kill_session))
        .route("/sessions/{port}/restart", post(restart_session))
        .route("/shutdown", post(shutdown))
        .route("/killall", post(killall))
        .route("/restart-server", post(restart_server))
        .route("/resurrect", post(resurrect))
        .with_state(daemon);

    let app = router.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "management server exited");
    }
}

#[derive(Deserialize)]
struct CreateBody {
    port: Option<u16>,
    name: Option<String>,
    #[serde(default)]
    is_global: bool,
    token: Option<String>,
    shell: Option<String>,
    cwd: Option<String>,
}

async fn create_session(
    State(daemon): State<Arc<Daemon>>,
    Json(body): Json<CreateBody>,
) -> SilcResult<Json<CreateResponse>> {
    let resp = daemon
        .create_session(CreateRequest {
            port: body.port,
            name: body.name,
            is_global: body.is_global,
            token: body.token,
            shell: body.shell,
            cwd: body.cwd,
        })
        .await?;
    Ok(Json(resp))
}

#[derive(Serialize)]
struct SessionSummary {
    port: u16,
    name: String,
    session_id: String,
    shell: String,
    cwd: String,
    idle_seconds: u64,
    alive: bool,
}

async fn summarize(session: &crate::session::Session) -> SessionSummary {
    SessionSummary {
        port: session.port,
        name: session.name.clone(),
        session_id: session.session_id.clone(),
        shell: session.shell_kind.to_string(),
        cwd: session.cwd.clone(),
        idle_seconds: session.idle_seconds(),
        alive: session.is_alive().await,
    }
}

async fn list_sessions(State(daemon): State<Arc<Daemon>>) -> Json<Vec<SessionSummary>> {
    let sessions = daemon.registry.list_sorted_by_port().await;
    let mut out = Vec::with_capacity(sessions.len());
    for session in sessions {
        out.push(summarize(&session).await);
    }
    Json(out)
}

async fn resolve(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> SilcResult<Json<SessionSummary>> {
    let session = daemon.registry.resolve(&name).await.ok_or(SilcError::NotFound)?;
    Ok(Json(summarize(&session).await))
}

async fn close_session(State(daemon): State<Arc<Daemon>>, Path(port): Path<u16>) -> SilcResult<Json<serde_json::Value>> {
    daemon.close_session(port).await?;
    Ok(Json(json!({"ok": true})))
}

async fn kill_session(State(daemon): State<Arc<Daemon>>, Path(port): Path<u16>) -> SilcResult<Json<serde_json::Value>> {
    daemon.kill_session(port).await?;
    Ok(Json(json!({"ok": true})))
}

async fn restart_session(State(daemon): State<Arc<Daemon>>, Path(port): Path<u16>) -> SilcResult<Json<CreateResponse>> {
    let resp = daemon.restart_session(port).await?;
    Ok(Json(resp))
}

/// Graceful shutdown of the whole daemon, triggered remotely. Spawns the
/// actual teardown so the HTTP response can be sent before the process
/// starts tearing down its own listeners.
async fn shutdown(State(daemon): State<Arc<Daemon>>) -> Json<serde_json::Value> {
    info!("shutdown requested via management api");
    let d = daemon.clone();
    tokio::spawn(async move {
        d.shutdown(Duration::from_secs(30)).await;
        std::process::exit(0);
    });
    Json(json!({"ok": true}))
}

async fn killall(State(daemon): State<Arc<Daemon>>) -> Json<serde_json::Value> {
    let ports: Vec<u16> = daemon.registry.list_sorted_by_port().await.iter().map(|s| s.port).collect();
    for port in ports {
        let _ = daemon.kill_session(port).await;
    }
    Json(json!({"ok": true}))
}

/// Rebind the management HTTP listener only — every session keeps its own
/// endpoint and is untouched. Used to pick up a changed management port
/// without disrupting anyone's live shell.
async fn restart_server(State(daemon): State<Arc<Daemon>>) -> Json<serde_json::Value> {
    info!("management endpoint rebind requested via management api");
    daemon.request_management_restart();
    Json(json!({"ok": true}))
}

async fn resurrect(State(daemon): State<Arc<Daemon>>) -> Json<serde_json::Value> {
    let (restored, failed) = daemon.resurrect().await;
    Json(json!({
        "restored": restored,
        "failed": failed.into_iter().map(|(name, reason)| json!({"name": name, "reason": reason})).collect::<Vec<_>>(),
    }))
}
