//! Per-session HTTP + WebSocket server.
//!
//! One of these listens on each session's own port, the same "every session
//! is its own tiny server" shape the teacher uses for the single shared
//! `sctl` router in `main.rs`, just instantiated once per `Session` instead
//! of once per process. Routes mirror the REST surface the management server
//! exposes for the registry as a whole, scoped here to one session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::middleware;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::auth::{self, ExpectedToken};
use crate::daemon::Daemon;
use crate::error::{SilcError, SilcResult};
use crate::session::{RunOutcome, Session};
use crate::shell::pty::PtySignal;

#[derive(Clone)]
struct EndpointState {
    daemon: Arc<Daemon>,
    session: Arc<Session>,
}

pub async fn serve(daemon: Arc<Daemon>, session: Arc<Session>, listener: TcpListener) {
    let token = session.api_token.clone();
    let state = EndpointState { daemon, session: session.clone() };

    let router = Router::new()
        .route("/status", get(status))
        .route("/out", get(out))
        .route("/raw", get(raw))
        .route("/logs", get(logs))
        .route("/stream", get(stream))
        .route("/in", post(write_in))
        .route("/run", post(run))
        .route("/interrupt", post(interrupt))
        .route("/clear", post(clear))
        .route("/reset", post(reset))
        .route("/resize", post(resize))
        .route("/sigterm", post(sigterm))
        .route("/sigkill", post(sigkill))
        .route("/token", get(token_info))
        .route("/web", get(web_ui))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn(auth::require_token))
        .layer(axum::Extension(ExpectedToken(token)))
        .with_state(state);

    let app = router.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(err) = axum::serve(listener, app).await {
        warn!(port = session.port, error = %err, "session endpoint exited");
    }
}

#[derive(Serialize)]
struct StatusResponse {
    session_id: String,
    name: String,
    port: u16,
    alive: bool,
    idle_seconds: u64,
    waiting_for_input: bool,
    last_line: String,
    run_locked: bool,
}

async fn status(State(state): State<EndpointState>) -> SilcResult<Json<StatusResponse>> {
    let s = &state.session;
    require_alive(s).await?;
    let run_locked = s.run_locked().await;
    let tail = s.buffer.tail(1).await;
    let last_line = crate::cleaner::clean(&tail).trim_end().to_string();
    Ok(Json(StatusResponse {
        session_id: s.session_id.clone(),
        name: s.name.clone(),
        port: s.port,
        alive: true,
        idle_seconds: s.idle_seconds(),
        waiting_for_input: !run_locked,
        last_line,
        run_locked,
    }))
}

#[derive(Deserialize)]
struct LinesQuery {
    lines: Option<usize>,
}

#[derive(Deserialize)]
struct OutQuery {
    lines: Option<usize>,
    #[serde(default)]
    raw: bool,
}

#[derive(Serialize)]
struct OutResponse {
    output: String,
    lines: usize,
}

/// Renders through the VT100 grid by default, so in-place redraws (prompts,
/// progress bars) collapse to their final state instead of replaying every
/// intermediate frame. `?raw=true` instead returns the cleaned,
/// sentinel-stripped text with no grid emulation — the fallback for callers
/// that want a plain scrollback rather than a rendered screen.
async fn out(State(state): State<EndpointState>, Query(q): Query<OutQuery>) -> Json<OutResponse> {
    state.session.touch();
    let n = q.lines.unwrap_or(200);
    let raw = state.session.buffer.tail(n).await;

    let output = if q.raw {
        crate::cleaner::clean(&raw)
    } else {
        let (rows, cols) = state.session.screen_size();
        let mut renderer = crate::renderer::Renderer::new(rows, cols);
        renderer.feed(&raw);
        renderer.render_text()
    };
    let lines = output.lines().count();
    Json(OutResponse { output, lines })
}

/// Unfiltered bytes, UTF-8 decoded with replacement — ANSI escapes are left
/// intact since a real terminal client reading this endpoint directly needs
/// them.
async fn raw(State(state): State<EndpointState>, Query(q): Query<LinesQuery>) -> Json<OutResponse> {
    state.session.touch();
    let n = q.lines.unwrap_or(200);
    let bytes = state.session.buffer.tail(n).await;
    let output = String::from_utf8_lossy(&bytes).into_owned();
    let lines = output.lines().count();
    Json(OutResponse { output, lines })
}

#[derive(Deserialize)]
struct TailQuery {
    tail: Option<usize>,
}

/// Tail of the on-disk per-session log, distinct from `/out`/`/raw` which
/// read the in-memory ring buffer.
async fn logs(State(state): State<EndpointState>, Query(q): Query<TailQuery>) -> Json<OutResponse> {
    let n = q.tail.unwrap_or(200);
    let output = state.session.log_tail(n).await;
    let lines = output.lines().count();
    Json(OutResponse { output, lines })
}

/// Server-sent events: one `data:` frame per poll tick carrying newly
/// appended bytes, grounded in the teacher's `DropCounterStream`/keep-alive
/// SSE pattern (`routes/events.rs`) but driven off the ring buffer's
/// `Notify` instead of a broadcast channel. Starts at the cursor current at
/// subscribe time, not at the start of the buffer.
async fn stream(State(state): State<EndpointState>) -> impl IntoResponse {
    use axum::response::sse::{Event, KeepAlive, Sse};
    use futures_util::stream;

    let session = state.session.clone();
    let notifier = session.buffer.notifier();
    let cursor0 = session.buffer.cursor().await;

    let event_stream = stream::unfold((session, cursor0), move |(session, cursor)| {
        let notifier = notifier.clone();
        async move {
            loop {
                let (bytes, new_cursor) = session.buffer.since(cursor).await;
                if !bytes.is_empty() {
                    let text = crate::cleaner::clean(&bytes);
                    let event = Event::default().data(text);
                    return Some((Ok::<_, std::convert::Infallible>(event), (session, new_cursor)));
                }
                if !session.is_alive().await {
                    return None;
                }
                tokio::select! {
                    _ = notifier.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(15)) => {}
                }
            }
        }
    });

    Sse::new(event_stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct InQuery {
    #[serde(default)]
    nonewline: bool,
}

async fn write_in(
    State(state): State<EndpointState>,
    Query(q): Query<InQuery>,
    body: String,
) -> SilcResult<impl IntoResponse> {
    require_alive(&state.session).await?;
    state.session.write(&body, !q.nonewline).await;
    Ok(Json(json!({"ok": true})))
}

async fn require_alive(session: &Session) -> SilcResult<()> {
    if session.is_alive().await {
        Ok(())
    } else {
        Err(SilcError::Gone)
    }
}

#[derive(Deserialize)]
struct RunBody {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

/// Accepts either a JSON `{command, timeout?}` body or a plain-text command
/// with no explicit timeout, per the same "JSON if it parses, raw text
/// otherwise" convention the teacher's `routes/sessions.rs` uses for
/// `/run`.
async fn run(State(state): State<EndpointState>, body: String) -> SilcResult<Json<RunOutcome>> {
    require_alive(&state.session).await?;
    let (command, timeout_secs) = match serde_json::from_str::<RunBody>(&body) {
        Ok(parsed) => (parsed.command, parsed.timeout),
        Err(_) => (body.trim_end_matches('\n').to_string(), None),
    };
    let timeout = Duration::from_secs(
        timeout_secs.unwrap_or(state.daemon.config.sessions.default_timeout),
    );
    Ok(Json(state.session.run(&command, timeout).await))
}

async fn interrupt(State(state): State<EndpointState>) -> impl IntoResponse {
    state.session.interrupt().await;
    Json(json!({"ok": true}))
}

async fn clear(State(state): State<EndpointState>) -> impl IntoResponse {
    state.session.clear().await;
    Json(json!({"ok": true}))
}

async fn reset(State(state): State<EndpointState>) -> impl IntoResponse {
    state.session.reset().await;
    Json(json!({"ok": true}))
}

#[derive(Deserialize)]
struct ResizeQuery {
    rows: u16,
    cols: u16,
}

async fn resize(State(state): State<EndpointState>, Query(q): Query<ResizeQuery>) -> SilcResult<impl IntoResponse> {
    state
        .session
        .resize(q.rows, q.cols)
        .await
        .map_err(|e| SilcError::Internal(e.to_string()))?;
    Ok(Json(json!({"ok": true})))
}

async fn sigterm(State(state): State<EndpointState>) -> impl IntoResponse {
    state.session.signal(PtySignal::Term).await;
    Json(json!({"ok": true}))
}

async fn sigkill(State(state): State<EndpointState>) -> impl IntoResponse {
    state.session.signal(PtySignal::Kill).await;
    Json(json!({"ok": true}))
}

async fn token_info(State(state): State<EndpointState>) -> Json<serde_json::Value> {
    Json(json!({"token": state.session.api_token}))
}

async fn web_ui() -> Html<&'static str> {
    Html(include_str!("web_ui.html"))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<EndpointState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientEvent {
    Type {
        text: String,
        #[serde(default)]
        nonewline: bool,
    },
    LoadHistory,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerEvent<'a> {
    Update { data: &'a str },
    History { data: String, start_offset: u64 },
}

/// Streams `update` frames as new output arrives, polling the ring buffer on
/// a short interval rather than only on `Notify` so the ≤100 ms latency the
/// protocol promises holds even across a missed wakeup. Replies with a
/// `history` frame only when the client explicitly asks via `load_history` —
/// it is never sent unprompted on connect.
async fn handle_ws(socket: WebSocket, state: EndpointState) {
    let (mut sender, mut receiver) = socket.split();
    state.session.set_tui_active(true);

    let session = state.session.clone();
    let mut cursor = session.buffer.cursor().await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                let (bytes, new_cursor) = session.buffer.since(cursor).await;
                cursor = new_cursor;
                if !bytes.is_empty() {
                    let data = crate::cleaner::clean(&bytes);
                    let frame = ServerEvent::Update { data: &data };
                    if sender.send(Message::Text(serde_json::to_string(&frame).unwrap().into())).await.is_err() {
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(raw))) => {
                        match serde_json::from_str::<ClientEvent>(&raw) {
                            Ok(ClientEvent::Type { text, nonewline }) => {
                                session.write(&text, !nonewline).await;
                            }
                            Ok(ClientEvent::LoadHistory) => {
                                let start_offset = session.buffer.start_offset().await;
                                let (bytes, new_cursor) = session.buffer.since(0).await;
                                cursor = new_cursor;
                                let data = crate::cleaner::clean(&bytes);
                                let frame = ServerEvent::History { data, start_offset };
                                if sender.send(Message::Text(serde_json::to_string(&frame).unwrap().into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!(error = %err, "ignoring malformed ws frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(error = %err, "ws receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
        if !session.is_alive().await {
            break;
        }
    }

    state.session.set_tui_active(false);
}
