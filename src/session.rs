//! A single shared PTY session: owns the PTY, its ring buffer, the read loop,
//! and the sentinel-based run-protocol.
//!
//! Lifecycle and signal-delivery structure ground on `ManagedSession` from the
//! teacher's `sessions/session.rs` (stdin writer + reader + exit-watcher task
//! layout, `graceful_kill`'s SIGTERM-then-poll-then-SIGKILL pattern). The
//! sentinel run-protocol itself has no teacher counterpart and is grounded in
//! the marker-delimited command wrapping used by
//! `other_examples/331c1022_sanjay920-agentsh`'s PTY session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::buffer::RingBuffer;
use crate::persistence::RotatingLog;
use crate::shell::pty::{PtyError, PtySignal, UnixPty};
use crate::shell::ShellKind;

/// Commands may run for at most this long before the buffer-overflow guard
/// interrupts the foreground process.
const MAX_COLLECTED_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Dead,
}

/// Outcome of `Session::run`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Completed { output: String, exit_code: i32 },
    Timeout { output: String },
    Busy { running_cmd: Option<String> },
    Error { error: String },
}

/// A live, shared interactive shell.
pub struct Session {
    pub port: u16,
    pub name: String,
    pub session_id: String,
    pub shell_kind: ShellKind,
    pub shell_path: String,
    pub cwd: String,
    pub is_global: bool,
    pub api_token: Option<String>,
    pub created_at: Instant,

    pty: Mutex<UnixPty>,
    pub buffer: Arc<RingBuffer>,
    log: Option<RotatingLog>,
    state: RwLock<SessionState>,
    run_lock: Mutex<()>,
    running_cmd: RwLock<Option<String>>,
    screen_rows: AtomicU64,
    screen_cols: AtomicU64,
    last_access_secs: AtomicU64,
    last_output_secs: AtomicU64,
    tui_active: AtomicBool,
    epoch: Instant,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Parameters for creating a new session, mirroring the management API's
/// `POST /sessions` body.
pub struct SessionSpec {
    pub port: u16,
    pub name: String,
    pub shell_path: String,
    pub cwd: String,
    pub is_global: bool,
    pub api_token: Option<String>,
    pub buffer_capacity: usize,
    /// When set, every byte the read loop pulls off the PTY is also
    /// appended to `log_dir/session_<port>.log`.
    pub log_dir: Option<std::path::PathBuf>,
    pub max_log_lines: usize,
}

impl Session {
    /// Spawn the PTY and start the background read loop. Writes the
    /// run-protocol helper invocation is NOT done here — the helper is
    /// injected inline with each `run()` call instead of as a one-time rc
    /// file sourcing, so no shell-specific startup file needs writing.
    pub async fn start(spec: SessionSpec) -> Result<Arc<Self>, PtyError> {
        let shell_kind = ShellKind::from_path(&spec.shell_path);
        let pty = UnixPty::spawn(&spec.shell_path, 30, 120, &spec.cwd, None)?;
        let now = secs_since_epoch();
        let log = spec
            .log_dir
            .as_deref()
            .map(|dir| RotatingLog::for_session(dir, spec.port, spec.max_log_lines));

        let session = Arc::new(Self {
            port: spec.port,
            name: spec.name,
            session_id: random_hex(8),
            shell_kind,
            shell_path: spec.shell_path,
            cwd: spec.cwd,
            is_global: spec.is_global,
            api_token: spec.api_token,
            created_at: Instant::now(),
            pty: Mutex::new(pty),
            buffer: Arc::new(RingBuffer::new(spec.buffer_capacity)),
            log,
            state: RwLock::new(SessionState::Starting),
            run_lock: Mutex::new(()),
            running_cmd: RwLock::new(None),
            screen_rows: AtomicU64::new(30),
            screen_cols: AtomicU64::new(120),
            last_access_secs: AtomicU64::new(now),
            last_output_secs: AtomicU64::new(now),
            tui_active: AtomicBool::new(false),
            epoch: Instant::now(),
            read_loop: Mutex::new(None),
        });

        *session.state.write().await = SessionState::Running;
        let handle = spawn_read_loop(session.clone());
        *session.read_loop.lock().await = Some(handle);

        Ok(session)
    }

    pub async fn is_alive(&self) -> bool {
        *self.state.read().await == SessionState::Running
    }

    pub fn touch(&self) {
        self.last_access_secs.store(secs_since_epoch(), Ordering::Relaxed);
    }

    pub fn idle_seconds(&self) -> u64 {
        secs_since_epoch().saturating_sub(self.last_access_secs.load(Ordering::Relaxed))
    }

    pub fn set_tui_active(&self, active: bool) {
        self.tui_active.store(active, Ordering::Relaxed);
    }

    pub fn tui_active(&self) -> bool {
        self.tui_active.load(Ordering::Relaxed)
    }

    pub async fn run_locked(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub async fn running_cmd(&self) -> Option<String> {
        self.running_cmd.read().await.clone()
    }

    pub fn screen_size(&self) -> (u16, u16) {
        (
            self.screen_rows.load(Ordering::Relaxed) as u16,
            self.screen_cols.load(Ordering::Relaxed) as u16,
        )
    }

    /// Raw PTY write, used by `/in` and the WS `type` event.
    pub async fn write(&self, text: &str, append_newline: bool) {
        self.touch();
        let mut payload = text.as_bytes().to_vec();
        if append_newline {
            payload.push(b'\n');
        }
        self.pty.lock().await.write(&payload).await;
    }

    pub async fn interrupt(&self) {
        self.pty.lock().await.write(&[0x03]).await;
    }

    pub async fn signal(&self, signal: PtySignal) {
        let pty = self.pty.lock().await;
        if let Err(err) = pty.signal(signal) {
            tracing::debug!(session_id = %self.session_id, pid = self.port, error = %err, operation = "signal", "signal delivery failed, process likely already dead");
        }
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let rows = rows.clamp(1, 256);
        let cols = cols.clamp(1, 256);
        self.pty.lock().await.resize(rows, cols)?;
        self.screen_rows.store(rows as u64, Ordering::Relaxed);
        self.screen_cols.store(cols as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn clear(&self) {
        self.buffer.clear().await;
        self.pty.lock().await.write(b"\x1b[2J\x1b[H").await;
    }

    pub async fn reset(&self) {
        self.pty.lock().await.write(b"\x1bc").await;
    }

    /// Graceful close: SIGTERM the process group, give it up to 2 s to exit
    /// on its own, then SIGKILL — the cleanup-task budget from §5. Cancels
    /// the read loop and marks the session dead either way.
    pub async fn close(&self) {
        {
            let mut pty = self.pty.lock().await;
            pty.graceful_kill(Duration::from_secs(2)).await;
        }
        self.finish_close().await;
    }

    /// Force kill: immediate SIGKILL, no grace period. Used by `/sigkill`
    /// and the management `kill` endpoint.
    pub async fn force_kill(&self) {
        {
            let mut pty = self.pty.lock().await;
            pty.kill().await;
        }
        self.finish_close().await;
    }

    async fn finish_close(&self) {
        if let Some(handle) = self.read_loop.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        *self.state.write().await = SessionState::Dead;
    }

    /// Run `command` under the sentinel wrapper, returning once the end
    /// sentinel is observed, the timeout elapses, or the output cap is hit.
    ///
    /// At most one `run()` is ever in flight per session; a concurrent call
    /// observes the lock held and returns `Busy` immediately rather than
    /// queueing.
    pub async fn run(&self, command: &str, timeout: Duration) -> RunOutcome {
        if command.contains('\n') {
            return RunOutcome::Error {
                error: "invalid_command".to_string(),
            };
        }

        let Ok(_guard) = self.run_lock.try_lock() else {
            return RunOutcome::Busy {
                running_cmd: self.running_cmd().await,
            };
        };

        self.touch();
        *self.running_cmd.write().await = Some(command.to_string());
        let outcome = self.run_inner(command, timeout).await;
        *self.running_cmd.write().await = None;
        outcome
    }

    async fn run_inner(&self, command: &str, timeout: Duration) -> RunOutcome {
        let token = random_hex(8);
        let begin = format!("__SILC_BEGIN_{token}__");
        let end_re = Regex::new(&format!(r"__SILC_END_{token}__:(-?\d+)")).unwrap();

        let c0 = self.buffer.cursor().await;
        let wrapped = self.shell_kind.wrap_command(command, &token);
        self.pty.lock().await.write(wrapped.as_bytes()).await;

        let deadline = Instant::now() + timeout;
        let mut collected: Vec<u8> = Vec::new();
        let mut cursor = c0;

        loop {
            let (chunk, new_cursor) = self.buffer.since(cursor).await;
            cursor = new_cursor;
            collected.extend_from_slice(&chunk);

            if collected.len() > MAX_COLLECTED_BYTES {
                self.pty.lock().await.write(&[0x03]).await;
                return RunOutcome::Error {
                    error: "buffer overflow".to_string(),
                };
            }

            let text = String::from_utf8_lossy(&collected);
            if let Some(caps) = end_re.captures(&text) {
                let exit_code: i32 = caps[1].parse().unwrap_or(-1);
                let end_match_start = caps.get(0).unwrap().start();
                let region = if let Some(begin_pos) = text.find(&begin) {
                    &text[begin_pos + begin.len()..end_match_start]
                } else {
                    // Begin sentinel never observed: treat the whole region as output.
                    &text[..end_match_start]
                };
                return RunOutcome::Completed {
                    output: crate::cleaner::clean(region.trim_start_matches('\n').as_bytes()),
                    exit_code,
                };
            }

            if Instant::now() >= deadline {
                return RunOutcome::Timeout {
                    output: crate::cleaner::clean(&collected),
                };
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn mark_output(&self) {
        self.last_output_secs.store(secs_since_epoch(), Ordering::Relaxed);
    }

    /// Tail of the on-disk per-session log (distinct from the in-memory ring
    /// buffer `/out`/`/raw` read from): empty when no `log_dir` was
    /// configured for this session.
    pub async fn log_tail(&self, n_lines: usize) -> String {
        match &self.log {
            Some(log) => log.tail(n_lines).await,
            None => String::new(),
        }
    }
}

fn spawn_read_loop(session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = {
                let mut pty = session.pty.lock().await;
                pty.read(&mut buf).await
            };
            match n {
                Ok(0) => break,
                Ok(n) => {
                    session.buffer.append(&buf[..n]).await;
                    if let Some(log) = &session.log {
                        if let Err(err) = log.append(&buf[..n]).await {
                            tracing::warn!(session_id = %session.session_id, error = %err, "session log append failed");
                        }
                    }
                    session.mark_output();
                }
                Err(err) => {
                    tracing::warn!(session_id = %session.session_id, error = %err, operation = "read", "pty read failed, closing session");
                    break;
                }
            }
        }
        *session.state.write().await = SessionState::Dead;
    })
}

fn secs_since_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate an `n`-character lowercase hex token, used for both `session_id`
/// and per-run sentinel tokens.
pub fn random_hex(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_session(capacity: usize) -> Arc<Session> {
        Session::start(SessionSpec {
            port: 0,
            name: "test".to_string(),
            shell_path: "/bin/sh".to_string(),
            cwd: "/tmp".to_string(),
            is_global: false,
            api_token: None,
            buffer_capacity: capacity,
            log_dir: None,
            max_log_lines: 1000,
        })
        .await
        .expect("spawn session")
    }

    #[tokio::test]
    async fn run_captures_exit_code() {
        let session = spawn_session(64 * 1024).await;
        let outcome = session.run("exit 7", Duration::from_secs(2)).await;
        match outcome {
            RunOutcome::Completed { exit_code, .. } => assert_eq!(exit_code, 7),
            other => panic!("expected Completed, got {other:?}"),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn run_rejects_embedded_newline() {
        let session = spawn_session(64 * 1024).await;
        let outcome = session.run("echo a\necho b", Duration::from_secs(1)).await;
        assert!(matches!(outcome, RunOutcome::Error { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn concurrent_run_yields_one_busy() {
        let session = spawn_session(64 * 1024).await;
        let a = session.clone();
        let b = session.clone();
        let (r1, r2) = tokio::join!(
            a.run("sleep 1", Duration::from_secs(3)),
            b.run("echo x", Duration::from_millis(10)),
        );
        let statuses: Vec<bool> = vec![
            matches!(r1, RunOutcome::Busy { .. }),
            matches!(r2, RunOutcome::Busy { .. }),
        ];
        assert_eq!(statuses.iter().filter(|b| **b).count(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn timeout_does_not_kill_shell() {
        let session = spawn_session(64 * 1024).await;
        let outcome = session.run("sleep 2", Duration::from_millis(100)).await;
        assert!(matches!(outcome, RunOutcome::Timeout { .. }));
        assert!(session.is_alive().await);
        session.close().await;
    }
}
