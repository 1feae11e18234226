//! Daemon state and lifecycle orchestration: create/close/kill/restart a
//! session, resurrect from `sessions.json`, idle GC, and graceful shutdown.
//!
//! Restructured from the teacher's single-shared-`AppState`/single-router
//! model (`state.rs`, `main.rs`) into the per-session-socket architecture the
//! spec calls for: the daemon owns every session in one arena behind the
//! registry, reserves a listener before handing it to a spawned endpoint
//! task, and tracks those tasks so shutdown can tear them down with a budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{SilcError, SilcResult};
use crate::persistence::{self, ManifestEntry, RotatingLog};
use crate::registry::{Registry, RegistryEntry};
use crate::session::{Session, SessionSpec};
use crate::shell::ShellKind;

const ADJECTIVES: &[&str] = &["swift", "quiet", "brave", "calm", "bright", "eager", "sturdy"];
const NOUNS: &[&str] = &["otter", "falcon", "cedar", "comet", "harbor", "meadow", "summit"];

pub struct Daemon {
    pub config: Arc<Config>,
    pub registry: Registry,
    servers: AsyncMutex<HashMap<u16, JoinHandle<()>>>,
    create_mutex: AsyncMutex<()>,
    pub shutting_down: AtomicBool,
    /// Fired by `POST /restart-server`: rebind the management listener
    /// without touching any session. Session endpoints have their own
    /// listeners and are never affected by this.
    management_restart: tokio::sync::Notify,
    daemon_log: RotatingLog,
}

pub struct CreateRequest {
    pub port: Option<u16>,
    pub name: Option<String>,
    pub is_global: bool,
    pub token: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
}

#[derive(serde::Serialize)]
pub struct CreateResponse {
    pub port: u16,
    pub name: String,
    pub session_id: String,
    pub shell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
}

impl Daemon {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let daemon_log = RotatingLog::for_daemon(
            std::path::Path::new(&config.paths.log_dir),
            config.logging.max_log_lines,
        );
        Arc::new(Self {
            config,
            registry: Registry::new(),
            servers: AsyncMutex::new(HashMap::new()),
            create_mutex: AsyncMutex::new(()),
            shutting_down: AtomicBool::new(false),
            management_restart: tokio::sync::Notify::new(),
            daemon_log,
        })
    }

    /// Ask the main loop to rebind the management listener on its next
    /// iteration. Returns immediately; the rebind happens asynchronously.
    pub fn request_management_restart(&self) {
        self.management_restart.notify_one();
    }

    pub async fn wait_for_management_restart(&self) {
        self.management_restart.notified().await;
    }

    fn manifest_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config.paths.data_dir).join("sessions.json")
    }

    fn pid_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config.paths.data_dir).join("daemon.pid")
    }

    /// Refuse to start a second daemon against the same data dir: if
    /// `daemon.pid` names a PID that's still alive, this returns an error the
    /// caller should treat as an init failure (exit code 1).
    pub fn check_not_already_running(&self) -> std::io::Result<()> {
        let Ok(content) = std::fs::read_to_string(self.pid_path()) else {
            return Ok(());
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            return Ok(());
        };
        // SAFETY: signal 0 performs no action beyond existence/permission
        // checks, per kill(2).
        if unsafe { libc::kill(pid, 0) } == 0 {
            return Err(std::io::Error::other(format!(
                "daemon already running with pid {pid}"
            )));
        }
        Ok(())
    }

    pub fn write_pidfile(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.paths.data_dir)?;
        std::fs::write(self.pid_path(), std::process::id().to_string())
    }

    pub fn remove_pidfile(&self) {
        let _ = std::fs::remove_file(self.pid_path());
    }

    /// Create a session per §4.9: validate/generate name, reserve a socket
    /// before spawning anything (so a bind race can never leak a half-created
    /// session), spawn the PTY, register, persist, then start the endpoint.
    pub async fn create_session(
        self: &Arc<Self>,
        req: CreateRequest,
    ) -> SilcResult<CreateResponse> {
        let _guard = self.create_mutex.lock().await;

        if self.registry.list_sorted_by_port().await.len() >= self.config.sessions.max_sessions {
            return Err(SilcError::MaxSessions);
        }

        let name = match req.name {
            Some(n) => {
                crate::registry::validate_name(&n)
                    .map_err(|e| SilcError::InvalidInput(e.to_string()))?;
                if self.registry.get_by_name(&n).await.is_some() {
                    return Err(SilcError::Conflict(format!("name {n} already in use")));
                }
                n
            }
            None => self.generate_unique_name().await?,
        };

        let (port, listener) = self.reserve_socket(req.port, req.is_global).await?;

        let shell_path = req.shell.unwrap_or_else(|| {
            crate::shell::detect_shells()
                .into_iter()
                .next()
                .unwrap_or_else(|| "/bin/sh".to_string())
        });
        if !std::path::Path::new(&shell_path).exists() {
            return Err(SilcError::InvalidInput(format!("shell not found: {shell_path}")));
        }
        let cwd = crate::util::expand_tilde(&req.cwd.unwrap_or_else(|| "/".to_string())).into_owned();

        // §6.4: non-loopback peers must present a token. If the operator
        // requires one and the caller didn't supply one, generate it here
        // rather than silently standing up an unauthenticated session.
        let api_token = match req.token {
            Some(t) => Some(t),
            None if self.config.tokens.require_token => {
                Some(crate::session::random_hex(self.config.tokens.length))
            }
            None => None,
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.config.paths.log_dir).await {
            warn!(error = %e, "failed to create session log directory");
        }

        let spec = SessionSpec {
            port,
            name: name.clone(),
            shell_path: shell_path.clone(),
            cwd: cwd.clone(),
            is_global: req.is_global,
            api_token,
            buffer_capacity: self.config.sessions.max_buffer_bytes,
            log_dir: Some(std::path::PathBuf::from(&self.config.paths.log_dir)),
            max_log_lines: self.config.logging.max_log_lines,
        };

        let session = match Session::start(spec).await {
            Ok(s) => s,
            Err(e) => {
                drop(listener);
                return Err(SilcError::Internal(e.to_string()));
            }
        };

        if let Err(e) = self.registry.add(session.clone()).await {
            session.close().await;
            return Err(SilcError::Conflict(e.to_string()));
        }

        let entry = ManifestEntry {
            port,
            name: name.clone(),
            session_id: session.session_id.clone(),
            shell: shell_path.clone(),
            is_global: req.is_global,
            cwd,
            created_at: now_secs(),
        };
        if let Err(e) = persistence::upsert(&self.manifest_path(), entry).await {
            warn!(error = %e, "failed to persist session manifest entry");
        }

        let handle = self.spawn_endpoint(session.clone(), listener);
        self.servers.lock().await.insert(port, handle);

        Ok(CreateResponse {
            port,
            name,
            session_id: session.session_id.clone(),
            shell: ShellKind::from_path(&shell_path).to_string(),
            status: None,
        })
    }

    async fn generate_unique_name(&self) -> SilcResult<String> {
        for _ in 0..10 {
            let candidate = {
                let mut rng = rand::thread_rng();
                let adj = ADJECTIVES.choose(&mut rng).unwrap();
                let noun = NOUNS.choose(&mut rng).unwrap();
                let n: u8 = rand::Rng::gen_range(&mut rng, 0..100);
                format!("{adj}-{noun}-{n}")
            };
            if self.registry.get_by_name(&candidate).await.is_none() {
                return Ok(candidate);
            }
        }
        Err(SilcError::Internal(
            "failed to generate a unique session name".to_string(),
        ))
    }

    /// Reserve a listening socket before anything else touches the port, so
    /// two concurrent creates can never both believe they own it.
    async fn reserve_socket(
        &self,
        requested: Option<u16>,
        is_global: bool,
    ) -> SilcResult<(u16, TcpListener)> {
        let bind_addr = |port: u16| {
            if is_global {
                format!("0.0.0.0:{port}")
            } else {
                format!("127.0.0.1:{port}")
            }
        };

        if let Some(port) = requested {
            if self.registry.get(port).await.is_some() {
                return Err(SilcError::Conflict(format!("port {port} already in use")));
            }
            return TcpListener::bind(bind_addr(port))
                .await
                .map(|l| (port, l))
                .map_err(|_| SilcError::Conflict(format!("port {port} unavailable")));
        }

        let range = self.config.ports.session_start..=self.config.ports.session_end;
        for _ in 0..self.config.ports.max_attempts {
            let port = rand::Rng::gen_range(&mut rand::thread_rng(), range.clone());
            if self.registry.get(port).await.is_some() {
                continue;
            }
            if let Ok(listener) = TcpListener::bind(bind_addr(port)).await {
                return Ok((port, listener));
            }
        }
        Err(SilcError::Internal("no free session port found".to_string()))
    }

    fn spawn_endpoint(self: &Arc<Self>, session: Arc<Session>, listener: TcpListener) -> JoinHandle<()> {
        let daemon = self.clone();
        tokio::spawn(async move {
            crate::endpoint::serve(daemon, session, listener).await;
        })
    }

    /// Graceful close: SIGTERM, poll, then SIGKILL (`Session::close`).
    pub async fn close_session(&self, port: u16) -> SilcResult<()> {
        let session = self.registry.remove(port).await.ok_or(SilcError::NotFound)?;
        session.close().await;
        self.teardown_endpoint(port).await;
        Ok(())
    }

    /// Force kill: immediate SIGKILL, no grace period (`Session::force_kill`).
    pub async fn kill_session(&self, port: u16) -> SilcResult<()> {
        let session = self.registry.remove(port).await.ok_or(SilcError::NotFound)?;
        session.force_kill().await;
        self.teardown_endpoint(port).await;
        Ok(())
    }

    async fn teardown_endpoint(&self, port: u16) {
        if let Some(handle) = self.servers.lock().await.remove(&port) {
            handle.abort();
        }
        let _ = persistence::remove_by_port(&self.manifest_path(), port).await;
    }

    /// Close the existing PTY and spawn a fresh one on the same port with the
    /// same identity (name, shell, cwd, globality, token).
    pub async fn restart_session(self: &Arc<Self>, port: u16) -> SilcResult<CreateResponse> {
        let session = self.registry.get(port).await.ok_or(SilcError::NotFound)?;
        let req = CreateRequest {
            port: Some(port),
            name: Some(session.name.clone()),
            is_global: session.is_global,
            token: session.api_token.clone(),
            shell: Some(session.shell_path.clone()),
            cwd: Some(session.cwd.clone()),
        };

        self.close_session(port).await?;
        let mut resp = self.create_session(req).await?;
        resp.status = Some(if resp.port == port { "restored" } else { "relocated" });
        Ok(resp)
    }

    pub async fn shutdown(self: &Arc<Self>, budget: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ports: Vec<u16> = self.registry.list_sorted_by_port().await.iter().map(|s| s.port).collect();
        let cleanup = async {
            for port in ports {
                let _ = self.close_session(port).await;
            }
        };
        if tokio::time::timeout(budget, cleanup).await.is_err() {
            warn!("graceful shutdown budget exceeded, remaining sessions will be hard-killed by process exit");
        }
        self.remove_pidfile();
    }

    /// Idle GC tick: close sessions idle beyond `idle_timeout`, unless a TUI
    /// is attached or a command is in flight. Also rotates the daemon log,
    /// per §4.9.
    pub async fn gc_tick(&self) {
        let removed = self.registry.cleanup_idle(self.config.sessions.idle_timeout).await;
        for session in removed {
            info!(port = session.port, name = %session.name, "closing idle session");
            session.close().await;
            self.teardown_endpoint(session.port).await;
        }
        if let Err(e) = self.daemon_log.rotate().await {
            warn!(error = %e, "failed to rotate daemon log");
        }
    }

    pub async fn list_entries(&self) -> Vec<RegistryEntry> {
        let sessions = self.registry.list_sorted_by_port().await;
        let mut out = Vec::with_capacity(sessions.len());
        for s in sessions {
            out.push(RegistryEntry {
                port: s.port,
                name: s.name.clone(),
                session_id: s.session_id.clone(),
                shell: s.shell_kind.to_string(),
                cwd: s.cwd.clone(),
                is_global: s.is_global,
                created_at: now_secs(),
            });
        }
        out
    }

    /// Recreate sessions from `sessions.json`, relocating to a new free port
    /// immediately on the first bind failure rather than retrying with
    /// backoff (decision recorded in DESIGN.md).
    pub async fn resurrect(self: &Arc<Self>) -> (Vec<CreateResponse>, Vec<(String, String)>) {
        let entries = persistence::read_manifest(&self.manifest_path()).await;
        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for entry in entries {
            let req = CreateRequest {
                port: Some(entry.port),
                name: Some(entry.name.clone()),
                is_global: entry.is_global,
                token: None,
                shell: Some(entry.shell.clone()),
                cwd: Some(entry.cwd.clone()),
            };
            match self.create_session(req).await {
                Ok(resp) => restored.push(resp),
                Err(_) => {
                    let fallback = CreateRequest {
                        port: None,
                        name: Some(entry.name.clone()),
                        is_global: entry.is_global,
                        token: None,
                        shell: Some(entry.shell.clone()),
                        cwd: Some(entry.cwd.clone()),
                    };
                    match self.create_session(fallback).await {
                        Ok(resp) => restored.push(resp),
                        Err(e) => failed.push((entry.name, e.to_string())),
                    }
                }
            }
        }
        (restored, failed)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
