//! In-memory dual index (port <-> name) of live sessions.
//!
//! Restructured from the teacher's `SessionManager` map-with-lock pattern in
//! `sessions/mod.rs` (`Arc<RwLock<HashMap<...>>>`, TOCTOU-safe insert under a
//! single write-lock hold) to the two-index shape the daemon's registry needs:
//! lookups by port (sessions own a TCP port) and by name (clients address
//! sessions by either).

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use std::sync::LazyLock;
use tokio::sync::RwLock;

use crate::session::Session;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*[a-z0-9]$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("name already in use")]
    NameTaken,
    #[error("port already in use")]
    PortTaken,
    #[error("invalid session name")]
    InvalidName,
    #[error("unknown session")]
    NotFound,
}

/// Snapshot of one session's identity, independent of the live `Session`
/// object (used for `GET /sessions` and `sessions.json`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryEntry {
    pub port: u16,
    pub name: String,
    pub session_id: String,
    pub shell: String,
    pub cwd: String,
    pub is_global: bool,
    pub created_at: u64,
}

#[derive(Default)]
struct Indices {
    by_port: HashMap<u16, Arc<Session>>,
    by_name: HashMap<String, u16>,
}

pub struct Registry {
    inner: RwLock<Indices>,
}

/// Validate a session name per the registry's naming contract: lowercase,
/// starts with a letter, min length 2, and never all-digits (digit strings
/// are reserved so a bare port number is never ambiguous with a name).
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.len() < 2 || name.chars().all(|c| c.is_ascii_digit()) || !NAME_RE.is_match(name) {
        return Err(RegistryError::InvalidName);
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indices::default()),
        }
    }

    /// Insert a session under both indices atomically. Fails without mutating
    /// state if the name is already taken.
    pub async fn add(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        validate_name(&session.name)?;
        let mut indices = self.inner.write().await;
        if indices.by_name.contains_key(&session.name) {
            return Err(RegistryError::NameTaken);
        }
        if indices.by_port.contains_key(&session.port) {
            return Err(RegistryError::PortTaken);
        }
        indices.by_name.insert(session.name.clone(), session.port);
        indices.by_port.insert(session.port, session);
        Ok(())
    }

    pub async fn remove(&self, port: u16) -> Option<Arc<Session>> {
        let mut indices = self.inner.write().await;
        let session = indices.by_port.remove(&port)?;
        indices.by_name.remove(&session.name);
        Some(session)
    }

    pub async fn get(&self, port: u16) -> Option<Arc<Session>> {
        self.inner.read().await.by_port.get(&port).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Session>> {
        let indices = self.inner.read().await;
        let port = indices.by_name.get(name)?;
        indices.by_port.get(port).cloned()
    }

    /// Resolve either a bare port number or a session name, per the CLI
    /// surface's contract that session subcommands accept both.
    pub async fn resolve(&self, port_or_name: &str) -> Option<Arc<Session>> {
        if let Ok(port) = port_or_name.parse::<u16>() {
            self.get(port).await
        } else {
            self.get_by_name(port_or_name).await
        }
    }

    pub async fn list_sorted_by_port(&self) -> Vec<Arc<Session>> {
        let indices = self.inner.read().await;
        let mut sessions: Vec<Arc<Session>> = indices.by_port.values().cloned().collect();
        sessions.sort_by_key(|s| s.port);
        sessions
    }

    /// Remove and return sessions idle longer than `idle_seconds`, skipping
    /// any with an attached TUI/WS client or a command in flight.
    pub async fn cleanup_idle(&self, idle_seconds: u64) -> Vec<Arc<Session>> {
        let candidates: Vec<Arc<Session>> = {
            let indices = self.inner.read().await;
            indices
                .by_port
                .values()
                .filter(|s| s.idle_seconds() > idle_seconds && !s.tui_active())
                .cloned()
                .collect()
        };
        let mut removed = Vec::new();
        for session in candidates {
            if session.run_locked().await {
                continue;
            }
            if self.remove(session.port).await.is_some() {
                removed.push(session);
            }
        }
        removed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_all_digit_names() {
        assert!(validate_name("123").is_err());
    }

    #[test]
    fn validate_name_rejects_short_names() {
        assert!(validate_name("a").is_err());
    }

    #[test]
    fn validate_name_accepts_typical_names() {
        assert!(validate_name("proj-a").is_ok());
        assert!(validate_name("alpha2").is_ok());
    }

    #[tokio::test]
    async fn add_remove_keeps_indices_bijective() {
        let registry = Registry::new();
        let session = crate::session::Session::start(crate::session::SessionSpec {
            port: 20001,
            name: "proj-a".to_string(),
            shell_path: "/bin/sh".to_string(),
            cwd: "/tmp".to_string(),
            is_global: false,
            api_token: None,
            buffer_capacity: 4096,
            log_dir: None,
            max_log_lines: 1000,
        })
        .await
        .unwrap();
        registry.add(session.clone()).await.unwrap();
        assert!(registry.get(20001).await.is_some());
        assert!(registry.get_by_name("proj-a").await.is_some());
        registry.remove(20001).await;
        assert!(registry.get(20001).await.is_none());
        assert!(registry.get_by_name("proj-a").await.is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn add_rejects_duplicate_name() {
        let registry = Registry::new();
        let s1 = crate::session::Session::start(crate::session::SessionSpec {
            port: 20002,
            name: "dup".to_string(),
            shell_path: "/bin/sh".to_string(),
            cwd: "/tmp".to_string(),
            is_global: false,
            api_token: None,
            buffer_capacity: 4096,
            log_dir: None,
            max_log_lines: 1000,
        })
        .await
        .unwrap();
        let s2 = crate::session::Session::start(crate::session::SessionSpec {
            port: 20003,
            name: "dup".to_string(),
            shell_path: "/bin/sh".to_string(),
            cwd: "/tmp".to_string(),
            is_global: false,
            api_token: None,
            buffer_capacity: 4096,
            log_dir: None,
            max_log_lines: 1000,
        })
        .await
        .unwrap();
        registry.add(s1.clone()).await.unwrap();
        assert!(matches!(
            registry.add(s2.clone()).await,
            Err(RegistryError::NameTaken)
        ));
        s1.close().await;
        s2.close().await;
    }
}
