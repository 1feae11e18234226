//! `sessions.json` resurrection manifest and per-session log rotation.
//!
//! The teacher's `sessions/journal.rs` persists one JSONL file per session
//! holding the full output history; SILC's daemon needs something lighter —
//! a single manifest of launch identity (for resurrection) plus a plain-text
//! output log per session — so this is a new design, grounded only in that
//! file's atomic-write-then-rename discipline and age-based rotation/cleanup
//! idiom, not in its per-entry JSONL format.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::registry::RegistryEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub port: u16,
    pub name: String,
    pub session_id: String,
    pub shell: String,
    pub is_global: bool,
    pub cwd: String,
    pub created_at: u64,
}

impl From<&RegistryEntry> for ManifestEntry {
    fn from(e: &RegistryEntry) -> Self {
        Self {
            port: e.port,
            name: e.name.clone(),
            session_id: e.session_id.clone(),
            shell: e.shell.clone(),
            is_global: e.is_global,
            cwd: e.cwd.clone(),
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    sessions: Vec<ManifestEntry>,
}

/// Reads tolerate a missing or corrupt file, returning an empty list — the
/// daemon must still start cleanly on a fresh `DATA_DIR`.
pub async fn read_manifest(path: &Path) -> Vec<ManifestEntry> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str::<Manifest>(&content)
            .map(|m| m.sessions)
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Write the manifest atomically via a temp-file-then-rename, so a crash
/// mid-write never leaves `sessions.json` corrupt.
pub async fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> std::io::Result<()> {
    let manifest = Manifest {
        sessions: entries.to_vec(),
    };
    let body = serde_json::to_vec_pretty(&manifest)?;
    let tmp_path = tmp_path_for(path);
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&body).await?;
        file.flush().await?;
    }
    tokio::fs::rename(&tmp_path, path).await
}

/// Append-or-replace `entry`, deduplicating by both `port` and `name` per the
/// persistence contract. Rewrites the whole manifest atomically.
pub async fn upsert(path: &Path, entry: ManifestEntry) -> std::io::Result<()> {
    let mut entries = read_manifest(path).await;
    entries.retain(|e| e.port != entry.port && e.name != entry.name);
    entries.push(entry);
    write_manifest(path, &entries).await
}

pub async fn remove_by_port(path: &Path, port: u16) -> std::io::Result<()> {
    let mut entries = read_manifest(path).await;
    entries.retain(|e| e.port != port);
    write_manifest(path, &entries).await
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Append-only plain-text log file, rotated to `max_lines` by truncating the
/// oldest lines once the cap is exceeded. Used both for a session's own
/// transcript (`session_<port>.log`) and for the daemon's own log
/// (`daemon.log`).
pub struct RotatingLog {
    path: PathBuf,
    max_lines: usize,
}

impl RotatingLog {
    pub fn for_session(log_dir: &Path, port: u16, max_lines: usize) -> Self {
        Self {
            path: log_dir.join(format!("session_{port}.log")),
            max_lines,
        }
    }

    pub fn for_daemon(log_dir: &Path, max_lines: usize) -> Self {
        Self {
            path: log_dir.join("daemon.log"),
            max_lines,
        }
    }

    pub async fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await
    }

    /// Drop lines beyond `max_lines`, keeping the most recent. Intended to
    /// run on the daemon's periodic GC tick, not on every append.
    pub async fn rotate(&self) -> std::io::Result<()> {
        let Ok(content) = tokio::fs::read_to_string(&self.path).await else {
            return Ok(());
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= self.max_lines {
            return Ok(());
        }
        let trimmed = lines[lines.len() - self.max_lines..].join("\n");
        write_manifest_like(&self.path, trimmed.as_bytes()).await
    }

    pub async fn tail(&self, n: usize) -> String {
        let Ok(content) = tokio::fs::read_to_string(&self.path).await else {
            return String::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

async fn write_manifest_like(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let tmp_path = tmp_path_for(path);
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(body).await?;
        file.flush().await?;
    }
    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = std::env::temp_dir().join(format!("silc-test-{}", crate::session::random_hex(8)));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("sessions.json");

        let entry = ManifestEntry {
            port: 20000,
            name: "alpha".to_string(),
            session_id: "abcd1234".to_string(),
            shell: "bash".to_string(),
            is_global: false,
            cwd: "/tmp".to_string(),
            created_at: 1234,
        };
        upsert(&path, entry.clone()).await.unwrap();
        let entries = read_manifest(&path).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "alpha");

        remove_by_port(&path, 20000).await.unwrap();
        assert!(read_manifest(&path).await.is_empty());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn read_manifest_tolerates_missing_file() {
        let path = Path::new("/nonexistent/silc/sessions.json");
        assert!(read_manifest(path).await.is_empty());
    }
}
