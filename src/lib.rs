#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! silc library — a networked, shareable PTY session daemon.
//!
//! - `daemon` — session lifecycle orchestration: create/close/kill/restart,
//!   resurrect, idle GC, graceful shutdown
//! - `endpoint` — per-session HTTP + WebSocket server
//! - `management` — the well-known control-plane server for the registry
//! - `session` — a single shared PTY session and its sentinel run-protocol
//! - `registry` — the in-memory port/name index of live sessions
//! - `persistence` — `sessions.json` resurrection manifest and log rotation
//! - `buffer` — the byte ring buffer behind every session's output history
//! - `renderer` — VT100 grid rendering for screen-mode reads
//! - `cleaner` — ANSI/sentinel stripping for plain-text reads
//! - `shell` — shell dialect detection and PTY spawning
//! - `auth` — bearer-token middleware with a loopback bypass
//! - `config` — configuration loading
//! - `error` — the daemon's central error type

pub mod auth;
pub mod buffer;
pub mod cleaner;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod management;
pub mod persistence;
pub mod registry;
pub mod renderer;
pub mod session;
pub mod shell;
pub mod util;

pub use config::Config;
pub use daemon::Daemon;
pub use error::SilcError;
