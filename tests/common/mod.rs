//! Shared harness for the black-box HTTP/WS scenario tests: boots a real
//! daemon against an isolated temp data dir and a management listener bound
//! to an ephemeral loopback port, the same way `main.rs` wires things up
//! minus the pidfile/signal-handling bits a test run doesn't need.

use std::path::PathBuf;
use std::sync::Arc;

use silc::config::Config;
use silc::daemon::Daemon;
use tokio::net::TcpListener;

pub struct TestDaemon {
    pub base_url: String,
    pub daemon: Arc<Daemon>,
    data_dir: PathBuf,
    owns_dir: bool,
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if self.owns_dir {
            let _ = std::fs::remove_dir_all(&self.data_dir);
        }
    }
}

impl TestDaemon {
    pub async fn spawn() -> Self {
        let data_dir = std::env::temp_dir().join(format!("silc-e2e-{}", silc::session::random_hex(8)));
        std::fs::create_dir_all(&data_dir).expect("create temp data dir");
        Self::spawn_against(data_dir, true).await
    }

    /// Boot a second daemon against an already-populated data dir, simulating
    /// a restart: the new daemon's registry starts empty but `sessions.json`
    /// on disk survives, which is exactly what `resurrect` is for.
    pub async fn spawn_restart(&self) -> Self {
        Self::spawn_against(self.data_dir.clone(), false).await
    }

    async fn spawn_against(data_dir: PathBuf, owns_dir: bool) -> Self {
        let log_dir = data_dir.join("logs");

        let mut config = Config::default();
        config.paths.data_dir = data_dir.to_string_lossy().into_owned();
        config.paths.log_dir = log_dir.to_string_lossy().into_owned();
        // Dedicated range so concurrent test binaries don't collide on a
        // session port while they're each picking one at random.
        config.ports.session_start = 28000;
        config.ports.session_end = 28999;
        config.tokens.require_token = false;

        let daemon = Daemon::new(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind management listener");
        let addr = listener.local_addr().expect("local addr");

        let serve_daemon = daemon.clone();
        tokio::spawn(async move {
            silc::management::serve(serve_daemon, listener).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            daemon,
            data_dir,
            owns_dir,
        }
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}
