//! PTY allocation, shell spawning, resize, and signal delivery.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd is kept alive for the
//! session lifetime so I/O, resize, and signal operations can all be performed
//! on the same handle. The child is made its own session leader (`setsid` +
//! `TIOCSCTTY`) so signals sent via `killpg` reach the whole process tree it
//! spawns, not just the shell itself.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

/// Signals a session can deliver to its foreground process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtySignal {
    Term,
    Kill,
}

impl From<PtySignal> for Signal {
    fn from(s: PtySignal) -> Self {
        match s {
            PtySignal::Term => Signal::SIGTERM,
            PtySignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Error returned by PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to allocate pty: {0}")]
    Unavailable(#[from] nix::Error),
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// A spawned shell attached to a PTY.
///
/// The master fd is `dup`'d into independent read and write handles (same
/// technique the teacher's `ManagedSession::spawn_pty` uses to split a PTY
/// master into separate tokio handles) so a blocked `read` never holds up a
/// concurrent `write`/`resize`/`signal` — the alternative, one shared mutex
/// around a single fd, would serialize writes behind an idle read() await.
/// Rows/cols are clamped to `[1, 256]` on every resize per the terminal size
/// contract.
pub struct UnixPty {
    reader: AsyncFd<OwnedFd>,
    writer: AsyncFd<OwnedFd>,
    resize_fd: RawFd,
    child: Child,
    pgid: Pid,
}

impl UnixPty {
    /// Spawn `shell` attached to a freshly allocated PTY of size `rows x cols`.
    ///
    /// `cwd` is applied before exec. `env`, when present, is merged into the
    /// inherited environment (teacher's process.rs convention).
    pub fn spawn(
        shell: &str,
        rows: u16,
        cols: u16,
        cwd: &str,
        env: Option<&HashMap<String, String>>,
    ) -> Result<Self, PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(&winsize, None)?;
        let slave_fd = slave.as_raw_fd();

        let mut cmd = Command::new(shell);
        cmd.current_dir(cwd).kill_on_drop(false);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(vars) = env {
            cmd.envs(vars);
        }

        // SAFETY: only async-signal-safe syscalls are used in pre_exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::dup2(slave_fd, 0);
                libc::dup2(slave_fd, 1);
                libc::dup2(slave_fd, 2);
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pgid = Pid::from_raw(child.id().ok_or(PtyError::SpawnFailed(
            std::io::Error::other("child exited before id() was read"),
        ))? as i32);
        drop(slave);

        set_nonblocking(master.as_raw_fd())?;
        let resize_fd = master.as_raw_fd();
        // SAFETY: dup() duplicates a valid, open fd; both copies are wrapped
        // in OwnedFd so each closes independently without double-closing.
        let writer_raw = unsafe { libc::dup(master.as_raw_fd()) };
        if writer_raw == -1 {
            return Err(PtyError::SpawnFailed(std::io::Error::last_os_error()));
        }
        let writer_fd = unsafe { OwnedFd::from_raw_fd(writer_raw) };

        let reader = AsyncFd::new(master)?;
        let writer = AsyncFd::new(writer_fd)?;

        Ok(Self {
            reader,
            writer,
            resize_fd,
            child,
            pgid,
        })
    }

    /// Read up to `buf.len()` bytes. Returns `0` on EOF, matching `Pty::read`'s
    /// `b""`-on-EOF contract.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.reader.readable_mut().await?;
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write bytes to the PTY master. Fails silently when the pty is closed —
    /// callers rely on the subsequent `read` returning EOF instead.
    pub async fn write(&mut self, data: &[u8]) {
        let mut written = 0;
        while written < data.len() {
            let Ok(mut guard) = self.writer.writable_mut().await else {
                return;
            };
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(
                        fd.get_ref().as_raw_fd(),
                        data[written..].as_ptr().cast(),
                        data.len() - written,
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(_)) | Err(_) => return,
            }
        }
    }

    /// Resize the terminal window via `TIOCSWINSZ`. Rows/cols clamp to `[1,256]`.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let rows = rows.clamp(1, 256);
        let cols = cols.clamp(1, 256);
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let ret = unsafe {
            libc::ioctl(self.resize_fd, libc::TIOCSWINSZ, std::ptr::addr_of!(winsize))
        };
        if ret == -1 {
            Err(PtyError::Unavailable(nix::Error::last()))
        } else {
            Ok(())
        }
    }

    /// Send a signal to the whole foreground process group. Errors on an
    /// already-dead process are non-fatal; caller logs at debug level.
    pub fn signal(&self, signal: PtySignal) -> nix::Result<()> {
        nix::sys::signal::killpg(self.pgid, Signal::from(signal))
    }

    /// Terminate the process group (SIGKILL) and reap the child.
    pub async fn kill(&mut self) {
        let _ = self.signal(PtySignal::Kill);
        let _ = self.child.wait().await;
    }

    /// Graceful teardown: SIGTERM the process group, poll `try_wait` for up
    /// to `budget`, then SIGKILL if it's still running. Mirrors the
    /// teacher's `ManagedSession::graceful_kill` SIGTERM-poll-SIGKILL phases.
    pub async fn graceful_kill(&mut self, budget: Duration) {
        let _ = self.signal(PtySignal::Term);

        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(_) => return,
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = self.signal(PtySignal::Kill);
        let _ = self.child.wait().await;
    }

    /// Wait for the child to exit, returning its exit code if known.
    pub async fn wait(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|s| s.code())
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_read_write_roundtrip() {
        let mut pty = UnixPty::spawn("/bin/sh", 24, 80, "/tmp", None).expect("spawn");
        pty.write(b"echo hi\n").await;
        let mut buf = [0u8; 4096];
        let mut collected = Vec::new();
        for _ in 0..50 {
            let n = tokio::time::timeout(std::time::Duration::from_millis(200), pty.read(&mut buf))
                .await;
            match n {
                Ok(Ok(n)) if n > 0 => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.windows(2).any(|w| w == b"hi") {
                        break;
                    }
                }
                _ => break,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hi"));
        pty.kill().await;
    }

    #[test]
    fn resize_clamps_to_valid_range() {
        let pty = UnixPty::spawn("/bin/sh", 24, 80, "/tmp", None).expect("spawn");
        assert!(pty.resize(0, 0).is_ok());
        assert!(pty.resize(500, 500).is_ok());
    }
}
