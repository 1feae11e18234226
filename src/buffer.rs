//! Bounded append-only byte ring buffer with a monotonic cursor.
//!
//! Keeps the teacher's `Notify`-based wakeup so `/stream` and the WebSocket
//! handler can block on new bytes instead of tight-polling, but the storage
//! model is rewritten: capacity is in bytes, not entries, and readers resume
//! from a `u64` cursor rather than a sequence-numbered entry index.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// A single session's output buffer.
///
/// Invariants: `len(data) <= capacity`; `cursor - start_offset == len(data)`.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

struct Inner {
    capacity: usize,
    data: VecDeque<u8>,
    start_offset: u64,
    cursor: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                data: VecDeque::with_capacity(capacity.min(64 * 1024)),
                start_offset: 0,
                cursor: 0,
            }),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A handle other tasks can `notified().await` on to wake when new bytes
    /// land, instead of polling `since` on a fixed interval.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Append bytes, trimming the head to `capacity` if necessary.
    pub async fn append(&self, bytes: &[u8]) {
        {
            let mut inner = self.inner.lock().await;
            inner.data.extend(bytes.iter().copied());
            inner.cursor += bytes.len() as u64;
            let overflow = inner.data.len().saturating_sub(inner.capacity);
            if overflow > 0 {
                inner.data.drain(..overflow);
                inner.start_offset += overflow as u64;
            }
        }
        self.notify.notify_waiters();
    }

    /// Return `(bytes, new_cursor)` for everything appended since `since`.
    ///
    /// If `since >= cursor`, returns `(empty, cursor)`. If `since <
    /// start_offset` (the caller fell behind capacity), returns the whole
    /// buffer starting at `start_offset` rather than erroring — the caller is
    /// expected to re-sync from there.
    pub async fn since(&self, since: u64) -> (Vec<u8>, u64) {
        let inner = self.inner.lock().await;
        if since >= inner.cursor {
            return (Vec::new(), inner.cursor);
        }
        let from = since.max(inner.start_offset);
        let skip = (from - inner.start_offset) as usize;
        let bytes: Vec<u8> = inner.data.iter().skip(skip).copied().collect();
        (bytes, inner.cursor)
    }

    /// Current cursor value (total bytes ever appended).
    pub async fn cursor(&self) -> u64 {
        self.inner.lock().await.cursor
    }

    /// Oldest cursor value still retained in the buffer.
    pub async fn start_offset(&self) -> u64 {
        self.inner.lock().await.start_offset
    }

    /// Bytes covering the last `n_lines` newline-delimited lines (or the
    /// whole buffer if it holds fewer).
    pub async fn tail(&self, n_lines: usize) -> Vec<u8> {
        let inner = self.inner.lock().await;
        let data: Vec<u8> = inner.data.iter().copied().collect();
        if n_lines == 0 {
            return Vec::new();
        }
        let mut newline_positions: Vec<usize> =
            data.iter().enumerate().filter(|(_, &b)| b == b'\n').map(|(i, _)| i).collect();
        if newline_positions.len() < n_lines {
            return data;
        }
        newline_positions.reverse();
        let start = if newline_positions.len() > n_lines {
            newline_positions[n_lines] + 1
        } else {
            0
        };
        data[start..].to_vec()
    }

    /// Clear buffered data but preserve the cursor (it is monotone for the
    /// session's lifetime): `start_offset` is advanced to meet `cursor`.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.data.clear();
        inner.start_offset = inner.cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cursor_monotonic_across_appends() {
        let buf = RingBuffer::new(1024);
        buf.append(b"abc").await;
        let c1 = buf.cursor().await;
        buf.append(b"def").await;
        let c2 = buf.cursor().await;
        assert!(c2 > c1);
        assert_eq!(c2, 6);
    }

    #[tokio::test]
    async fn capacity_invariant_holds_after_overflow() {
        let buf = RingBuffer::new(4);
        buf.append(b"abcdef").await;
        let (bytes, cursor) = buf.since(0).await;
        assert_eq!(cursor, 6);
        assert!(bytes.len() <= 4);
        assert_eq!(bytes, b"cdef");
    }

    #[tokio::test]
    async fn since_before_start_offset_resyncs_from_start() {
        let buf = RingBuffer::new(4);
        buf.append(b"abcdef").await;
        let (bytes, cursor) = buf.since(0).await;
        assert_eq!(cursor, 6);
        assert_eq!(bytes, b"cdef");
    }

    #[tokio::test]
    async fn since_at_cursor_returns_empty() {
        let buf = RingBuffer::new(64);
        buf.append(b"abc").await;
        let cursor = buf.cursor().await;
        let (bytes, new_cursor) = buf.since(cursor).await;
        assert!(bytes.is_empty());
        assert_eq!(new_cursor, cursor);
    }

    #[tokio::test]
    async fn clear_preserves_cursor() {
        let buf = RingBuffer::new(64);
        buf.append(b"abc").await;
        let cursor_before = buf.cursor().await;
        buf.clear().await;
        assert_eq!(buf.cursor().await, cursor_before);
        assert_eq!(buf.start_offset().await, cursor_before);
        let (bytes, _) = buf.since(0).await;
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn tail_returns_last_n_lines() {
        let buf = RingBuffer::new(1024);
        buf.append(b"one\ntwo\nthree\n").await;
        let tail = buf.tail(2).await;
        assert_eq!(String::from_utf8(tail).unwrap(), "two\nthree\n");
    }
}
