// ABOUTME: Thread-safe append-only byte accumulator for captured command output.
// ABOUTME: Supports consistent snapshots, an optional byte cap, and freezing on close.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Accumulates one output stream of a remote command.
///
/// The adapter task appends while the caller takes snapshots; both paths only
/// hold the lock for the duration of the copy. Once frozen, appends are
/// silently dropped so snapshots stay constant.
pub(crate) struct StreamBuffer {
    inner: Mutex<Inner>,
    frozen: AtomicBool,
}

struct Inner {
    data: Vec<u8>,
    limit: Option<usize>,
}

impl StreamBuffer {
    /// Create a buffer, optionally capped at `limit` bytes.
    ///
    /// When capped, the oldest bytes are dropped on overflow so the most
    /// recent `limit` bytes are retained.
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: Vec::new(),
                limit,
            }),
            frozen: AtomicBool::new(false),
        }
    }

    pub(crate) fn append(&self, bytes: &[u8]) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.data.extend_from_slice(bytes);
        if let Some(limit) = inner.limit {
            if inner.data.len() > limit {
                let excess = inner.data.len() - limit;
                inner.data.drain(..excess);
            }
        }
    }

    /// Point-in-time copy of everything appended so far.
    pub(crate) fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().data)
    }

    /// Stop accepting appends. Called when the owning command closes.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}
