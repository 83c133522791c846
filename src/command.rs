// ABOUTME: Remote command session lifecycle: running, completed, aborted, closed.
// ABOUTME: Exposes stdin writes, output snapshots, wait with timeout, abort and close.

use crate::buffer::StreamBuffer;
use crate::channel::ChannelOp;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// Exit code recorded when the process was aborted before reporting a status.
const ABORT_EXIT_CODE: i32 = -1;

/// Bound on how long `close` waits for the adapter task to finish.
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Running,
    Completed,
    Aborted,
    Closed,
}

struct State {
    status: Status,
    exit_code: Option<i32>,
}

/// State shared between the command handle, the adapter task, and the
/// owning connection (for cascade close).
pub(crate) struct CommandShared {
    command: String,
    state: Mutex<State>,
    pub(crate) stdout: StreamBuffer,
    pub(crate) stderr: StreamBuffer,
    ops: mpsc::UnboundedSender<ChannelOp>,
    /// Woken whenever the session leaves `Running`.
    exited: Notify,
    /// Woken once when the adapter task has finished.
    done: Notify,
    close_started: AtomicBool,
}

impl CommandShared {
    pub(crate) fn new(
        command: String,
        ops: mpsc::UnboundedSender<ChannelOp>,
        output_limit: Option<usize>,
    ) -> Self {
        Self {
            command,
            state: Mutex::new(State {
                status: Status::Running,
                exit_code: None,
            }),
            stdout: StreamBuffer::new(output_limit),
            stderr: StreamBuffer::new(output_limit),
            ops,
            exited: Notify::new(),
            done: Notify::new(),
            close_started: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.state.lock().status
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    /// Record the remote-reported exit status. First terminal transition wins.
    pub(crate) fn record_exit(&self, code: i32) {
        let mut state = self.state.lock();
        if state.status == Status::Running {
            state.status = Status::Completed;
            state.exit_code = Some(code);
            drop(state);
            self.exited.notify_waiters();
        }
    }

    /// Transition to `Aborted` with the exit sentinel, waking all waiters.
    /// Returns whether this call performed the transition.
    fn force_abort(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == Status::Running {
            state.status = Status::Aborted;
            state.exit_code = Some(ABORT_EXIT_CODE);
            drop(state);
            self.exited.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Implicit abort from the adapter side (remote signal death, channel
    /// torn down without an exit status).
    pub(crate) fn record_abort(&self) {
        self.force_abort();
    }

    /// Called by the adapter task as its final act.
    pub(crate) fn task_finished(&self) {
        // A channel that ends without reporting a status counts as aborted.
        self.force_abort();
        self.done.notify_one();
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        if self.status() != Status::Running {
            return Err(Error::ChannelClosed);
        }
        self.ops
            .send(ChannelOp::Stdin(data.to_vec()))
            .map_err(|_| Error::ChannelClosed)?;
        Ok(data.len())
    }

    fn abort(&self) {
        if self.force_abort() {
            // Best effort; the adapter may already be gone.
            let _ = self.ops.send(ChannelOp::Abort);
        }
    }

    /// Wait until the session leaves `Running`, then return the exit code.
    async fn wait_exit(&self) -> i32 {
        loop {
            let notified = self.exited.notified();
            if let Some(code) = self.exit_code() {
                return code;
            }
            notified.await;
        }
    }

    /// First-call latch for close. Aborts a still-running command and signals
    /// the adapter task to stop.
    pub(crate) fn begin_close(&self) -> bool {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.force_abort();
        let _ = self.ops.send(ChannelOp::Close);
        true
    }

    /// Join the adapter task with a bounded wait.
    pub(crate) async fn join_task(&self) {
        tokio::select! {
            _ = self.done.notified() => {}
            _ = tokio::time::sleep(CLOSE_JOIN_TIMEOUT) => {
                tracing::debug!(command = %self.command, "adapter task did not stop in time");
            }
        }
    }

    /// Freeze buffers and exit code; no mutation happens past this point.
    pub(crate) fn finalize_close(&self) {
        let mut state = self.state.lock();
        state.status = Status::Closed;
        drop(state);
        self.stdout.freeze();
        self.stderr.freeze();
        self.exited.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }
}

/// Handle to one remote process started with [`Connection::exec`].
///
/// Output is captured continuously in the background, so `stdout`/`stderr`
/// snapshots are available while the command is still running. Dropping the
/// handle aborts the command if it has not exited yet; call [`wait`] first to
/// let it finish.
///
/// [`Connection::exec`]: crate::Connection::exec
/// [`wait`]: RemoteCommand::wait
pub struct RemoteCommand {
    shared: Arc<CommandShared>,
}

impl std::fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("command", &self.shared.command)
            .field("status", &self.shared.status())
            .field("exit_code", &self.shared.exit_code())
            .finish()
    }
}

impl RemoteCommand {
    pub(crate) fn new(shared: Arc<CommandShared>) -> Self {
        Self { shared }
    }

    /// The command line this session is executing.
    pub fn command(&self) -> &str {
        &self.shared.command
    }

    /// Queue `data` for the remote process's stdin.
    ///
    /// Returns the number of bytes accepted. Fails with
    /// [`Error::ChannelClosed`] once the command has completed, been aborted,
    /// or been closed.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<usize> {
        self.shared.write(data.as_ref())
    }

    /// Snapshot of the stdout captured so far.
    pub fn stdout(&self) -> Bytes {
        self.shared.stdout.snapshot()
    }

    /// Snapshot of the stderr captured so far.
    pub fn stderr(&self) -> Bytes {
        self.shared.stderr.snapshot()
    }

    /// The exit code, or `None` while the command is still running.
    ///
    /// An aborted command reports `-1`, since its real exit status never
    /// reached the client.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.exit_code()
    }

    pub fn is_running(&self) -> bool {
        self.shared.status() == Status::Running
    }

    /// Wait for the command to exit and return its exit code.
    ///
    /// With a timeout, fails with [`Error::WaitTimeout`] if the command is
    /// still running when the deadline elapses; the command is not aborted by
    /// that, and `wait` may be called again. An exit status that races the
    /// deadline wins over the timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<i32> {
        match timeout {
            None => Ok(self.shared.wait_exit().await),
            Some(duration) => {
                match tokio::time::timeout(duration, self.shared.wait_exit()).await {
                    Ok(code) => Ok(code),
                    Err(_) => self
                        .shared
                        .exit_code()
                        .ok_or(Error::WaitTimeout(duration)),
                }
            }
        }
    }

    /// Abort the command.
    ///
    /// Locally guaranteed: waiting stops and the exit code is fixed to `-1`.
    /// The remote side is killed on a best-effort basis only.
    pub fn abort(&self) {
        self.shared.abort();
    }

    /// Close the session, aborting the command if it is still running.
    ///
    /// Idempotent; repeat calls return immediately. After the first call the
    /// output snapshots and exit code are frozen.
    pub async fn close(&self) {
        if self.shared.begin_close() {
            self.shared.join_task().await;
            self.shared.finalize_close();
        }
    }
}

impl Drop for RemoteCommand {
    fn drop(&mut self) {
        // Best-effort close without the bounded join, so the lifecycle
        // invariants hold even when the handle is dropped early.
        if self.shared.begin_close() {
            self.shared.finalize_close();
        }
    }
}
