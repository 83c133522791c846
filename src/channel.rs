// ABOUTME: Adapter task owning one russh channel for the lifetime of a command.
// ABOUTME: Drains channel messages into the stream buffers and services caller ops.

use crate::command::CommandShared;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Requests forwarded from the command handle to the task owning the channel.
pub(crate) enum ChannelOp {
    Stdin(Vec<u8>),
    Abort,
    Close,
}

/// Drive one command's channel until it terminates or the caller closes it.
///
/// The channel is owned exclusively by this task, so stdin writes and channel
/// reads are never issued concurrently. Output ordering is FIFO per stream
/// because russh delivers both streams over this single message sequence.
pub(crate) async fn run_adapter(
    mut channel: Channel<Msg>,
    shared: Arc<CommandShared>,
    mut ops: mpsc::UnboundedReceiver<ChannelOp>,
) {
    let mut got_exit_status = false;
    let mut got_eof = false;

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    shared.stdout.append(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        // stderr
                        shared.stderr.append(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    shared.record_exit(exit_status as i32);
                    got_exit_status = true;
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::ExitSignal { .. }) => {
                    // The remote process died to a signal; its real exit
                    // status is unknown, so the abort sentinel applies.
                    shared.record_abort();
                    got_exit_status = true;
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    got_eof = true;
                    if got_exit_status {
                        break;
                    }
                }
                Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => break,
            },
            op = ops.recv() => match op {
                Some(ChannelOp::Stdin(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        tracing::debug!("stdin write failed: {}", e);
                        break;
                    }
                }
                Some(ChannelOp::Abort) => {
                    // Best-effort remote termination; the local state was
                    // already fixed by the caller.
                    let _ = channel.signal(Sig::KILL).await;
                    let _ = channel.close().await;
                }
                Some(ChannelOp::Close) | None => break,
            },
        }
    }

    let _ = channel.close().await;
    shared.task_finished();
}
