//! Channel executor for persistent interactive shells
//!
//! One executor owns one long-lived shell sub-stream and the demultiplexer
//! attached to it. A single task serializes all channel access; commands
//! are written fire-and-forget and resolved in FIFO order, which is the
//! whole of the pipelining protocol.

use std::time::Duration;

use deckhand_shell::{sentinel, CommandResult, Demux, FeedStatus};
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::{classify, ClassifiedError};
use crate::transport::ClientHandler;

/// How long to poll for shell readiness before giving up with `NoSession`
const READY_DEADLINE: Duration = Duration::from_secs(1);

/// Step of the readiness poll loop
const READY_POLL: Duration = Duration::from_millis(50);

enum ShellRequest {
    Run {
        line: String,
        sentinel: String,
        command: String,
        tx: oneshot::Sender<CommandResult>,
    },
    Close,
}

/// One persistent interactive-shell sub-stream plus its demultiplexer
pub struct ChannelExecutor {
    key: String,
    requests: mpsc::UnboundedSender<ShellRequest>,
    ready: watch::Receiver<bool>,
}

impl ChannelExecutor {
    /// Open the interactive shell for `key` and spawn its owning task
    pub(crate) async fn open(
        key: &str,
        handle: &Handle<ClientHandler>,
    ) -> Result<Self, ClassifiedError> {
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| classify(&e))?;
        channel.request_shell(true).await.map_err(|e| classify(&e))?;

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        let task_key = key.to_string();
        tokio::spawn(async move {
            shell_task(task_key, channel, req_rx, ready_tx).await;
        });

        debug!(key = %key, "opened interactive shell channel");
        Ok(Self {
            key: key.to_string(),
            requests: req_tx,
            ready: ready_rx,
        })
    }

    /// Logical key this executor serves
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the owning task has shut down
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Run one command and return its extracted result.
    ///
    /// The command is written to the shell immediately, without waiting for
    /// earlier results. Commands submitted to the same executor resolve in
    /// submission order, never reordered or interleaved.
    pub async fn run(&self, command: &str) -> Result<String, ClassifiedError> {
        self.await_ready().await?;

        let token = sentinel::generate();
        let line = format!("{}; printf '\\n%s\\n' {}\n", command, token);
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(ShellRequest::Run {
                line,
                sentinel: token,
                command: command.to_string(),
                tx,
            })
            .map_err(|_| ClassifiedError::ChannelError("channel closed unexpectedly".to_string()))?;

        match rx.await {
            Ok(result) => result.map_err(ClassifiedError::from),
            Err(_) => Err(ClassifiedError::ChannelError(
                "channel closed unexpectedly".to_string(),
            )),
        }
    }

    /// Close the shell; queued commands fail through the demux close path
    pub fn close(&self) {
        let _ = self.requests.send(ShellRequest::Close);
    }

    /// Fixed short backoff loop waiting for the remote shell to come up
    async fn await_ready(&self) -> Result<(), ClassifiedError> {
        let mut waited = Duration::ZERO;
        loop {
            if *self.ready.borrow() {
                return Ok(());
            }
            if self.is_closed() || waited >= READY_DEADLINE {
                warn!(key = %self.key, "shell never became ready");
                return Err(ClassifiedError::NoSession);
            }
            tokio::time::sleep(READY_POLL).await;
            waited += READY_POLL;
        }
    }
}

/// Owning task for one shell channel.
///
/// All channel access funnels through this loop, so the FIFO and
/// at-most-one-in-flight-per-channel invariants hold without locks.
async fn shell_task(
    key: String,
    mut channel: Channel<Msg>,
    mut requests: mpsc::UnboundedReceiver<ShellRequest>,
    ready: watch::Sender<bool>,
) {
    let mut demux = Demux::new();
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(ShellRequest::Run { line, sentinel, command, tx }) => {
                    demux.push(sentinel, command, tx);
                    if let Err(e) = channel.data(line.as_bytes()).await {
                        warn!(key = %key, error = %e, "write to shell failed");
                        demux.close();
                        break;
                    }
                }
                Some(ShellRequest::Close) | None => {
                    debug!(key = %key, "closing shell channel");
                    demux.close();
                    let _ = channel.eof().await;
                    break;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    if demux.feed(data) == FeedStatus::Overflow {
                        warn!(key = %key, "closing channel after output overflow");
                        demux.close();
                        let _ = channel.eof().await;
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    demux.feed_stderr(data);
                }
                Some(ChannelMsg::Success) => {
                    // Reply to request_shell: the remote shell is up.
                    let _ = ready.send(true);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!(key = %key, "shell channel closed by remote");
                    demux.close();
                    break;
                }
                Some(_) => {}
            },
        }
    }
}
