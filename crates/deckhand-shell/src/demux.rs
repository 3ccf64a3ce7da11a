//! Shell output demultiplexer
//!
//! One interactive shell carries many pipelined commands. Each command is
//! submitted with a trailing sentinel; the demultiplexer accumulates raw
//! stream data, matches sentinels against the head of a FIFO queue of
//! pending commands, and resolves each pending result exactly once.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{parse, ShellError};

/// Upper bound on one command's accumulated output before the command is
/// declared stuck and the owning stream must be closed
pub const BUFFER_CEILING: usize = 100_000;

/// Result delivered for one resolved command
pub type CommandResult = Result<String, ShellError>;

/// Outcome of feeding a chunk into the demultiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// The stream may keep running
    Ok,
    /// The overflow backstop fired; the owner must close the sub-stream
    Overflow,
}

/// A command awaiting its sentinel
struct Pending {
    sentinel: String,
    command: String,
    tx: oneshot::Sender<CommandResult>,
}

/// Demultiplexes one interactive-shell byte stream into per-command results.
///
/// Commands are resolved strictly in the order they were pushed. Stream
/// byte order plus this queue order is the whole correctness argument for
/// sentinel pipelining.
pub struct Demux {
    queue: VecDeque<Pending>,
    /// Sentinels of commands that were resolved early (stderr attribution)
    /// but whose sentinel line is still in flight and must be discarded
    discards: VecDeque<String>,
    buffer: String,
    greeting_stripped: bool,
}

impl Demux {
    /// Create an empty demultiplexer for a fresh channel
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            discards: VecDeque::new(),
            buffer: String::new(),
            greeting_stripped: false,
        }
    }

    /// Number of commands still awaiting resolution
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a pending command awaiting `sentinel`
    pub fn push(&mut self, sentinel: String, command: String, tx: oneshot::Sender<CommandResult>) {
        self.queue.push_back(Pending {
            sentinel,
            command,
            tx,
        });
    }

    /// Feed a chunk from the shell's output stream.
    ///
    /// The first chunk ever received is stripped of login noise once. A
    /// single chunk may resolve several queued commands when a fast remote
    /// shell answers more than one command in one read.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedStatus {
        let text = String::from_utf8_lossy(chunk);
        if self.greeting_stripped {
            self.buffer.push_str(&text);
        } else {
            self.greeting_stripped = true;
            self.buffer.push_str(&parse::strip_greeting(&text));
        }
        self.resolve_ready()
    }

    /// Feed a chunk from the shell's error stream.
    ///
    /// Policy: a stderr chunk is attributed to the currently-executing
    /// (head-of-queue) command and fails it immediately with the raw text.
    /// The failed command's sentinel will still be emitted by the shell, so
    /// it is queued for discard to keep later results uncorrupted.
    pub fn feed_stderr(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk).trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.queue.pop_front() {
            Some(pending) => {
                warn!(sentinel = %pending.sentinel, "stderr during command, failing it");
                self.discards.push_back(pending.sentinel);
                let _ = pending.tx.send(Err(ShellError::Stderr(text)));
            }
            None => {
                debug!(text = %text, "stderr with no pending command");
            }
        }
    }

    /// Fail every queued command in FIFO order and clear all state.
    ///
    /// Called when the owning sub-stream closes or errors.
    pub fn close(&mut self) {
        let pending = self.queue.len();
        if pending > 0 {
            warn!(pending, "channel closed with commands outstanding");
        }
        for entry in self.queue.drain(..) {
            let _ = entry.tx.send(Err(ShellError::ChannelClosed));
        }
        self.discards.clear();
        self.buffer.clear();
    }

    /// Match sentinels against the queue head until no more progress is
    /// possible, enforcing the overflow backstop.
    fn resolve_ready(&mut self) -> FeedStatus {
        loop {
            self.drop_discarded();

            let hit = match self.queue.front() {
                Some(head) => find_sentinel(&self.buffer, &head.sentinel),
                None => {
                    // Unsolicited output (prompt noise between commands)
                    // must not grow without bound either.
                    if self.buffer.len() > BUFFER_CEILING {
                        self.buffer.clear();
                    }
                    return FeedStatus::Ok;
                }
            };

            match hit {
                Some((start, end)) => {
                    let raw = self.buffer[..start].to_string();
                    self.buffer.drain(..end);
                    if let Some(pending) = self.queue.pop_front() {
                        let result = parse::extract_result(&raw, &pending.command);
                        debug!(
                            sentinel = %pending.sentinel,
                            ok = result.is_ok(),
                            "command resolved"
                        );
                        let _ = pending.tx.send(result);
                    }
                }
                None => {
                    if self.buffer.len() > BUFFER_CEILING {
                        if let Some(pending) = self.queue.pop_front() {
                            warn!(
                                sentinel = %pending.sentinel,
                                buffered = self.buffer.len(),
                                "output ceiling exceeded with no sentinel match"
                            );
                            let _ = pending.tx.send(Err(ShellError::BufferOverflow));
                        }
                        return FeedStatus::Overflow;
                    }
                    return FeedStatus::Ok;
                }
            }
        }
    }

    /// Drop output belonging to commands that were already resolved early.
    ///
    /// Stream order guarantees a dead command's sentinel arrives before the
    /// next live command's output, so discards are consumed front-first.
    fn drop_discarded(&mut self) {
        while let Some(sentinel) = self.discards.front() {
            match find_sentinel(&self.buffer, sentinel) {
                Some((_, end)) => {
                    self.buffer.drain(..end);
                    self.discards.pop_front();
                }
                None => break,
            }
        }
    }
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate a sentinel in the buffer in either recognized result encoding:
/// the structured evaluator echo `=> "<sentinel>"` or the bare token.
/// Returns the byte range to remove, extended through the end of the
/// sentinel's line.
fn find_sentinel(buffer: &str, sentinel: &str) -> Option<(usize, usize)> {
    let quoted = format!("{}\"{}\"", parse::ECHO_MARKER, sentinel);
    let structured = buffer.find(&quoted);
    let bare = buffer.find(sentinel);

    // The bare token is a substring of the structured form, so when the
    // structured form comes first it is always the wider match.
    let (start, len) = match (structured, bare) {
        (Some(s), Some(b)) if s <= b => (s, quoted.len()),
        (_, Some(b)) => (b, sentinel.len()),
        (Some(s), None) => (s, quoted.len()),
        (None, None) => return None,
    };

    let mut end = start + len;
    match buffer[end..].find('\n') {
        Some(nl) => end += nl + 1,
        None => end = buffer.len(),
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(
        demux: &mut Demux,
        sentinel: &str,
        command: &str,
    ) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        demux.push(sentinel.to_string(), command.to_string(), tx);
        rx
    }

    #[test]
    fn test_single_command_bare_sentinel() {
        let mut demux = Demux::new();
        let mut rx = pending(&mut demux, "DKaaaa111100", "osascript -e x");

        assert_eq!(demux.feed(b"Playing\nDKaaaa111100\n"), FeedStatus::Ok);
        assert_eq!(rx.try_recv().unwrap().unwrap(), "Playing");
        assert_eq!(demux.pending(), 0);
    }

    #[test]
    fn test_structured_sentinel_encoding() {
        let mut demux = Demux::new();
        let mut rx = pending(&mut demux, "DKbbbb222200", "");

        demux.feed(b"=> \"Paused\"\n=> \"DKbbbb222200\"\n");
        assert_eq!(rx.try_recv().unwrap().unwrap(), "Paused");
    }

    #[test]
    fn test_fifo_two_commands_one_chunk() {
        // A fast local shell can answer two queued commands in one read.
        let mut demux = Demux::new();
        let mut rx1 = pending(&mut demux, "DKcccc333300", "");
        let mut rx2 = pending(&mut demux, "DKdddd444400", "");

        demux.feed(b"first\nDKcccc333300\nsecond\nDKdddd444400\n");
        assert_eq!(rx1.try_recv().unwrap().unwrap(), "first");
        assert_eq!(rx2.try_recv().unwrap().unwrap(), "second");
    }

    #[test]
    fn test_no_spillover_between_commands() {
        let mut demux = Demux::new();
        let mut rx1 = pending(&mut demux, "DKeeee555500", "");
        let mut rx2 = pending(&mut demux, "DKffff666600", "");

        demux.feed(b"alpha\nDKeeee555500\n");
        demux.feed(b"beta\nDKffff666600\n");

        let first = rx1.try_recv().unwrap().unwrap();
        let second = rx2.try_recv().unwrap().unwrap();
        assert!(!first.contains("beta"));
        assert!(!second.contains("alpha"));
    }

    #[test]
    fn test_sentinel_split_across_chunks() {
        let mut demux = Demux::new();
        let mut rx = pending(&mut demux, "DKgggg777700", "");

        assert_eq!(demux.feed(b"out\nDKgggg"), FeedStatus::Ok);
        assert!(rx.try_recv().is_err());
        demux.feed(b"777700\n");
        assert_eq!(rx.try_recv().unwrap().unwrap(), "out");
    }

    #[test]
    fn test_greeting_stripped_only_on_first_chunk() {
        let mut demux = Demux::new();
        let mut rx1 = pending(&mut demux, "DKhhhh888800", "");

        demux.feed(b"Last login: Tue Feb 3\nuser@desk ~ %\n");
        demux.feed(b"ok\nDKhhhh888800\n");
        assert_eq!(rx1.try_recv().unwrap().unwrap(), "ok");

        // Later chunks are not greeting-stripped; banner-like lines in the
        // middle of the stream no longer disturb sentinel matching.
        let mut rx2 = pending(&mut demux, "DKiiii999900", "");
        demux.feed(b"data line\nLast login: fake\nDKiiii999900\n");
        assert_eq!(rx2.try_recv().unwrap().unwrap(), "data line");
    }

    #[test]
    fn test_stderr_fails_head_and_discards_its_sentinel() {
        let mut demux = Demux::new();
        let mut rx1 = pending(&mut demux, "DKjjjj000011", "");
        let mut rx2 = pending(&mut demux, "DKkkkk000022", "");

        demux.feed_stderr(b"sh: bogus: command not found");
        assert!(matches!(
            rx1.try_recv().unwrap().unwrap_err(),
            ShellError::Stderr(_)
        ));

        // The dead command's sentinel still arrives and must not leak into
        // the next command's result.
        demux.feed(b"DKjjjj000011\nreal output\nDKkkkk000022\n");
        assert_eq!(rx2.try_recv().unwrap().unwrap(), "real output");
    }

    #[test]
    fn test_stderr_with_empty_queue_is_ignored() {
        let mut demux = Demux::new();
        demux.feed_stderr(b"late noise");
        assert_eq!(demux.pending(), 0);
    }

    #[test]
    fn test_overflow_backstop() {
        let mut demux = Demux::new();
        let mut rx = pending(&mut demux, "DKllll000033", "");

        let chunk = vec![b'x'; BUFFER_CEILING + 1];
        assert_eq!(demux.feed(&chunk), FeedStatus::Overflow);
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err(),
            ShellError::BufferOverflow
        );
    }

    #[test]
    fn test_overflow_never_grows_unbounded_without_queue() {
        let mut demux = Demux::new();
        let chunk = vec![b'y'; BUFFER_CEILING + 1];
        assert_eq!(demux.feed(&chunk), FeedStatus::Ok);
        assert!(demux.buffer.is_empty());
    }

    #[test]
    fn test_close_fails_all_pending_in_order() {
        let mut demux = Demux::new();
        let mut rx1 = pending(&mut demux, "DKmmmm000044", "");
        let mut rx2 = pending(&mut demux, "DKnnnn000055", "");

        demux.close();
        assert_eq!(
            rx1.try_recv().unwrap().unwrap_err(),
            ShellError::ChannelClosed
        );
        assert_eq!(
            rx2.try_recv().unwrap().unwrap_err(),
            ShellError::ChannelClosed
        );
        assert_eq!(demux.pending(), 0);
    }

    #[test]
    fn test_evaluator_error_resolves_as_failure() {
        let mut demux = Demux::new();
        let mut rx = pending(&mut demux, "DKoooo000066", "");

        demux.feed(b"=> \"Can't get player state\"\nDKoooo000066\n");
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            ShellError::Evaluator(_)
        ));
    }

    #[test]
    fn test_pipelined_fifo_order_many_commands() {
        let mut demux = Demux::new();
        let mut receivers = Vec::new();
        for i in 0..8 {
            let sentinel = format!("DKfifo{:06}", i);
            let (tx, rx) = oneshot::channel();
            demux.push(sentinel, String::new(), tx);
            receivers.push(rx);
        }
        for i in 0..8 {
            demux.feed(format!("result-{}\nDKfifo{:06}\n", i, i).as_bytes());
        }
        for (i, rx) in receivers.iter_mut().enumerate() {
            assert_eq!(rx.try_recv().unwrap().unwrap(), format!("result-{}", i));
        }
    }
}
