use std::{
    io::{self, BufRead, BufReader, Read, Write},
    process::ChildStdin,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use tracing::{debug, trace, warn};

use crate::{
    cgroup_manager::LimitedProcess, command::CommandBuffer, configuration::Configuration,
    constraints::Constraints,
};

use super::AgentId;

const KILL_DURATION: Duration = Duration::from_secs(1);

/// Longest line accepted from an agent, terminator excluded.
pub(super) const MAX_LINE_BYTES: usize = 64 * 1024;

/// Lines buffered per output pipe. A full stdout backlog stops the reader until the runner
/// consumes it; a full stderr backlog drops lines.
const PIPE_BACKLOG: usize = 256;

/// What the stdout reader thread forwards.
#[derive(Debug)]
enum PipeEvent {
    Line(String),
    NotText,
    TooLong,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ReceiveError {
    Timeout { received: usize },
    Closed { received: usize },
    NotText,
    LineTooLong,
    InputFailed(String),
}

/// An external executable, spoken to over its stdin/stdout.
///
/// Every pipe is owned by its own thread: the writer is fed over a channel and the readers
/// forward complete lines over bounded channels. Waiting for a reply, including for the
/// input to be fully written, is a bounded `recv_timeout` and never a blocking syscall.
#[derive(Debug)]
pub(super) struct ProcessAgent {
    id: AgentId,
    process: LimitedProcess,
    stdin: Sender<String>,
    written: Receiver<io::Result<()>>,
    pending_writes: usize,
    stdout: Receiver<PipeEvent>,
    stderr: Receiver<String>,
    closed: bool,
}

impl ProcessAgent {
    pub fn launch(
        id: AgentId,
        program: &str,
        args: &[String],
        constraints: &Constraints,
        config: &Configuration,
    ) -> anyhow::Result<ProcessAgent> {
        if program.is_empty() {
            bail!("empty command line");
        }
        let mut process = Self::spawn(program, args, constraints, config)?;

        let stdin = process.child.stdin.take().context("no stdin pipe")?;
        let stdout = process.child.stdout.take().context("no stdout pipe")?;
        let stderr = process.child.stderr.take().context("no stderr pipe")?;

        let (tx_in, rx_in) = mpsc::channel();
        let (tx_written, rx_written) = mpsc::channel();
        thread::Builder::new()
            .name(format!("agent-{id}-stdin"))
            .spawn(move || forward_stdin(stdin, rx_in, tx_written))
            .context("could not spawn stdin writer")?;

        let (tx_out, rx_out) = mpsc::sync_channel(PIPE_BACKLOG);
        thread::Builder::new()
            .name(format!("agent-{id}-stdout"))
            .spawn(move || forward_stdout(stdout, tx_out))
            .context("could not spawn stdout reader")?;

        let (tx_err, rx_err) = mpsc::sync_channel(PIPE_BACKLOG);
        let echo = config.debug_agent_stderr;
        thread::Builder::new()
            .name(format!("agent-{id}-stderr"))
            .spawn(move || forward_stderr(id, stderr, tx_err, echo))
            .context("could not spawn stderr reader")?;

        debug!(
            pid = process.child.id(),
            contained = process.is_contained(),
            "process launched"
        );
        Ok(ProcessAgent {
            id,
            process,
            stdin: tx_in,
            written: rx_written,
            pending_writes: 0,
            stdout: rx_out,
            stderr: rx_err,
            closed: false,
        })
    }

    fn spawn(
        program: &str,
        args: &[String],
        constraints: &Constraints,
        config: &Configuration,
    ) -> anyhow::Result<LimitedProcess> {
        if !constraints.needs_container() {
            return LimitedProcess::launch_without_container(program, args);
        }
        let max_memory = constraints.agent_ram().unwrap_or(0) as i64;
        match LimitedProcess::launch(program, args, max_memory, &constraints.cpus_string()) {
            Ok(process) => Ok(process),
            Err(e) if config.allow_uncontained => {
                warn!("could not contain agent ({e:#}), running it without cgroup");
                LimitedProcess::launch_without_container(program, args)
            }
            Err(e) => Err(e.context("could not launch agent in its cgroup")),
        }
    }

    /// Hands `input` to the writer thread. Whether it was fully written is only known by
    /// [`ProcessAgent::receive`], within the turn deadline.
    pub fn send(&mut self, input: &CommandBuffer) -> io::Result<()> {
        let stale = self.discard_stale_output();
        if stale > 0 {
            debug!(agent_id = self.id, "discarded {stale} unexpected lines");
        }
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "agent closed its output",
            ));
        }
        trace!(agent_id = self.id, %input, "sending");
        self.stdin
            .send(input.serialize())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stdin writer is gone"))?;
        self.pending_writes += 1;
        Ok(())
    }

    /// Collects exactly `expected` lines, or fails once `deadline` has passed.
    ///
    /// Input still being written at the deadline counts as a timeout.
    pub fn receive(&mut self, expected: usize, deadline: Instant) -> Result<Vec<String>, ReceiveError> {
        self.wait_for_input(deadline)?;
        let mut lines = Vec::with_capacity(expected);
        while lines.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.stdout.recv_timeout(remaining) {
                Ok(PipeEvent::Line(line)) => lines.push(line),
                Ok(PipeEvent::NotText) => return Err(ReceiveError::NotText),
                Ok(PipeEvent::TooLong) => return Err(ReceiveError::LineTooLong),
                Ok(PipeEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                    return Err(ReceiveError::Closed {
                        received: lines.len(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ReceiveError::Timeout {
                        received: lines.len(),
                    })
                }
            }
        }
        trace!(agent_id = self.id, ?lines, "received");
        Ok(lines)
    }

    fn wait_for_input(&mut self, deadline: Instant) -> Result<(), ReceiveError> {
        while self.pending_writes > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.written.recv_timeout(remaining) {
                Ok(Ok(())) => self.pending_writes -= 1,
                Ok(Err(e)) => return Err(ReceiveError::InputFailed(e.to_string())),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ReceiveError::InputFailed("stdin writer is gone".to_string()))
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!(agent_id = self.id, "input still not consumed at the deadline");
                    return Err(ReceiveError::Timeout { received: 0 });
                }
            }
        }
        Ok(())
    }

    pub fn drain_stderr(&self) -> Vec<String> {
        self.stderr.try_iter().collect()
    }

    /// Kills the process. Dropping the channels afterwards releases the pipe threads.
    pub fn kill(mut self) {
        if let Err(e) = self.process.try_kill(KILL_DURATION) {
            warn!(agent_id = self.id, "could not kill agent process: {e:#}");
        }
    }

    fn discard_stale_output(&mut self) -> usize {
        let mut stale = 0;
        loop {
            match self.stdout.try_recv() {
                Ok(PipeEvent::Line(_)) | Ok(PipeEvent::NotText) => stale += 1,
                Ok(PipeEvent::TooLong) | Ok(PipeEvent::Closed) | Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    return stale;
                }
                Err(TryRecvError::Empty) => return stale,
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    TooLong,
    End,
}

/// Reads one line into `buf`, terminator stripped, never buffering more than
/// [`MAX_LINE_BYTES`] (plus terminator). A longer line leaves its first bytes in `buf` and
/// the rest unread.
fn read_line(reader: &mut impl BufRead, buf: &mut Vec<u8>) -> LineRead {
    buf.clear();
    let limit = MAX_LINE_BYTES as u64 + 2;
    match reader.by_ref().take(limit).read_until(b'\n', buf) {
        Ok(0) | Err(_) => LineRead::End,
        Ok(_) => {
            let terminated = buf.last() == Some(&b'\n');
            if terminated {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            if buf.len() > MAX_LINE_BYTES {
                buf.truncate(MAX_LINE_BYTES);
                LineRead::TooLong
            } else {
                LineRead::Line
            }
        }
    }
}

fn forward_stdin(mut stdin: ChildStdin, rx: Receiver<String>, tx: Sender<io::Result<()>>) {
    for input in rx {
        let result = stdin
            .write_all(input.as_bytes())
            .and_then(|()| stdin.flush());
        let failed = result.is_err();
        if tx.send(result).is_err() || failed {
            return;
        }
    }
}

fn forward_stdout(stdout: impl Read, tx: SyncSender<PipeEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        let event = match read_line(&mut reader, &mut buf) {
            LineRead::End => break,
            // the rest of the output can no longer be framed
            LineRead::TooLong => {
                let _ = tx.send(PipeEvent::TooLong);
                return;
            }
            LineRead::Line => match String::from_utf8(buf.clone()) {
                Ok(line) => PipeEvent::Line(line),
                Err(_) => PipeEvent::NotText,
            },
        };
        if tx.send(event).is_err() {
            return;
        }
    }
    let _ = tx.send(PipeEvent::Closed);
}

/// Overlong stderr lines are split; lines arriving while the backlog is full are dropped.
fn forward_stderr(id: AgentId, stderr: impl Read, tx: SyncSender<String>, echo: bool) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    while read_line(&mut reader, &mut buf) != LineRead::End {
        let line = String::from_utf8_lossy(&buf).into_owned();
        if echo {
            eprintln!("\x1b[33m[agent {id}]\x1b[39m {line}");
        }
        match tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if dropped == 0 {
                    warn!(agent_id = id, "stderr backlog full, dropping lines");
                }
                dropped += 1;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
    if dropped > 0 {
        debug!(agent_id = id, "{dropped} stderr lines dropped");
    }
}
