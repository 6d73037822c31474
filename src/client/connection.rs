// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use tokio::{
    net::{TcpStream, UnixStream},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    cfg::config::{Config, DEFAULT_PAYLOAD_COALESCE_LIMIT},
    client::{
        command::{Command, CommandError, Retired},
        common::{Direction, SendStatus, StepOutcome},
        stream::RawSock,
    },
    models::{
        common::{REQUEST_LEN, SIMPLE_REPLY_LEN},
        flags::CmdFlags,
        opcode::CmdType,
        request::RequestHeader,
    },
    state_machine::{issue_states, issue_states::IssueStates, reply_states,
        reply_states::ReplyCursor},
};

/// Byte cursor for the request frame currently being drained.
///
/// `Idle` means no send is partial. The other two variants select which
/// buffer the cursor points into (the connection's reusable header or the
/// head command's payload) and how far into it the socket has accepted
/// bytes; together they replace a raw pointer/length pair and make the
/// "paused on header vs paused on payload" distinction unrepresentable
/// to get wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteCursor {
    Idle,
    Header { sent: usize },
    Payload { sent: usize },
}

impl WriteCursor {
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Where the connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Idle: no active send, ready to pick the next command.
    Ready,
    /// The issue machine is parked mid-command; `step_issue` re-enters at
    /// the stored state and resumes the byte cursor exactly where it was.
    Issue(IssueStates),
    /// Fatal I/O error; the connection is unusable.
    Dead,
    /// Shut down by the caller; in-flight replies may still drain.
    Closed,
}

/// Outcome of draining the current write cursor.
#[derive(Debug)]
pub(crate) enum FlushOutcome {
    /// The cursor reached the end of its buffer.
    Drained,
    /// The socket stopped accepting bytes; the cursor keeps its place.
    Pending,
    /// Fatal socket error.
    Failed(std::io::Error),
}

/// A single connection to an NBD export, in the transmission phase.
///
/// Owns the socket, the reusable request header, the write cursor, and
/// the two command queues. Everything here is single-threaded: one task
/// at a time drives a connection, and pipelining comes from the state
/// machine keeping many commands in flight on the one socket, not from
/// parallelism.
pub struct Connection<S> {
    pub(crate) sock: S,
    pub(crate) state: ConnState,

    /// FIFO of commands awaiting transmission.
    pub(crate) cmds_to_issue: VecDeque<Command>,
    /// Commands fully on the wire, awaiting replies. Order here carries
    /// no meaning; the reply path locates entries by handle.
    pub(crate) cmds_in_flight: Vec<Command>,
    /// Retired commands awaiting pickup via `take_completion`.
    completions: HashMap<u64, Retired>,

    /// Reusable request header. Frozen while the cursor is not idle.
    pub(crate) request: RequestHeader,
    pub(crate) cursor: WriteCursor,
    /// "More data follows" hint for the next send calls; cleared when the
    /// current buffer drains.
    pub(crate) more_hint: bool,

    /// Reply-side scratch: header bytes assembled so far plus the cursor
    /// tracking a partially-received reply.
    pub(crate) reply_hdr: [u8; SIMPLE_REPLY_LEN],
    pub(crate) reply_cursor: ReplyCursor,

    /// Payloads strictly below this size keep the coalescing hint on when
    /// another command is queued behind them.
    pub(crate) coalesce_limit: usize,

    next_handle: u64,
    fatal: Option<anyhow::Error>,
}

impl<S: RawSock> Connection<S> {
    /// Wrap an already-connected socket. The engine assumes the handshake
    /// is done and the transmission phase has begun.
    pub fn from_socket(sock: S, coalesce_limit: usize) -> Self {
        Self {
            sock,
            state: ConnState::Ready,
            cmds_to_issue: VecDeque::new(),
            cmds_in_flight: Vec::new(),
            completions: HashMap::new(),
            request: RequestHeader::default(),
            cursor: WriteCursor::Idle,
            more_hint: false,
            reply_hdr: [0u8; SIMPLE_REPLY_LEN],
            reply_cursor: ReplyCursor::default(),
            coalesce_limit,
            next_handle: 1,
            fatal: None,
        }
    }

    // ── enqueue ─────────────────────────────────────────────────────────

    /// Queue a command for transmission and return its handle.
    ///
    /// Validation happens here, synchronously: a dead or closed handle,
    /// a `WRITE` without data (or whose data length disagrees with
    /// `count`), and data on a command that sends none are all rejected
    /// without touching the queues.
    pub fn enqueue(
        &mut self,
        kind: CmdType,
        flags: CmdFlags,
        offset: u64,
        count: u32,
        data: Option<Bytes>,
    ) -> Result<u64> {
        match self.state {
            ConnState::Dead => bail!("connection is dead"),
            ConnState::Closed => bail!("connection is shut down"),
            _ => {},
        }
        if kind.has_write_payload() {
            let data_len = data.as_ref().map(Bytes::len).context(
                "WRITE requires a payload",
            )?;
            ensure!(
                data_len == count as usize,
                "payload length {data_len} does not match count {count}"
            );
        } else {
            ensure!(
                data.is_none(),
                "{kind:?} does not carry a payload on the wire"
            );
        }

        let handle = self.next_handle;
        self.next_handle += 1;

        debug!(handle, ?kind, offset, count, "enqueue command");
        self.cmds_to_issue.push_back(Command {
            handle,
            kind,
            flags,
            offset,
            count,
            data,
        });
        Ok(handle)
    }

    /// Queue a read of `count` bytes at `offset`.
    pub fn pread(&mut self, count: u32, offset: u64) -> Result<u64> {
        self.enqueue(CmdType::Read, CmdFlags::empty(), offset, count, None)
    }

    /// Queue a write of `data` at `offset`.
    pub fn pwrite(&mut self, data: Bytes, offset: u64, flags: CmdFlags) -> Result<u64> {
        let count = u32::try_from(data.len()).context("payload exceeds u32::MAX")?;
        self.enqueue(CmdType::Write, flags, offset, count, Some(data))
    }

    /// Queue a flush of the server's caches.
    pub fn flush(&mut self) -> Result<u64> {
        self.enqueue(CmdType::Flush, CmdFlags::empty(), 0, 0, None)
    }

    /// Queue a trim (discard) of `count` bytes at `offset`.
    pub fn trim(&mut self, count: u32, offset: u64) -> Result<u64> {
        self.enqueue(CmdType::Trim, CmdFlags::empty(), offset, count, None)
    }

    /// Queue a zero-fill of `count` bytes at `offset`. No data travels.
    pub fn write_zeroes(
        &mut self,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> Result<u64> {
        self.enqueue(CmdType::WriteZeroes, flags, offset, count, None)
    }

    /// Queue a cache-warming hint for `count` bytes at `offset`.
    pub fn cache(&mut self, count: u32, offset: u64) -> Result<u64> {
        self.enqueue(CmdType::Cache, CmdFlags::empty(), offset, count, None)
    }

    // ── state machine entry points ──────────────────────────────────────

    /// Drive the issue machine: frame and send queued commands until the
    /// socket stops cooperating, the queue empties, or the connection
    /// dies. Never blocks.
    pub fn step_issue(&mut self) -> StepOutcome {
        issue_states::run(self)
    }

    /// Drive the reply path: consume whatever reply bytes the socket has,
    /// retiring in-flight commands as their replies complete. Never
    /// blocks.
    pub fn notify_read(&mut self) -> StepOutcome {
        reply_states::run(self)
    }

    // ── direction advisor ───────────────────────────────────────────────

    /// Current directional interest of the connection.
    ///
    /// `WRITE` while a send is partial (or the issue machine is parked
    /// with work queued); `READ` while a reply could arrive: any command
    /// in flight, a reply frame partially assembled, or the issue machine
    /// paused with the reply path in control. Empty when dead or idle.
    pub fn direction(&self) -> Direction {
        if matches!(self.state, ConnState::Dead) {
            return Direction::empty();
        }

        let mut dir = Direction::empty();

        if !self.cursor.is_idle()
            || (matches!(self.state, ConnState::Issue(_))
                && !self.cmds_to_issue.is_empty())
        {
            dir |= Direction::WRITE;
        }

        let reply_pending = !self.reply_cursor.is_blank();
        if !self.cmds_in_flight.is_empty()
            || reply_pending
            || matches!(self.state, ConnState::Issue(_))
        {
            dir |= Direction::READ;
        }

        dir
    }

    /// Interest to poll with: the advisor's answer plus write-intent when
    /// commands are queued and the connection can still issue them.
    pub fn poll_interest(&self) -> Direction {
        let mut dir = self.direction();
        if !self.cmds_to_issue.is_empty()
            && matches!(self.state, ConnState::Ready | ConnState::Issue(_))
        {
            dir |= Direction::WRITE;
        }
        dir
    }

    // ── readiness driver ────────────────────────────────────────────────

    /// One iteration of the readiness loop: wait until the socket is
    /// ready in a direction we care about, then feed the corresponding
    /// state machine. Returns without waiting when there is nothing to
    /// do.
    pub async fn process(&mut self) -> Result<()> {
        let interest = self.poll_interest();
        if interest.is_empty() {
            return Ok(());
        }

        let ready = match self.sock.wait(interest).await {
            Ok(r) => r,
            Err(e) => {
                let err = anyhow!(e).context("readiness wait failed");
                self.die(err);
                return Ok(());
            },
        };

        if ready.contains(Direction::READ) {
            let _ = self.notify_read();
        }
        if ready.contains(Direction::WRITE) {
            while self.wants_issue() {
                if self.step_issue() != StepOutcome::Ready {
                    break;
                }
            }
        }
        Ok(())
    }

    fn wants_issue(&self) -> bool {
        match self.state {
            ConnState::Ready => !self.cmds_to_issue.is_empty(),
            ConnState::Issue(_) => true,
            ConnState::Dead | ConnState::Closed => false,
        }
    }

    // ── send primitive ──────────────────────────────────────────────────

    /// Drain the current write cursor into the socket.
    ///
    /// Advances the cursor by however many bytes the socket accepts and
    /// resets it (clearing the coalescing hint) once the buffer is fully
    /// out. A zero-byte send counts as would-block.
    pub(crate) fn flush_wbuf(&mut self) -> FlushOutcome {
        loop {
            let Self {
                sock,
                request,
                cmds_to_issue,
                cursor,
                more_hint,
                ..
            } = self;

            let slice: &[u8] = match *cursor {
                WriteCursor::Idle => {
                    *more_hint = false;
                    return FlushOutcome::Drained;
                },
                WriteCursor::Header { sent } => {
                    &zerocopy::IntoBytes::as_bytes(request)[sent..]
                },
                WriteCursor::Payload { sent } => {
                    match cmds_to_issue.front().and_then(|c| c.data.as_ref()) {
                        Some(data) => &data[sent..],
                        // Unreachable by construction: the cursor only
                        // enters Payload for a WRITE at the queue head.
                        None => {
                            *cursor = WriteCursor::Idle;
                            return FlushOutcome::Drained;
                        },
                    }
                },
            };

            if slice.is_empty() {
                *cursor = WriteCursor::Idle;
                *more_hint = false;
                return FlushOutcome::Drained;
            }

            match sock.try_send(slice, *more_hint) {
                SendStatus::Sent(n) => match cursor {
                    WriteCursor::Header { sent } | WriteCursor::Payload { sent } => {
                        *sent += n;
                    },
                    WriteCursor::Idle => {},
                },
                SendStatus::WouldBlock => return FlushOutcome::Pending,
                SendStatus::Fatal(e) => return FlushOutcome::Failed(e),
            }
        }
    }

    /// Bytes still owed to the socket by the current partial send.
    pub fn pending_send_bytes(&self) -> usize {
        match self.cursor {
            WriteCursor::Idle => 0,
            WriteCursor::Header { sent } => REQUEST_LEN - sent,
            WriteCursor::Payload { sent } => self
                .cmds_to_issue
                .front()
                .map_or(0, |c| c.count as usize - sent),
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Kill the connection. Queued and in-flight commands stay where they
    /// are; `take_completion` reports each of them as connection-lost.
    pub(crate) fn die(&mut self, err: anyhow::Error) {
        warn!(
            queued = self.cmds_to_issue.len(),
            in_flight = self.cmds_in_flight.len(),
            "connection died: {err:#}"
        );
        self.state = ConnState::Dead;
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    /// Stop issuing: refuse further enqueues and cancel every command
    /// that has not reached the wire. In-flight commands keep waiting for
    /// their replies; drive `notify_read` (or `process`) to drain them.
    pub fn shutdown(&mut self) {
        if matches!(self.state, ConnState::Dead | ConnState::Closed) {
            return;
        }
        debug!(
            cancelled = self.cmds_to_issue.len(),
            in_flight = self.cmds_in_flight.len(),
            "connection shutting down"
        );
        // A partially-sent head frame is abandoned with the rest: once we
        // stop mid-frame the write side of this socket is unusable for
        // further commands anyway.
        self.cursor = WriteCursor::Idle;
        self.more_hint = false;
        while let Some(cmd) = self.cmds_to_issue.pop_front() {
            let retired =
                Retired::from_command(cmd, Err(CommandError::Cancelled), None);
            self.completions.insert(retired.handle, retired);
        }
        self.state = ConnState::Closed;
    }

    /// Unlink an in-flight command by handle and hand back the record.
    /// This is the reply path's removal entry point.
    pub fn retire(&mut self, handle: u64) -> Option<Command> {
        let idx = self
            .cmds_in_flight
            .iter()
            .position(|c| c.handle == handle)?;
        Some(self.cmds_in_flight.swap_remove(idx))
    }

    /// Park a retired command for pickup via `take_completion`.
    pub(crate) fn complete(
        &mut self,
        cmd: Command,
        status: Result<(), CommandError>,
        data: Option<Bytes>,
    ) {
        debug!(handle = cmd.handle, ok = status.is_ok(), "command retired");
        let retired = Retired::from_command(cmd, status, data);
        self.completions.insert(retired.handle, retired);
    }

    /// Fetch the completion for `handle`, if it has one.
    ///
    /// On a dead connection this also sweeps the queues: a command still
    /// sitting in either queue is surfaced as connection-lost.
    pub fn take_completion(&mut self, handle: u64) -> Option<Retired> {
        if let Some(r) = self.completions.remove(&handle) {
            return Some(r);
        }
        if matches!(self.state, ConnState::Dead) {
            if let Some(idx) = self
                .cmds_to_issue
                .iter()
                .position(|c| c.handle == handle)
            {
                let cmd = self
                    .cmds_to_issue
                    .remove(idx)?;
                return Some(Retired::from_command(
                    cmd,
                    Err(CommandError::ConnectionLost),
                    None,
                ));
            }
            if let Some(cmd) = self.retire(handle) {
                return Some(Retired::from_command(
                    cmd,
                    Err(CommandError::ConnectionLost),
                    None,
                ));
            }
        }
        None
    }

    // ── introspection ───────────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, ConnState::Dead)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /// Commands still waiting to be transmitted.
    pub fn queued_count(&self) -> usize {
        self.cmds_to_issue.len()
    }

    /// Commands on the wire awaiting replies.
    pub fn in_flight_count(&self) -> usize {
        self.cmds_in_flight.len()
    }

    /// Commands the connection is still responsible for.
    pub fn live_commands(&self) -> usize {
        self.cmds_to_issue.len() + self.cmds_in_flight.len()
    }

    /// The error that killed the connection, if any.
    pub fn last_error(&self) -> Option<&anyhow::Error> {
        self.fatal.as_ref()
    }

    /// The underlying socket, for callers running their own poll loop.
    pub fn socket(&self) -> &S {
        &self.sock
    }

    /// Mutable access to the underlying socket.
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.sock
    }
}

impl Connection<TcpStream> {
    /// Connect over TCP using `target.address` from the config.
    pub async fn connect_tcp(cfg: &Config) -> Result<Self> {
        let addr = cfg
            .target
            .address
            .as_deref()
            .context("target.address is required for a TCP connection")?;
        let stream = timeout(cfg.timeouts.connect, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))??;
        stream.set_nodelay(true)?;
        Ok(Self::from_socket(stream, cfg.limits.payload_coalesce_limit))
    }
}

impl Connection<UnixStream> {
    /// Connect over a Unix-domain socket using `target.unix`.
    pub async fn connect_unix(cfg: &Config) -> Result<Self> {
        let path = cfg
            .target
            .unix
            .as_ref()
            .context("target.unix is required for a Unix-socket connection")?;
        let stream = timeout(cfg.timeouts.connect, UnixStream::connect(path))
            .await
            .with_context(|| format!("timed out connecting to {}", path.display()))??;
        Ok(Self::from_socket(stream, cfg.limits.payload_coalesce_limit))
    }
}

impl<S: RawSock> Connection<S> {
    /// [`Self::from_socket`] with the default coalescing threshold.
    pub fn with_default_tuning(sock: S) -> Self {
        Self::from_socket(sock, DEFAULT_PAYLOAD_COALESCE_LIMIT)
    }
}
