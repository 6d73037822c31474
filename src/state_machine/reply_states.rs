// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reply-drain machine: the collaborator the issue path yields to.
//!
//! Consumes simple replies arriving on the same socket the issue machine
//! writes to, matches them to in-flight commands by handle, and retires
//! the commands. Like the write side, reads are non-blocking and the
//! cursor survives would-block mid-frame: a reply header or a `READ`
//! payload can arrive in arbitrarily small pieces across many readable
//! events.

use std::{io, mem};

use anyhow::anyhow;
use bytes::BytesMut;
use tracing::{debug, trace};

use crate::{
    client::{
        command::CommandError,
        common::{RecvStatus, StepOutcome},
        connection::{ConnState, Connection},
        stream::RawSock,
    },
    models::{
        common::{SIMPLE_REPLY_LEN, WireFrame},
        reply::SimpleReply,
    },
};

/// Byte cursor for the reply frame currently being assembled.
#[derive(Debug)]
pub(crate) enum ReplyCursor {
    /// Collecting the 16-byte reply header into the connection's scratch.
    Header { filled: usize },
    /// Header complete; collecting `buf.len()` bytes of `READ` data for
    /// the in-flight command `handle`.
    Payload {
        handle: u64,
        buf: BytesMut,
        filled: usize,
    },
}

impl Default for ReplyCursor {
    fn default() -> Self {
        Self::Header { filled: 0 }
    }
}

impl ReplyCursor {
    /// No reply bytes consumed yet; safe to stop reading here.
    #[inline]
    pub(crate) fn is_blank(&self) -> bool {
        matches!(self, Self::Header { filled: 0 })
    }
}

enum RecvProgress {
    More,
    HeaderFull,
    PayloadFull,
    Blocked,
    Eof,
    Fatal(io::Error),
}

/// Drain whatever reply bytes the socket has, retiring commands as their
/// replies complete.
pub(crate) fn run<S: RawSock>(conn: &mut Connection<S>) -> StepOutcome {
    if conn.is_dead() {
        return StepOutcome::Dead;
    }

    loop {
        let progress = match &mut conn.reply_cursor {
            ReplyCursor::Header { filled } => {
                match conn.sock.try_recv(&mut conn.reply_hdr[*filled..]) {
                    RecvStatus::Received(n) => {
                        *filled += n;
                        if *filled == SIMPLE_REPLY_LEN {
                            RecvProgress::HeaderFull
                        } else {
                            RecvProgress::More
                        }
                    },
                    RecvStatus::WouldBlock => RecvProgress::Blocked,
                    RecvStatus::Eof => RecvProgress::Eof,
                    RecvStatus::Fatal(e) => RecvProgress::Fatal(e),
                }
            },
            ReplyCursor::Payload { buf, filled, .. } => {
                let want = buf.len();
                match conn.sock.try_recv(&mut buf[*filled..want]) {
                    RecvStatus::Received(n) => {
                        *filled += n;
                        if *filled == want {
                            RecvProgress::PayloadFull
                        } else {
                            RecvProgress::More
                        }
                    },
                    RecvStatus::WouldBlock => RecvProgress::Blocked,
                    RecvStatus::Eof => RecvProgress::Eof,
                    RecvStatus::Fatal(e) => RecvProgress::Fatal(e),
                }
            },
        };

        match progress {
            RecvProgress::More => {},
            RecvProgress::Blocked => return StepOutcome::Paused,
            RecvProgress::Eof => return on_eof(conn),
            RecvProgress::Fatal(e) => {
                conn.die(anyhow!(e).context("receiving reply"));
                return StepOutcome::Dead;
            },
            RecvProgress::HeaderFull => {
                if let Some(outcome) = on_reply_header(conn) {
                    return outcome;
                }
            },
            RecvProgress::PayloadFull => {
                let cursor = mem::take(&mut conn.reply_cursor);
                if let ReplyCursor::Payload { handle, buf, .. } = cursor
                    && let Some(cmd) = conn.retire(handle)
                {
                    conn.complete(cmd, Ok(()), Some(buf.freeze()));
                }
            },
        }
    }
}

/// Decode the assembled header and decide what follows it.
///
/// Returns `Some` when the connection is finished for this entry (death);
/// `None` keeps the drain loop running.
fn on_reply_header<S: RawSock>(conn: &mut Connection<S>) -> Option<StepOutcome> {
    let (handle, error) = match SimpleReply::from_wire_bytes(&conn.reply_hdr) {
        Ok(reply) => (reply.handle.get(), reply.error.get()),
        Err(e) => {
            conn.die(e.context("decoding reply header"));
            return Some(StepOutcome::Dead);
        },
    };
    trace!(handle, error, "reply header received");

    let (kind, count) = match conn
        .cmds_in_flight
        .iter()
        .find(|c| c.handle == handle)
    {
        Some(cmd) => (cmd.kind, cmd.count),
        None => {
            conn.die(anyhow!("reply for unknown handle {handle}"));
            return Some(StepOutcome::Dead);
        },
    };

    if error == 0 && kind.expects_read_payload() && count > 0 {
        // The reply carries the data the command asked for; its length is
        // the request's count, not anything in the reply itself.
        let mut buf = BytesMut::with_capacity(count as usize);
        buf.resize(count as usize, 0);
        conn.reply_cursor = ReplyCursor::Payload {
            handle,
            buf,
            filled: 0,
        };
    } else {
        let status = if error == 0 {
            Ok(())
        } else {
            Err(CommandError::Server(error))
        };
        if let Some(cmd) = conn.retire(handle) {
            conn.complete(cmd, status, None);
        }
        conn.reply_cursor = ReplyCursor::default();
    }
    None
}

fn on_eof<S: RawSock>(conn: &mut Connection<S>) -> StepOutcome {
    let clean = conn.cmds_in_flight.is_empty()
        && conn.cmds_to_issue.is_empty()
        && conn.reply_cursor.is_blank()
        && conn.cursor.is_idle();
    if clean {
        debug!("peer closed the connection cleanly");
        conn.state = ConnState::Closed;
        StepOutcome::Ready
    } else {
        conn.die(anyhow!("unexpected EOF with commands outstanding"));
        StepOutcome::Dead
    }
}
