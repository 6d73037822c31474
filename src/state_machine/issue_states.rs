// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! State machine for issuing command requests to the server.
//!
//! The machine frames the head of the to-issue queue onto the socket:
//! a 28-byte big-endian header, then (for `WRITE`) the inline payload.
//! Sends are non-blocking, so either phase can stop mid-buffer; the
//! `Pause*` states park the byte cursor and hand the socket to the reply
//! path, and the next writable event re-enters through `Start`, which
//! resumes the paused buffer at the exact next byte. Without that hand-off
//! a large partial write could deadlock against a peer whose TCP window
//! stays closed until we consume its replies.

use anyhow::anyhow;
use tracing::trace;
use zerocopy::IntoBytes;

use crate::{
    client::{
        common::StepOutcome,
        connection::{ConnState, Connection, FlushOutcome, WriteCursor},
        stream::RawSock,
    },
    state_machine::common::Transition,
};

/// States of the issue machine.
///
/// Only `Start` is ever parked in the connection between entries; the
/// remaining states are transient within a single `step_issue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStates {
    /// Pick the next to-issue command and prepare its header, or resume
    /// a paused send without touching the header.
    Start,
    /// Drain header bytes to the socket.
    SendRequest,
    /// Header partially written; yield to the reply path.
    PauseSendRequest,
    /// Header fully sent; set up the payload drain if the command has one.
    PrepareWritePayload,
    /// Drain payload bytes to the socket.
    SendWritePayload,
    /// Payload partially written; yield to the reply path.
    PauseWritePayload,
    /// Move the head command from to-issue to in-flight.
    Finish,
}

type IssueStep = Transition<IssueStates, StepOutcome>;

impl IssueStates {
    fn step<S: RawSock>(self, conn: &mut Connection<S>) -> IssueStep {
        match self {
            Self::Start => start(conn),
            Self::SendRequest => send_request(conn),
            Self::PauseSendRequest => pause_send_request(conn),
            Self::PrepareWritePayload => prepare_write_payload(conn),
            Self::SendWritePayload => send_write_payload(conn),
            Self::PauseWritePayload => pause_write_payload(conn),
            Self::Finish => finish(conn),
        }
    }
}

/// Run the issue machine until it parks or returns to ready.
pub(crate) fn run<S: RawSock>(conn: &mut Connection<S>) -> StepOutcome {
    let mut state = match conn.state {
        ConnState::Dead => return StepOutcome::Dead,
        ConnState::Closed => return StepOutcome::Ready,
        ConnState::Ready => {
            if conn.cmds_to_issue.is_empty() {
                return StepOutcome::Ready;
            }
            IssueStates::Start
        },
        ConnState::Issue(parked) => parked,
    };

    loop {
        match state.step(conn) {
            Transition::Next(next) => state = next,
            Transition::Yield(parked, outcome) => {
                conn.state = ConnState::Issue(parked);
                return outcome;
            },
            Transition::Done(outcome) => {
                if !matches!(conn.state, ConnState::Dead | ConnState::Closed) {
                    conn.state = ConnState::Ready;
                }
                return outcome;
            },
        }
    }
}

fn start<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    // Were we interrupted by reading a reply to an earlier command?
    // Resume the paused buffer; the header must not be rewritten while
    // any of its bytes (or the payload after it) are still owed.
    match conn.cursor {
        WriteCursor::Header { .. } => {
            return Transition::Next(IssueStates::SendRequest);
        },
        WriteCursor::Payload { .. } => {
            return Transition::Next(IssueStates::SendWritePayload);
        },
        WriteCursor::Idle => {},
    }

    let (flags, kind, handle, offset, count) = match conn.cmds_to_issue.front() {
        Some(cmd) => (cmd.flags, cmd.kind, cmd.handle, cmd.offset, cmd.count),
        None => return Transition::Done(StepOutcome::Ready),
    };
    let queued_behind = conn.cmds_to_issue.len() > 1;

    conn.request.fill(flags, kind, handle, offset, count);
    conn.cursor = WriteCursor::Header { sent: 0 };
    // Let the kernel coalesce the header with what follows it: the
    // payload of a WRITE, or the next queued command's header.
    conn.more_hint = kind.has_write_payload() || queued_behind;

    trace!(
        handle,
        header = %hex::encode(conn.request.as_bytes()),
        "issue header prepared"
    );
    Transition::Next(IssueStates::SendRequest)
}

fn send_request<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    match conn.flush_wbuf() {
        FlushOutcome::Drained => Transition::Next(IssueStates::PrepareWritePayload),
        FlushOutcome::Pending => Transition::Next(IssueStates::PauseSendRequest),
        FlushOutcome::Failed(e) => {
            conn.die(anyhow!(e).context("sending request header"));
            Transition::Done(StepOutcome::Dead)
        },
    }
}

fn pause_send_request<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    debug_assert!(matches!(conn.cursor, WriteCursor::Header { .. }));
    debug_assert!(!conn.cmds_to_issue.is_empty());
    // The reply path may now run on the socket; the parked Start state
    // resumes the header cursor on the next writable event.
    Transition::Yield(IssueStates::Start, StepOutcome::Paused)
}

fn prepare_write_payload<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    let (has_payload, count) = match conn.cmds_to_issue.front() {
        Some(cmd) => {
            debug_assert_eq!(cmd.handle, conn.request.handle.get());
            (cmd.kind.has_write_payload(), cmd.count)
        },
        None => return Transition::Done(StepOutcome::Ready),
    };

    if has_payload {
        let queued_behind = conn.cmds_to_issue.len() > 1;
        conn.cursor = WriteCursor::Payload { sent: 0 };
        // Small payloads coalesce with the next header; large ones should
        // flush immediately, so the hint stays off for them.
        conn.more_hint = queued_behind && (count as usize) < conn.coalesce_limit;
        Transition::Next(IssueStates::SendWritePayload)
    } else {
        Transition::Next(IssueStates::Finish)
    }
}

fn send_write_payload<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    match conn.flush_wbuf() {
        FlushOutcome::Drained => Transition::Next(IssueStates::Finish),
        FlushOutcome::Pending => Transition::Next(IssueStates::PauseWritePayload),
        FlushOutcome::Failed(e) => {
            conn.die(anyhow!(e).context("sending write payload"));
            Transition::Done(StepOutcome::Dead)
        },
    }
}

fn pause_write_payload<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    debug_assert!(matches!(conn.cursor, WriteCursor::Payload { .. }));
    debug_assert!(!conn.cmds_to_issue.is_empty());
    Transition::Yield(IssueStates::Start, StepOutcome::Paused)
}

fn finish<S: RawSock>(conn: &mut Connection<S>) -> IssueStep {
    debug_assert!(conn.cursor.is_idle());
    let Some(cmd) = conn.cmds_to_issue.pop_front() else {
        return Transition::Done(StepOutcome::Ready);
    };
    debug_assert_eq!(cmd.handle, conn.request.handle.get());
    trace!(handle = cmd.handle, "command in flight");
    conn.cmds_in_flight.push(cmd);
    Transition::Done(StepOutcome::Ready)
}
