// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use thiserror::Error;

use crate::models::{flags::CmdFlags, opcode::CmdType};

/// One queued or in-flight command.
///
/// Lives in exactly one of the connection's two queues at any time: the
/// to-issue FIFO from enqueue until its last byte hits the wire, then the
/// in-flight set until the reply path retires it. The handle is unique
/// within the connection and never reused.
#[derive(Debug, Clone)]
pub struct Command {
    pub handle: u64,
    pub kind: CmdType,
    pub flags: CmdFlags,
    pub offset: u64,
    pub count: u32,
    /// `WRITE` payload, shared read-only with the caller until retirement.
    pub data: Option<Bytes>,
}

/// Why a command failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("server failed the request: errno {0}")]
    Server(u32),
    #[error("connection lost before the reply arrived")]
    ConnectionLost,
    #[error("command cancelled before transmission")]
    Cancelled,
}

/// A command after the reply path (or a shutdown/death sweep) finished
/// with it.
#[derive(Debug, Clone)]
pub struct Retired {
    pub handle: u64,
    pub kind: CmdType,
    pub offset: u64,
    pub count: u32,
    pub status: Result<(), CommandError>,
    /// Data returned by the server (`READ` only).
    pub data: Option<Bytes>,
}

impl Retired {
    pub(crate) fn from_command(
        cmd: Command,
        status: Result<(), CommandError>,
        data: Option<Bytes>,
    ) -> Self {
        Self {
            handle: cmd.handle,
            kind: cmd.kind,
            offset: cmd.offset,
            count: cmd.count,
            status,
            data,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}
