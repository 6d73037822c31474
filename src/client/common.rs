// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use bitflags::bitflags;

bitflags! {
    /// Directional interest reported by the connection's advisor.
    ///
    /// Drives the caller's readiness-polling loop: wait for the reported
    /// directions, then invoke `notify_read` when readable and step the
    /// issue machine when writable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Direction: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Outcome of a single non-blocking send attempt.
#[derive(Debug)]
pub enum SendStatus {
    /// `n` bytes were accepted by the kernel.
    Sent(usize),
    /// The socket buffer is full; try again on the next writable event.
    WouldBlock,
    /// The connection is unusable (reset, broken pipe, ...).
    Fatal(io::Error),
}

/// Outcome of a single non-blocking receive attempt.
#[derive(Debug)]
pub enum RecvStatus {
    /// `n` bytes were read into the buffer.
    Received(usize),
    /// No bytes available; try again on the next readable event.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
    /// The connection is unusable.
    Fatal(io::Error),
}

/// What a state-machine entry point did with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The machine ran to completion and the connection is idle again.
    Ready,
    /// The socket had nothing more to give or take; any partial frame's
    /// byte cursor is parked and the next readiness event resumes at the
    /// exact byte.
    Paused,
    /// A fatal error killed the connection.
    Dead,
}
