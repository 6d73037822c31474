// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Helpers for encoding / decoding the 16-bit **type** field of an NBD
//! transmission request.
//!
//! The field layout is defined by the NBD protocol specification
//! (transmission phase):
//!
//! ```text
//! offset  size  field
//!   0      4    magic = 0x25609513
//!   4      2    command flags
//!   6      2    type            ← this module
//!   8      8    handle
//!  16      8    offset
//!  24      4    count
//! ```
//!
//! Only `WRITE` is followed by an inline payload of `count` bytes;
//! every other command consists of the bare 28-byte header.

use std::convert::TryFrom;

use thiserror::Error;

/// All transmission-phase command types understood by this client.
#[repr(u16)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdType {
    #[default]
    Read = 0,
    Write = 1,
    Disc = 2,
    Flush = 3,
    Trim = 4,
    Cache = 5,
    WriteZeroes = 6,
    BlockStatus = 7,
}

impl CmdType {
    #[inline]
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Disc,
            3 => Self::Flush,
            4 => Self::Trim,
            5 => Self::Cache,
            6 => Self::WriteZeroes,
            7 => Self::BlockStatus,
            _ => return None,
        })
    }

    /// Whether `count` bytes of caller data follow the request header on
    /// the wire.
    #[inline]
    pub fn has_write_payload(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Whether a successful reply carries `count` bytes of data back.
    #[inline]
    pub fn expects_read_payload(self) -> bool {
        matches!(self, Self::Read)
    }
}

/// Returned when the type field contains an undefined command.
#[derive(Debug, Error)]
#[error("invalid command type: 0x{0:04x}")]
pub struct UnknownCmdType(pub u16);

impl TryFrom<u16> for CmdType {
    type Error = UnknownCmdType;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Self::from_u16(v).ok_or(UnknownCmdType(v))
    }
}
