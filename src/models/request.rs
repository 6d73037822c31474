// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
    U64,
};

use crate::models::{
    common::{REQUEST_LEN, WireFrame},
    flags::CmdFlags,
    opcode::CmdType,
};

/// Magic leading every transmission request.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;

/// Header of a transmission request PDU.
///
/// One instance is owned by each connection and refilled in place for
/// every outgoing command; only one request header is ever on the wire
/// at a time per connection, so a single reusable buffer suffices. While
/// a send of this header (or of the payload that follows it) is partial,
/// the struct is frozen: rewriting it mid-send corrupts the stream.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RequestHeader {
    pub magic: U32<BigEndian>,  // 0..4
    pub flags: U16<BigEndian>,  // 4..6
    pub kind: U16<BigEndian>,   // 6..8
    pub handle: U64<BigEndian>, // 8..16
    pub offset: U64<BigEndian>, // 16..24
    pub count: U32<BigEndian>,  // 24..28
}

impl RequestHeader {
    /// Rewrite every field for the next command to go on the wire.
    pub fn fill(
        &mut self,
        flags: CmdFlags,
        kind: CmdType,
        handle: u64,
        offset: u64,
        count: u32,
    ) {
        self.magic.set(REQUEST_MAGIC);
        self.flags.set(flags.bits());
        self.kind.set(kind as u16);
        self.handle.set(handle);
        self.offset.set(offset);
        self.count.set(count);
    }

    /// Decoded command type, if the field holds a known value.
    pub fn kind_known(&self) -> Option<CmdType> {
        CmdType::from_u16(self.kind.get())
    }
}

impl WireFrame for RequestHeader {
    const LEN: usize = REQUEST_LEN;

    fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != REQUEST_LEN {
            bail!("buffer length must be {REQUEST_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    fn from_wire_bytes(buf: &[u8]) -> Result<&Self> {
        let hdr = <Self as ZFromBytes>::ref_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer to RequestHeader: {e}"))?;
        if hdr.magic.get() != REQUEST_MAGIC {
            bail!("RequestHeader: invalid magic 0x{:08x}", hdr.magic.get());
        }
        Ok(hdr)
    }
}
