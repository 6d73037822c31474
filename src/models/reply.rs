// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::common::{SIMPLE_REPLY_LEN, WireFrame};

/// Magic leading every simple reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

/// Header of a simple reply PDU.
///
/// The server echoes the handle of the originating request; `error` is an
/// errno-style status, zero on success. For a successful `READ` the header
/// is followed by `count` bytes of data, where `count` comes from the
/// request (the reply itself carries no length).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SimpleReply {
    pub magic: U32<BigEndian>,  // 0..4
    pub error: U32<BigEndian>,  // 4..8
    pub handle: U64<BigEndian>, // 8..16
}

impl SimpleReply {
    pub fn new(error: u32, handle: u64) -> Self {
        Self {
            magic: U32::new(SIMPLE_REPLY_MAGIC),
            error: U32::new(error),
            handle: U64::new(handle),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.get() == 0
    }
}

impl WireFrame for SimpleReply {
    const LEN: usize = SIMPLE_REPLY_LEN;

    fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != SIMPLE_REPLY_LEN {
            bail!(
                "buffer length must be {SIMPLE_REPLY_LEN}, got {}",
                buf.len()
            );
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    fn from_wire_bytes(buf: &[u8]) -> Result<&Self> {
        let hdr = <Self as ZFromBytes>::ref_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer to SimpleReply: {e}"))?;
        if hdr.magic.get() != SIMPLE_REPLY_MAGIC {
            bail!("SimpleReply: invalid magic 0x{:08x}", hdr.magic.get());
        }
        Ok(hdr)
    }
}
