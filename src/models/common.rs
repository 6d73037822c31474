// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

/// Size of a transmission request header on the wire.
pub const REQUEST_LEN: usize = 28;

/// Size of a simple reply header on the wire.
pub const SIMPLE_REPLY_LEN: usize = 16;

/// Common functionality for the fixed-size transmission-phase frames.
///
/// Both headers this client speaks (the 28-byte request and the 16-byte
/// simple reply) are plain big-endian structs with a leading magic; this
/// trait lets generic helpers (the connection scratch buffers, the test
/// harness) encode and borrow them without knowing the concrete frame
/// type. Implementations validate the magic on the borrow path.
pub trait WireFrame: Sized {
    /// Exact size of the frame on the wire.
    const LEN: usize;

    /// Serialize the frame into `buf`, which must be exactly [`Self::LEN`]
    /// bytes long.
    fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()>;

    /// Borrow a frame view over `buf`, validating length and magic.
    fn from_wire_bytes(buf: &[u8]) -> Result<&Self>;
}
