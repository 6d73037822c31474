// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bitflags::bitflags;

bitflags! {
    /// Per-command flag bits carried in the request header.
    ///
    /// Which bits a server honours depends on the transmission flags it
    /// advertised during the handshake; the engine transmits whatever the
    /// caller sets and leaves policy to the layer above.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdFlags: u16 {
        /// Force unit access: do not complete until the data is durable.
        const FUA = 1 << 0;
        /// `WRITE_ZEROES`: punching a hole is not acceptable.
        const NO_HOLE = 1 << 1;
        /// `READ`: do not fragment the reply.
        const DF = 1 << 2;
        /// `BLOCK_STATUS`: a single extent in the reply is enough.
        const REQ_ONE = 1 << 3;
        /// `WRITE_ZEROES`: fail unless zeroing is fast.
        const FAST_ZERO = 1 << 4;
    }
}
