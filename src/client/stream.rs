// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use tokio::{
    io::Interest,
    net::{TcpStream, UnixStream},
};

use crate::client::common::{Direction, RecvStatus, SendStatus};

/// Non-blocking socket surface the connection engine runs against.
///
/// `try_send`/`try_recv` must never block: they either move bytes, report
/// would-block, or report a fatal error. Interrupted calls are retried
/// internally so the state machines never see `EINTR`. `wait` parks the
/// caller until the socket is ready in at least one of the requested
/// directions.
///
/// The `more` argument to `try_send` is an advisory "more data follows"
/// hint. Real sockets may ignore it; test harnesses observe it.
pub trait RawSock: Send {
    fn try_send(&mut self, buf: &[u8], more: bool) -> SendStatus;

    fn try_recv(&mut self, buf: &mut [u8]) -> RecvStatus;

    fn wait(
        &mut self,
        interest: Direction,
    ) -> impl Future<Output = io::Result<Direction>> + Send;
}

fn to_interest(dir: Direction) -> Interest {
    match (dir.contains(Direction::READ), dir.contains(Direction::WRITE)) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        _ => Interest::WRITABLE,
    }
}

macro_rules! impl_raw_sock {
    ($stream:ty) => {
        impl RawSock for $stream {
            fn try_send(&mut self, buf: &[u8], _more: bool) -> SendStatus {
                loop {
                    return match self.try_write(buf) {
                        Ok(0) if !buf.is_empty() => SendStatus::WouldBlock,
                        Ok(n) => SendStatus::Sent(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            SendStatus::WouldBlock
                        },
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => SendStatus::Fatal(e),
                    };
                }
            }

            fn try_recv(&mut self, buf: &mut [u8]) -> RecvStatus {
                loop {
                    return match self.try_read(buf) {
                        Ok(0) if !buf.is_empty() => RecvStatus::Eof,
                        Ok(n) => RecvStatus::Received(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            RecvStatus::WouldBlock
                        },
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => RecvStatus::Fatal(e),
                    };
                }
            }

            fn wait(
                &mut self,
                interest: Direction,
            ) -> impl Future<Output = io::Result<Direction>> + Send {
                async move {
                    if interest.is_empty() {
                        return Ok(Direction::empty());
                    }
                    let ready = self.ready(to_interest(interest)).await?;
                    let mut out = Direction::empty();
                    if ready.is_readable() {
                        out |= Direction::READ;
                    }
                    if ready.is_writable() {
                        out |= Direction::WRITE;
                    }
                    Ok(out)
                }
            }
        }
    };
}

impl_raw_sock!(TcpStream);
impl_raw_sock!(UnixStream);
