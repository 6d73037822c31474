// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nbd_client_rs::{
    client::{command::CommandError, common::StepOutcome, connection::Connection},
    models::{
        common::{SIMPLE_REPLY_LEN, WireFrame},
        reply::SimpleReply,
    },
};

use super::mock::{MockSock, RecvStep};

fn reply_bytes(error: u32, handle: u64) -> Vec<u8> {
    let mut buf = [0u8; SIMPLE_REPLY_LEN];
    SimpleReply::new(error, handle)
        .to_wire_bytes(&mut buf)
        .expect("encode reply");
    buf.to_vec()
}

/// Puts one READ of `count` bytes in flight on a fresh connection.
fn conn_with_read_in_flight(count: u32) -> (Connection<MockSock>, u64) {
    let mut conn = Connection::with_default_tuning(MockSock::new());
    let handle = conn.pread(count, 0).expect("enqueue read");
    assert_eq!(conn.step_issue(), StepOutcome::Ready);
    (conn, handle)
}

#[test]
fn reply_header_survives_split_arrival() -> Result<()> {
    let (mut conn, handle) = conn_with_read_in_flight(16);

    let mut frame = reply_bytes(0, handle);
    frame.extend_from_slice(&[0x77u8; 16]);

    let tail = frame.split_off(8);
    conn.socket_mut().feed(RecvStep::Chunk(frame));
    conn.socket_mut().feed(RecvStep::Block);

    assert_eq!(conn.notify_read(), StepOutcome::Paused);
    assert!(conn.take_completion(handle).is_none());
    assert_eq!(conn.in_flight_count(), 1);

    conn.socket_mut().feed(RecvStep::Chunk(tail));
    assert_eq!(conn.notify_read(), StepOutcome::Paused);

    let retired = conn.take_completion(handle).expect("completion");
    assert!(retired.is_ok());
    assert_eq!(retired.data.as_deref(), Some(&[0x77u8; 16][..]));

    Ok(())
}

#[test]
fn read_payload_reassembles_from_pieces() -> Result<()> {
    let (mut conn, handle) = conn_with_read_in_flight(12);

    conn.socket_mut().feed(RecvStep::Chunk(reply_bytes(0, handle)));
    conn.socket_mut().feed(RecvStep::Chunk(b"hell".to_vec()));
    conn.socket_mut().feed(RecvStep::Block);
    conn.socket_mut().feed(RecvStep::Chunk(b"o, world".to_vec()));

    // First pass stalls mid-payload; the command stays in flight.
    assert_eq!(conn.notify_read(), StepOutcome::Paused);
    assert_eq!(conn.in_flight_count(), 1);

    assert_eq!(conn.notify_read(), StepOutcome::Paused);
    let retired = conn.take_completion(handle).expect("completion");
    assert_eq!(retired.data.as_deref(), Some(&b"hello, world"[..]));

    Ok(())
}

#[test]
fn server_errno_surfaces_without_payload() -> Result<()> {
    let (mut conn, handle) = conn_with_read_in_flight(512);

    // EIO: the server sends no data after a failed READ.
    conn.socket_mut().feed(RecvStep::Chunk(reply_bytes(5, handle)));

    assert_eq!(conn.notify_read(), StepOutcome::Paused);
    let retired = conn.take_completion(handle).expect("completion");
    assert_eq!(retired.status, Err(CommandError::Server(5)));
    assert!(retired.data.is_none());
    assert_eq!(conn.in_flight_count(), 0);

    Ok(())
}

#[test]
fn flush_reply_carries_no_data() -> Result<()> {
    let mut conn = Connection::with_default_tuning(MockSock::new());
    let handle = conn.flush()?;
    assert_eq!(conn.step_issue(), StepOutcome::Ready);

    conn.socket_mut().feed(RecvStep::Chunk(reply_bytes(0, handle)));
    assert_eq!(conn.notify_read(), StepOutcome::Paused);

    let retired = conn.take_completion(handle).expect("completion");
    assert!(retired.is_ok());
    assert!(retired.data.is_none());

    Ok(())
}

#[test]
fn unknown_handle_kills_connection() {
    let (mut conn, handle) = conn_with_read_in_flight(512);

    conn.socket_mut().feed(RecvStep::Chunk(reply_bytes(0, 99)));
    assert_eq!(conn.notify_read(), StepOutcome::Dead);
    assert!(conn.is_dead());

    let retired = conn.take_completion(handle).expect("lost completion");
    assert_eq!(retired.status, Err(CommandError::ConnectionLost));
}

#[test]
fn bad_reply_magic_kills_connection() {
    let (mut conn, _) = conn_with_read_in_flight(512);

    conn.socket_mut().feed(RecvStep::Chunk(vec![0u8; SIMPLE_REPLY_LEN]));
    assert_eq!(conn.notify_read(), StepOutcome::Dead);
    assert!(conn.is_dead());
    assert!(conn.last_error().is_some());
}

#[test]
fn clean_eof_closes_idle_connection() {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    conn.socket_mut().feed(RecvStep::Eof);
    assert_eq!(conn.notify_read(), StepOutcome::Ready);
    assert!(conn.is_closed());
    assert!(!conn.is_dead());

    assert!(conn.pread(512, 0).is_err());
}

#[test]
fn eof_mid_reply_kills_connection() {
    let (mut conn, handle) = conn_with_read_in_flight(16);

    // Header arrives, then the stream dies before the payload.
    conn.socket_mut().feed(RecvStep::Chunk(reply_bytes(0, handle)));
    conn.socket_mut().feed(RecvStep::Eof);

    assert_eq!(conn.notify_read(), StepOutcome::Dead);
    assert!(conn.is_dead());
}
