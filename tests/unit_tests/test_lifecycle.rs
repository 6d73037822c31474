// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use nbd_client_rs::{
    client::{
        command::CommandError,
        common::{Direction, StepOutcome},
        connection::Connection,
    },
    models::{
        common::{REQUEST_LEN, SIMPLE_REPLY_LEN, WireFrame},
        flags::CmdFlags,
        opcode::CmdType,
        reply::SimpleReply,
        request::RequestHeader,
    },
};

use super::mock::{MockSock, RecvStep};

/// Properties 4 and 5: handles are unique and monotonic, and headers hit
/// the wire in enqueue order.
#[test]
fn handles_are_monotonic_and_fifo_on_the_wire() -> Result<()> {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    let h1 = conn.pread(512, 0)?;
    let h2 = conn.flush()?;
    let h3 = conn.trim(4096, 8192)?;
    assert_eq!((h1, h2, h3), (1, 2, 3));

    for _ in 0..3 {
        assert_eq!(conn.step_issue(), StepOutcome::Ready);
    }

    let sent = conn.socket().sent.clone();
    assert_eq!(sent.len(), 3 * REQUEST_LEN);

    let expected = [
        (1u64, CmdType::Read, 0u64, 512u32),
        (2, CmdType::Flush, 0, 0),
        (3, CmdType::Trim, 8192, 4096),
    ];
    for (i, (handle, kind, offset, count)) in expected.into_iter().enumerate() {
        let hdr =
            RequestHeader::from_wire_bytes(&sent[i * REQUEST_LEN..(i + 1) * REQUEST_LEN])?;
        assert_eq!(hdr.handle.get(), handle);
        assert_eq!(hdr.kind_known(), Some(kind));
        assert_eq!(hdr.offset.get(), offset);
        assert_eq!(hdr.count.get(), count);
    }

    Ok(())
}

/// Property 3: every command is in exactly one of to-issue, in-flight,
/// or retired at each observable step.
#[test]
fn commands_partition_across_queues() -> Result<()> {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    for i in 0..4u64 {
        conn.pread(512, i * 512)?;
    }
    assert_eq!((conn.queued_count(), conn.in_flight_count()), (4, 0));

    for step in 1..=4usize {
        assert_eq!(conn.step_issue(), StepOutcome::Ready);
        assert_eq!(conn.queued_count(), 4 - step);
        assert_eq!(conn.in_flight_count(), step);
    }

    // Retire one: it leaves in-flight the moment its reply completes.
    let mut reply = [0u8; SIMPLE_REPLY_LEN];
    SimpleReply::new(0, 2).to_wire_bytes(&mut reply)?;
    let mut incoming = reply.to_vec();
    incoming.extend_from_slice(&[0u8; 512]);
    conn.socket_mut().feed(RecvStep::Chunk(incoming));

    assert_eq!(conn.notify_read(), StepOutcome::Paused);
    assert_eq!(conn.in_flight_count(), 3);
    assert!(conn.take_completion(2).is_some());
    assert!(conn.take_completion(2).is_none());

    Ok(())
}

#[test]
fn enqueue_validation_rejects_bad_commands() {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    // WRITE without a payload.
    assert!(
        conn.enqueue(CmdType::Write, CmdFlags::empty(), 0, 8, None)
            .is_err()
    );
    // Payload length disagreeing with count.
    assert!(
        conn.enqueue(
            CmdType::Write,
            CmdFlags::empty(),
            0,
            8,
            Some(Bytes::from_static(b"xy")),
        )
        .is_err()
    );
    // Data on a command that sends none.
    assert!(
        conn.enqueue(
            CmdType::Read,
            CmdFlags::empty(),
            0,
            2,
            Some(Bytes::from_static(b"xy")),
        )
        .is_err()
    );
    // Nothing slipped into the queue.
    assert_eq!(conn.queued_count(), 0);
}

#[test]
fn shutdown_cancels_unshipped_commands() -> Result<()> {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    let h1 = conn.pread(512, 0)?;
    let h2 = conn.flush()?;
    conn.shutdown();

    assert!(conn.is_closed());
    assert_eq!(conn.queued_count(), 0);
    assert_eq!(conn.direction(), Direction::empty());

    for h in [h1, h2] {
        let retired = conn.take_completion(h).expect("cancelled completion");
        assert_eq!(retired.status, Err(CommandError::Cancelled));
    }

    // A closed handle refuses new work.
    assert!(conn.pread(512, 0).is_err());
    Ok(())
}

#[test]
fn shutdown_lets_in_flight_replies_drain() -> Result<()> {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    let inflight = conn.pread(16, 0)?;
    assert_eq!(conn.step_issue(), StepOutcome::Ready);

    let queued = conn.pread(16, 16)?;
    conn.shutdown();

    assert_eq!(
        conn.take_completion(queued).map(|r| r.status),
        Some(Err(CommandError::Cancelled))
    );
    // The in-flight command still wants its reply.
    assert_eq!(conn.direction(), Direction::READ);

    let mut reply = [0u8; SIMPLE_REPLY_LEN];
    SimpleReply::new(0, inflight).to_wire_bytes(&mut reply)?;
    let mut incoming = reply.to_vec();
    incoming.extend_from_slice(&[0xaau8; 16]);
    conn.socket_mut().feed(RecvStep::Chunk(incoming));

    assert_eq!(conn.notify_read(), StepOutcome::Paused);
    let retired = conn.take_completion(inflight).expect("drained completion");
    assert!(retired.is_ok());
    assert_eq!(conn.in_flight_count(), 0);
    assert_eq!(conn.direction(), Direction::empty());

    Ok(())
}

#[test]
fn dead_connection_surfaces_in_flight_as_lost() -> Result<()> {
    let mut conn = Connection::with_default_tuning(MockSock::new());

    let inflight = conn.pread(512, 0)?;
    assert_eq!(conn.step_issue(), StepOutcome::Ready);

    // The peer vanishes mid-stream.
    conn.socket_mut().feed(RecvStep::Eof);
    assert_eq!(conn.notify_read(), StepOutcome::Dead);
    assert!(conn.is_dead());

    let retired = conn.take_completion(inflight).expect("lost completion");
    assert_eq!(retired.status, Err(CommandError::ConnectionLost));

    assert!(conn.pread(512, 0).is_err());
    Ok(())
}
