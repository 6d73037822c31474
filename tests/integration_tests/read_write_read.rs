// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bytes::Bytes;
use nbd_client_rs::{client::connection::Connection, models::flags::CmdFlags};
use serial_test::serial;

use super::common::{spawn_ramdisk_server, test_config, with_timeout};

/// Drives a single connection by hand through its readiness loop:
/// write a block, read it back, verify the bytes.
#[tokio::test]
#[serial]
async fn single_connection_write_then_read() -> Result<()> {
    let server = spawn_ramdisk_server(1 << 20).await?;
    let cfg = test_config(server.addr, 1)?;
    let mut conn = Connection::connect_tcp(&cfg).await?;

    let payload = Bytes::from(vec![0xabu8; 4096]);
    let w = conn.pwrite(payload.clone(), 8192, CmdFlags::empty())?;
    let r = conn.pread(4096, 8192)?;

    let (w_done, r_done) = with_timeout(async {
        let mut w_done = None;
        let mut r_done = None;
        while w_done.is_none() || r_done.is_none() {
            if conn.is_dead() {
                bail!("connection died: {:?}", conn.last_error());
            }
            conn.process().await?;
            if w_done.is_none() {
                w_done = conn.take_completion(w);
            }
            if r_done.is_none() {
                r_done = conn.take_completion(r);
            }
        }
        Ok((w_done, r_done))
    })
    .await?;

    let w_done = w_done.expect("write completion");
    let r_done = r_done.expect("read completion");
    assert!(w_done.is_ok());
    assert!(r_done.is_ok());
    assert_eq!(r_done.data.as_deref(), Some(&payload[..]));

    assert_eq!(conn.live_commands(), 0);
    Ok(())
}

/// Flush and trim complete alongside data commands on one connection.
#[tokio::test]
#[serial]
async fn mixed_commands_complete() -> Result<()> {
    let server = spawn_ramdisk_server(1 << 20).await?;
    let cfg = test_config(server.addr, 1)?;
    let mut conn = Connection::connect_tcp(&cfg).await?;

    let payload = Bytes::from(vec![0x11u8; 1024]);
    let handles = vec![
        conn.pwrite(payload, 0, CmdFlags::FUA)?,
        conn.flush()?,
        conn.trim(1024, 0)?,
        conn.pread(1024, 0)?,
    ];

    let retired = with_timeout(async {
        let mut retired = Vec::new();
        let mut pending = handles.clone();
        while !pending.is_empty() {
            if conn.is_dead() {
                bail!("connection died: {:?}", conn.last_error());
            }
            conn.process().await?;
            pending.retain(|h| match conn.take_completion(*h) {
                Some(done) => {
                    retired.push(done);
                    false
                },
                None => true,
            });
        }
        Ok(retired)
    })
    .await?;

    assert_eq!(retired.len(), 4);
    assert!(retired.iter().all(|r| r.is_ok()));

    // The trim preceded the read in FIFO order, so the read sees zeroes.
    let read = retired
        .iter()
        .find(|r| r.handle == handles[3])
        .expect("read result");
    assert_eq!(read.data.as_deref(), Some(&vec![0u8; 1024][..]));

    Ok(())
}
