// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result, anyhow, ensure};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::{command::Retired, connection::Connection, stream::RawSock},
    models::{flags::CmdFlags, opcode::CmdType},
};

/// One command handed to a connection worker, with the channel its
/// completion travels back on.
struct Submission {
    kind: CmdType,
    flags: CmdFlags,
    offset: u64,
    count: u32,
    data: Option<Bytes>,
    done: oneshot::Sender<Result<Retired>>,
}

struct ConnSlot {
    tx: mpsc::Sender<Submission>,
    task: JoinHandle<()>,
}

/// A multi-connection handle to one export.
///
/// Owns several independent connections, each driven by its own task;
/// commands are routed round-robin, so per-connection FIFO ordering still
/// holds for commands routed to the same connection but nothing is
/// guaranteed across connections. The submission channel is the only
/// cross-connection synchronisation point.
pub struct Pool {
    conns: DashMap<u16, ConnSlot>,
    ids: Vec<u16>,
    next: AtomicUsize,
    cancel: CancellationToken,
}

impl Pool {
    /// Open `limits.max_connections` TCP connections and start a driver
    /// task for each.
    pub async fn connect_tcp(cfg: &Config) -> Result<Self> {
        ensure!(
            cfg.limits.max_connections >= 1,
            "limits.max_connections must be >= 1"
        );
        let cancel = CancellationToken::new();
        let conns = DashMap::new();
        let mut ids = Vec::with_capacity(cfg.limits.max_connections as usize);

        for id in 0..cfg.limits.max_connections {
            let conn = Connection::connect_tcp(cfg).await?;
            let (tx, rx) = mpsc::channel::<Submission>(32);
            let task = tokio::spawn(run_connection(
                conn,
                rx,
                cancel.child_token(),
                cfg.limits.max_in_flight,
            ));
            conns.insert(id, ConnSlot { tx, task });
            ids.push(id);
        }

        debug!(connections = ids.len(), "pool connected");
        Ok(Self {
            conns,
            ids,
            next: AtomicUsize::new(0),
            cancel,
        })
    }

    /// Read `count` bytes at `offset`.
    pub async fn pread(&self, count: u32, offset: u64) -> Result<Retired> {
        self.submit(CmdType::Read, CmdFlags::empty(), offset, count, None)
            .await
    }

    /// Write `data` at `offset`.
    pub async fn pwrite(
        &self,
        data: Bytes,
        offset: u64,
        flags: CmdFlags,
    ) -> Result<Retired> {
        let count = u32::try_from(data.len()).context("payload exceeds u32::MAX")?;
        self.submit(CmdType::Write, flags, offset, count, Some(data))
            .await
    }

    /// Flush the server's caches.
    pub async fn flush(&self) -> Result<Retired> {
        self.submit(CmdType::Flush, CmdFlags::empty(), 0, 0, None)
            .await
    }

    /// Discard `count` bytes at `offset`.
    pub async fn trim(&self, count: u32, offset: u64) -> Result<Retired> {
        self.submit(CmdType::Trim, CmdFlags::empty(), offset, count, None)
            .await
    }

    /// Zero `count` bytes at `offset` without sending data.
    pub async fn write_zeroes(
        &self,
        count: u32,
        offset: u64,
        flags: CmdFlags,
    ) -> Result<Retired> {
        self.submit(CmdType::WriteZeroes, flags, offset, count, None)
            .await
    }

    async fn submit(
        &self,
        kind: CmdType,
        flags: CmdFlags,
        offset: u64,
        count: u32,
        data: Option<Bytes>,
    ) -> Result<Retired> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.ids.len();
        let id = self.ids[slot];
        let tx = self
            .conns
            .get(&id)
            .map(|s| s.tx.clone())
            .with_context(|| format!("connection {id} is gone"))?;

        let (done, rx) = oneshot::channel();
        tx.send(Submission {
            kind,
            flags,
            offset,
            count,
            data,
            done,
        })
        .await
        .map_err(|_| anyhow!("connection {id} no longer accepts commands"))?;

        rx.await
            .map_err(|_| anyhow!("connection {id} dropped the command"))?
    }

    /// Ask every connection worker to stop. Queued commands come back
    /// cancelled; in-flight commands come back as lost.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for every worker task to exit.
    pub async fn join(&self) {
        for id in &self.ids {
            if let Some((_, slot)) = self.conns.remove(id) {
                drop(slot.tx);
                if let Err(e) = slot.task.await {
                    warn!("connection {id} task panicked: {e}");
                }
            }
        }
    }
}

/// Per-connection driver: the readiness loop from the outside world's
/// point of view. Single-threaded with respect to its connection, as the
/// engine requires; pipelining happens inside the connection, not here.
async fn run_connection<S: RawSock + 'static>(
    mut conn: Connection<S>,
    mut rx: mpsc::Receiver<Submission>,
    cancel: CancellationToken,
    max_in_flight: usize,
) {
    let mut waiters: HashMap<u64, oneshot::Sender<Result<Retired>>> = HashMap::new();
    let mut rx_open = true;

    loop {
        // Hand finished commands back to their submitters.
        let pending: Vec<u64> = waiters.keys().copied().collect();
        for handle in pending {
            if let Some(retired) = conn.take_completion(handle)
                && let Some(tx) = waiters.remove(&handle)
            {
                let _ = tx.send(Ok(retired));
            }
        }

        if conn.is_dead() || cancel.is_cancelled() {
            break;
        }
        if !rx_open && waiters.is_empty() && conn.live_commands() == 0 {
            break;
        }

        let interest = conn.poll_interest();
        let accepting =
            rx_open && !conn.is_closed() && conn.live_commands() < max_in_flight;

        tokio::select! {
            _ = cancel.cancelled() => {},
            sub = rx.recv(), if accepting => match sub {
                Some(sub) => {
                    let done = sub.done;
                    match conn.enqueue(
                        sub.kind, sub.flags, sub.offset, sub.count, sub.data,
                    ) {
                        Ok(handle) => {
                            waiters.insert(handle, done);
                        },
                        Err(e) => {
                            let _ = done.send(Err(e));
                        },
                    }
                },
                None => rx_open = false,
            },
            res = conn.process(), if !interest.is_empty() => {
                if let Err(e) = res {
                    debug!("connection process failed: {e:#}");
                }
            },
        }
    }

    // Sweep: cancel anything that never reached the wire and fail the
    // waiters we cannot satisfy any more.
    conn.shutdown();
    let pending: Vec<u64> = waiters.keys().copied().collect();
    for handle in pending {
        if let Some(tx) = waiters.remove(&handle) {
            let outcome = match conn.take_completion(handle) {
                Some(retired) => Ok(retired),
                None => Err(anyhow!("connection shut down before completion")),
            };
            let _ = tx.send(outcome);
        }
    }
}
