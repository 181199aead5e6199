//! Per-socket connection driver.
//!
//! Each accepted socket gets two tasks: a reader running the framed request
//! loop, and a writer draining a FIFO reply queue (at most one write in
//! flight; order equals enqueue order). Reads and writes share no buffers,
//! so a large reply never stalls request intake.
//!
//! The idle timer spans one full frame: it arms when the connection starts
//! waiting for a header and is cancelled once the body has arrived. A
//! heartbeat (`body_len == 0`) completes the frame immediately and re-arms
//! the timer on the next iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{trace, warn};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, watch};

use crate::error::RpcError;
use crate::router::Router;
use crate::wire::{self, RpcMsg};

/// Shared handle on one accepted connection.
///
/// Jointly owned by the registry and the connection's tasks; the reaper
/// removes the registry's clone once `closed` is observed, and the state is
/// freed when the last owner drops.
pub(crate) struct Connection {
    id: u64,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl Connection {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
    }
}

/// Start the reader and writer tasks for an accepted socket and return the
/// shared handle for the registry.
pub(crate) fn spawn(
    id: u64,
    stream: TcpStream,
    router: Arc<Router>,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Arc<Connection> {
    let conn = Arc::new(Connection {
        id,
        closed: AtomicBool::new(false),
        closed_notify: Notify::new(),
    });

    let (read_half, write_half) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<RpcMsg>();

    let writer_conn = Arc::clone(&conn);
    tokio::spawn(async move {
        write_loop(&writer_conn, write_half, reply_rx).await;
    });

    let reader_conn = Arc::clone(&conn);
    tokio::spawn(async move {
        read_loop(
            &reader_conn,
            read_half,
            reply_tx,
            router,
            idle_timeout,
            shutdown,
        )
        .await;
        reader_conn.mark_closed();
        trace!("connection {}: closed", reader_conn.id());
    });

    conn
}

/// Read one full frame, bounded by the idle timer when enabled.
async fn read_one(
    reader: &mut BufReader<OwnedReadHalf>,
    idle_timeout: Duration,
) -> crate::error::Result<RpcMsg> {
    if idle_timeout.is_zero() {
        return wire::read_msg(reader).await;
    }
    match tokio::time::timeout(idle_timeout, wire::read_msg(reader)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    }
}

async fn read_loop(
    conn: &Connection,
    read_half: OwnedReadHalf,
    reply_tx: mpsc::UnboundedSender<RpcMsg>,
    router: Arc<Router>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        if conn.is_closed() {
            break;
        }
        let result = tokio::select! {
            result = read_one(&mut reader, idle_timeout) => result,
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = conn.closed_notify.notified() => break,
        };
        let msg = match result {
            Ok(msg) => msg,
            Err(RpcError::ConnectionClosed) => {
                trace!("connection {}: peer closed", conn.id());
                break;
            }
            Err(RpcError::Timeout) => {
                trace!("connection {}: idle timeout expired", conn.id());
                break;
            }
            Err(e) => {
                warn!("connection {}: read error: {e}", conn.id());
                break;
            }
        };
        if msg.is_heartbeat() {
            trace!("connection {}: heartbeat", conn.id());
            continue;
        }

        let reply_body = router.route(msg.header.function_id, &msg.body);
        let reply = RpcMsg::new(msg.header.request_id, msg.header.function_id, reply_body);
        if reply_tx.send(reply).is_err() {
            // Writer already gone after a write error.
            break;
        }
    }
}

async fn write_loop(
    conn: &Connection,
    write_half: OwnedWriteHalf,
    mut reply_rx: mpsc::UnboundedReceiver<RpcMsg>,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(msg) = reply_rx.recv().await {
        if let Err(e) = wire::write_msg(&mut writer, &msg).await {
            warn!("connection {}: write error: {e}", conn.id());
            conn.mark_closed();
            return;
        }
    }
    // Reader exited and dropped its sender: half-close so the peer sees EOF.
    let mut half = writer.into_inner();
    let _ = half.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
