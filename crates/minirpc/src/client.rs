//! RPC client: a single-socket request/response multiplexer.
//!
//! The client correlates many in-flight calls over one TCP connection. Each
//! call allocates a monotonic request id, parks a one-shot completion slot
//! in the pending-reply map, and enqueues its frame on the write queue. A
//! background reader task matches inbound replies to slots by request id; a
//! background writer task drains the queue in FIFO order with one write in
//! flight.
//!
//! On any transport error the reader fails **all** pending slots with an
//! empty payload, so waiters wake with a definitive error instead of
//! hanging. A timed-out call removes its own slot; a reply that arrives
//! later finds no slot and is dropped silently.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{trace, warn};
use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::codec::{self, STATUS_OK};
use crate::error::{Result, RpcError};
use crate::hash::name_hash;
use crate::wire::{self, RpcMsg};

/// Default deadline for [`RpcClient::connect_default`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Live-connection state, replaced wholesale on every reconnect. The epoch
/// lets tasks from a torn-down connection recognize they are stale.
struct ConnState {
    write_tx: Option<mpsc::UnboundedSender<RpcMsg>>,
    epoch: u64,
}

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>,
    state: Mutex<ConnState>,
    next_request_id: AtomicU64,
    connected: AtomicBool,
    closing: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnState {
                write_tx: None,
                epoch: 0,
            }),
            next_request_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    fn current_epoch(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }

    fn remove_pending(&self, request_id: u64) -> Option<oneshot::Sender<Vec<u8>>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id)
    }

    /// Deliver a reply body to its waiter; unmatched replies are dropped.
    fn complete(&self, request_id: u64, body: Vec<u8>) {
        match self.remove_pending(request_id) {
            Some(slot) => {
                let _ = slot.send(body);
            }
            None => trace!("no pending slot for request {request_id}, dropping reply"),
        }
    }

    /// Tear down the current connection. Idempotent.
    fn disconnect(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.teardown(&mut state);
    }

    /// Tear down from a background task, but only while its connection is
    /// still the current one; a stale task must not touch a successor
    /// connection's state.
    fn disconnect_epoch(&self, epoch: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch != epoch {
            return;
        }
        self.teardown(&mut state);
    }

    /// Clear the connected flag, stop the writer, wake the reader, and fail
    /// every pending slot with an empty payload.
    fn teardown(&self, state: &mut ConnState) {
        state.write_tx = None;
        self.connected.store(false, Ordering::Release);
        self.closing.notify_waiters();

        let slots: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (request_id, slot) in slots {
            trace!("failing pending request {request_id} on disconnect");
            let _ = slot.send(Vec::new());
        }
    }
}

// ---------------------------------------------------------------------------
// Reply future and result
// ---------------------------------------------------------------------------

/// The in-flight side of a call, resolving to an [`RpcResult`] when the
/// reply arrives or the connection is lost.
#[derive(Debug)]
pub struct ReplyFuture {
    request_id: u64,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl ReplyFuture {
    /// The request id this future is waiting on.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for ReplyFuture {
    type Output = RpcResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(body)) => Poll::Ready(RpcResult::new(body)),
            // Sender dropped without completing: the client itself was
            // dropped. Same surface as a connection loss.
            Poll::Ready(Err(_)) => Poll::Ready(RpcResult::new(Vec::new())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An owned reply payload, decoded on demand.
///
/// An empty payload is the connection-loss signal and decodes to
/// [`RpcError::ConnectionClosed`].
#[derive(Debug)]
pub struct RpcResult {
    body: Vec<u8>,
}

impl RpcResult {
    /// Wrap a raw reply payload for decoding.
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    /// Verify the reply's status, surfacing failure replies as
    /// [`RpcError::Remote`].
    pub fn check(&self) -> Result<()> {
        self.success_value().map(|_| ())
    }

    /// Check the status and decode the result value as `T`. The unit type
    /// accepts void replies.
    pub fn decode<T: DeserializeOwned + 'static>(&self) -> Result<T> {
        let value = self.success_value()?;
        if TypeId::of::<T>() == TypeId::of::<()>() {
            // Void replies carry no value element.
            return Ok(rmpv::ext::from_value(Value::Nil)?);
        }
        Ok(rmpv::ext::from_value(value)?)
    }

    /// Raw reply payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Decode the envelope and return the value element (`Nil` for void
    /// replies) after confirming a success status.
    fn success_value(&self) -> Result<Value> {
        if self.body.is_empty() {
            return Err(RpcError::ConnectionClosed);
        }
        let value: Value = rmp_serde::from_slice(&self.body)?;
        let Value::Array(mut items) = value else {
            return Err(RpcError::Protocol("reply is not a status envelope".into()));
        };
        let Some(status) = items.first().and_then(Value::as_i64) else {
            return Err(RpcError::Protocol("reply envelope has no status".into()));
        };
        if status != STATUS_OK as i64 {
            let message = items
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("unknown remote error")
                .to_string();
            return Err(RpcError::Remote(message));
        }
        Ok(if items.len() > 1 {
            items.swap_remove(1)
        } else {
            Value::Nil
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A multiplexing RPC client for one server endpoint.
///
/// All socket state lives in two background tasks spawned by
/// [`connect`](Self::connect); the client handle itself only enqueues
/// frames and parks completion slots, so calls may be issued concurrently
/// from many tasks.
pub struct RpcClient {
    host: String,
    port: u16,
    shared: Arc<Shared>,
}

impl RpcClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            shared: Arc::new(Shared::new()),
        }
    }

    /// Whether the client currently holds a live connection.
    pub fn has_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Connect with the default timeout.
    pub async fn connect_default(&self) -> Result<()> {
        self.connect(DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to the configured endpoint, starting the background reader
    /// and writer. Succeeds immediately when already connected.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        if self.has_connected() {
            return Ok(());
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RpcError::Io(e)),
            Err(_) => return Err(RpcError::Timeout),
        };
        trace!("connected to {}:{}", self.host, self.port);

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let epoch = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.write_tx.is_some() {
                // Raced with another connect; keep the established one.
                return Ok(());
            }
            state.epoch += 1;
            state.write_tx = Some(write_tx);
            self.shared.connected.store(true, Ordering::Release);
            state.epoch
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            write_loop(write_half, write_rx, shared, epoch).await;
        });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            read_loop(read_half, shared, epoch).await;
        });

        Ok(())
    }

    /// Re-target the client and connect. Closes any existing connection
    /// first.
    pub async fn connect_to(
        &mut self,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Result<()> {
        self.close();
        self.host = host.into();
        self.port = port;
        self.connect(timeout).await
    }

    /// Close the connection. Pending calls complete with a connection-loss
    /// error; subsequent calls fail fast until [`connect`](Self::connect) is
    /// called again. Idempotent.
    pub fn close(&self) {
        self.shared.disconnect();
    }

    /// Start a call and return a future for its reply.
    ///
    /// The pending slot is registered before the frame is queued, so a fast
    /// reply can never miss its waiter. Fails fast when disconnected.
    pub fn async_call<A: Serialize>(&self, name: &str, args: &A) -> Result<ReplyFuture> {
        if !self.has_connected() {
            return Err(RpcError::NotConnected);
        }

        let body = codec::encode_args(args)?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        let msg = RpcMsg::new(request_id, name_hash(name), body);
        let queued = {
            let state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.write_tx.as_ref().is_some_and(|tx| tx.send(msg).is_ok())
        };

        if !queued {
            // Lost the connection between the flag check and the enqueue.
            self.shared.remove_pending(request_id);
            return Err(RpcError::NotConnected);
        }

        Ok(ReplyFuture { request_id, rx })
    }

    /// Call a procedure and decode its result, bounded by `timeout`.
    ///
    /// On expiry the pending slot is removed (a late reply is then dropped
    /// silently) and [`RpcError::Timeout`] is returned. Use `T = ()` for
    /// void procedures.
    pub async fn call<T, A>(&self, name: &str, args: &A, timeout: Duration) -> Result<T>
    where
        T: DeserializeOwned + 'static,
        A: Serialize,
    {
        let reply = self.async_call(name, args)?;
        let request_id = reply.request_id();
        match tokio::time::timeout(timeout, reply).await {
            Ok(result) => result.decode(),
            Err(_) => {
                self.shared.remove_pending(request_id);
                Err(RpcError::Timeout)
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn read_loop(read_half: OwnedReadHalf, shared: Arc<Shared>, epoch: u64) {
    let mut reader = BufReader::new(read_half);
    loop {
        if shared.current_epoch() != epoch || !shared.connected.load(Ordering::Acquire) {
            break;
        }
        let result = tokio::select! {
            result = wire::read_msg(&mut reader) => result,
            _ = shared.closing.notified() => break,
        };
        let msg = match result {
            Ok(msg) => msg,
            Err(RpcError::ConnectionClosed) => {
                trace!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!("read error: {e}");
                break;
            }
        };
        // Only the server may send heartbeats; a zero-length reply body is
        // a protocol violation here.
        if msg.is_heartbeat() {
            warn!("received zero-length reply body, closing connection");
            break;
        }
        shared.complete(msg.header.request_id, msg.body);
    }
    shared.disconnect_epoch(epoch);
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<RpcMsg>,
    shared: Arc<Shared>,
    epoch: u64,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(msg) = write_rx.recv().await {
        if let Err(e) = wire::write_msg(&mut writer, &msg).await {
            warn!("write error: {e}");
            shared.disconnect_epoch(epoch);
            return;
        }
    }
    // Sender dropped by close(): flush out and half-close.
    let mut half = writer.into_inner();
    let _ = half.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
