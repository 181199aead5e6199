//! RPC server: acceptor, connection registry, reaper, and lifecycle.
//!
//! The server accepts on one listening socket and drives every connection on
//! the worker pool ([`RpcServer::run`] builds a multi-threaded runtime with
//! `pool_size` workers; [`RpcServer::serve`] runs on an existing runtime).
//! The acceptor inserts each accepted connection into the registry; a
//! periodic reaper task is the only remover and sweeps out entries whose
//! connection has closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, trace, warn};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};

use crate::error::Result;
use crate::router::Router;

mod connection;

use connection::Connection;

type ConnectionRegistry = Arc<Mutex<HashMap<u64, Arc<Connection>>>>;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Number of worker threads in the I/O pool used by [`RpcServer::run`].
    pub pool_size: usize,
    /// Per-request idle timeout, armed while waiting for the next frame.
    /// Zero disables the timer.
    pub idle_timeout: Duration,
    /// How often the reaper sweeps closed connections out of the registry.
    pub reap_interval: Duration,
}

impl ServerConfig {
    pub fn new(port: u16, pool_size: usize) -> Self {
        Self {
            port,
            pool_size,
            idle_timeout: Duration::from_secs(15),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// A cloneable handle for stopping and inspecting a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    connections: ConnectionRegistry,
}

impl ServerHandle {
    /// Signal the server to stop. Idempotent; safe from any thread.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Number of connections currently held in the registry (closed entries
    /// linger until the next reaper sweep).
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

/// The RPC server. Register procedures, then either [`run`](Self::run) on a
/// fresh worker pool or [`serve`](Self::serve) on an existing runtime.
pub struct RpcServer {
    config: ServerConfig,
    router: Router,
    listener: Option<TcpListener>,
    shutdown: watch::Sender<bool>,
    connections: ConnectionRegistry,
}

impl RpcServer {
    /// # Panics
    ///
    /// Panics when `config.pool_size` is zero.
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.pool_size > 0, "pool_size must be > 0");
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            router: Router::new(),
            listener: None,
            shutdown,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a procedure; see [`Router::register`].
    pub fn register<Args, R, F>(&mut self, name: &str, f: F)
    where
        Args: serde::de::DeserializeOwned + 'static,
        R: serde::Serialize + 'static,
        F: Fn(Args) -> R + Send + Sync + 'static,
    {
        self.router.register(name, f);
    }

    /// Register a fallible procedure; see [`Router::register_fallible`].
    pub fn register_fallible<Args, R, F>(&mut self, name: &str, f: F)
    where
        Args: serde::de::DeserializeOwned + 'static,
        R: serde::Serialize + 'static,
        F: Fn(Args) -> std::result::Result<R, String> + Send + Sync + 'static,
    {
        self.router.register_fallible(name, f);
    }

    /// Register a method bound to a shared receiver; see
    /// [`Router::register_method`].
    pub fn register_method<S, Args, R, F>(&mut self, name: &str, receiver: Arc<S>, method: F)
    where
        S: Send + Sync + 'static,
        Args: serde::de::DeserializeOwned + 'static,
        R: serde::Serialize + 'static,
        F: Fn(&S, Args) -> R + Send + Sync + 'static,
    {
        self.router.register_method(name, receiver, method);
    }

    /// Bind the listening socket ahead of serving and return the bound
    /// address. Useful with `port = 0`.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// A handle for stopping the server, usable after `serve` has consumed
    /// it.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            connections: Arc::clone(&self.connections),
        }
    }

    /// Signal the server to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Build a multi-threaded runtime with `pool_size` workers and block on
    /// [`serve`](Self::serve) until the server is stopped.
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.pool_size)
            .thread_name("minirpc-worker")
            .enable_all()
            .build()?;
        runtime.block_on(self.serve())
    }

    /// Accept and serve connections until stopped by [`stop`](Self::stop),
    /// a [`ServerHandle`], or a termination signal.
    pub async fn serve(mut self) -> Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(("0.0.0.0", self.config.port)).await?,
        };
        let local_addr = listener.local_addr()?;
        let router = Arc::new(self.router);
        let connections = self.connections;
        let shutdown = self.shutdown;
        let mut shutdown_rx = shutdown.subscribe();

        info!(
            "rpc server listening on {local_addr} ({} workers)",
            self.config.pool_size
        );

        #[cfg(unix)]
        spawn_signal_handlers(shutdown.clone());

        let reaper = tokio::spawn(reap_loop(
            Arc::clone(&connections),
            self.config.reap_interval,
            shutdown.subscribe(),
        ));

        let mut next_conn_id: u64 = 0;
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let id = next_conn_id;
                    next_conn_id += 1;
                    trace!("connection {id}: accepted from {peer}");
                    let conn = connection::spawn(
                        id,
                        stream,
                        Arc::clone(&router),
                        self.config.idle_timeout,
                        shutdown.subscribe(),
                    );
                    connections.lock().await.insert(id, conn);
                }
                Err(e) => {
                    warn!("accept error: {e}");
                }
            }
        }

        // Connections observe the same shutdown signal; wait for the reaper
        // so registry access has quiesced before returning.
        let _ = reaper.await;
        info!("rpc server stopped");
        Ok(())
    }
}

/// Periodically erase registry entries whose connection has closed. Wakes
/// immediately on shutdown. The reaper is the sole remover of entries.
async fn reap_loop(
    connections: ConnectionRegistry,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        let mut registry = connections.lock().await;
        registry.retain(|id, conn| {
            if conn.is_closed() {
                trace!("reaped connection {id}");
                false
            } else {
                true
            }
        });
    }
}

/// Stop the server on SIGINT, SIGTERM, or SIGQUIT.
#[cfg(unix)]
fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    for kind in [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::quit(),
    ] {
        match signal(kind) {
            Ok(mut sig) => {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    sig.recv().await;
                    info!("received signal, stopping server");
                    let _ = shutdown.send(true);
                });
            }
            Err(e) => warn!("failed to install signal handler: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "pool_size must be > 0")]
    fn rejects_empty_pool() {
        let _ = RpcServer::new(ServerConfig::new(0, 0));
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let mut server = RpcServer::new(ServerConfig::new(0, 1));
        let addr = server.bind().await.unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn stop_ends_serve() {
        let mut server = RpcServer::new(ServerConfig::new(0, 1));
        server.bind().await.unwrap();
        let handle = server.handle();

        let task = tokio::spawn(server.serve());
        handle.stop();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut server = RpcServer::new(ServerConfig::new(0, 1));
        server.bind().await.unwrap();
        let handle = server.handle();

        let task = tokio::spawn(server.serve());
        handle.stop();
        handle.stop();
        handle.stop();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn reaper_removes_closed_connections() {
        let mut config = ServerConfig::new(0, 1);
        config.reap_interval = Duration::from_millis(50);
        let mut server = RpcServer::new(config);
        let addr = server.bind().await.unwrap();
        let handle = server.handle();
        tokio::spawn(server.serve());

        let stream = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
            .await
            .unwrap();

        // Entry appears once accepted.
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.connection_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was never registered");

        // Dropping the client closes the connection; the reaper must erase
        // it within a sweep or two.
        drop(stream);
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.connection_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed connection was never reaped");

        handle.stop();
    }
}
