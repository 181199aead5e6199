//! Compact MessagePack-RPC runtime over TCP.
//!
//! A server exposes ordinary typed functions under string names; a client
//! multiplexes many in-flight calls over a single connection. The wire
//! carries a fixed 16-byte header plus a MessagePack body:
//!
//! ```text
//! ┌─────────────────┬────────────────┬──────────────────┬──────────────┐
//! │ request_id: u64 │ body_len: u32  │ function_id: u32 │  body bytes  │
//! └─────────────────┴────────────────┴──────────────────┴──────────────┘
//! ```
//!
//! `function_id` is the 32-bit MD5-derived hash of the procedure name, and
//! `body_len == 0` is a heartbeat the server accepts to keep an idle
//! connection alive.
//!
//! ```no_run
//! use std::time::Duration;
//! use minirpc::{RpcClient, RpcServer, ServerConfig};
//!
//! # async fn demo() -> minirpc::Result<()> {
//! let mut server = RpcServer::new(ServerConfig::new(6666, 2));
//! server.register("hello", |(a, b): (i32, i32)| a + b);
//! let handle = server.handle();
//! tokio::spawn(server.serve());
//!
//! let client = RpcClient::new("127.0.0.1", 6666);
//! client.connect_default().await?;
//! let sum: i32 = client.call("hello", &(1, 2), Duration::from_secs(1)).await?;
//! assert_eq!(sum, 3);
//! handle.stop();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod hash;
pub mod router;
pub mod server;
pub mod wire;

pub use client::{ReplyFuture, RpcClient, RpcResult};
pub use error::{Result, RpcError};
pub use router::Router;
pub use server::{RpcServer, ServerConfig, ServerHandle};
pub use wire::{RpcHeader, RpcMsg};
