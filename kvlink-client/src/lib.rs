//! # kvlink Sync Client
//!
//! Purpose: Provide a synchronous Redis-compatible client with a shared
//! connection pool and a distributed lock built on top of it.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Bounded Waits**: Connect, send, receive and pool acquisition all give
//!    up after a configured or fixed budget.
//! 3. **Minimal Allocation**: Each connection reuses its request and receive
//!    buffers.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod client;
mod command;
mod connection;
mod lock;
mod pool;
mod resp;
mod transport;

pub use client::{Client, PooledConnection};
pub use command::Command;
pub use connection::Connection;
pub use lock::{LockId, LOCK_RETRY_INTERVAL, UNLOCK_SCRIPT};
pub use pool::{Creator, Pool, Pooled};
pub use resp::{encode_command, parse_reply, Parsed, RespValue};
pub use transport::{TcpTransport, Transport, STALL_LIMIT};

pub use kvlink_common::{ClientConfig, KvError, KvResult, PoolSettings, Status};
