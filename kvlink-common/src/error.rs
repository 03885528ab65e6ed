//! # Error Types
//!
//! Every failure the client can surface, each tied to one [`Status`] code so
//! callers can keep reasoning in terms of the numeric taxonomy.

use std::io;

use thiserror::Error;

use crate::status::Status;

/// Result type used across kvlink crates.
pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    /// Socket level failure other than a timeout or an orderly close.
    #[error("network error: {0}")]
    Network(#[source] io::Error),
    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// Send/receive stalled past its retry budget, or no complete reply
    /// arrived within the command timeout.
    #[error("response timeout")]
    Timeout,
    /// Reply bytes could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Reply did not fit into the fixed receive buffer.
    #[error("reply exceeds receive buffer of {capacity} bytes")]
    BufferFull { capacity: usize },
    /// Null bulk or null array reply.
    #[error("element not found")]
    NotFound,
    /// Server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Connection failed earlier and has not been reconnected.
    #[error("connection unusable after {0}")]
    Broken(Status),
    /// Pool could not hand out a resource before its retry window elapsed.
    #[error("resource pool exhausted")]
    PoolExhausted,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
}

impl KvError {
    /// Maps the error onto the status taxonomy.
    pub fn status(&self) -> Status {
        match self {
            KvError::Network(_) => Status::NetErr,
            KvError::Closed => Status::NetClose,
            KvError::Timeout => Status::Timeout,
            KvError::Protocol(_) => Status::DataErr,
            KvError::BufferFull { .. } => Status::ParamErr,
            KvError::NotFound => Status::NotFound,
            KvError::Server(_) => Status::Fail,
            KvError::AuthFailed(_) => Status::AuthFail,
            KvError::Broken(status) => *status,
            KvError::PoolExhausted => Status::SysBusy,
            KvError::Config(_) => Status::ParamErr,
            KvError::Io(_) => Status::IoErr,
            KvError::Json(_) => Status::ParamErr,
        }
    }

    /// Numeric code, always negative.
    #[inline]
    pub fn code(&self) -> i32 {
        self.status().code()
    }

    /// Text stored as the connection's last error message.
    ///
    /// Server and auth replies keep the server's own wording; everything else
    /// uses the fixed taxonomy text.
    pub fn describe(&self) -> String {
        match self {
            KvError::Server(message) | KvError::AuthFailed(message) => message.clone(),
            KvError::Config(message) => message.clone(),
            other => other.status().message().to_string(),
        }
    }
}
