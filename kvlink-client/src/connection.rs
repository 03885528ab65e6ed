//! # Connection
//!
//! Purpose: Drive one request/response round trip at a time over a
//! transport, and expose the command surface on top of it.
//!
//! ## Design Principles
//! 1. **Strictly Sequential**: One command is written, then its reply is read
//!    to completion before the next command may start.
//! 2. **Fixed Buffer**: The receive buffer is sized once from configuration;
//!    a reply that does not fit is a parameter error.
//! 3. **Last-Outcome State**: Every call records status payload, error code
//!    and message on the connection for later inspection.
//! 4. **Sticky Failure**: After a transport or framing failure the stream may
//!    be out of sync, so the connection refuses work until reconnected.

use std::io::{self, ErrorKind};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kvlink_common::{ClientConfig, KvError, KvResult, Status};
use tracing::{debug, warn};

use crate::command::Command;
use crate::resp::{parse_reply, Parsed, RespValue};
use crate::transport::{TcpTransport, Transport};

/// A connection to one server.
pub struct Connection<T: Transport = TcpTransport> {
    config: ClientConfig,
    transport: T,
    buffer: Vec<u8>,
    write_buf: BytesMut,
    status: i64,
    code: Status,
    message: String,
    broken: Option<Status>,
}

impl Connection<TcpTransport> {
    /// Connects to the configured server and authenticates when a password
    /// is configured.
    pub fn connect(config: &ClientConfig) -> KvResult<Self> {
        config.validate()?;
        let transport = open_transport(config)?;
        let mut conn = Connection::with_transport(config.clone(), transport);
        conn.authenticate()?;
        debug!(host = %config.host, port = config.port, "connection ready");
        Ok(conn)
    }

    /// Re-establishes the transport with the stored settings and
    /// re-authenticates.
    pub fn reconnect(&mut self) -> KvResult<()> {
        self.close();
        self.config.validate()?;
        self.transport = open_transport(&self.config)?;
        self.buffer = vec![0u8; self.config.buffer_size];
        self.broken = None;
        self.status = 0;
        self.code = Status::Ok;
        self.message.clear();
        self.authenticate()
    }
}

fn open_transport(config: &ClientConfig) -> KvResult<TcpTransport> {
    TcpTransport::connect(
        &config.host,
        config.port,
        config.timeout(),
        config.poll_quantum(),
    )
}

impl<T: Transport> Connection<T> {
    /// Builds a connection over an already established transport.
    ///
    /// No AUTH is sent; call [`Connection::auth`] when needed.
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        let buffer = vec![0u8; config.buffer_size];
        Connection {
            config,
            transport,
            buffer,
            write_buf: BytesMut::with_capacity(256),
            status: 0,
            code: Status::Ok,
            message: String::new(),
            broken: None,
        }
    }

    /// Sends one command and waits for its complete reply.
    ///
    /// Error replies surface as `KvError::Server` and null replies as
    /// `KvError::NotFound`; both leave the connection usable.
    pub fn execute(&mut self, cmd: &Command) -> KvResult<RespValue> {
        let outcome = self.round_trip(cmd).and_then(|value| match value {
            RespValue::Error(message) => Err(KvError::Server(message)),
            RespValue::Null => Err(KvError::NotFound),
            other => Ok(other),
        });

        match &outcome {
            Ok(value) => self.record_ok(value),
            Err(err) => self.record_err(cmd, err),
        }
        outcome
    }

    /// Executes a command and converts its reply, recording a reply of the
    /// wrong shape as a protocol failure.
    fn execute_as<R, F>(&mut self, cmd: &Command, convert: F) -> KvResult<R>
    where
        F: FnOnce(RespValue) -> KvResult<R>,
    {
        let reply = self.execute(cmd)?;
        convert(reply).map_err(|err| {
            self.record_err(cmd, &err);
            err
        })
    }

    /// Executes a command and flattens the reply into its string sequence.
    pub fn execute_list(&mut self, cmd: &Command) -> KvResult<Vec<Bytes>> {
        self.execute(cmd).map(RespValue::into_list)
    }

    fn round_trip(&mut self, cmd: &Command) -> KvResult<RespValue> {
        if let Some(status) = self.broken {
            return Err(KvError::Broken(status));
        }
        if self.transport.is_closed() {
            return Err(KvError::Network(io::Error::from(ErrorKind::NotConnected)));
        }

        self.write_buf.clear();
        cmd.encode(&mut self.write_buf);
        self.transport
            .send_all(&self.write_buf)
            .map_err(|err| match err {
                KvError::Network(err) => KvError::Network(err),
                other => KvError::Network(io::Error::new(ErrorKind::Other, other.to_string())),
            })?;

        let capacity = self.buffer.len();
        let timeout = self.config.timeout();
        let quantum = self.config.poll_quantum();
        let mut filled = 0;
        let mut waited = Duration::ZERO;

        while filled < capacity {
            let n = self.transport.recv_available(&mut self.buffer[filled..])?;
            if n == 0 {
                waited += quantum;
                if waited > timeout {
                    return Err(KvError::Timeout);
                }
                continue;
            }

            filled += n;
            match parse_reply(&self.buffer[..filled])? {
                // Fresh bytes count as progress.
                Parsed::Incomplete => waited = Duration::ZERO,
                Parsed::Complete { value, consumed } => {
                    if consumed < filled {
                        debug!(trailing = filled - consumed, "discarding bytes after reply");
                    }
                    return Ok(value);
                }
            }
        }

        Err(KvError::BufferFull { capacity })
    }

    fn record_ok(&mut self, value: &RespValue) {
        self.code = Status::Ok;
        match value {
            RespValue::Simple(text) => {
                self.status = Status::Ok.code() as i64;
                self.message = text.clone();
            }
            RespValue::Integer(number) => {
                self.status = *number;
                self.message = number.to_string();
            }
            _ => {
                self.status = Status::Ok.code() as i64;
                self.message.clear();
            }
        }
    }

    fn record_err(&mut self, cmd: &Command, err: &KvError) {
        let status = err.status();
        self.code = status;
        self.status = if matches!(err, KvError::Server(_)) {
            Status::Ok.code() as i64
        } else {
            0
        };
        self.message = err.describe();

        if status.is_fatal() && self.broken.is_none() {
            warn!(command = %cmd.verb(), error = %err, "connection marked broken");
            self.broken = Some(status);
        }
    }

    /// Sends AUTH with `password` and remembers it for reconnects.
    ///
    /// An empty password is accepted without contacting the server. A
    /// rejected password leaves the connection refusing other commands until
    /// a later AUTH succeeds.
    pub fn auth(&mut self, password: &str) -> KvResult<()> {
        self.config.password = Some(password.to_string()).filter(|p| !p.is_empty());
        // The stream is still in sync after a rejected AUTH.
        if self.broken == Some(Status::AuthFail) {
            self.broken = None;
        }
        self.authenticate()
    }

    fn authenticate(&mut self) -> KvResult<()> {
        let Some(password) = self.config.password().map(str::to_string) else {
            return Ok(());
        };
        match self.execute(&Command::new("auth").arg(password)) {
            Ok(_) => Ok(()),
            Err(KvError::Server(message)) => {
                warn!(host = %self.config.host, "authentication rejected");
                self.code = Status::AuthFail;
                self.broken = Some(Status::AuthFail);
                Err(KvError::AuthFailed(message))
            }
            Err(err) => Err(err),
        }
    }

    /// Closes the transport and releases the receive buffer.
    pub fn close(&mut self) {
        self.transport.close();
        self.buffer = Vec::new();
    }

    /// Status payload of the last reply: the integer for `:` replies,
    /// `OK` for status and data replies.
    pub fn status(&self) -> i64 {
        self.status
    }

    /// Outcome code of the last call.
    pub fn code(&self) -> Status {
        self.code
    }

    /// Last failure, or `Fail` when the transport is closed.
    pub fn error_code(&self) -> Option<Status> {
        if self.transport.is_closed() {
            return Some(Status::Fail);
        }
        (!self.code.is_ok()).then_some(self.code)
    }

    /// Message of the last call: reply text on success, error text otherwise.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the connection must be reconnected before further use.
    pub fn is_broken(&self) -> bool {
        self.broken.is_some() || self.transport.is_closed()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn ping(&mut self) -> KvResult<String> {
        self.execute_as(&Command::new("ping"), |reply| match reply {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
            _ => Err(unexpected()),
        })
    }

    /// Returns the number of keys removed.
    pub fn del(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.execute_as(&Command::new("del").arg(key), integer)
    }

    /// Remaining time to live in seconds; `-1` without expiry, `-2` when
    /// the key is missing.
    pub fn ttl(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.execute_as(&Command::new("ttl").arg(key), integer)
    }

    /// Sets a time to live in seconds. Returns true when it was applied.
    pub fn expire(&mut self, key: impl AsRef<[u8]>, seconds: i64) -> KvResult<bool> {
        let cmd = Command::new("expire").arg(key).arg_int(seconds);
        Ok(self.execute_as(&cmd, integer)? > 0)
    }

    /// Fetches a value. A missing key is `KvError::NotFound`.
    pub fn get(&mut self, key: impl AsRef<[u8]>) -> KvResult<Bytes> {
        self.execute_as(&Command::new("get").arg(key), bulk)
    }

    /// Stores a value, with an expiry in seconds when `ttl_secs` is given.
    pub fn set(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl_secs: Option<u64>,
    ) -> KvResult<()> {
        let cmd = match ttl_secs {
            Some(secs) if secs > 0 => Command::new("setex")
                .arg(key)
                .arg_int(secs.min(i64::MAX as u64) as i64)
                .arg(value),
            _ => Command::new("set").arg(key).arg(value),
        };
        self.execute(&cmd).map(|_| ())
    }

    /// Increments by `by`, returning the new value.
    pub fn incr(&mut self, key: impl AsRef<[u8]>, by: i64) -> KvResult<i64> {
        self.execute_as(&Command::new("incrby").arg(key).arg_int(by), integer)
    }

    /// Decrements by `by`, returning the new value.
    pub fn decr(&mut self, key: impl AsRef<[u8]>, by: i64) -> KvResult<i64> {
        self.execute_as(&Command::new("decrby").arg(key).arg_int(by), integer)
    }

    /// Lists keys matching a glob pattern.
    pub fn keys(&mut self, pattern: impl AsRef<[u8]>) -> KvResult<Vec<Bytes>> {
        self.execute_list(&Command::new("keys").arg(pattern))
    }

    pub fn hget(&mut self, key: impl AsRef<[u8]>, field: impl AsRef<[u8]>) -> KvResult<Bytes> {
        self.execute_as(&Command::new("hget").arg(key).arg(field), bulk)
    }

    /// Returns the number of fields newly created.
    pub fn hset(
        &mut self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> KvResult<i64> {
        self.execute_as(&Command::new("hset").arg(key).arg(field).arg(value), integer)
    }

    pub fn hdel(&mut self, key: impl AsRef<[u8]>, field: impl AsRef<[u8]>) -> KvResult<i64> {
        self.execute_as(&Command::new("hdel").arg(key).arg(field), integer)
    }

    pub fn hlen(&mut self, key: impl AsRef<[u8]>) -> KvResult<i64> {
        self.execute_as(&Command::new("hlen").arg(key), integer)
    }

    pub fn zadd(
        &mut self,
        key: impl AsRef<[u8]>,
        member: impl AsRef<[u8]>,
        score: i64,
    ) -> KvResult<i64> {
        self.execute_as(&Command::new("zadd").arg(key).arg_int(score).arg(member), integer)
    }

    pub fn zrem(&mut self, key: impl AsRef<[u8]>, member: impl AsRef<[u8]>) -> KvResult<i64> {
        self.execute_as(&Command::new("zrem").arg(key).arg(member), integer)
    }

    /// Members between `start` and `stop`; with scores they alternate
    /// member, score.
    pub fn zrange(
        &mut self,
        key: impl AsRef<[u8]>,
        start: i64,
        stop: i64,
        with_scores: bool,
    ) -> KvResult<Vec<Bytes>> {
        let mut cmd = Command::new("zrange").arg(key).arg_int(start).arg_int(stop);
        if with_scores {
            cmd.push("withscores");
        }
        self.execute_list(&cmd)
    }

    /// Evaluates a server-side script with its key and argument lists.
    pub fn eval<K, A>(&mut self, script: &str, keys: &[K], args: &[A]) -> KvResult<RespValue>
    where
        K: AsRef<[u8]>,
        A: AsRef<[u8]>,
    {
        let cmd = Command::new("eval")
            .arg(script)
            .arg_int(keys.len() as i64)
            .args(keys)
            .args(args);
        self.execute(&cmd)
    }

    /// Evaluates a script with keys only.
    pub fn eval_keys<K: AsRef<[u8]>>(&mut self, script: &str, keys: &[K]) -> KvResult<RespValue> {
        self.eval::<K, &str>(script, keys, &[])
    }

    /// Evaluates a script that takes no keys or arguments.
    pub fn eval_script(&mut self, script: &str) -> KvResult<RespValue> {
        self.eval::<&str, &str>(script, &[], &[])
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected() -> KvError {
    KvError::Protocol("unexpected reply type")
}

fn integer(reply: RespValue) -> KvResult<i64> {
    match reply {
        RespValue::Integer(value) => Ok(value),
        _ => Err(unexpected()),
    }
}

fn bulk(reply: RespValue) -> KvResult<Bytes> {
    match reply {
        RespValue::Bulk(data) => Ok(data),
        _ => Err(unexpected()),
    }
}
