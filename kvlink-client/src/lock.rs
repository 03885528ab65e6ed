//! # Distributed Lock
//!
//! Mutual exclusion on a single key: the holder stores its [`LockId`] under
//! the key with `SET NX EX`, and releases it with a script that deletes the
//! key only while it still holds that identifier.

use std::fmt;
use std::net::IpAddr;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use kvlink_common::{KvError, KvResult};
use tracing::{debug, trace};

use crate::command::Command;
use crate::connection::Connection;
use crate::resp::RespValue;
use crate::transport::Transport;

/// Pause between acquisition attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Compare-and-delete executed atomically by the server.
pub const UNLOCK_SCRIPT: &str =
    "if redis.call('get',KEYS[1])==ARGV[1] then return redis.call('del',KEYS[1]) else return 0 end";

const UNKNOWN_HOST: &str = "unknown host";

/// Identifier of a lock holder: `host:pid:thread`.
///
/// Compute it once per thread and pass it to every lock call made from that
/// thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    /// Builds the identifier for the calling thread on `host`.
    pub fn new(host: impl fmt::Display) -> Self {
        LockId(format!("{}:{}:{}", host, process::id(), current_thread_number()))
    }

    /// Uses the local address of `conn` as the host part.
    pub fn for_connection<T: Transport>(conn: &Connection<T>) -> Self {
        match conn.transport().local_ip() {
            Some(ip) => LockId::new(ip),
            None => LockId::new(UNKNOWN_HOST),
        }
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        LockId::new(ip)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockId {
    fn from(value: String) -> Self {
        LockId(value)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// `ThreadId` has no stable numeric accessor; its Debug form is `ThreadId(N)`.
fn current_thread_number() -> u64 {
    let debug = format!("{:?}", thread::current().id());
    debug
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

impl<T: Transport> Connection<T> {
    /// Tries to take `key` for `ttl_secs` seconds, retrying until the same
    /// amount of time has passed.
    ///
    /// Returns `Ok(false)` when another holder kept the key for the whole
    /// wait. A connection failure ends the wait with that error.
    pub fn lock(&mut self, key: &str, ttl_secs: u64, id: &LockId) -> KvResult<bool> {
        let ttl_secs = ttl_secs.max(1);
        let deadline = Instant::now().checked_add(Duration::from_secs(ttl_secs));
        let cmd = Command::new("set")
            .arg(key)
            .arg(id.as_str())
            .arg("nx")
            .arg("ex")
            .arg_int(ttl_secs.min(i64::MAX as u64) as i64);

        loop {
            match self.execute(&cmd) {
                Ok(_) => {
                    debug!(key, holder = %id, "lock acquired");
                    return Ok(true);
                }
                // NX refused: someone else holds the key.
                Err(KvError::NotFound) | Err(KvError::Server(_)) => {
                    trace!(key, "lock busy");
                }
                Err(err) => return Err(err),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!(key, holder = %id, "lock wait expired");
                return Ok(false);
            }
            thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    /// Releases `key` if and only if it is held by `id`.
    pub fn unlock(&mut self, key: &str, id: &LockId) -> KvResult<bool> {
        match self.eval(UNLOCK_SCRIPT, &[key], &[id.as_str()])? {
            RespValue::Integer(deleted) => Ok(deleted > 0),
            _ => Ok(false),
        }
    }
}
