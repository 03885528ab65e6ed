//! # Client Registry
//!
//! Purpose: Own one server configuration and the pool of connections built
//! from it, and hand out healthy pooled connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling and connection setup.
//! 2. **Caller-Owned**: Several clients with different targets can coexist;
//!    nothing is global.
//! 3. **Health Check on Lease**: A broken connection is disabled and its pool
//!    entry rebuilt instead of being handed out.

use kvlink_common::{ClientConfig, KvError, KvResult};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::lock::LockId;
use crate::pool::{Pool, Pooled};

/// A pooled connection lease.
pub type PooledConnection = Pooled<Connection>;

/// Connection registry for one server.
pub struct Client {
    config: ClientConfig,
    pool: Pool<Connection>,
}

impl Client {
    /// Creates a client with default settings for `host:port`.
    pub fn connect(host: impl Into<String>, port: u16) -> KvResult<Self> {
        Self::with_config(ClientConfig::new(host, port))
    }

    /// Creates a client with a custom configuration. No connection is
    /// opened until the first lease.
    pub fn with_config(config: ClientConfig) -> KvResult<Self> {
        config.validate()?;
        let factory_config = config.clone();
        let pool = Pool::new(
            move || match Connection::connect(&factory_config) {
                Ok(conn) => Some(conn),
                Err(err) => {
                    warn!(
                        host = %factory_config.host,
                        port = factory_config.port,
                        error = %err,
                        "failed to open pooled connection"
                    );
                    None
                }
            },
            config.pool.clone(),
        );
        Ok(Client { config, pool })
    }

    /// True when a usable target is configured.
    pub fn can_use(&self) -> bool {
        self.config.port > 0 && !self.config.host.is_empty()
    }

    /// Leases a healthy connection.
    ///
    /// Broken connections found in the pool are disabled and the lease is
    /// retried, at most once per pool entry.
    pub fn instance(&self) -> KvResult<PooledConnection> {
        let attempts = self.pool.settings().max_len + 1;
        for _ in 0..attempts {
            let lease = self.pool.acquire().ok_or(KvError::PoolExhausted)?;
            if !lease.is_broken() {
                return Ok(lease);
            }
            debug!(code = ?lease.error_code(), "discarding broken pooled connection");
            lease.disable();
        }
        Err(KvError::PoolExhausted)
    }

    /// Leases a connection for the duration of `f`.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> KvResult<R>) -> KvResult<R> {
        let mut conn = self.instance()?;
        f(&mut *conn)
    }

    /// Builds the lock identifier for the calling thread, using the local
    /// address of a pooled connection as the host part.
    pub fn lock_id(&self) -> KvResult<LockId> {
        let conn = self.instance()?;
        Ok(LockId::for_connection(&*conn))
    }

    /// Changes the maximum number of pooled connections; ignored when zero.
    pub fn set_max_conn_count(&self, max_len: usize) {
        if max_len > 0 {
            self.pool.set_length(max_len);
        }
    }

    pub fn pool(&self) -> &Pool<Connection> {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
