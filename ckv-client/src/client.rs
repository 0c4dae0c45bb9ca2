//! # Store Client
//!
//! Purpose: Expose a compact, blocking API for issuing commands to the store
//! through the shared connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `StoreClient` hides pooling and protocol details.
//! 2. **Borrow/Execute/Release**: Each call borrows one connection, runs its
//!    command(s) and releases the connection on every exit path.
//! 3. **Nil Is Not An Error**: Missing keys come back as `Ok(None)`.
//! 4. **Traceable Failures**: Public calls are `#[track_caller]`; genuine
//!    errors carry the command name and the caller's source location.
//!
//! The client is a cheap handle (`Clone` shares the pool). Build it once at
//! start-up and hand clones to the components that need store access.

use std::panic::Location;
use std::time::Duration;

use ckv_common::RespValue;

use crate::config::StoreConfig;
use crate::error::{ClientError, ClientResult};
use crate::hash::HashClient;
use crate::lock::LockManager;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
use crate::queue::QueueClient;
use crate::ready::{wait_until_ready, Backoff};

/// Synchronous client with connection pooling.
#[derive(Clone)]
pub struct StoreClient {
    pool: ConnectionPool,
}

impl StoreClient {
    /// Creates a client from store settings. Nothing is dialed yet.
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_pool_config(config.pool_config())
    }

    /// Creates a client with explicit pool settings.
    pub fn with_pool_config(config: PoolConfig) -> Self {
        StoreClient {
            pool: ConnectionPool::new(config),
        }
    }

    /// Creates a client and blocks until the store answers a ping.
    pub fn connect_ready(config: &StoreConfig, backoff: &Backoff) -> ClientResult<Self> {
        let client = Self::new(config);
        wait_until_ready(&client, backoff)?;
        Ok(client)
    }

    /// Pool occupancy snapshot.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Distributed lock manager sharing this client's pool.
    pub fn locks(&self) -> LockManager {
        LockManager::new(self.clone())
    }

    /// Queue operations sharing this client's pool.
    pub fn queues(&self) -> QueueClient {
        QueueClient::new(self.clone())
    }

    /// Hash operations sharing this client's pool.
    pub fn hashes(&self) -> HashClient {
        HashClient::new(self.clone())
    }

    /// Borrows a connection, runs `op`, releases the connection.
    ///
    /// Errors are wrapped with `command` and `location`.
    pub(crate) fn execute<T, F>(&self, command: &'static str, location: &'static Location<'static>, op: F) -> ClientResult<T>
    where
        F: FnOnce(&mut PooledConnection) -> ClientResult<T>,
    {
        let outcome = self.pool.acquire().and_then(|mut conn| op(&mut conn));
        outcome.map_err(|err| err.traced(command, location))
    }

    /// Runs a single command and hands back the raw reply.
    ///
    /// Error replies are converted to `ClientError::Server`.
    #[track_caller]
    pub fn command(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let location = Location::caller();
        self.execute("command", location, |conn| match conn.exec(args)? {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            reply => Ok(reply),
        })
    }

    /// Liveness probe.
    #[track_caller]
    pub fn ping(&self) -> ClientResult<()> {
        let location = Location::caller();
        self.execute("PING", location, |conn| match conn.exec(&[b"PING"])? {
            RespValue::Simple(_) | RespValue::Bulk(Some(_)) => Ok(()),
            other => Err(unexpected("PING", other)),
        })
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    #[track_caller]
    pub fn get(&self, key: &str) -> ClientResult<Option<Vec<u8>>> {
        let location = Location::caller();
        self.execute("GET", location, |conn| match conn.exec(&[b"GET", key.as_bytes()])? {
            RespValue::Bulk(data) => Ok(data),
            other => Err(unexpected("GET", other)),
        })
    }

    /// Sets a value for a key without expiration.
    #[track_caller]
    pub fn set(&self, key: &str, value: impl AsRef<[u8]>) -> ClientResult<()> {
        let location = Location::caller();
        self.execute("SET", location, |conn| match conn.exec(&[b"SET", key.as_bytes(), value.as_ref()])? {
            RespValue::Simple(_) => Ok(()),
            other => Err(unexpected("SET", other)),
        })
    }

    /// Atomically sets `key` only when it is absent, with a millisecond TTL.
    ///
    /// Returns false when the key already existed.
    #[track_caller]
    pub fn set_if_absent(&self, key: &str, value: impl AsRef<[u8]>, ttl: Duration) -> ClientResult<bool> {
        self.set_if_absent_at(key, value.as_ref(), ttl, Location::caller())
    }

    pub(crate) fn set_if_absent_at(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        location: &'static Location<'static>,
    ) -> ClientResult<bool> {
        let ttl_ms = ttl.as_millis().max(1).to_string();
        self.execute("SET NX", location, |conn| {
            match conn.exec(&[b"SET", key.as_bytes(), value, b"NX", b"PX", ttl_ms.as_bytes()])? {
                RespValue::Simple(_) => Ok(true),
                RespValue::Bulk(None) => Ok(false),
                other => Err(unexpected("SET NX", other)),
            }
        })
    }

    /// Deletes a key. Returns true when a key was removed.
    #[track_caller]
    pub fn del(&self, key: &str) -> ClientResult<bool> {
        let location = Location::caller();
        self.execute("DEL", location, |conn| match conn.exec(&[b"DEL", key.as_bytes()])? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected("DEL", other)),
        })
    }
}

/// Maps a reply that did not match the command's contract to an error.
pub(crate) fn unexpected(command: &'static str, reply: RespValue) -> ClientError {
    match reply {
        RespValue::Error(message) => ClientError::Server { message },
        _ => ClientError::UnexpectedResponse { command },
    }
}
