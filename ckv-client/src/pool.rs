//! # Connection Pool
//!
//! Purpose: Share a bounded set of store connections between every caller in
//! the process.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    dialing and liveness probes run outside it.
//! 3. **Lazy Dial**: Connections are created on demand and retired on idle
//!    timeout, lifetime expiry, failed probe or transport error.
//! 4. **RAII Release**: `PooledConnection` hands its connection back on drop,
//!    so every exit path of a command releases the slot.
//!
//! ## Exhaustion
//!
//! With `max_active > 0` the pool either fails fast (`wait = false`) or parks
//! the caller on a condition variable until a slot frees up (`wait = true`).

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ckv_common::{encode_command, read_response, RespValue};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::ConnectionUrl;
use crate::error::{ClientError, ClientResult};

/// Extra read time granted on top of a blocking command's own wait.
const BLOCKING_READ_MARGIN: Duration = Duration::from_secs(5);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Where and how to dial.
    pub url: ConnectionUrl,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use); `0` means unbounded.
    pub max_active: usize,
    /// Close connections idle for longer than this.
    pub idle_timeout: Option<Duration>,
    /// Close connections older than this.
    pub max_lifetime: Option<Duration>,
    /// Ping connections idle for longer than this before handing them out.
    pub test_on_borrow: Option<Duration>,
    /// Wait for a free slot instead of failing with `PoolExhausted`.
    pub wait: bool,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Settings for `url` with the library defaults for everything else.
    pub fn new(url: ConnectionUrl) -> Self {
        PoolConfig {
            url,
            max_idle: 10,
            max_active: 0,
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: None,
            test_on_borrow: Some(Duration::from_secs(60)),
            wait: false,
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(600)),
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked in the pool.
    pub idle: usize,
    /// Connections currently borrowed.
    pub active: usize,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

enum Checkout {
    Idle(Connection),
    Reserved,
    Exhausted,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool with the provided configuration.
    ///
    /// No connection is dialed until the first `acquire`.
    pub fn new(config: PoolConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        }
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection from the pool.
    ///
    /// Dial failures are returned to the caller as-is; the pool does not retry.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        loop {
            match self.checkout() {
                Checkout::Idle(conn) => {
                    if let Some(conn) = self.test_on_borrow(conn) {
                        return Ok(PooledConnection::new(self.inner.clone(), conn));
                    }
                }
                Checkout::Reserved => {
                    return match Connection::connect(&self.inner.config) {
                        Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
                        Err(err) => {
                            self.release_slot();
                            Err(err)
                        }
                    };
                }
                Checkout::Exhausted => return Err(ClientError::PoolExhausted),
            }
        }
    }

    /// Takes an idle connection or reserves a dial slot.
    fn checkout(&self) -> Checkout {
        let mut state = self.inner.state.lock();
        loop {
            self.prune_idle(&mut state);
            if let Some(conn) = state.idle.pop_front() {
                return Checkout::Idle(conn);
            }
            let max_active = self.inner.config.max_active;
            if max_active == 0 || state.total < max_active {
                state.total += 1;
                return Checkout::Reserved;
            }
            if !self.inner.config.wait {
                return Checkout::Exhausted;
            }
            self.inner.available.wait(&mut state);
        }
    }

    fn prune_idle(&self, state: &mut PoolState) {
        let config = &self.inner.config;
        let before = state.idle.len();
        state
            .idle
            .retain(|conn| !conn.idle_expired(config.idle_timeout) && !conn.lifetime_expired(config.max_lifetime));
        let pruned = before - state.idle.len();
        if pruned > 0 {
            state.total = state.total.saturating_sub(pruned);
            debug!(pruned, "closed expired idle connections");
        }
    }

    /// Returns `None` when the liveness probe fails; the slot is released.
    fn test_on_borrow(&self, mut conn: Connection) -> Option<Connection> {
        let threshold = match self.inner.config.test_on_borrow {
            Some(threshold) => threshold,
            None => return Some(conn),
        };
        if conn.last_used.elapsed() < threshold {
            return Some(conn);
        }
        match conn.exec(&[b"PING"]) {
            Ok(RespValue::Simple(_)) => Some(conn),
            outcome => {
                debug!(?outcome, "discarding connection that failed its borrow probe");
                self.release_slot();
                None
            }
        }
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }

    fn return_connection(&self, mut conn: Connection) {
        if conn.lifetime_expired(self.inner.config.max_lifetime) {
            self.release_slot();
            return;
        }
        conn.last_used = Instant::now();

        let mut state = self.inner.state.lock();
        if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
        drop(state);
        self.inner.available.notify_one();
    }

    /// Snapshot of idle and borrowed connection counts.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes a RESP command and returns the parsed response.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into()),
        };
        let response = conn.exec(args);
        if matches!(&response, Err(err) if err.is_transport()) {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        response
    }

    /// Executes a command the server may hold for up to `wait`.
    ///
    /// The socket read timeout is raised to cover `wait` for this call only.
    /// A wait too large to extend runs without a read timeout.
    pub fn exec_blocking(&mut self, args: &[&[u8]], wait: Duration) -> ClientResult<RespValue> {
        let configured = self.pool.config.read_timeout;
        let needed = wait.checked_add(BLOCKING_READ_MARGIN);
        let extend = match (configured, needed) {
            (Some(timeout), Some(needed)) => timeout < needed,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if extend {
            if let Err(err) = self.set_read_timeout(needed) {
                self.valid = false;
                return Err(err);
            }
        }
        let response = self.exec(args);
        if extend && self.valid {
            if let Err(err) = self.set_read_timeout(configured) {
                self.valid = false;
                return Err(err);
            }
        }
        response
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> ClientResult<()> {
        if let Some(conn) = self.conn.as_mut() {
            conn.reader.get_ref().set_read_timeout(timeout)?;
        }
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid {
            pool.return_connection(conn);
        } else {
            debug!("dropping connection after transport failure");
            pool.release_slot();
        }
    }
}

/// Single TCP connection with reusable buffers.
///
/// The buffers are stored on the connection to avoid per-call allocations.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    fn connect(config: &PoolConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let now = Instant::now();
        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            created_at: now,
            last_used: now,
        };
        conn.handshake(&config.url)?;
        debug!(host = %config.url.host, port = config.url.port, db = config.url.database, "dialed store");
        Ok(conn)
    }

    fn handshake(&mut self, url: &ConnectionUrl) -> ClientResult<()> {
        if let Some(password) = &url.password {
            let reply = self.exec(&[b"AUTH", password.as_bytes()])?;
            expect_ok("AUTH", reply)?;
        }
        if url.database != 0 {
            let db = url.database.to_string();
            let reply = self.exec(&[b"SELECT", db.as_bytes()])?;
            expect_ok("SELECT", reply)?;
        }
        Ok(())
    }

    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        Ok(read_response(&mut self.reader, &mut self.line_buf)?)
    }

    fn idle_expired(&self, idle_timeout: Option<Duration>) -> bool {
        matches!(idle_timeout, Some(limit) if self.last_used.elapsed() >= limit)
    }

    fn lifetime_expired(&self, max_lifetime: Option<Duration>) -> bool {
        matches!(max_lifetime, Some(limit) if self.created_at.elapsed() >= limit)
    }
}

fn expect_ok(command: &'static str, reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse { command }),
    }
}

fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let target = (config.url.host.as_str(), config.url.port);
    let addrs = target
        .to_socket_addrs()
        .map_err(|err| ClientError::InvalidAddress(format!("{}:{}: {err}", target.0, target.1)))?;

    let mut last_err = None;
    for addr in addrs {
        let attempt = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => ClientError::Io(err),
        None => ClientError::InvalidAddress(format!("{}:{} resolved to nothing", target.0, target.1)),
    })
}
