//! # Mock Store
//!
//! A small RESP2 server on a background tokio runtime, speaking just enough
//! of the store protocol for the client's integration tests: strings with
//! `NX`/`PX`, lists with blocking pops, hashes with cursor scans and
//! `MEMORY STATS`.
//!
//! ```no_run
//! let store = ckv_mockstore::MockStore::start()?;
//! println!("listening on {}", store.addr());
//! # Ok::<(), std::io::Error>(())
//! ```

mod keyspace;
mod server;

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tracing::info;

pub use keyspace::{KeyResult, Keyspace, SetOptions, Usage, WrongType};

use server::Shared;

/// Startup options for [`MockStore::start_with`].
#[derive(Debug, Clone, Default)]
pub struct MockStoreOptions {
    /// Address to bind; an ephemeral loopback port when `None`.
    pub addr: Option<SocketAddr>,
    /// Require `AUTH <password>` before any other command.
    pub password: Option<String>,
}

/// Handle to a running mock store. Dropping it stops the server.
pub struct MockStore {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MockStore {
    /// Starts on an ephemeral loopback port without a password.
    pub fn start() -> io::Result<Self> {
        Self::start_with(MockStoreOptions::default())
    }

    pub fn start_with(options: MockStoreOptions) -> io::Result<Self> {
        let bind = options.addr.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ckv-mockstore")
            .enable_all()
            .build()?;

        let shared = Arc::new(Shared::new(options.password.map(String::into_bytes)));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let serve_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("ckv-mockstore-{}", addr.port()))
            .spawn(move || runtime.block_on(server::serve(listener, serve_shared, shutdown_rx)))?;

        info!(%addr, "mock store listening");
        Ok(MockStore {
            addr,
            shared,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Direct access to the stored data.
    pub fn keyspace(&self) -> &Keyspace {
        &self.shared.keyspace
    }

    /// Closes every open client connection. The listener stays up.
    pub fn kill_connections(&self) {
        self.shared.kill.send_modify(|generation| *generation += 1);
    }

    /// Connections accepted since start.
    pub fn connections_accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// How many times `command` was received, e.g. `"PING"` or `"MEMORY STATS"`.
    pub fn command_count(&self, command: &str) -> u64 {
        self.shared
            .commands
            .lock()
            .get(&command.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.kill_connections();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
