//! # CoordKV Client
//!
//! Purpose: Turn a remote Redis-compatible store into shared coordination
//! infrastructure for a multi-process application: a pooled command client,
//! a TTL-bound distributed lock, FIFO work queues with blocking pop, and
//! cursor-based hash scanning.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Borrow/Execute/Release**: Every operation borrows one connection and
//!    always hands it back, whatever the outcome.
//! 3. **Explicit Handles**: One `StoreClient` per process, cloned into each
//!    component instead of living in a global.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Start-up
//!
//! ```no_run
//! use ckv_client::{Backoff, StoreClient, StoreConfig};
//!
//! let config = StoreConfig::from_env()?;
//! let client = StoreClient::connect_ready(&config, &Backoff::default())?;
//! let locks = client.locks();
//! let token = locks.lock("job:5")?;
//! locks.unlock("job:5", token);
//! # Ok::<(), ckv_client::ClientError>(())
//! ```

mod client;
mod config;
mod error;
mod hash;
mod lock;
mod pool;
mod queue;
mod ready;
mod stats;

pub use ckv_common::RespValue;
pub use client::StoreClient;
pub use config::{ConnectionUrl, StoreConfig, ENV_PREFIX};
pub use error::{ClientError, ClientResult};
pub use hash::{HashClient, ScanPage};
pub use lock::{LockGuard, LockManager, LockToken, UnlockOutcome, DEFAULT_LOCK_TTL, LOCK_KEY_PREFIX};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use queue::{QueueClient, DEFAULT_BLOCKING_POP_TIMEOUT, MAX_BLOCKING_POP_TIMEOUT};
pub use ready::{wait_until_ready, Backoff, Intervals, ReadyReport};
pub use stats::{parse_memory_stats, MEMORY_STATS_METRICS};
