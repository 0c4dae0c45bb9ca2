//! # Distributed Lock
//!
//! Advisory, TTL-bound mutual exclusion keyed by an application-chosen name.
//!
//! ## Protocol
//! - **lock**: `SET <key> <token> NX PX <ttl>`. `OK` means the caller now holds
//!   the lock; a null reply means someone else does (`AlreadyLocked`). No
//!   internal blocking: callers pick their own retry policy.
//! - **unlock**: `GET <key>`, compare with the caller's token, `DEL <key>` on
//!   match. The TTL frees locks whose holder crashed.
//!
//! ## Known Race
//! The compare and the delete are two round trips. If the TTL fires between
//! them and another holder re-acquires, the delete removes the new holder's
//! key. The window is bounded by one round trip after TTL expiry.
//!
//! ## Key Layout
//! ```text
//! name "job:5"  ->  key "nodes:lock:job-5"
//! ```

use std::panic::Location;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ckv_common::RespValue;
use tracing::{debug, warn};

use crate::client::{unexpected, StoreClient};
use crate::error::{ClientError, ClientResult};

/// Default lock expiry.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Namespace prepended to every lock key.
pub const LOCK_KEY_PREFIX: &str = "nodes:lock:";

/// Acquisition token; only the holder presenting it may release the lock.
pub type LockToken = i64;

static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Issues a token from the wall clock, strictly increasing within the process.
fn next_token() -> LockToken {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0);
    let mut last = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_TOKEN.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Result of a release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Key matched the token and was deleted.
    Released,
    /// No lock stored under the key (expired or never taken).
    Missing,
    /// Key holds another holder's token; left untouched.
    NotOwner { stored: String },
    /// Token matched but the delete removed nothing.
    NotDeleted,
}

/// Lock manager bound to one client/pool.
#[derive(Clone)]
pub struct LockManager {
    client: StoreClient,
    ttl: Duration,
    prefix: String,
}

impl LockManager {
    pub fn new(client: StoreClient) -> Self {
        LockManager {
            client,
            ttl: DEFAULT_LOCK_TTL,
            prefix: LOCK_KEY_PREFIX.to_string(),
        }
    }

    /// Overrides the lock expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides the key namespace.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store key for `name`; `:` separators become `-`.
    pub fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.replace(':', "-"))
    }

    /// Tries once to take the lock.
    ///
    /// Fails with `ClientError::AlreadyLocked` when another holder owns it.
    #[track_caller]
    pub fn lock(&self, name: &str) -> ClientResult<LockToken> {
        self.lock_at(name, Location::caller())
    }

    /// Retries `lock` up to `attempts` times, sleeping `delay` after contention.
    ///
    /// Only `AlreadyLocked` is retried; other errors return immediately.
    #[track_caller]
    pub fn lock_with_retry(&self, name: &str, attempts: u32, delay: Duration) -> ClientResult<LockToken> {
        let location = Location::caller();
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.lock_at(name, location) {
                Err(err) if err.is_already_locked() && attempt < attempts => {
                    attempt += 1;
                    thread::sleep(delay);
                }
                outcome => return outcome,
            }
        }
    }

    fn lock_at(&self, name: &str, location: &'static Location<'static>) -> ClientResult<LockToken> {
        let key = self.key_for(name);
        let token = next_token();
        let value = token.to_string();
        let acquired = self.client.set_if_absent_at(&key, value.as_bytes(), self.ttl, location)?;

        if !acquired {
            return Err(ClientError::AlreadyLocked { name: name.to_string() });
        }
        debug!(%key, token, "lock acquired");
        Ok(token)
    }

    /// Releases the lock if `token` still owns it, reporting what happened.
    ///
    /// Both round trips run on the same borrowed connection.
    #[track_caller]
    pub fn try_unlock(&self, name: &str, token: LockToken) -> ClientResult<UnlockOutcome> {
        let location = Location::caller();
        let key = self.key_for(name);
        let expected = token.to_string();

        self.client.execute("UNLOCK", location, |conn| {
            let stored = match conn.exec(&[b"GET", key.as_bytes()])? {
                RespValue::Bulk(None) => return Ok(UnlockOutcome::Missing),
                RespValue::Bulk(Some(stored)) => stored,
                other => return Err(unexpected("GET", other)),
            };
            if stored != expected.as_bytes() {
                return Ok(UnlockOutcome::NotOwner {
                    stored: String::from_utf8_lossy(&stored).into_owned(),
                });
            }
            match conn.exec(&[b"DEL", key.as_bytes()])? {
                RespValue::Integer(0) => Ok(UnlockOutcome::NotDeleted),
                RespValue::Integer(_) => Ok(UnlockOutcome::Released),
                other => Err(unexpected("DEL", other)),
            }
        })
    }

    /// Best-effort release for cleanup paths: problems are logged, never
    /// returned.
    #[track_caller]
    pub fn unlock(&self, name: &str, token: LockToken) {
        let key = self.key_for(name);
        match self.try_unlock(name, token) {
            Ok(UnlockOutcome::Released) => debug!(%key, token, "lock released"),
            Ok(UnlockOutcome::Missing) => warn!(%key, token, "unlock skipped: lock key is absent"),
            Ok(UnlockOutcome::NotOwner { stored }) => {
                warn!(%key, token, %stored, "unlock skipped: lock is held under a different token")
            }
            Ok(UnlockOutcome::NotDeleted) => warn!(%key, token, "unlock failed: delete removed nothing"),
            Err(err) => warn!(%key, token, error = %err, "unlock failed"),
        }
    }

    /// Takes the lock and returns a guard that releases it on drop.
    #[track_caller]
    pub fn guard(&self, name: &str) -> ClientResult<LockGuard<'_>> {
        let token = self.lock(name)?;
        Ok(LockGuard {
            manager: self,
            name: name.to_string(),
            token,
        })
    }
}

/// Held lock; dropping it performs a best-effort `unlock`.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    name: String,
    token: LockToken,
}

impl LockGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> LockToken {
        self.token
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.unlock(&self.name, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn manager() -> LockManager {
        LockManager::new(StoreClient::new(&StoreConfig::default()))
    }

    #[test]
    fn key_replaces_separators() {
        assert_eq!(manager().key_for("job:5:run"), "nodes:lock:job-5-run");
        assert_eq!(manager().with_prefix("app:").key_for("a"), "app:a");
    }

    #[test]
    fn tokens_strictly_increase() {
        let tokens: Vec<LockToken> = (0..1000).map(|_| next_token()).collect();
        assert!(tokens.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn tokens_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..500).map(|_| next_token()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<LockToken> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }
}
