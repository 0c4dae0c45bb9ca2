//! # Work Queues
//!
//! FIFO queues over store lists: producers append at the tail, consumers take
//! from the head. `blocking_pop` parks the caller (and one pooled connection)
//! for at most its timeout; the store enforces the wait.

use std::panic::Location;
use std::time::Duration;

use ckv_common::RespValue;

use crate::client::{unexpected, StoreClient};
use crate::error::{ClientError, ClientResult};

/// Wait used by `blocking_pop` when given a zero timeout.
pub const DEFAULT_BLOCKING_POP_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest wait `blocking_pop` sends; larger timeouts are clamped to it.
pub const MAX_BLOCKING_POP_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Queue operations bound to one client/pool.
#[derive(Clone)]
pub struct QueueClient {
    client: StoreClient,
}

impl QueueClient {
    pub fn new(client: StoreClient) -> Self {
        QueueClient { client }
    }

    /// Appends `value` at the tail. Returns the queue length after the push.
    #[track_caller]
    pub fn push(&self, queue: &str, value: impl AsRef<[u8]>) -> ClientResult<i64> {
        self.push_with(b"RPUSH", "RPUSH", queue, value.as_ref(), Location::caller())
    }

    /// Inserts `value` at the head, ahead of everything already queued.
    #[track_caller]
    pub fn push_front(&self, queue: &str, value: impl AsRef<[u8]>) -> ClientResult<i64> {
        self.push_with(b"LPUSH", "LPUSH", queue, value.as_ref(), Location::caller())
    }

    fn push_with(
        &self,
        verb: &[u8],
        command: &'static str,
        queue: &str,
        value: &[u8],
        location: &'static Location<'static>,
    ) -> ClientResult<i64> {
        self.client.execute(command, location, |conn| match conn.exec(&[verb, queue.as_bytes(), value])? {
            RespValue::Integer(len) => Ok(len),
            other => Err(unexpected(command, other)),
        })
    }

    /// Removes the head entry. `Ok(None)` when the queue is empty.
    #[track_caller]
    pub fn pop(&self, queue: &str) -> ClientResult<Option<Vec<u8>>> {
        let location = Location::caller();
        self.client.execute("LPOP", location, |conn| match conn.exec(&[b"LPOP", queue.as_bytes()])? {
            RespValue::Bulk(value) => Ok(value),
            other => Err(unexpected("LPOP", other)),
        })
    }

    /// Removes the head entry, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout means [`DEFAULT_BLOCKING_POP_TIMEOUT`]. Sub-second parts
    /// round up to the next whole second and the wait is clamped to
    /// [`MAX_BLOCKING_POP_TIMEOUT`]. `Ok(None)` when the wait expires.
    #[track_caller]
    pub fn blocking_pop(&self, queue: &str, timeout: Duration) -> ClientResult<Option<Vec<u8>>> {
        let location = Location::caller();
        let wait = blocking_wait(timeout);
        let seconds = wait.as_secs().to_string();

        self.client.execute("BLPOP", location, |conn| {
            match conn.exec_blocking(&[b"BLPOP", queue.as_bytes(), seconds.as_bytes()], wait)? {
                RespValue::Array(None) | RespValue::Bulk(None) => Ok(None),
                RespValue::Array(Some(mut pair)) if pair.len() == 2 => match pair.pop() {
                    Some(RespValue::Bulk(Some(value))) => Ok(Some(value)),
                    _ => Err(ClientError::UnexpectedResponse { command: "BLPOP" }),
                },
                other => Err(unexpected("BLPOP", other)),
            }
        })
    }

    /// Number of queued entries.
    #[track_caller]
    pub fn len(&self, queue: &str) -> ClientResult<i64> {
        let location = Location::caller();
        self.client.execute("LLEN", location, |conn| match conn.exec(&[b"LLEN", queue.as_bytes()])? {
            RespValue::Integer(len) => Ok(len),
            other => Err(unexpected("LLEN", other)),
        })
    }

    /// Drops the whole queue. Returns true when it existed.
    #[track_caller]
    pub fn clear(&self, queue: &str) -> ClientResult<bool> {
        self.client.del(queue)
    }
}

/// Whole-second wait actually sent to the store.
fn blocking_wait(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        return DEFAULT_BLOCKING_POP_TIMEOUT;
    }
    let mut secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    Duration::from_secs(secs).min(MAX_BLOCKING_POP_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_uses_default() {
        assert_eq!(blocking_wait(Duration::ZERO), Duration::from_secs(60));
    }

    #[test]
    fn partial_seconds_round_up() {
        assert_eq!(blocking_wait(Duration::from_millis(1)), Duration::from_secs(1));
        assert_eq!(blocking_wait(Duration::from_millis(2500)), Duration::from_secs(3));
        assert_eq!(blocking_wait(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn huge_timeouts_are_clamped() {
        assert_eq!(blocking_wait(Duration::MAX), MAX_BLOCKING_POP_TIMEOUT);
        assert_eq!(blocking_wait(Duration::from_secs(u64::MAX)), MAX_BLOCKING_POP_TIMEOUT);
        assert_eq!(blocking_wait(Duration::from_secs(3600)), Duration::from_secs(3600));
    }
}
