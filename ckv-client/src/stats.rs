//! # Memory Statistics
//!
//! `MEMORY STATS` answers with one flat array alternating metric names and
//! values:
//!
//! ```text
//! ["peak.allocated", 1048576, "db.1", [..nested..], "dataset.percentage", "12.5", ...]
//! ```
//!
//! The reply is walked in strict (name, value) pairs. A pair is kept only when
//! the name is on [`MEMORY_STATS_METRICS`] and the value decodes as an integer;
//! anything else is skipped without failing the call.

use std::collections::HashMap;
use std::panic::Location;

use ckv_common::RespValue;

use crate::client::{unexpected, StoreClient};
use crate::error::ClientResult;

/// Metrics retained from `MEMORY STATS`.
pub const MEMORY_STATS_METRICS: [&str; 6] = [
    "peak.allocated",
    "total.allocated",
    "startup.allocated",
    "overhead.total",
    "keys.count",
    "dataset.bytes",
];

impl StoreClient {
    /// Allow-listed memory metrics reported by the store.
    #[track_caller]
    pub fn memory_stats(&self) -> ClientResult<HashMap<String, i64>> {
        let location = Location::caller();
        self.execute("MEMORY STATS", location, |conn| match conn.exec(&[b"MEMORY", b"STATS"])? {
            reply @ RespValue::Array(_) => Ok(parse_memory_stats(&reply)),
            other => Err(unexpected("MEMORY STATS", other)),
        })
    }
}

/// Extracts allow-listed integer metrics from a flat `MEMORY STATS` reply.
pub fn parse_memory_stats(reply: &RespValue) -> HashMap<String, i64> {
    let mut stats = HashMap::new();
    let items = match reply {
        RespValue::Array(Some(items)) => items,
        _ => return stats,
    };

    for pair in items.chunks_exact(2) {
        let name = match pair[0].as_bytes().and_then(|raw| std::str::from_utf8(raw).ok()) {
            Some(name) => name,
            None => continue,
        };
        if !MEMORY_STATS_METRICS.contains(&name) {
            continue;
        }
        if let Some(value) = pair[1].as_i64() {
            stats.insert(name.to_string(), value);
        }
    }
    stats
}
