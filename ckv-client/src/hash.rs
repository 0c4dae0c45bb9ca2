//! # Hash Client
//!
//! Field-level access to store hashes plus a cursor-driven full scan.
//!
//! ## Scan Protocol
//! `HSCAN key cursor [COUNT n]` returns `[next_cursor, [field, value, ...]]`.
//! A single page is not the whole hash; the loop keeps feeding the returned
//! cursor back until the store hands out `0` again. The store may repeat a
//! field across pages, so fields are de-duplicated.

use std::collections::HashSet;
use std::panic::Location;

use ckv_common::RespValue;

use crate::client::{unexpected, StoreClient};
use crate::error::{ClientError, ClientResult};
use crate::pool::PooledConnection;

/// One `HSCAN` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` when the scan is complete.
    pub cursor: u64,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Hash operations bound to one client/pool.
#[derive(Clone)]
pub struct HashClient {
    client: StoreClient,
}

impl HashClient {
    pub fn new(client: StoreClient) -> Self {
        HashClient { client }
    }

    /// Sets `field` on hash `key`. Returns true when the field is new.
    #[track_caller]
    pub fn set(&self, key: &str, field: &str, value: impl AsRef<[u8]>) -> ClientResult<bool> {
        let location = Location::caller();
        self.client.execute("HSET", location, |conn| {
            match conn.exec(&[b"HSET", key.as_bytes(), field.as_bytes(), value.as_ref()])? {
                RespValue::Integer(added) => Ok(added > 0),
                other => Err(unexpected("HSET", other)),
            }
        })
    }

    /// Reads one field. `Ok(None)` when the hash or field is missing.
    #[track_caller]
    pub fn get(&self, key: &str, field: &str) -> ClientResult<Option<Vec<u8>>> {
        let location = Location::caller();
        self.client.execute("HGET", location, |conn| {
            match conn.exec(&[b"HGET", key.as_bytes(), field.as_bytes()])? {
                RespValue::Bulk(value) => Ok(value),
                other => Err(unexpected("HGET", other)),
            }
        })
    }

    /// Removes one field. Returns true when it existed.
    #[track_caller]
    pub fn delete(&self, key: &str, field: &str) -> ClientResult<bool> {
        let location = Location::caller();
        self.client.execute("HDEL", location, |conn| {
            match conn.exec(&[b"HDEL", key.as_bytes(), field.as_bytes()])? {
                RespValue::Integer(removed) => Ok(removed > 0),
                other => Err(unexpected("HDEL", other)),
            }
        })
    }

    /// All field names in one call.
    #[track_caller]
    pub fn keys(&self, key: &str) -> ClientResult<Vec<Vec<u8>>> {
        let location = Location::caller();
        self.client.execute("HKEYS", location, |conn| match conn.exec(&[b"HKEYS", key.as_bytes()])? {
            RespValue::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Bulk(Some(field)) => Ok(field),
                    _ => Err(ClientError::UnexpectedResponse { command: "HKEYS" }),
                })
                .collect(),
            RespValue::Array(None) => Ok(Vec::new()),
            other => Err(unexpected("HKEYS", other)),
        })
    }

    /// Fetches one page starting at `cursor`.
    #[track_caller]
    pub fn scan_page(&self, key: &str, cursor: u64, count: Option<usize>) -> ClientResult<ScanPage> {
        let location = Location::caller();
        self.client.execute("HSCAN", location, |conn| hscan(conn, key, cursor, count))
    }

    /// Every `(field, value)` of the hash, each field once.
    ///
    /// The whole cursor loop runs on one borrowed connection.
    #[track_caller]
    pub fn scan_entries(&self, key: &str) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_entries_at(key, None, Location::caller())
    }

    /// Like `scan_entries`, hinting the store to return about `count` per page.
    #[track_caller]
    pub fn scan_entries_with_count(&self, key: &str, count: usize) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_entries_at(key, Some(count), Location::caller())
    }

    /// Every value of the hash.
    #[track_caller]
    pub fn scan_all(&self, key: &str) -> ClientResult<Vec<Vec<u8>>> {
        let entries = self.scan_entries_at(key, None, Location::caller())?;
        Ok(entries.into_iter().map(|(_, value)| value).collect())
    }

    fn scan_entries_at(
        &self,
        key: &str,
        count: Option<usize>,
        location: &'static Location<'static>,
    ) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.client.execute("HSCAN", location, |conn| {
            let mut seen = HashSet::new();
            let mut results = Vec::new();
            let mut cursor = 0;
            loop {
                let page = hscan(conn, key, cursor, count)?;
                for (field, value) in page.entries {
                    if seen.insert(field.clone()) {
                        results.push((field, value));
                    }
                }
                if page.cursor == 0 {
                    return Ok(results);
                }
                cursor = page.cursor;
            }
        })
    }
}

fn hscan(conn: &mut PooledConnection, key: &str, cursor: u64, count: Option<usize>) -> ClientResult<ScanPage> {
    let cursor_arg = cursor.to_string();
    let reply = match count {
        Some(count) => {
            let count_arg = count.max(1).to_string();
            conn.exec(&[b"HSCAN", key.as_bytes(), cursor_arg.as_bytes(), b"COUNT", count_arg.as_bytes()])?
        }
        None => conn.exec(&[b"HSCAN", key.as_bytes(), cursor_arg.as_bytes()])?,
    };
    parse_scan_reply(reply)
}

fn parse_scan_reply(reply: RespValue) -> ClientResult<ScanPage> {
    let shape = || ClientError::UnexpectedResponse { command: "HSCAN" };

    let mut parts = match reply {
        RespValue::Array(Some(parts)) if parts.len() == 2 => parts.into_iter(),
        other => return Err(unexpected("HSCAN", other)),
    };
    let cursor = parts
        .next()
        .and_then(|value| value.as_i64())
        .and_then(|cursor| u64::try_from(cursor).ok())
        .ok_or_else(shape)?;
    let items = match parts.next() {
        Some(RespValue::Array(Some(items))) if items.len() % 2 == 0 => items,
        _ => return Err(shape()),
    };

    let mut entries = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(field), Some(value)) = (items.next(), items.next()) {
        match (field, value) {
            (RespValue::Bulk(Some(field)), RespValue::Bulk(Some(value))) => entries.push((field, value)),
            _ => return Err(shape()),
        }
    }
    Ok(ScanPage { cursor, entries })
}
