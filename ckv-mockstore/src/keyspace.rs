//! # In-Memory Keyspace
//!
//! Strings, lists and hashes per logical database, guarded by one
//! `parking_lot` mutex. Expiry is checked lazily on access, the same way a
//! real store treats a key whose TTL has passed: it simply stops existing.
//!
//! ## Structure Overview
//!
//! ```text
//! Keyspace
//!   ├── dbs: Mutex<HashMap<db, HashMap<key, Entry>>>
//!   │          └── Entry { value: Str | List | Hash, expires_at }
//!   └── list_pushed: Notify   (wakes blocking pops)
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Operation hit a key holding another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

pub type KeyResult<T> = Result<T, WrongType>;

enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

impl Value {
    fn byte_size(&self) -> usize {
        match self {
            Value::Str(data) => data.len(),
            Value::List(items) => items.iter().map(Vec::len).sum(),
            Value::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len()).sum(),
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Entry { value, expires_at: None }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

type Db = HashMap<Vec<u8>, Entry>;

/// Conditions for `set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub only_if_absent: bool,
    pub ttl: Option<Duration>,
}

/// Aggregate size figures for `MEMORY STATS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub keys: usize,
    pub bytes: usize,
}

#[derive(Default)]
pub struct Keyspace {
    dbs: Mutex<HashMap<u32, Db>>,
    list_pushed: Notify,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signalled after every list push.
    pub fn list_pushed(&self) -> &Notify {
        &self.list_pushed
    }

    fn with_db<T>(&self, db: u32, key: &[u8], op: impl FnOnce(&mut Db) -> T) -> T {
        let mut dbs = self.dbs.lock();
        let map = dbs.entry(db).or_default();
        if map.get(key).map_or(false, |entry| entry.is_expired(Instant::now())) {
            map.remove(key);
        }
        op(map)
    }

    pub fn get(&self, db: u32, key: &[u8]) -> KeyResult<Option<Vec<u8>>> {
        self.with_db(db, key, |map| match map.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(data), .. }) => Ok(Some(data.clone())),
            Some(_) => Err(WrongType),
        })
    }

    /// Returns false when `only_if_absent` blocked the write.
    pub fn set(&self, db: u32, key: &[u8], value: Vec<u8>, options: SetOptions) -> bool {
        self.with_db(db, key, |map| {
            if options.only_if_absent && map.contains_key(key) {
                return false;
            }
            let mut entry = Entry::new(Value::Str(value));
            entry.expires_at = options.ttl.map(|ttl| Instant::now() + ttl);
            map.insert(key.to_vec(), entry);
            true
        })
    }

    pub fn del(&self, db: u32, key: &[u8]) -> bool {
        self.with_db(db, key, |map| map.remove(key).is_some())
    }

    /// Pushes `values` in order; returns the new length.
    pub fn push(&self, db: u32, key: &[u8], values: &[Vec<u8>], front: bool) -> KeyResult<i64> {
        let len = self.with_db(db, key, |map| {
            let entry = map
                .entry(key.to_vec())
                .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
            let list = match &mut entry.value {
                Value::List(list) => list,
                _ => return Err(WrongType),
            };
            for value in values {
                if front {
                    list.push_front(value.clone());
                } else {
                    list.push_back(value.clone());
                }
            }
            Ok(list.len() as i64)
        })?;
        self.list_pushed.notify_waiters();
        Ok(len)
    }

    pub fn pop_front(&self, db: u32, key: &[u8]) -> KeyResult<Option<Vec<u8>>> {
        self.with_db(db, key, |map| {
            let list = match map.get_mut(key) {
                None => return Ok(None),
                Some(Entry { value: Value::List(list), .. }) => list,
                Some(_) => return Err(WrongType),
            };
            let value = list.pop_front();
            if list.is_empty() {
                map.remove(key);
            }
            Ok(value)
        })
    }

    pub fn list_len(&self, db: u32, key: &[u8]) -> KeyResult<i64> {
        self.with_db(db, key, |map| match map.get(key) {
            None => Ok(0),
            Some(Entry { value: Value::List(list), .. }) => Ok(list.len() as i64),
            Some(_) => Err(WrongType),
        })
    }

    /// Returns how many fields were newly created.
    pub fn hash_set(&self, db: u32, key: &[u8], pairs: &[(Vec<u8>, Vec<u8>)]) -> KeyResult<i64> {
        self.with_db(db, key, |map| {
            let entry = map
                .entry(key.to_vec())
                .or_insert_with(|| Entry::new(Value::Hash(BTreeMap::new())));
            let fields = match &mut entry.value {
                Value::Hash(fields) => fields,
                _ => return Err(WrongType),
            };
            let mut added = 0;
            for (field, value) in pairs {
                if fields.insert(field.clone(), value.clone()).is_none() {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    pub fn hash_get(&self, db: u32, key: &[u8], field: &[u8]) -> KeyResult<Option<Vec<u8>>> {
        self.with_db(db, key, |map| match map.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(WrongType),
        })
    }

    pub fn hash_del(&self, db: u32, key: &[u8], fields: &[Vec<u8>]) -> KeyResult<i64> {
        self.with_db(db, key, |map| {
            let hash = match map.get_mut(key) {
                None => return Ok(0),
                Some(Entry { value: Value::Hash(hash), .. }) => hash,
                Some(_) => return Err(WrongType),
            };
            let removed = fields.iter().filter(|field| hash.remove(*field).is_some()).count();
            if hash.is_empty() {
                map.remove(key);
            }
            Ok(removed as i64)
        })
    }

    pub fn hash_keys(&self, db: u32, key: &[u8]) -> KeyResult<Vec<Vec<u8>>> {
        self.with_db(db, key, |map| match map.get(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(fields.keys().cloned().collect()),
            Some(_) => Err(WrongType),
        })
    }

    /// One page of at most `count` fields starting at offset `cursor`.
    ///
    /// The next cursor is `0` once the last field has been returned.
    pub fn hash_scan(
        &self,
        db: u32,
        key: &[u8],
        cursor: u64,
        count: usize,
    ) -> KeyResult<(u64, Vec<(Vec<u8>, Vec<u8>)>)> {
        self.with_db(db, key, |map| {
            let fields = match map.get(key) {
                None => return Ok((0, Vec::new())),
                Some(Entry { value: Value::Hash(fields), .. }) => fields,
                Some(_) => return Err(WrongType),
            };
            let start = cursor as usize;
            let page: Vec<_> = fields
                .iter()
                .skip(start)
                .take(count.max(1))
                .map(|(f, v)| (f.clone(), v.clone()))
                .collect();
            let end = start + page.len();
            let next = if end >= fields.len() { 0 } else { end as u64 };
            Ok((next, page))
        })
    }

    /// Live keys and payload bytes across every database.
    pub fn usage(&self) -> Usage {
        let now = Instant::now();
        let dbs = self.dbs.lock();
        let mut usage = Usage::default();
        for entry in dbs.values().flat_map(HashMap::values) {
            if entry.is_expired(now) {
                continue;
            }
            usage.keys += 1;
            usage.bytes += entry.value.byte_size();
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_if_absent_respects_existing_key() {
        let keyspace = Keyspace::new();
        let nx = SetOptions { only_if_absent: true, ttl: None };
        assert!(keyspace.set(0, b"k", b"1".to_vec(), nx));
        assert!(!keyspace.set(0, b"k", b"2".to_vec(), nx));
        assert_eq!(keyspace.get(0, b"k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn expired_key_disappears() {
        let keyspace = Keyspace::new();
        let options = SetOptions { only_if_absent: true, ttl: Some(Duration::from_millis(20)) };
        assert!(keyspace.set(0, b"k", b"1".to_vec(), options));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(keyspace.get(0, b"k").unwrap(), None);
        assert!(keyspace.set(0, b"k", b"2".to_vec(), options));
    }

    #[test]
    fn databases_are_isolated() {
        let keyspace = Keyspace::new();
        keyspace.set(1, b"k", b"1".to_vec(), SetOptions::default());
        assert_eq!(keyspace.get(2, b"k").unwrap(), None);
    }

    #[test]
    fn list_and_hash_types_do_not_mix() {
        let keyspace = Keyspace::new();
        keyspace.push(0, b"q", &[b"a".to_vec()], false).unwrap();
        assert_eq!(keyspace.hash_get(0, b"q", b"f"), Err(WrongType));
        assert_eq!(keyspace.get(0, b"q"), Err(WrongType));
    }

    #[test]
    fn hash_scan_pages_cover_every_field() {
        let keyspace = Keyspace::new();
        let pairs: Vec<_> = (0..7).map(|i| (format!("f{i}").into_bytes(), b"v".to_vec())).collect();
        keyspace.hash_set(0, b"h", &pairs).unwrap();

        let (next, first) = keyspace.hash_scan(0, b"h", 0, 3).unwrap();
        assert_eq!((next, first.len()), (3, 3));
        let (next, second) = keyspace.hash_scan(0, b"h", next, 3).unwrap();
        assert_eq!((next, second.len()), (6, 3));
        let (next, last) = keyspace.hash_scan(0, b"h", next, 3).unwrap();
        assert_eq!((next, last.len()), (0, 1));
    }
}
