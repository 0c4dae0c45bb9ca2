//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! in-memory keyspace.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ckv_common::{parse_i64, RespParser, RespValue};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::keyspace::{Keyspace, SetOptions, WrongType};

const DEFAULT_SCAN_COUNT: usize = 10;

/// State shared by every connection task.
pub(crate) struct Shared {
    pub(crate) keyspace: Keyspace,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) kill: watch::Sender<u64>,
    pub(crate) accepted: AtomicU64,
    pub(crate) commands: Mutex<HashMap<String, u64>>,
}

impl Shared {
    pub(crate) fn new(password: Option<Vec<u8>>) -> Self {
        let (kill, _) = watch::channel(0);
        Shared {
            keyspace: Keyspace::new(),
            password,
            kill,
            accepted: AtomicU64::new(0),
            commands: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    db: u32,
    authenticated: bool,
}

/// Accepts connections until `shutdown` fires.
pub(crate) async fn serve(listener: std::net::TcpListener, shared: Arc<Shared>, mut shutdown: oneshot::Receiver<()>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(error = %err, "mock store could not adopt listener");
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    shared.accepted.fetch_add(1, Ordering::Relaxed);
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, shared).await {
                            debug!(%peer, error = %err, "mock store connection ended");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "mock store accept failed"),
            },
            _ = &mut shutdown => break,
        }
    }
}

/// Handles a single TCP client connection.
async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let mut kill = shared.kill.subscribe();
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut session = Session {
        db: 0,
        authenticated: shared.password.is_none(),
    };
    let mut out = Vec::with_capacity(256);

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }
            }
            _ = kill.changed() => return Ok(()),
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    let response = dispatch_command(&args, &mut session, &shared).await;
                    out.clear();
                    response.encode(&mut out);
                    stream.write_all(&out).await?;
                }
                Ok(None) => break,
                Err(_) => {
                    out.clear();
                    resp_error("protocol error").encode(&mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch_command(args: &[Vec<u8>], session: &mut Session, shared: &Shared) -> RespValue {
    if args.is_empty() {
        return resp_error("empty command");
    }

    let mut name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    if name == "MEMORY" && args.len() > 1 {
        name = format!("MEMORY {}", String::from_utf8_lossy(&args[1]).to_ascii_uppercase());
    }
    *shared.commands.lock().entry(name.clone()).or_insert(0) += 1;

    if name == "AUTH" {
        return handle_auth(args, session, shared);
    }
    if !session.authenticated {
        return RespValue::error("NOAUTH Authentication required.");
    }

    let keyspace = &shared.keyspace;
    let db = session.db;
    match name.as_str() {
        "PING" => handle_ping(args),
        "SELECT" => handle_select(args, session),
        "GET" => handle_get(args, keyspace, db),
        "SET" => handle_set(args, keyspace, db),
        "DEL" => handle_del(args, keyspace, db),
        "RPUSH" => handle_push(args, keyspace, db, false),
        "LPUSH" => handle_push(args, keyspace, db, true),
        "LPOP" => handle_pop(args, keyspace, db),
        "BLPOP" => handle_blocking_pop(args, keyspace, db).await,
        "LLEN" => handle_llen(args, keyspace, db),
        "HSET" => handle_hset(args, keyspace, db),
        "HGET" => handle_hget(args, keyspace, db),
        "HDEL" => handle_hdel(args, keyspace, db),
        "HKEYS" => handle_hkeys(args, keyspace, db),
        "HSCAN" => handle_hscan(args, keyspace, db),
        "MEMORY STATS" => handle_memory_stats(keyspace),
        _ => resp_error("unknown command"),
    }
}

fn handle_auth(args: &[Vec<u8>], session: &mut Session, shared: &Shared) -> RespValue {
    if args.len() != 2 {
        return wrong_args("AUTH");
    }
    match &shared.password {
        None => resp_error("AUTH called without any password configured"),
        Some(password) if *password == args[1] => {
            session.authenticated = true;
            RespValue::ok()
        }
        Some(_) => RespValue::error("WRONGPASS invalid password"),
    }
}

fn handle_ping(args: &[Vec<u8>]) -> RespValue {
    match args.len() {
        1 => RespValue::Simple(b"PONG".to_vec()),
        2 => RespValue::bulk(args[1].clone()),
        _ => wrong_args("PING"),
    }
}

fn handle_select(args: &[Vec<u8>], session: &mut Session) -> RespValue {
    if args.len() != 2 {
        return wrong_args("SELECT");
    }
    match parse_i64(&args[1]).ok().and_then(|db| u32::try_from(db).ok()) {
        Some(db) => {
            session.db = db;
            RespValue::ok()
        }
        None => resp_error("invalid DB index"),
    }
}

fn handle_get(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() != 2 {
        return wrong_args("GET");
    }
    typed(keyspace.get(db, &args[1]), RespValue::Bulk)
}

fn handle_set(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() < 3 {
        return wrong_args("SET");
    }

    let mut options = SetOptions::default();
    let mut idx = 3;
    while idx < args.len() {
        let flag = args[idx].to_ascii_uppercase();
        match flag.as_slice() {
            b"NX" => options.only_if_absent = true,
            b"EX" | b"PX" => {
                let amount = match args.get(idx + 1).and_then(|raw| parse_i64(raw).ok()) {
                    Some(amount) if amount > 0 => amount as u64,
                    _ => return resp_error("invalid expire time in 'set' command"),
                };
                options.ttl = Some(if flag == b"EX" {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                });
                idx += 1;
            }
            _ => return resp_error("syntax error"),
        }
        idx += 1;
    }

    if keyspace.set(db, &args[1], args[2].clone(), options) {
        RespValue::ok()
    } else {
        RespValue::Bulk(None)
    }
}

fn handle_del(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() < 2 {
        return wrong_args("DEL");
    }
    let removed = args[1..].iter().filter(|key| keyspace.del(db, key)).count();
    RespValue::Integer(removed as i64)
}

fn handle_push(args: &[Vec<u8>], keyspace: &Keyspace, db: u32, front: bool) -> RespValue {
    if args.len() < 3 {
        return wrong_args(if front { "LPUSH" } else { "RPUSH" });
    }
    typed(keyspace.push(db, &args[1], &args[2..], front), RespValue::Integer)
}

fn handle_pop(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() != 2 {
        return wrong_args("LPOP");
    }
    typed(keyspace.pop_front(db, &args[1]), RespValue::Bulk)
}

async fn handle_blocking_pop(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() < 3 {
        return wrong_args("BLPOP");
    }
    let keys = &args[1..args.len() - 1];
    let timeout = match std::str::from_utf8(&args[args.len() - 1])
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
    {
        Some(secs) if secs >= 0.0 && secs.is_finite() => secs,
        _ => return resp_error("timeout is not a float or out of range"),
    };
    // Zero blocks forever.
    let deadline = (timeout > 0.0).then(|| Instant::now() + Duration::from_secs_f64(timeout));

    loop {
        // Register before checking so a push in between still wakes us.
        let pushed = keyspace.list_pushed().notified();
        for key in keys {
            match keyspace.pop_front(db, key) {
                Ok(Some(value)) => return RespValue::array(vec![RespValue::bulk(key.clone()), RespValue::bulk(value)]),
                Ok(None) => {}
                Err(WrongType) => return wrong_type(),
            }
        }
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return RespValue::Array(None);
                }
                let _ = tokio::time::timeout_at(deadline, pushed).await;
            }
            None => pushed.await,
        }
    }
}

fn handle_llen(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() != 2 {
        return wrong_args("LLEN");
    }
    typed(keyspace.list_len(db, &args[1]), RespValue::Integer)
}

fn handle_hset(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() < 4 || args.len() % 2 != 0 {
        return wrong_args("HSET");
    }
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = args[2..]
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    typed(keyspace.hash_set(db, &args[1], &pairs), RespValue::Integer)
}

fn handle_hget(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() != 3 {
        return wrong_args("HGET");
    }
    typed(keyspace.hash_get(db, &args[1], &args[2]), RespValue::Bulk)
}

fn handle_hdel(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() < 3 {
        return wrong_args("HDEL");
    }
    typed(keyspace.hash_del(db, &args[1], &args[2..]), RespValue::Integer)
}

fn handle_hkeys(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() != 2 {
        return wrong_args("HKEYS");
    }
    typed(keyspace.hash_keys(db, &args[1]), |fields| {
        RespValue::array(fields.into_iter().map(RespValue::bulk).collect())
    })
}

fn handle_hscan(args: &[Vec<u8>], keyspace: &Keyspace, db: u32) -> RespValue {
    if args.len() < 3 {
        return wrong_args("HSCAN");
    }
    let cursor = match parse_i64(&args[2]).ok().and_then(|cursor| u64::try_from(cursor).ok()) {
        Some(cursor) => cursor,
        None => return resp_error("invalid cursor"),
    };

    let mut count = DEFAULT_SCAN_COUNT;
    let mut idx = 3;
    while idx + 1 < args.len() {
        match args[idx].to_ascii_uppercase().as_slice() {
            b"COUNT" => match parse_i64(&args[idx + 1]).ok().filter(|count| *count > 0) {
                Some(value) => count = value as usize,
                None => return resp_error("syntax error"),
            },
            // Patterns are accepted and ignored.
            b"MATCH" => {}
            _ => return resp_error("syntax error"),
        }
        idx += 2;
    }
    if idx != args.len() {
        return resp_error("syntax error");
    }

    typed(keyspace.hash_scan(db, &args[1], cursor, count), |(next, page)| {
        let mut items = Vec::with_capacity(page.len() * 2);
        for (field, value) in page {
            items.push(RespValue::bulk(field));
            items.push(RespValue::bulk(value));
        }
        RespValue::array(vec![RespValue::bulk(next.to_string()), RespValue::array(items)])
    })
}

fn handle_memory_stats(keyspace: &Keyspace) -> RespValue {
    let usage = keyspace.usage();
    let overhead = 800_000 + usage.keys as i64 * 64;
    let dataset = usage.bytes as i64;
    let total = overhead + dataset;

    let metric = |name: &str, value: RespValue| [RespValue::bulk(name), value];
    let items: Vec<RespValue> = [
        metric("peak.allocated", RespValue::Integer(total)),
        metric("total.allocated", RespValue::Integer(total)),
        metric("startup.allocated", RespValue::Integer(800_000)),
        metric("clients.normal", RespValue::Integer(20_000)),
        metric(
            "db.0",
            RespValue::array(vec![
                RespValue::bulk("overhead.hashtable.main"),
                RespValue::Integer(usage.keys as i64 * 64),
            ]),
        ),
        metric("overhead.total", RespValue::Integer(overhead)),
        metric("keys.count", RespValue::Integer(usage.keys as i64)),
        metric("keys.bytes-per-key", RespValue::Integer(if usage.keys == 0 { 0 } else { total / usage.keys as i64 })),
        metric("dataset.bytes", RespValue::Integer(dataset)),
        metric("dataset.percentage", RespValue::bulk(format!("{:.2}", dataset as f64 * 100.0 / total as f64))),
        metric("fragmentation", RespValue::bulk("1.25")),
    ]
    .into_iter()
    .flatten()
    .collect();
    RespValue::array(items)
}

fn typed<T>(result: Result<T, WrongType>, reply: impl FnOnce(T) -> RespValue) -> RespValue {
    match result {
        Ok(value) => reply(value),
        Err(WrongType) => wrong_type(),
    }
}

fn wrong_type() -> RespValue {
    RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn wrong_args(command: &str) -> RespValue {
    resp_error(&format!("wrong number of arguments for '{}' command", command.to_ascii_lowercase()))
}

fn resp_error(message: &str) -> RespValue {
    RespValue::error(format!("ERR {message}"))
}
