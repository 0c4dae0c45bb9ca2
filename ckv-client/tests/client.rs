use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use ckv_client::{
    ClientError, ConnectionPool, ConnectionUrl, PoolConfig, RespValue, StoreClient, MAX_BLOCKING_POP_TIMEOUT,
};

mod common;

fn spawn_server(expected_commands: usize, handler: fn(usize, Vec<Vec<u8>>, &mut TcpStream)) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let args = read_command(&mut reader).expect("read command");
            handler(idx, args, &mut stream);
        }
    });

    port
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        if !data.ends_with(b"\r\n") {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        data.truncate(len);
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "length"))
}

fn write_raw(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(data);
    let _ = stream.flush();
}

fn scripted_config(port: u16, database: u32, password: Option<&str>) -> PoolConfig {
    let mut config = PoolConfig::new(ConnectionUrl {
        host: "127.0.0.1".to_string(),
        port,
        database,
        password: password.map(str::to_string),
    });
    config.max_idle = 1;
    config.max_active = 1;
    config.read_timeout = Some(Duration::from_secs(1));
    config.write_timeout = Some(Duration::from_secs(1));
    config.connect_timeout = Some(Duration::from_secs(1));
    config
}

fn scripted_client(port: u16, database: u32, password: Option<&str>) -> StoreClient {
    StoreClient::with_pool_config(scripted_config(port, database, password))
}

#[test]
fn handshake_authenticates_and_selects_database() {
    let port = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args, vec![b"AUTH".to_vec(), b"hunter2".to_vec()]);
            write_raw(stream, b"+OK\r\n");
        }
        1 => {
            assert_eq!(args, vec![b"SELECT".to_vec(), b"4".to_vec()]);
            write_raw(stream, b"+OK\r\n");
        }
        _ => {
            assert_eq!(args, vec![b"GET".to_vec(), b"jobs:5".to_vec()]);
            write_raw(stream, b"$-1\r\n");
        }
    });

    let client = scripted_client(port, 4, Some("hunter2"));
    assert_eq!(client.get("jobs:5").expect("get"), None);
}

#[test]
fn database_zero_skips_select() {
    let port = spawn_server(1, |_, args, stream| {
        assert_eq!(args, vec![b"PING".to_vec()]);
        write_raw(stream, b"+PONG\r\n");
    });

    scripted_client(port, 0, None).ping().expect("ping");
}

#[test]
fn set_if_absent_sends_nx_with_millisecond_ttl() {
    let port = spawn_server(3, |idx, args, stream| match idx {
        0 => write_raw(stream, b"+OK\r\n"),
        1 => {
            assert_eq!(
                args,
                vec![
                    b"SET".to_vec(),
                    b"k".to_vec(),
                    b"v".to_vec(),
                    b"NX".to_vec(),
                    b"PX".to_vec(),
                    b"1500".to_vec()
                ]
            );
            write_raw(stream, b"+OK\r\n");
        }
        _ => write_raw(stream, b"$-1\r\n"),
    });

    let client = scripted_client(port, 1, None);
    assert!(client.set_if_absent("k", "v", Duration::from_millis(1500)).expect("first"));
    assert!(!client.set_if_absent("k", "v", Duration::from_millis(1500)).expect("second"));
}

#[test]
fn server_error_carries_command_and_call_site() {
    let port = spawn_server(2, |idx, _, stream| match idx {
        0 => write_raw(stream, b"+OK\r\n"),
        _ => write_raw(stream, b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"),
    });

    let client = scripted_client(port, 1, None);
    let err = client.get("queue").unwrap_err();
    match &err {
        ClientError::Command { command, location, .. } => {
            assert_eq!(*command, "GET");
            assert!(location.file().ends_with("client.rs"), "{}", location.file());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root(), ClientError::Server { .. }));
    assert!(err.to_string().contains("WRONGTYPE"));
}

#[test]
fn failed_auth_surfaces_server_error() {
    let port = spawn_server(1, |_, _, stream| {
        write_raw(stream, b"-WRONGPASS invalid password\r\n");
    });

    let err = scripted_client(port, 1, Some("nope")).ping().unwrap_err();
    assert!(matches!(err.root(), ClientError::Server { .. }));
}

#[test]
fn strings_roundtrip_against_store() {
    let store = common::start_store();
    let client = common::client(&store);

    assert_eq!(client.get("missing").expect("get"), None);
    client.set("greeting", "hello").expect("set");
    assert_eq!(client.get("greeting").expect("get"), Some(b"hello".to_vec()));
    assert!(client.del("greeting").expect("del"));
    assert!(!client.del("greeting").expect("del again"));
}

#[test]
fn database_index_isolates_keys() {
    let store = common::start_store();
    let db1 = common::client(&store);
    let mut config = common::store_config(&store);
    config.database = 2;
    let db2 = StoreClient::new(&config);

    db1.set("shared", "one").expect("set");
    assert_eq!(db2.get("shared").expect("get"), None);
}

#[test]
fn password_protected_store_accepts_configured_password() {
    let store = ckv_mockstore::MockStore::start_with(ckv_mockstore::MockStoreOptions {
        password: Some("s3cret".to_string()),
        ..Default::default()
    })
    .expect("start");

    let mut config = common::store_config(&store);
    config.password = Some("s3cret".to_string());
    StoreClient::new(&config).ping().expect("authorized ping");

    config.password = None;
    let err = StoreClient::new(&config).ping().unwrap_err();
    assert!(matches!(err.root(), ClientError::Server { .. }));
}

#[test]
fn raw_command_returns_reply() {
    let store = common::start_store();
    let client = common::client(&store);

    let reply = client.command(&[b"PING", b"hi"]).expect("command");
    assert_eq!(reply.as_bytes(), Some(&b"hi"[..]));
    let err = client.command(&[b"NOPE"]).unwrap_err();
    assert!(matches!(err.root(), ClientError::Server { .. }));
}

#[test]
fn blocking_pop_clamps_unbounded_timeout() {
    let port = spawn_server(1, |_, args, stream| {
        let clamped = MAX_BLOCKING_POP_TIMEOUT.as_secs().to_string().into_bytes();
        assert_eq!(args, vec![b"BLPOP".to_vec(), b"jobs".to_vec(), clamped]);
        write_raw(stream, b"*-1\r\n");
    });

    let queues = scripted_client(port, 0, None).queues();
    assert_eq!(queues.blocking_pop("jobs", Duration::MAX).expect("bpop"), None);
}

#[test]
fn blocking_exec_without_room_for_margin_drops_read_timeout() {
    let port = spawn_server(1, |_, args, stream| {
        assert_eq!(args[0], b"BLPOP");
        write_raw(stream, b"*-1\r\n");
    });

    let pool = ConnectionPool::new(scripted_config(port, 0, None));
    let mut conn = pool.acquire().expect("acquire");
    let reply = conn
        .exec_blocking(&[b"BLPOP", b"jobs", b"1"], Duration::MAX)
        .expect("blocking exec");
    assert_eq!(reply, RespValue::Array(None));
}

#[test]
fn scan_keeps_first_value_of_repeated_field() {
    let port = spawn_server(4, |idx, args, stream| {
        assert_eq!(args[0], b"HSCAN");
        assert_eq!(args[1], b"nodes");
        if idx % 2 == 0 {
            assert_eq!(args[2], b"0");
            write_raw(stream, b"*2\r\n$1\r\n5\r\n*4\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n");
        } else {
            assert_eq!(args[2], b"5");
            write_raw(stream, b"*2\r\n$1\r\n0\r\n*4\r\n$1\r\nb\r\n$1\r\nX\r\n$1\r\nc\r\n$1\r\n3\r\n");
        }
    });

    let hashes = scripted_client(port, 0, None).hashes();
    let entries = hashes.scan_entries("nodes").expect("scan entries");
    assert_eq!(
        entries,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );

    let values = hashes.scan_all("nodes").expect("scan all");
    assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
}
