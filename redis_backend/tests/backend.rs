// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Engine round-trips against a scripted in-process store node.
//!
//! The fake node speaks enough RESP to cover the engine's command set:
//! lists for tuple data, hashes for namespace metadata, SCAN, DUMP and
//! RESTORE, MULTI/EXEC blocks, and scripted CLUSTER SLOTS / MOVED
//! behavior for the redirect scenario.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use redis_backend::config::Config;
use redis_backend::engine::Engine;
use tuple_protocol::{
    Completion, ErrorCode, OpCode, Request, Sge, FLAG_IMMEDIATE, FLAG_PARTIAL,
};

#[derive(Default)]
struct Store {
    lists: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>,
}

#[derive(Default)]
struct Behavior {
    /// When set, list reads answer `-MOVED <slot> <addr>` instead.
    moved: Mutex<Option<(u16, String)>>,

    /// Scripted raw CLUSTER SLOTS replies; the last entry repeats. Empty
    /// means "cluster support disabled".
    cluster: Mutex<VecDeque<Vec<u8>>>,

    counters: Mutex<HashMap<String, usize>>,
}

impl Behavior {
    fn count(&self, name: &str) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    fn counted(&self, name: &str) -> usize {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

struct FakeNode {
    address: String,
    store: Arc<Mutex<Store>>,
    behavior: Arc<Behavior>,
}

impl FakeNode {
    fn spawn() -> FakeNode {
        FakeNode::spawn_shared(Arc::new(Mutex::new(Store::default())))
    }

    fn spawn_shared(store: Arc<Mutex<Store>>) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let behavior = Arc::new(Behavior::default());

        let node_store = Arc::clone(&store);
        let node_behavior = Arc::clone(&behavior);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let store = Arc::clone(&node_store);
                let behavior = Arc::clone(&node_behavior);
                thread::spawn(move || serve(stream, store, behavior));
            }
        });

        FakeNode {
            address,
            store,
            behavior,
        }
    }

    fn url(&self) -> String {
        format!("sock://{}", self.address)
    }
}

fn read_header(reader: &mut impl BufRead) -> Option<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    Some(line.trim_end().to_string())
}

fn read_command(reader: &mut impl BufRead) -> Option<Vec<Vec<u8>>> {
    let head = read_header(reader)?;
    let count: usize = head.strip_prefix('*')?.parse().ok()?;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len_line = read_header(reader)?;
        let len: usize = len_line.strip_prefix('$')?.parse().ok()?;
        let mut payload = vec![0u8; len + 2];
        reader.read_exact(&mut payload).ok()?;
        payload.truncate(len);
        parts.push(payload);
    }
    Some(parts)
}

fn serve(stream: TcpStream, store: Arc<Mutex<Store>>, behavior: Arc<Behavior>) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut txn: Option<Vec<Vec<Vec<u8>>>> = None;

    while let Some(command) = read_command(&mut reader) {
        let name = String::from_utf8_lossy(&command[0]).to_uppercase();
        behavior.count(&name);

        let reply = match (name.as_str(), &mut txn) {
            ("MULTI", txn) => {
                *txn = Some(Vec::new());
                b"+OK\r\n".to_vec()
            }
            ("EXEC", txn) => {
                let queued = txn.take().unwrap_or_default();
                let mut reply = format!("*{}\r\n", queued.len()).into_bytes();
                for queued_cmd in queued {
                    reply.extend(execute(&queued_cmd, &store, &behavior));
                }
                reply
            }
            (_, Some(queued)) => {
                queued.push(command);
                b"+QUEUED\r\n".to_vec()
            }
            _ => execute(&command, &store, &behavior),
        };

        if writer.write_all(&reply).is_err() {
            break;
        }
    }
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    match pattern.last() {
        Some(b'*') => key.starts_with(&pattern[..pattern.len() - 1]),
        _ => key == pattern,
    }
}

fn execute(command: &[Vec<u8>], store: &Mutex<Store>, behavior: &Behavior) -> Vec<u8> {
    let name = String::from_utf8_lossy(&command[0]).to_uppercase();
    let mut store = store.lock().unwrap();

    match name.as_str() {
        "PING" => b"+PONG\r\n".to_vec(),
        "AUTH" => b"+OK\r\n".to_vec(),

        "CLUSTER" => {
            let mut scripted = behavior.cluster.lock().unwrap();
            match scripted.len() {
                0 => b"-ERR This instance has cluster support disabled\r\n".to_vec(),
                1 => scripted.front().unwrap().clone(),
                _ => scripted.pop_front().unwrap(),
            }
        }

        "RPUSH" => {
            let list = store.lists.entry(command[1].clone()).or_default();
            list.push_back(command[2].clone());
            integer(list.len() as i64)
        }

        "LPOP" | "LINDEX" | "DUMP" => {
            if let Some((slot, address)) = behavior.moved.lock().unwrap().clone() {
                return format!("-MOVED {slot} {address}\r\n").into_bytes();
            }
            let value = match name.as_str() {
                "LPOP" => store
                    .lists
                    .get_mut(&command[1])
                    .and_then(|l| l.pop_front()),
                _ => store
                    .lists
                    .get(&command[1])
                    .and_then(|l| l.front().cloned()),
            };
            if name == "LPOP" {
                if store
                    .lists
                    .get(&command[1])
                    .map(|l| l.is_empty())
                    .unwrap_or(false)
                {
                    store.lists.remove(&command[1]);
                }
            }
            match value {
                Some(v) => bulk(&v),
                None => b"$-1\r\n".to_vec(),
            }
        }

        "RESTORE" => {
            if store.lists.contains_key(&command[1]) {
                return b"-BUSYKEY Target key name already exists.\r\n".to_vec();
            }
            store
                .lists
                .insert(command[1].clone(), VecDeque::from([command[3].clone()]));
            b"+OK\r\n".to_vec()
        }

        "DEL" => {
            let mut removed = 0;
            if store.lists.remove(&command[1]).is_some() {
                removed += 1;
            }
            if store.hashes.remove(&command[1]).is_some() {
                removed += 1;
            }
            integer(removed)
        }

        "SCAN" => {
            let pattern = command
                .iter()
                .position(|p| p.eq_ignore_ascii_case(b"MATCH"))
                .and_then(|at| command.get(at + 1))
                .cloned()
                .unwrap_or_else(|| b"*".to_vec());
            let mut keys: Vec<&Vec<u8>> = store
                .lists
                .keys()
                .chain(store.hashes.keys())
                .filter(|k| glob_match(&pattern, k))
                .collect();
            keys.sort();

            let mut reply = b"*2\r\n".to_vec();
            reply.extend(bulk(b"0"));
            reply.extend(format!("*{}\r\n", keys.len()).into_bytes());
            for key in keys {
                reply.extend(bulk(key));
            }
            reply
        }

        "HSETNX" => {
            let hash = store.hashes.entry(command[1].clone()).or_default();
            if hash.contains_key(&command[2]) {
                integer(0)
            } else {
                hash.insert(command[2].clone(), command[3].clone());
                integer(1)
            }
        }

        "HMSET" => {
            let hash = store.hashes.entry(command[1].clone()).or_default();
            for pair in command[2..].chunks(2) {
                hash.insert(pair[0].clone(), pair[1].clone());
            }
            b"+OK\r\n".to_vec()
        }

        "HSET" => {
            let hash = store.hashes.entry(command[1].clone()).or_default();
            let mut added = 0;
            for pair in command[2..].chunks(2) {
                if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            integer(added)
        }

        "HMGET" => {
            let mut reply = format!("*{}\r\n", command.len() - 2).into_bytes();
            for field in &command[2..] {
                match store.hashes.get(&command[1]).and_then(|h| h.get(field)) {
                    Some(value) => reply.extend(bulk(value)),
                    None => reply.extend_from_slice(b"$-1\r\n"),
                }
            }
            reply
        }

        "HGETALL" => {
            let fields = store.hashes.get(&command[1]);
            let count = fields.map(|h| h.len() * 2).unwrap_or(0);
            let mut reply = format!("*{count}\r\n").into_bytes();
            if let Some(hash) = fields {
                for (field, value) in hash {
                    reply.extend(bulk(field));
                    reply.extend(bulk(value));
                }
            }
            reply
        }

        "HEXISTS" => {
            let exists = store
                .hashes
                .get(&command[1])
                .map(|h| h.contains_key(&command[2]))
                .unwrap_or(false);
            integer(exists as i64)
        }

        "HINCRBY" => {
            let delta: i64 = String::from_utf8_lossy(&command[3]).parse().unwrap();
            let hash = store.hashes.entry(command[1].clone()).or_default();
            let field = hash.entry(command[2].clone()).or_insert_with(|| b"0".to_vec());
            let value: i64 = String::from_utf8_lossy(field).parse().unwrap_or(0);
            *field = (value + delta).to_string().into_bytes();
            integer(value + delta)
        }

        "ASKING" => b"+OK\r\n".to_vec(),

        other => format!("-ERR unknown command '{other}'\r\n").into_bytes(),
    }
}

fn test_config(node: &FakeNode) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config {
        hosts: vec![node.url()],
        authfile: String::new(),
        timeout: Duration::from_secs(2),
        reconnect: Duration::from_secs(60),
        plugin: None,
    }
}

fn drive(engine: &mut Engine) -> Completion {
    for _ in 0..2000 {
        engine.poll_once(Duration::from_millis(2));
        if let Some(completion) = engine.test() {
            return completion;
        }
    }
    panic!("engine produced no completion");
}

fn expect(engine: &mut Engine, request: Request, status: ErrorCode) -> Completion {
    let opcode = request.opcode;
    engine.post(request).unwrap();
    let completion = drive(engine);
    assert_eq!(completion.opcode, opcode);
    assert_eq!(completion.status, status, "completion: {completion:?}");
    completion
}

fn create_namespace(engine: &mut Engine, name: &[u8]) -> u64 {
    let completion = expect(
        engine,
        Request {
            opcode: OpCode::NsCreate,
            key: Some(name.to_vec()),
            group: 1,
            ..Request::default()
        },
        ErrorCode::Success,
    );
    assert!(completion.rc > 0);
    completion.rc as u64
}

#[test]
fn put_then_read_round_trip() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    let mut value = *b"WORLD";
    expect(
        &mut engine,
        Request {
            opcode: OpCode::Put,
            ns_hdl: ns,
            user: 1,
            key: Some(b"HELLO".to_vec()),
            sge: vec![Sge::from_slice(&mut value)],
            ..Request::default()
        },
        ErrorCode::Success,
    );

    let mut out = [0u8; 64];
    let completion = expect(
        &mut engine,
        Request {
            opcode: OpCode::Read,
            ns_hdl: ns,
            user: 2,
            key: Some(b"HELLO".to_vec()),
            sge: vec![Sge::from_slice(&mut out)],
            ..Request::default()
        },
        ErrorCode::Success,
    );

    assert_eq!(completion.rc, 5);
    assert_eq!(completion.user, 2);
    assert_eq!(&out[..5], b"WORLD");

    // READ was non-destructive
    let stored = node.store.lock().unwrap();
    assert_eq!(stored.lists.get(&b"KS::HELLO"[..]).unwrap().len(), 1);
}

#[test]
fn namespace_refcount_lifecycle() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    for _ in 0..10 {
        expect(
            &mut engine,
            Request {
                opcode: OpCode::NsAttach,
                key: Some(b"KS".to_vec()),
                ..Request::default()
            },
            ErrorCode::Success,
        );
    }

    for _ in 0..10 {
        expect(
            &mut engine,
            Request {
                opcode: OpCode::NsDetach,
                ns_hdl: ns,
                ..Request::default()
            },
            ErrorCode::Success,
        );
    }

    // the creator's own reference
    expect(
        &mut engine,
        Request {
            opcode: OpCode::NsDetach,
            ns_hdl: ns,
            ..Request::default()
        },
        ErrorCode::Success,
    );

    // delete = attach, mark, detach; the final detach tears down the
    // namespace hash and its keys
    expect(
        &mut engine,
        Request {
            opcode: OpCode::NsAttach,
            key: Some(b"KS".to_vec()),
            ..Request::default()
        },
        ErrorCode::Success,
    );
    expect(
        &mut engine,
        Request {
            opcode: OpCode::NsDelete,
            ns_hdl: ns,
            ..Request::default()
        },
        ErrorCode::Success,
    );
    expect(
        &mut engine,
        Request {
            opcode: OpCode::NsDetach,
            ns_hdl: ns,
            ..Request::default()
        },
        ErrorCode::Success,
    );

    assert!(node.store.lock().unwrap().hashes.get(&b"KS"[..]).is_none());

    // gone for good
    expect(
        &mut engine,
        Request {
            opcode: OpCode::NsAttach,
            key: Some(b"KS".to_vec()),
            ..Request::default()
        },
        ErrorCode::NsInval,
    );
}

#[test]
fn move_between_namespaces() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ks = create_namespace(&mut engine, b"KS");
    let ns = create_namespace(&mut engine, b"NS");

    let mut value = *b"WORLD";
    expect(
        &mut engine,
        Request {
            opcode: OpCode::Put,
            ns_hdl: ks,
            key: Some(b"HELLO".to_vec()),
            sge: vec![Sge::from_slice(&mut value)],
            ..Request::default()
        },
        ErrorCode::Success,
    );

    expect(
        &mut engine,
        Request {
            opcode: OpCode::Move,
            ns_hdl: ks,
            dest_hdl: ns,
            key: Some(b"HELLO".to_vec()),
            ..Request::default()
        },
        ErrorCode::Success,
    );

    let mut out = [0u8; 64];
    let completion = expect(
        &mut engine,
        Request {
            opcode: OpCode::Get,
            ns_hdl: ns,
            key: Some(b"HELLO".to_vec()),
            flags: FLAG_IMMEDIATE,
            sge: vec![Sge::from_slice(&mut out)],
            ..Request::default()
        },
        ErrorCode::Success,
    );
    assert_eq!(completion.rc, 5);
    assert_eq!(&out[..5], b"WORLD");

    // the source is gone
    expect(
        &mut engine,
        Request {
            opcode: OpCode::Get,
            ns_hdl: ks,
            key: Some(b"HELLO".to_vec()),
            flags: FLAG_IMMEDIATE,
            sge: vec![Sge::from_slice(&mut out)],
            ..Request::default()
        },
        ErrorCode::Unavail,
    );
}

#[test]
fn directory_respects_the_limit() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    let mut payload = *b"x";
    for i in 0..30 {
        expect(
            &mut engine,
            Request {
                opcode: OpCode::Put,
                ns_hdl: ns,
                key: Some(format!("key{i:02}").into_bytes()),
                sge: vec![Sge::from_slice(&mut payload)],
                ..Request::default()
            },
            ErrorCode::Success,
        );
    }

    let directory = |engine: &mut Engine, limit: usize, pattern: &[u8]| {
        let mut list = vec![0u8; 4096];
        let completion = expect(
            engine,
            Request {
                opcode: OpCode::Directory,
                ns_hdl: ns,
                match_template: Some(pattern.to_vec()),
                sge: vec![
                    Sge::from_slice(&mut list),
                    Sge {
                        base: std::ptr::null_mut(),
                        len: limit,
                    },
                ],
                ..Request::default()
            },
            ErrorCode::Success,
        );
        let filled = completion.rc as usize;
        let names: Vec<Vec<u8>> = if filled == 0 {
            Vec::new()
        } else {
            list[..filled]
                .split(|&b| b == b'\n')
                .map(|t| t.to_vec())
                .collect()
        };
        names
    };

    let all = directory(&mut engine, 30, b"*");
    assert_eq!(all.len(), 30);
    assert!(all.contains(&b"key00".to_vec()));
    assert!(all.contains(&b"key29".to_vec()));

    let half = directory(&mut engine, 15, b"*");
    assert_eq!(half.len(), 15);

    let none = directory(&mut engine, 30, b"abcdef1234567abcdef");
    assert_eq!(none.len(), 0);
}

#[test]
fn iterator_walks_every_key() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    let mut payload = *b"x";
    for name in [b"AAA".as_slice(), b"BBB", b"CCC"] {
        expect(
            &mut engine,
            Request {
                opcode: OpCode::Put,
                ns_hdl: ns,
                key: Some(name.to_vec()),
                sge: vec![Sge::from_slice(&mut payload)],
                ..Request::default()
            },
            ErrorCode::Success,
        );
    }

    let mut found = Vec::new();
    let mut cursor: Option<u64> = None;
    loop {
        let mut out = [0u8; 64];
        let completion = expect(
            &mut engine,
            Request {
                opcode: OpCode::Iterator,
                ns_hdl: ns,
                key: cursor.map(|c| c.to_string().into_bytes()),
                match_template: Some(b"*".to_vec()),
                sge: vec![Sge::from_slice(&mut out)],
                ..Request::default()
            },
            ErrorCode::Success,
        );
        if completion.rc == 0 {
            break;
        }
        cursor = Some(completion.rc as u64);
        let name: Vec<u8> = out.iter().take_while(|&&b| b != 0).copied().collect();
        found.push(name);
        assert!(found.len() <= 3, "iterator returned too many keys");
    }

    found.sort();
    assert_eq!(found, vec![b"AAA".to_vec(), b"BBB".to_vec(), b"CCC".to_vec()]);
}

#[test]
fn moved_redirect_reroutes_and_sticks() {
    let store_a = Arc::new(Mutex::new(Store::default()));
    let node_a = FakeNode::spawn_shared(store_a);
    let node_b = FakeNode::spawn();

    // node B owns the data
    {
        let mut store = node_b.store.lock().unwrap();
        store
            .hashes
            .entry(b"KS".to_vec())
            .or_default()
            .extend([(b"refcnt".to_vec(), b"1".to_vec())]);
        store
            .lists
            .insert(b"KS::HELLO".to_vec(), VecDeque::from([b"WORLD".to_vec()]));
    }
    // node A's metadata mirror so NSATTACH succeeds wherever it routes
    {
        let mut store = node_a.store.lock().unwrap();
        store
            .hashes
            .entry(b"KS".to_vec())
            .or_default()
            .extend([(b"refcnt".to_vec(), b"1".to_vec())]);
    }

    let slot = redis_backend::locator::Locator::hash(b"KS::HELLO").unwrap();
    *node_a.behavior.moved.lock().unwrap() = Some((slot, node_b.address.clone()));

    // after the redirect, a refresh tells the truth: everything lives on B
    let mut map = Vec::new();
    {
        use redis_backend::protocol as resp;
        let (ip, port) = node_b.address.split_once(':').unwrap();
        resp::serialize_array_header(&mut map, 1).unwrap();
        resp::serialize_array_header(&mut map, 3).unwrap();
        resp::serialize_integer(&mut map, 0).unwrap();
        resp::serialize_integer(&mut map, 16383).unwrap();
        resp::serialize_array_header(&mut map, 2).unwrap();
        resp::serialize_bulk(&mut map, Some(ip.as_bytes())).unwrap();
        resp::serialize_integer(&mut map, port.parse().unwrap()).unwrap();
    }
    {
        let mut scripted = node_a.behavior.cluster.lock().unwrap();
        scripted.push_back(b"-ERR This instance has cluster support disabled\r\n".to_vec());
        scripted.push_back(map);
    }

    let mut engine = Engine::standalone(test_config(&node_a)).unwrap();

    let ns = expect(
        &mut engine,
        Request {
            opcode: OpCode::NsAttach,
            key: Some(b"KS".to_vec()),
            ..Request::default()
        },
        ErrorCode::Success,
    )
    .rc as u64;

    let mut out = [0u8; 64];
    let completion = expect(
        &mut engine,
        Request {
            opcode: OpCode::Read,
            ns_hdl: ns,
            key: Some(b"HELLO".to_vec()),
            sge: vec![Sge::from_slice(&mut out)],
            ..Request::default()
        },
        ErrorCode::Success,
    );
    assert_eq!(completion.rc, 5);
    assert_eq!(&out[..5], b"WORLD");

    let reads_on_a = node_a.behavior.counted("LINDEX");
    assert_eq!(reads_on_a, 1, "the first read bounced off node A");

    // the second read goes straight to the new owner
    let completion = expect(
        &mut engine,
        Request {
            opcode: OpCode::Read,
            ns_hdl: ns,
            key: Some(b"HELLO".to_vec()),
            sge: vec![Sge::from_slice(&mut out)],
            ..Request::default()
        },
        ErrorCode::Success,
    );
    assert_eq!(completion.rc, 5);
    assert_eq!(node_a.behavior.counted("LINDEX"), reads_on_a);
    assert_eq!(node_b.behavior.counted("LINDEX"), 2);
}

#[test]
fn oversize_value_streams_into_user_memory() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    // 2 MiB value, patterned so truncation points are checkable
    let value: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    node.store
        .lock()
        .unwrap()
        .lists
        .insert(b"KS::BIG".to_vec(), VecDeque::from([value.clone()]));

    let mut out = vec![0u8; 1024 * 1024];
    let completion = expect(
        &mut engine,
        Request {
            opcode: OpCode::Get,
            ns_hdl: ns,
            key: Some(b"BIG".to_vec()),
            flags: FLAG_PARTIAL | FLAG_IMMEDIATE,
            sge: vec![Sge::from_slice(&mut out)],
            ..Request::default()
        },
        ErrorCode::Ubuffer,
    );

    // announced size so the caller can retry with a bigger buffer
    assert_eq!(completion.rc, 2 * 1024 * 1024);
    assert_eq!(&out[..], &value[..1024 * 1024]);

    // the engine is still usable afterwards: the pipelined path drained
    // cleanly
    let mut small = [0u8; 8];
    let mut payload = *b"ok";
    expect(
        &mut engine,
        Request {
            opcode: OpCode::Put,
            ns_hdl: ns,
            key: Some(b"SMALL".to_vec()),
            sge: vec![Sge::from_slice(&mut payload)],
            ..Request::default()
        },
        ErrorCode::Success,
    );
    let completion = expect(
        &mut engine,
        Request {
            opcode: OpCode::Read,
            ns_hdl: ns,
            key: Some(b"SMALL".to_vec()),
            sge: vec![Sge::from_slice(&mut small)],
            ..Request::default()
        },
        ErrorCode::Success,
    );
    assert_eq!(completion.rc, 2);
}

#[test]
fn completions_preserve_post_order_per_connection() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    let mut values = vec![*b"v0", *b"v1", *b"v2", *b"v3"];
    for (i, value) in values.iter_mut().enumerate() {
        engine
            .post(Request {
                opcode: OpCode::Put,
                ns_hdl: ns,
                user: 100 + i as u64,
                key: Some(format!("k{i}").into_bytes()),
                sge: vec![Sge::from_slice(value)],
                ..Request::default()
            })
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2000 {
        engine.poll_once(Duration::from_millis(2));
        while let Some(completion) = engine.test() {
            assert_eq!(completion.status, ErrorCode::Success);
            seen.push(completion.user);
        }
        if seen.len() == 4 {
            break;
        }
    }
    assert_eq!(seen, vec![100, 101, 102, 103]);
}

#[test]
fn cancel_suppresses_the_completion() {
    let node = FakeNode::spawn();
    let mut engine = Engine::standalone(test_config(&node)).unwrap();

    let ns = create_namespace(&mut engine, b"KS");

    // cancel first, then submit the target: the reply is consumed but no
    // completion surfaces
    engine
        .post(Request {
            opcode: OpCode::Cancel,
            user: 900,
            next: 901,
            ..Request::default()
        })
        .unwrap();
    let cancel_done = drive(&mut engine);
    assert_eq!(cancel_done.opcode, OpCode::Cancel);
    assert_eq!(cancel_done.status, ErrorCode::Success);

    let mut payload = *b"x";
    engine
        .post(Request {
            opcode: OpCode::Put,
            ns_hdl: ns,
            user: 901,
            key: Some(b"DOOMED".to_vec()),
            sge: vec![Sge::from_slice(&mut payload)],
            ..Request::default()
        })
        .unwrap();

    for _ in 0..50 {
        engine.poll_once(Duration::from_millis(2));
        assert!(engine.test().is_none(), "cancelled completion surfaced");
    }

    // the operation itself still executed on the store
    assert!(node
        .store
        .lock()
        .unwrap()
        .lists
        .contains_key(&b"KS::DOOMED"[..]));
}
