// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The engine: submission and completion queues, request dispatch, the
//! main event loop, redirects, timeouts and recovery.
//!
//! One dedicated thread runs [`Engine::run`]; API-facing threads talk to
//! it through the mutex-guarded queues on [`RedisBackend`]. Tests drive
//! the same machinery synchronously through [`Engine::poll_once`].

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::*;

use tuple_protocol::{Completion, ErrorCode, OpCode, Request, Sge};

use crate::cluster::{self, ClusterInfo};
use crate::commands;
use crate::config::{host_of_url, Config};
use crate::conn_mgr::ConnectionMgr;
use crate::connection::Connection;
use crate::event_mgr::EventMgr;
use crate::locator::{ConnIndex, Locator};
use crate::namespace::NamespaceRegistry;
use crate::process::{self, EngineIterator, IteratorTable, Outcome, StageCtx};
use crate::protocol::{self, ParseError, RespValue, Span};
use crate::request::{Command, CompoundState, Location, RedisRequest};
use crate::transport::{plan_tail_receive, scatter_copy, SCRAP_SPACE_LEN};
use crate::{wire_key, Error, MAX_REDIRECT_HOPS, SR_BUFFER_SIZE};

struct Shared {
    submissions: Mutex<VecDeque<Request>>,
    completions: Mutex<VecDeque<Completion>>,
    shutdown: AtomicBool,
}

/// Client handle of the backend: validates and enqueues requests, pops
/// completions, owns the engine thread.
pub struct RedisBackend {
    shared: Arc<Shared>,
    engine: Option<thread::JoinHandle<()>>,
}

impl RedisBackend {
    /// Connect the bootstrap node, discover the topology, connect the
    /// remaining endpoints and start the engine thread.
    pub fn connect(config: Config) -> Result<RedisBackend, Error> {
        let shared = Arc::new(Shared {
            submissions: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
        });

        let mut engine = Engine::new(config, Arc::clone(&shared))?;
        let handle = thread::Builder::new()
            .name("redis-engine".to_string())
            .spawn(move || engine.run())?;

        Ok(RedisBackend {
            shared,
            engine: Some(handle),
        })
    }

    /// Validate and enqueue one request.
    pub fn post(&self, request: Request) -> Result<(), ErrorCode> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ErrorCode::NoConnect);
        }
        if request.opcode == OpCode::Unspec {
            return Err(ErrorCode::Invalid);
        }
        request.validate().map_err(|_| ErrorCode::Invalid)?;

        self.shared
            .submissions
            .lock()
            .unwrap()
            .push_back(request);
        Ok(())
    }

    /// Ask the engine to suppress the completion of the request submitted
    /// with `target` as its user cookie.
    pub fn cancel(&self, user: u64, target: u64) -> Result<(), ErrorCode> {
        self.post(Request {
            opcode: OpCode::Cancel,
            user,
            next: target,
            ..Request::default()
        })
    }

    /// Pop one completion, if any.
    pub fn test(&self) -> Option<Completion> {
        self.shared.completions.lock().unwrap().pop_front()
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.engine.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A finished backend request awaiting completion synthesis.
struct Finished {
    request: RedisRequest,
    status: ErrorCode,
    rc: i64,
}

pub struct Engine {
    shared: Arc<Shared>,
    config: Config,
    conn_mgr: ConnectionMgr,
    locator: Locator,
    event_mgr: EventMgr,
    namespaces: NamespaceRegistry,
    iterators: IteratorTable,

    /// Follow-up and retried submissions for the next iteration.
    deferred: VecDeque<RedisRequest>,

    /// Finished requests awaiting the completion dispatcher.
    finished: VecDeque<Finished>,

    /// User cookies whose completions are suppressed.
    cancelled: HashSet<u64>,

    /// Lazily allocated overflow region for oversize values.
    scrap: Option<Vec<u8>>,

    refresh_needed: bool,
    last_recovery: std::time::Instant,
}

impl Engine {
    fn new(config: Config, shared: Arc<Shared>) -> Result<Engine, Error> {
        let mut engine = Engine {
            shared,
            config,
            conn_mgr: ConnectionMgr::new(),
            locator: Locator::new(),
            event_mgr: EventMgr::new()?,
            namespaces: NamespaceRegistry::new(),
            iterators: IteratorTable::new(),
            deferred: VecDeque::new(),
            finished: VecDeque::new(),
            cancelled: HashSet::new(),
            scrap: None,
            refresh_needed: false,
            last_recovery: std::time::Instant::now(),
        };
        engine.bootstrap()?;
        Ok(engine)
    }

    /// Stand-alone construction for synchronous use (tests drive
    /// `poll_once` directly).
    pub fn standalone(config: Config) -> Result<Engine, Error> {
        let shared = Arc::new(Shared {
            submissions: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
        });
        Engine::new(config, shared)
    }

    /// Submit on a standalone engine.
    pub fn post(&mut self, request: Request) -> Result<(), ErrorCode> {
        request.validate().map_err(|_| ErrorCode::Invalid)?;
        self.shared.submissions.lock().unwrap().push_back(request);
        Ok(())
    }

    /// Pop a completion on a standalone engine.
    pub fn test(&mut self) -> Option<Completion> {
        self.shared.completions.lock().unwrap().pop_front()
    }

    /// Link the bootstrap node, learn the slot map, connect the rest.
    fn bootstrap(&mut self) -> Result<(), Error> {
        let url = self.config.bootstrap().to_string();
        let authfile = self.config.authfile.clone();
        let timeout = self.config.timeout;

        let mut conn = Connection::new(SR_BUFFER_SIZE);
        conn.link(&url, &authfile, timeout)?;
        let index = self.conn_mgr.add(conn)?;
        self.event_mgr.add(self.conn_mgr.get_mut(index).expect("just added"))?;

        let info = self.discover_topology(index)?;
        cluster::apply(
            &info,
            &mut self.conn_mgr,
            &mut self.locator,
            &mut self.event_mgr,
            &authfile,
            timeout,
        )?;

        if !self.locator.fully_covered() {
            warn!(
                "cluster map leaves slots uncovered, first hole at {:?}",
                self.locator.first_uncovered()
            );
        }
        Ok(())
    }

    /// Synchronous CLUSTER SLOTS exchange on one connection, with the
    /// single-node fallback when cluster support is disabled.
    fn discover_topology(&mut self, index: ConnIndex) -> Result<ClusterInfo, Error> {
        let timeout = self.config.timeout;
        let conn = self.conn_mgr.get_mut(index).ok_or(Error::NotReady)?;

        let value = command_sync(conn, &commands::render_cluster_slots(), timeout)?;
        let info = match &value {
            RespValue::Error(span) => {
                debug!(
                    "no cluster support at the bootstrap node ({}), single-node mode",
                    String::from_utf8_lossy(span.bytes(&conn.recvbuf))
                );
                ClusterInfo::single_node(host_of_url(conn.url()))
            }
            other => cluster::parse_cluster_slots(other, &conn.recvbuf)?,
        };
        conn.recvbuf.reset();
        Ok(info)
    }

    pub fn run(&mut self) {
        info!("engine loop starting");
        let mut worked = true;
        while !self.shared.shutdown.load(Ordering::Acquire) {
            let wait = if worked {
                Duration::ZERO
            } else {
                Duration::from_millis(10)
            };
            worked = self.poll_once(wait);
        }
        info!("engine loop stopped");
    }

    /// One iteration of the main loop. Returns whether any work was done.
    pub fn poll_once(&mut self, wait: Duration) -> bool {
        let mut worked = false;

        // 1. user submissions
        let submissions: Vec<Request> = {
            let mut queue = self.shared.submissions.lock().unwrap();
            queue.drain(..).collect()
        };
        for request in submissions {
            worked = true;
            self.submit(request);
        }

        // deferred follow-ups from compound stages and retries
        let deferred: Vec<RedisRequest> = self.deferred.drain(..).collect();
        for request in deferred {
            worked = true;
            self.issue(request);
        }

        // 2. flush send buffers
        let mut send_failures = Vec::new();
        for index in self.conn_mgr.healthy() {
            let conn = self.conn_mgr.get_mut(index).expect("healthy index");
            if !conn.sendbuf.is_empty() && conn.send().is_err() {
                send_failures.push(index);
            }
        }
        for index in send_failures {
            self.fail_connection(index);
        }

        // 3./4. one readable connection, drained
        if let Some(index) = self.event_mgr.next(&mut self.conn_mgr, wait) {
            worked = true;
            self.drain_connection(index);
        }

        // 5. bookkeeping
        self.check_timeouts();
        self.recover_failures();
        if self.refresh_needed {
            self.refresh_topology();
        }
        self.dispatch_completions();

        worked
    }

    /// Turn a user request into a routed backend request.
    fn submit(&mut self, request: Request) {
        match request.opcode {
            OpCode::Cancel => {
                // tag the target; its reply will be consumed silently
                self.cancelled.insert(request.next);
                self.push_completion(Completion {
                    opcode: OpCode::Cancel,
                    status: ErrorCode::Success,
                    rc: 0,
                    user: request.user,
                    next: request.next,
                });
            }
            OpCode::Iterator => self.submit_iterator(request),
            _ => {
                let user = Arc::new(request);
                match self.slot_of(&user) {
                    Ok(slot) => self.issue(RedisRequest::new(user, Location::Slot(slot))),
                    Err(status) => self.finish_user(user, status),
                }
            }
        }
    }

    /// The slot a fresh request routes to.
    fn slot_of(&self, request: &Request) -> Result<u16, ErrorCode> {
        match request.opcode {
            OpCode::Put | OpCode::Get | OpCode::Read | OpCode::Remove | OpCode::Move => {
                let ns = self
                    .namespaces
                    .name_of(request.ns_hdl)
                    .ok_or(ErrorCode::NsInval)?;
                let key = request.key.as_deref().ok_or(ErrorCode::Invalid)?;
                Locator::hash(&wire_key(ns, key)).map_err(|_| ErrorCode::Invalid)
            }
            OpCode::NsCreate | OpCode::NsAttach => {
                let name = request.key.as_deref().ok_or(ErrorCode::Invalid)?;
                Locator::hash(name).map_err(|_| ErrorCode::Invalid)
            }
            OpCode::NsDetach | OpCode::NsDelete | OpCode::NsQuery | OpCode::Directory => {
                let ns = self
                    .namespaces
                    .name_of(request.ns_hdl)
                    .ok_or(ErrorCode::NsInval)?;
                Locator::hash(ns).map_err(|_| ErrorCode::Invalid)
            }
            _ => Err(ErrorCode::NotImpl),
        }
    }

    fn submit_iterator(&mut self, request: Request) {
        let user = Arc::new(request);

        let handle = match user.key.as_deref().filter(|k| !k.is_empty()) {
            None => self.iterators.create(EngineIterator {
                ns_hdl: user.ns_hdl,
                conns: self.conn_mgr.healthy(),
                conn_pos: 0,
                cursor: b"0".to_vec(),
                cached: VecDeque::new(),
            }),
            Some(key) => match std::str::from_utf8(key).ok().and_then(|s| s.parse().ok()) {
                Some(handle) => handle,
                None => return self.finish_user(user, ErrorCode::Iterator),
            },
        };

        // answer from the cache when possible, without a wire trip
        if self.iterators.get_mut(handle).is_none() {
            return self.finish_user(user, ErrorCode::Iterator);
        }
        let iter = self.iterators.get_mut(handle).expect("checked above");
        if let Some(name) = iter.cached.pop_front() {
            let copied = scatter_copy(&name, &user.sge);
            let (status, rc) = if copied == name.len() {
                (ErrorCode::Success, handle as i64)
            } else {
                (ErrorCode::Ubuffer, name.len() as i64)
            };
            return self.push_completion(Completion {
                opcode: OpCode::Iterator,
                status,
                rc,
                user: user.user,
                next: user.next,
            });
        }
        if iter.exhausted() {
            self.iterators.free(handle);
            return self.push_completion(Completion {
                opcode: OpCode::Iterator,
                status: ErrorCode::Success,
                rc: 0,
                user: user.user,
                next: user.next,
            });
        }

        let conn = iter.current_conn().expect("not exhausted");
        let mut req = RedisRequest::new(user, Location::Conn(conn));
        req.state = CompoundState::Iter { handle };
        self.issue(req);
    }

    /// Some stages route away from the request's original location.
    fn stage_location(&self, req: &RedisRequest) -> Option<Location> {
        let slot = |name: &[u8]| Locator::hash(name).ok().map(Location::Slot);
        match req.step.command {
            Command::MoveRestore => {
                let dest = self.namespaces.name_of(req.user.dest_hdl)?;
                slot(&wire_key(dest, req.user.key.as_deref()?))
            }
            Command::MoveDel => {
                let src = self.namespaces.name_of(req.user.ns_hdl)?;
                slot(&wire_key(src, req.user.key.as_deref()?))
            }
            Command::NsDetachDelNs => {
                let ns = self.namespaces.name_of(req.user.ns_hdl)?;
                slot(ns)
            }
            _ => None,
        }
    }

    /// Render the request's current stage into its target connection and
    /// post it.
    fn issue(&mut self, mut req: RedisRequest) {
        if let Some(location) = self.stage_location(&req) {
            req.location = location;
        }

        let index = match req.location {
            Location::Conn(index) => index,
            Location::Slot(slot) => match self.locator.lookup(slot) {
                Some(index) => index,
                None => return self.finish(req, ErrorCode::NoConnect, 0),
            },
        };

        let ready = self
            .conn_mgr
            .get(index)
            .map(Connection::ready_to_send)
            .unwrap_or(false);
        if !ready {
            if req.opcode().idempotent() {
                // park until recovery re-links the endpoint
                self.deferred.push_back(req);
            } else {
                // conservative: the op may or may not have executed
                self.finish(req, ErrorCode::Timeout, 0);
            }
            return;
        }

        // resolve names before borrowing the connection mutably
        let ns: Vec<u8> = match req.opcode() {
            OpCode::NsCreate | OpCode::NsAttach => {
                match req.user.key.as_deref() {
                    Some(name) => name.to_vec(),
                    None => return self.finish(req, ErrorCode::Invalid, 0),
                }
            }
            _ => match self.namespaces.name_of(req.user.ns_hdl) {
                Some(name) => name.to_vec(),
                None => return self.finish(req, ErrorCode::NsInval, 0),
            },
        };
        let dest_ns: Option<Vec<u8>> = self
            .namespaces
            .name_of(req.user.dest_hdl)
            .map(|name| name.to_vec());
        let iter_cursor: Option<Vec<u8>> = match &req.state {
            CompoundState::Iter { handle } => self
                .iterators
                .get_mut(*handle)
                .map(|iter| iter.cursor.clone()),
            _ => None,
        };

        let rendered =
            match commands::render(&req, &ns, dest_ns.as_deref(), iter_cursor.as_deref()) {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!("cannot render {:?}: {e}", req.step.command);
                    return self.finish(req, ErrorCode::Generic, 0);
                }
            };

        let timeout = self.config.timeout;
        let conn = self.conn_mgr.get_mut(index).expect("checked above");

        let mut wire = Vec::new();
        if req.ask_pending {
            wire.extend(commands::render_asking());
        }
        wire.extend(rendered.prefix);

        use std::io::Write as _;
        if conn.sendbuf.write_all(&wire).is_err() {
            // no room: push what is buffered out first
            if conn.send().is_err() || conn.sendbuf.write_all(&wire).is_err() {
                self.fail_connection(index);
                return self.finish(req, ErrorCode::NoConnect, 0);
            }
        }

        if let Some(vectored) = rendered.vectored {
            if conn.send_cmd(&vectored, timeout).is_err() {
                self.fail_connection(index);
                return self.finish(req, ErrorCode::NoConnect, 0);
            }
        }

        conn.posted.lock().unwrap().push_back(req);
    }

    /// Parse and process everything the readable connection has to offer.
    fn drain_connection(&mut self, index: ConnIndex) {
        {
            let Some(conn) = self.conn_mgr.get_mut(index) else {
                return;
            };
            if conn.recv().is_err() {
                self.fail_connection(index);
                return;
            }
        }

        loop {
            let parsed = {
                let conn = self.conn_mgr.get_mut(index).expect("drained connection");
                protocol::parse(&mut conn.recvbuf)
            };

            match parsed {
                Ok(value) => self.process_value(index, value),
                Err(ParseError::NoData) => {
                    let conn = self.conn_mgr.get_mut(index).expect("drained connection");
                    conn.recvbuf.reset();
                    conn.set_drained();
                    break;
                }
                Err(ParseError::Again) => {
                    // make room for the message tail, try one more read
                    let more = {
                        let conn = self.conn_mgr.get_mut(index).expect("drained connection");
                        conn.recvbuf.compact();
                        conn.recv()
                    };
                    match more {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(_) => {
                            self.fail_connection(index);
                            break;
                        }
                    }
                }
                Err(ParseError::BadMessage) => {
                    error!("protocol violation on connection {index}");
                    self.fail_connection(index);
                    break;
                }
            }

            let still_readable = self
                .conn_mgr
                .get(index)
                .map(Connection::ready_to_recv)
                .unwrap_or(false);
            if !still_readable {
                break;
            }
        }
    }

    /// Match one reply to the head of the posted queue and act on the
    /// handler's outcome.
    fn process_value(&mut self, index: ConnIndex, value: RespValue) {
        let popped = {
            let conn = self.conn_mgr.get_mut(index).expect("posted reply");
            let mut posted = conn.posted.lock().unwrap();
            posted.pop_front()
        };
        let Some(mut req) = popped else {
            error!("reply without a posted request on connection {index}");
            self.fail_connection(index);
            return;
        };

        // the +OK of an ASKING handshake precedes the real reply
        if req.ask_pending {
            req.ask_pending = false;
            let conn = self.conn_mgr.get_mut(index).expect("posted reply");
            conn.posted.lock().unwrap().push_front(req);
            return;
        }

        // redirects preempt everything else, including partial data
        match &value {
            RespValue::Relocate { slot, address } => {
                let address = address.clone();
                return self.handle_relocate(req, *slot, &address);
            }
            RespValue::Redirect { slot, address } => {
                let address = address.clone();
                return self.handle_ask(req, *slot, &address);
            }
            _ => {}
        }

        // bulk payloads that overran the receive buffer
        let mut aux = None;
        if let RespValue::Partial { total, span } = &value {
            let (total, span) = (*total, *span);
            if req.step.result && matches!(req.opcode(), OpCode::Get | OpCode::Read) {
                return self.finish_partial_get(index, req, total, span);
            }
            match self.drain_partial(index, total, span) {
                Ok(payload) => aux = Some(payload),
                Err(e) => {
                    warn!("draining oversize payload failed: {e}");
                    self.fail_connection(index);
                    return self.finish(req, ErrorCode::Backend, 0);
                }
            }
        }

        let remaining = req.step.expected_responses - 1 - req.responses_seen;
        let outcome = {
            let conn = self.conn_mgr.get(index).expect("posted reply");
            let mut ctx = StageCtx {
                buf: &conn.recvbuf,
                conn_mgr: &self.conn_mgr,
                deferred: &mut self.deferred,
                namespaces: &mut self.namespaces,
                iterators: &mut self.iterators,
                conn_index: index,
                remaining_responses: remaining,
                aux,
            };
            process::handle(&mut req, &value, &mut ctx)
        };

        match outcome {
            Outcome::More => {
                req.responses_seen += 1;
                let conn = self.conn_mgr.get_mut(index).expect("posted reply");
                conn.posted.lock().unwrap().push_front(req);
            }
            Outcome::Next => {
                req.transition();
                self.issue(req);
            }
            Outcome::Send => self.issue(req),
            Outcome::Retry => self.deferred.push_back(req),
            Outcome::Complete { status, rc } => self.finish(req, status, rc),
            Outcome::Consumed => {}
        }
    }

    /// MOVED: learn the new owner, refresh in the background, replay the
    /// request from its first stage.
    fn handle_relocate(&mut self, mut req: RedisRequest, slot: u16, address: &str) {
        req.hops += 1;
        if req.hops > MAX_REDIRECT_HOPS {
            warn!("request exceeded {MAX_REDIRECT_HOPS} redirect hops");
            return self.finish(req, ErrorCode::Backend, 0);
        }

        let index = match self.endpoint_for(address) {
            Ok(index) => index,
            Err(_) => return self.finish(req, ErrorCode::NoConnect, 0),
        };
        self.locator.assign(slot, index);
        if let Some(conn) = self.conn_mgr.get_mut(index) {
            conn.slots.set(slot);
        }
        self.refresh_needed = true;

        req.rewind();
        req.location = Location::Slot(slot);
        self.deferred.push_back(req);
    }

    /// ASK: one-shot redirect for this request only, no locator update.
    fn handle_ask(&mut self, mut req: RedisRequest, _slot: u16, address: &str) {
        req.hops += 1;
        if req.hops > MAX_REDIRECT_HOPS {
            warn!("request exceeded {MAX_REDIRECT_HOPS} redirect hops");
            return self.finish(req, ErrorCode::Backend, 0);
        }

        let index = match self.endpoint_for(address) {
            Ok(index) => index,
            Err(_) => return self.finish(req, ErrorCode::NoConnect, 0),
        };

        req.rewind();
        req.location = Location::Conn(index);
        req.ask_pending = true;
        self.deferred.push_back(req);
    }

    /// Find or establish the connection for a `host:port` endpoint.
    fn endpoint_for(&mut self, address: &str) -> Result<ConnIndex, Error> {
        if let Some(index) = self.conn_mgr.get_by_host(address) {
            return Ok(index);
        }
        let url = format!("sock://{address}");
        let mut conn = Connection::new(SR_BUFFER_SIZE);
        conn.link(&url, &self.config.authfile, self.config.timeout)?;
        let index = self.conn_mgr.add(conn)?;
        self.event_mgr
            .add(self.conn_mgr.get_mut(index).expect("just added"))?;
        info!("connected redirect target {address} as {index}");
        Ok(index)
    }

    /// GET/READ whose value overran the receive buffer: copy the prefix,
    /// stream the tail kernel-direct into the user segments.
    fn finish_partial_get(
        &mut self,
        index: ConnIndex,
        req: RedisRequest,
        total: usize,
        span: Span,
    ) {
        let timeout = self.config.timeout;
        let user_capacity = tuple_protocol::sge_total_len(&req.user.sge);

        // spill beyond the user buffer goes to the engine scrap region
        let tail_after_user = (total - span.len).saturating_sub(user_capacity.saturating_sub(span.len));
        let scrap_sge = if tail_after_user > 0 {
            if tail_after_user > SCRAP_SPACE_LEN {
                return self.finish(req, ErrorCode::NoMemory, 0);
            }
            let scrap = self
                .scrap
                .get_or_insert_with(|| vec![0u8; SCRAP_SPACE_LEN]);
            Sge {
                base: scrap.as_mut_ptr(),
                len: scrap.len(),
            }
        } else {
            Sge::null()
        };

        let received = {
            let conn = self.conn_mgr.get_mut(index).expect("partial sender");

            // prefix into the earliest user segments
            let prefix = span.bytes(&conn.recvbuf);
            scatter_copy(prefix, &req.user.sge);

            // the buffer is fully consumed now; reuse it for the
            // terminator and any pipelined follow-up response
            conn.recvbuf.reset();
            let capacity = conn.recvbuf.capacity();
            let region_len = capacity - (capacity >> 3);
            let region = Sge {
                base: conn.recvbuf.free_slice().as_mut_ptr(),
                len: region_len,
            };

            let plan = plan_tail_receive(&req.user.sge, span.len, total, region, scrap_sge);
            match conn.recv_direct(&plan.sges, plan.expected, timeout) {
                Ok(received) => {
                    // bytes landing in the buffer region: terminator first
                    let in_buffer = received - plan.user_tail - plan.scrap_tail;
                    conn.recvbuf.add_data(in_buffer, false);
                    conn.recvbuf.advance(2);
                    Ok(received)
                }
                Err(e) => Err(e),
            }
        };

        match received {
            Ok(_) => {
                let status = if total <= user_capacity {
                    ErrorCode::Success
                } else {
                    ErrorCode::Ubuffer
                };
                self.finish(req, status, total as i64);
            }
            Err(e) => {
                warn!("direct receive failed: {e}");
                self.fail_connection(index);
                self.finish(req, ErrorCode::Backend, 0);
            }
        }
    }

    /// Complete an oversize non-GET bulk (e.g. a MOVE dump) into owned
    /// memory.
    fn drain_partial(
        &mut self,
        index: ConnIndex,
        total: usize,
        span: Span,
    ) -> Result<Vec<u8>, Error> {
        let timeout = self.config.timeout;
        let conn = self.conn_mgr.get_mut(index).ok_or(Error::NotReady)?;

        let mut payload = vec![0u8; total + 2];
        let prefix = span.bytes(&conn.recvbuf);
        payload[..prefix.len()].copy_from_slice(prefix);
        let have = prefix.len();
        conn.recvbuf.reset();

        let tail = Sge {
            // SAFETY: in-bounds: have < total + 2
            base: unsafe { payload.as_mut_ptr().add(have) },
            len: total + 2 - have,
        };
        conn.recv_direct(&[tail], total + 2 - have, timeout)?;

        if &payload[total..] != protocol::TERMINATOR {
            return Err(Error::Protocol);
        }
        payload.truncate(total);
        Ok(payload)
    }

    /// Head-of-queue timeout scan plus deferred-queue expiry.
    fn check_timeouts(&mut self) {
        let timeout = self.config.timeout;
        let mut expired = Vec::new();

        for index in self.conn_mgr.healthy() {
            let conn = self.conn_mgr.get(index).expect("healthy index");
            let timed_out = conn
                .posted
                .lock()
                .unwrap()
                .front()
                .map(|req| req.inception.elapsed() > timeout)
                .unwrap_or(false);
            if timed_out {
                expired.push(index);
            }
        }

        for index in expired {
            let popped = {
                let conn = self.conn_mgr.get_mut(index).expect("expired index");
                let mut posted = conn.posted.lock().unwrap();
                posted.pop_front()
            };
            if let Some(req) = popped {
                warn!("request timed out on connection {index}");
                self.finish(req, ErrorCode::Timeout, 0);
            }
            // conservative: the server may have executed the operation
            self.fail_connection(index);
        }

        // blocked retries (e.g. a GET waiting for a writer) expire too
        let mut keep = VecDeque::new();
        while let Some(req) = self.deferred.pop_front() {
            if req.inception.elapsed() > timeout {
                self.finish(req, ErrorCode::Timeout, 0);
            } else {
                keep.push_back(req);
            }
        }
        self.deferred = keep;
    }

    /// Fail a connection: unregister it, re-route or fail its posted
    /// requests, leave a failure slot for recovery.
    fn fail_connection(&mut self, index: ConnIndex) {
        let posted: Vec<RedisRequest> = {
            let Some(conn) = self.conn_mgr.get_mut(index) else {
                return;
            };
            let _ = self.event_mgr.remove(conn);
            conn.posted.lock().unwrap().drain(..).collect()
        };
        self.conn_mgr.fail(index);
        self.locator.reassociate(Some(index), None);
        self.refresh_needed = true;

        for mut req in posted {
            let retryable = req.opcode().idempotent()
                && matches!(req.location, Location::Slot(_));
            if retryable {
                req.rewind();
                self.deferred.push_back(req);
            } else {
                // the server may have executed the mutation; fail
                // conservatively instead of re-issuing
                self.finish(req, ErrorCode::Timeout, 0);
            }
        }
    }

    fn recover_failures(&mut self) {
        if !self.conn_mgr.has_failures() {
            return;
        }
        // reconnects block; pace them by the configured back-off
        if self.last_recovery.elapsed() < self.config.reconnect {
            return;
        }
        self.last_recovery = std::time::Instant::now();
        let recovered = self
            .conn_mgr
            .recover(&mut self.locator, self.config.reconnect);
        for index in recovered {
            let conn = self.conn_mgr.get_mut(index).expect("recovered index");
            if self.event_mgr.add(conn).is_err() {
                let _ = self.event_mgr.rearm(conn);
            }
            self.refresh_needed = true;
        }
    }

    /// Re-learn the slot map through any healthy connection.
    fn refresh_topology(&mut self) {
        self.refresh_needed = false;
        let Some(&index) = self.conn_mgr.healthy().first() else {
            return;
        };
        let timeout = self.config.timeout;
        let authfile = self.config.authfile.clone();

        let info = {
            let conn = self.conn_mgr.get_mut(index).expect("healthy index");
            if !conn.recvbuf.is_empty() || !conn.posted.lock().unwrap().is_empty() {
                // mid-conversation; try again next round
                self.refresh_needed = true;
                return;
            }
            let value = match command_sync(conn, &commands::render_cluster_slots(), timeout) {
                Ok(value) => value,
                Err(e) => {
                    debug!("topology refresh failed: {e}");
                    return;
                }
            };
            let info = match &value {
                RespValue::Error(_) => {
                    Ok(ClusterInfo::single_node(host_of_url(conn.url())))
                }
                other => cluster::parse_cluster_slots(other, &conn.recvbuf),
            };
            conn.recvbuf.reset();
            info
        };

        match info {
            Ok(info) => {
                if let Err(e) = cluster::apply(
                    &info,
                    &mut self.conn_mgr,
                    &mut self.locator,
                    &mut self.event_mgr,
                    &authfile,
                    timeout,
                ) {
                    warn!("applying refreshed topology failed: {e}");
                }
            }
            Err(e) => warn!("topology refresh failed: {e}"),
        }
    }

    fn finish(&mut self, request: RedisRequest, status: ErrorCode, rc: i64) {
        if self.cancelled.remove(&request.user.user) {
            debug!("completion of cancelled request suppressed");
            return;
        }
        self.finished.push_back(Finished {
            request,
            status,
            rc,
        });
    }

    fn finish_user(&mut self, user: Arc<Request>, status: ErrorCode) {
        self.push_completion(Completion {
            opcode: user.opcode,
            status,
            rc: 0,
            user: user.user,
            next: user.next,
        });
    }

    /// The completion dispatcher: finished requests become API-visible
    /// completions.
    fn dispatch_completions(&mut self) {
        while let Some(done) = self.finished.pop_front() {
            self.push_completion(Completion {
                opcode: done.request.opcode(),
                status: done.status,
                rc: done.rc,
                user: done.request.user.user,
                next: done.request.user.next,
            });
        }
    }

    fn push_completion(&mut self, completion: Completion) {
        self.shared.completions.lock().unwrap().push_back(completion);
    }
}

/// Blocking request/response exchange on one connection, used outside the
/// event loop (bootstrap and topology refresh).
fn command_sync(
    conn: &mut Connection,
    command: &[u8],
    timeout: Duration,
) -> Result<RespValue, Error> {
    use std::io::Write as _;
    conn.sendbuf.write_all(command).map_err(|_| Error::Full)?;
    conn.send()?;

    loop {
        match protocol::parse(&mut conn.recvbuf) {
            Ok(value) => return Ok(value),
            Err(ParseError::Again) | Err(ParseError::NoData) => {
                conn.recvbuf.compact();
                conn.recv_wait(timeout)?;
            }
            Err(ParseError::BadMessage) => return Err(Error::Protocol),
        }
    }
}
