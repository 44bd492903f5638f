// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-stage response handlers: the decision tables of the request state
//! machine. Each handler inspects one RESP reply and tells the engine how
//! the request proceeds.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use log::*;

use tuple_protocol::{ErrorCode, FLAG_IMMEDIATE};

use crate::conn_mgr::ConnectionMgr;
use crate::locator::ConnIndex;
use crate::namespace::NamespaceRegistry;
use crate::protocol::RespValue;
use crate::request::{Command, CompoundState, RedisRequest, ScanShared, ScanState};
use crate::sr_buffer::SrBuffer;
use crate::transport::scatter_copy;
use crate::NAMESPACE_SEPARATOR;

/// What the engine does with the request after one reply.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Transition to the stage's `next` and send it.
    Next,

    /// Send the current stage again (the handler repositioned cursor,
    /// location, or stage).
    Send,

    /// Reply not conclusive yet; requeue the stage for a later retry
    /// (blocking GET on a missing key).
    Retry,

    /// Stage consumes further replies before concluding (MULTI blocks).
    More,

    /// Emit a completion.
    Complete { status: ErrorCode, rc: i64 },

    /// The request dissolved into children (fan-out) or another child
    /// will produce the completion.
    Consumed,
}

fn complete(status: ErrorCode, rc: i64) -> Outcome {
    Outcome::Complete { status, rc }
}

/// One SCAN-backed iterator, owned by the engine across ITERATOR calls.
pub struct EngineIterator {
    pub ns_hdl: u64,
    pub conns: Vec<ConnIndex>,
    pub conn_pos: usize,
    pub cursor: Vec<u8>,
    pub cached: VecDeque<Vec<u8>>,
}

impl EngineIterator {
    pub fn exhausted(&self) -> bool {
        self.conn_pos >= self.conns.len()
    }

    pub fn current_conn(&self) -> Option<ConnIndex> {
        self.conns.get(self.conn_pos).copied()
    }
}

#[derive(Default)]
pub struct IteratorTable {
    entries: Vec<Option<EngineIterator>>,
}

impl IteratorTable {
    pub fn new() -> IteratorTable {
        IteratorTable::default()
    }

    pub fn create(&mut self, iter: EngineIterator) -> u64 {
        match self.entries.iter().position(|e| e.is_none()) {
            Some(slot) => {
                self.entries[slot] = Some(iter);
                (slot + 1) as u64
            }
            None => {
                self.entries.push(Some(iter));
                self.entries.len() as u64
            }
        }
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut EngineIterator> {
        if handle == 0 {
            return None;
        }
        self.entries.get_mut((handle - 1) as usize)?.as_mut()
    }

    pub fn free(&mut self, handle: u64) {
        if handle > 0 {
            if let Some(entry) = self.entries.get_mut((handle - 1) as usize) {
                *entry = None;
            }
        }
    }
}

/// Everything a handler may touch besides the request itself.
pub struct StageCtx<'a> {
    /// Receive buffer the reply's spans point into.
    pub buf: &'a SrBuffer,

    pub conn_mgr: &'a ConnectionMgr,

    /// Deferred submissions: follow-up and fan-out requests picked up by
    /// the next loop iteration.
    pub deferred: &'a mut VecDeque<RedisRequest>,

    pub namespaces: &'a mut NamespaceRegistry,
    pub iterators: &'a mut IteratorTable,

    /// Connection the reply arrived on.
    pub conn_index: ConnIndex,

    /// Replies the current stage still expects after this one.
    pub remaining_responses: u8,

    /// Out-of-band completed bulk payload (a DUMP reply that overran the
    /// receive buffer arrives here instead of as a span).
    pub aux: Option<Vec<u8>>,
}

/// Dispatch one reply to the handler of the request's current stage.
pub fn handle(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match req.step.command {
        Command::Put => handle_put(value),
        Command::Get | Command::Read => handle_get(req, value, ctx),
        Command::Remove => handle_remove(value, ctx),
        Command::MoveDump => handle_move_dump(req, value, ctx),
        Command::MoveRestore => handle_move_restore(req, value, ctx),
        Command::MoveDel => handle_move_del(value),
        Command::DirMeta => handle_directory_meta(req, value, ctx),
        Command::DirScan => handle_directory_scan(req, value, ctx),
        Command::NsCreateId => handle_nscreate_id(value),
        Command::NsCreateMeta => handle_nscreate_meta(req, value, ctx),
        Command::NsAttachCheck => handle_nsattach_check(value),
        Command::NsAttachIncr => handle_nsattach_incr(req, value, ctx),
        Command::NsDetachCheck => handle_nsdetach_check(req, value, ctx),
        Command::NsDetachScan => handle_nsdetach_scan(req, value, ctx),
        Command::NsDetachDelKeys => handle_nsdetach_delkeys(req, value),
        Command::NsDetachDelNs => handle_nsdetach_delns(req, value, ctx),
        Command::NsDeleteCheck => handle_nsdelete_check(value, ctx),
        Command::NsDeleteMark => handle_nsdelete_mark(value),
        Command::NsQuery => handle_nsquery(req, value, ctx),
        Command::IterScan => handle_iterator(req, value, ctx),
    }
}

fn str_of<'a>(value: &RespValue, buf: &'a SrBuffer) -> Option<&'a [u8]> {
    match value {
        RespValue::Str(span) => Some(span.bytes(buf)),
        _ => None,
    }
}

fn int_of(value: &RespValue) -> Option<i64> {
    match value {
        RespValue::Int(v) => Some(*v),
        _ => None,
    }
}

fn backend_error(value: &RespValue, buf: &SrBuffer, what: &str) -> Outcome {
    if let RespValue::Error(span) = value {
        warn!(
            "{what}: backend error: {}",
            String::from_utf8_lossy(span.bytes(buf))
        );
    } else {
        warn!("{what}: unexpected reply {value:?}");
    }
    complete(ErrorCode::Backend, 0)
}

fn handle_put(value: &RespValue) -> Outcome {
    match int_of(value) {
        Some(n) if n >= 1 => complete(ErrorCode::Success, n),
        Some(_) => complete(ErrorCode::NoMemory, 0),
        None => complete(ErrorCode::Backend, 0),
    }
}

/// GET/READ with the payload already complete in the receive buffer. The
/// engine short-circuits partial payloads into the scatter path before the
/// handler runs.
fn handle_get(req: &RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match value {
        RespValue::Nil => {
            if req.user.flags & FLAG_IMMEDIATE != 0 {
                complete(ErrorCode::Unavail, 0)
            } else {
                Outcome::Retry
            }
        }
        RespValue::Str(span) => {
            let payload = span.bytes(ctx.buf);
            let copied = scatter_copy(payload, &req.user.sge);
            let total = payload.len() as i64;
            if copied == payload.len() {
                complete(ErrorCode::Success, total)
            } else {
                // announced size lets the caller retry with a larger buffer
                complete(ErrorCode::Ubuffer, total)
            }
        }
        other => backend_error(other, ctx.buf, "get"),
    }
}

fn handle_remove(value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match int_of(value) {
        Some(0) => complete(ErrorCode::Unavail, 0),
        Some(1) => complete(ErrorCode::Success, 1),
        Some(n) => {
            warn!("remove found {n} duplicate entries");
            complete(ErrorCode::Success, n)
        }
        None => backend_error(value, ctx.buf, "remove"),
    }
}

fn handle_move_dump(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let payload = match (ctx.aux.take(), value) {
        (Some(owned), _) => owned,
        (None, RespValue::Nil) => return complete(ErrorCode::Unavail, 0),
        (None, RespValue::Str(span)) => span.bytes(ctx.buf).to_vec(),
        (None, other) => return backend_error(other, ctx.buf, "move/dump"),
    };
    req.state = CompoundState::Move {
        dumped: Some(payload),
    };
    Outcome::Next
}

fn handle_move_restore(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    // the dump payload is dead weight from here on
    req.state = CompoundState::Move { dumped: None };

    match value {
        RespValue::Str(span) if span.bytes(ctx.buf) == b"OK" => Outcome::Next,
        RespValue::Error(span) => {
            let text = span.bytes(ctx.buf);
            if text.windows(7).any(|w| w == b"BUSYKEY") {
                complete(ErrorCode::Exists, 0)
            } else {
                backend_error(value, ctx.buf, "move/restore")
            }
        }
        other => backend_error(other, ctx.buf, "move/restore"),
    }
}

fn handle_move_del(value: &RespValue) -> Outcome {
    match int_of(value) {
        Some(1) => complete(ErrorCode::Success, 0),
        // the source vanished under us
        Some(0) => complete(ErrorCode::Unavail, 0),
        Some(n) => {
            warn!("move: {n} entries deleted at the source, possible concurrent writes");
            complete(ErrorCode::Generic, 0)
        }
        None => complete(ErrorCode::Backend, 0),
    }
}

/// The caller's key-count limit travels in the length of the second
/// segment of a DIRECTORY request.
fn directory_limit(req: &RedisRequest) -> u64 {
    req.user.sge.get(1).map(|s| s.len as u64).unwrap_or(u64::MAX)
}

fn handle_directory_meta(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match value {
        RespValue::Array(items) if !items.is_empty() => {
            req.state = CompoundState::Scan(ScanState {
                cursor: b"0".to_vec(),
                shared: ScanShared::new(),
                to_delete: false,
                del_key: None,
            });
            spawn_scan_children(req, ctx)
        }
        RespValue::Array(_) | RespValue::Nil => complete(ErrorCode::NsInval, 0),
        other => backend_error(other, ctx.buf, "directory/meta"),
    }
}

/// Clone the request onto every healthy connection, one SCAN per shard.
fn spawn_scan_children(req: &RedisRequest, ctx: &mut StageCtx) -> Outcome {
    let children = ctx.conn_mgr.request_each(req);
    if children.is_empty() {
        return complete(ErrorCode::NoConnect, 0);
    }

    let CompoundState::Scan(scan) = &req.state else {
        return complete(ErrorCode::Generic, 0);
    };
    for mut child in children {
        child.transition();
        scan.shared.inflight.fetch_add(1, Ordering::AcqRel);
        ctx.deferred.push_back(child);
    }
    Outcome::Consumed
}

/// Append one key to the user's key list, `\n`-separated.
fn append_key(req: &RedisRequest, shared: &ScanShared, name: &[u8]) -> bool {
    let Some(list) = req.user.sge.first() else {
        return false;
    };
    let filled = shared.filled.load(Ordering::Acquire);
    let needed = name.len() + usize::from(filled > 0);
    if filled + needed > list.len {
        return false;
    }

    // SAFETY: single engine thread appends; validity per Sge contract.
    let out = unsafe { list.as_mut_slice() };
    let mut at = filled;
    if filled > 0 {
        out[at] = b'\n';
        at += 1;
    }
    out[at..at + name.len()].copy_from_slice(name);
    shared.filled.store(at + name.len(), Ordering::Release);
    true
}

/// Shared shape of a SCAN reply: `[cursor, [key, ...]]`.
fn scan_reply<'a>(
    value: &'a RespValue,
    buf: &SrBuffer,
) -> Option<(Vec<u8>, &'a [RespValue])> {
    let RespValue::Array(items) = value else {
        return None;
    };
    if items.len() != 2 {
        return None;
    }
    let cursor = str_of(&items[0], buf)?.to_vec();
    let RespValue::Array(keys) = &items[1] else {
        return None;
    };
    Some((cursor, keys))
}

fn strip_namespace(full: &[u8]) -> Option<usize> {
    full.windows(NAMESPACE_SEPARATOR.len())
        .position(|w| w == NAMESPACE_SEPARATOR)
        .map(|at| at + NAMESPACE_SEPARATOR.len())
}

fn handle_directory_scan(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let limit = directory_limit(req);
    let CompoundState::Scan(scan) = &mut req.state else {
        return complete(ErrorCode::Generic, 0);
    };
    let shared = scan.shared.clone();

    let Some((cursor, keys)) = scan_reply(value, ctx.buf) else {
        shared.record_error(ErrorCode::Backend);
        return finish_scan_child(&shared);
    };

    let mut completed = false;
    for key in keys {
        let Some(full) = str_of(key, ctx.buf) else {
            continue;
        };
        let Some(name_at) = strip_namespace(full) else {
            // not a tuple key of ours; keep what was accumulated and fail
            error!("scan returned a key without a namespace separator");
            shared.record_error(ErrorCode::Iterator);
            return finish_scan_child(&shared);
        };

        if shared.keycount.load(Ordering::Acquire) >= limit {
            completed = true;
            break;
        }
        if !append_key(req, &shared, &full[name_at..]) {
            completed = true;
            break;
        }
        shared.keycount.fetch_add(1, Ordering::AcqRel);
    }

    completed |= cursor == b"0";

    if !completed {
        let CompoundState::Scan(scan) = &mut req.state else {
            return complete(ErrorCode::Generic, 0);
        };
        scan.cursor = cursor;
        return Outcome::Send;
    }
    finish_scan_child(&shared)
}

/// Drop this child's inflight reference; the last one completes with the
/// aggregated status and the accumulated byte count.
fn finish_scan_child(shared: &ScanShared) -> Outcome {
    let left = shared.inflight.fetch_sub(1, Ordering::AcqRel) - 1;
    if left == 0 {
        complete(
            shared.status(),
            shared.filled.load(Ordering::Acquire) as i64,
        )
    } else {
        Outcome::Consumed
    }
}

fn handle_nscreate_id(value: &RespValue) -> Outcome {
    match int_of(value) {
        Some(1) => Outcome::Next,
        Some(_) => complete(ErrorCode::Exists, 0),
        None => complete(ErrorCode::Backend, 0),
    }
}

fn handle_nscreate_meta(req: &RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match str_of(value, ctx.buf) {
        Some(b"OK") => {
            let Some(name) = req.user.key.as_deref() else {
                return complete(ErrorCode::Invalid, 0);
            };
            match ctx.namespaces.create(name) {
                Ok(handle) => complete(ErrorCode::Success, handle as i64),
                Err(code) => complete(code, 0),
            }
        }
        Some(_) => complete(ErrorCode::Unavail, 0),
        None => backend_error(value, ctx.buf, "nscreate/meta"),
    }
}

fn handle_nsattach_check(value: &RespValue) -> Outcome {
    match int_of(value) {
        Some(0) => complete(ErrorCode::NsInval, 0),
        Some(_) => Outcome::Next,
        None => complete(ErrorCode::Backend, 0),
    }
}

fn handle_nsattach_incr(req: &RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match int_of(value) {
        Some(n) if n >= 1 => {
            let Some(name) = req.user.key.as_deref() else {
                return complete(ErrorCode::Invalid, 0);
            };
            match ctx.namespaces.attach(name) {
                Ok(handle) => complete(ErrorCode::Success, handle as i64),
                Err(code) => complete(code, 0),
            }
        }
        Some(_) => complete(ErrorCode::Generic, 0),
        None => backend_error(value, ctx.buf, "nsattach/incr"),
    }
}

const META_DELETE_FLAG: i64 = 0x1;

fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

fn handle_nsdetach_check(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    match ctx.remaining_responses {
        // the OK from MULTI
        3 => match str_of(value, ctx.buf) {
            Some(b"OK") => Outcome::More,
            _ => backend_error(value, ctx.buf, "nsdetach/multi"),
        },
        // QUEUED from the two commands
        2 | 1 => match str_of(value, ctx.buf) {
            Some(b"QUEUED") => Outcome::More,
            _ => backend_error(value, ctx.buf, "nsdetach/queued"),
        },
        // the EXEC array
        0 => {
            let RespValue::Array(items) = value else {
                return backend_error(value, ctx.buf, "nsdetach/exec");
            };
            if items.len() != 2 {
                return complete(ErrorCode::Backend, 0);
            }
            let Some(refcnt_after) = int_of(&items[0]) else {
                return complete(ErrorCode::Backend, 0);
            };
            if refcnt_after < 0 {
                warn!("namespace refcount underflow ({refcnt_after})");
                return complete(ErrorCode::Generic, 0);
            }
            let RespValue::Array(fields) = &items[1] else {
                return complete(ErrorCode::Backend, 0);
            };
            if fields.len() != 2 {
                return complete(ErrorCode::Backend, 0);
            }
            let refcnt = str_of(&fields[0], ctx.buf)
                .and_then(parse_decimal)
                .unwrap_or(refcnt_after);
            let flags = str_of(&fields[1], ctx.buf)
                .and_then(parse_decimal)
                .unwrap_or(0);

            let _ = ctx.namespaces.detach(req.user.ns_hdl);

            if refcnt <= 0 && refcnt_after <= 0 && flags & META_DELETE_FLAG != 0 {
                // last reference and marked for deletion: sweep the keys
                req.state = CompoundState::Scan(ScanState {
                    cursor: b"0".to_vec(),
                    shared: ScanShared::new(),
                    to_delete: true,
                    del_key: None,
                });
                spawn_scan_children(req, ctx)
            } else {
                complete(ErrorCode::Success, 0)
            }
        }
        _ => complete(ErrorCode::Backend, 0),
    }
}

fn handle_nsdetach_scan(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let shared = match &req.state {
        CompoundState::Scan(scan) => scan.shared.clone(),
        _ => return complete(ErrorCode::Generic, 0),
    };

    let Some((cursor, keys)) = scan_reply(value, ctx.buf) else {
        shared.record_error(ErrorCode::Backend);
        return finish_detach_child(req, &shared);
    };

    // one DEL child per key found on this shard
    for key in keys {
        let Some(full) = str_of(key, ctx.buf) else {
            continue;
        };
        let mut child = req.clone_for_conn(ctx.conn_index);
        if let CompoundState::Scan(child_scan) = &mut child.state {
            child_scan.del_key = Some(full.to_vec());
        }
        child.transition();
        shared.inflight.fetch_add(1, Ordering::AcqRel);
        ctx.deferred.push_back(child);
    }

    if cursor != b"0" {
        let CompoundState::Scan(scan) = &mut req.state else {
            return complete(ErrorCode::Generic, 0);
        };
        scan.cursor = cursor;
        return Outcome::Send;
    }
    finish_detach_child(req, &shared)
}

fn handle_nsdetach_delkeys(req: &mut RedisRequest, value: &RespValue) -> Outcome {
    let Some(shared) = shared_of(req) else {
        return complete(ErrorCode::Generic, 0);
    };
    match int_of(value) {
        Some(1) => {}
        Some(_) => shared.record_error(ErrorCode::Unavail),
        None => {
            warn!("nsdetach: unexpected DEL reply {value:?}");
            shared.record_error(ErrorCode::Backend);
        }
    }
    finish_detach_child(req, &shared)
}

fn shared_of(req: &RedisRequest) -> Option<std::sync::Arc<ScanShared>> {
    match &req.state {
        CompoundState::Scan(scan) => Some(scan.shared.clone()),
        _ => None,
    }
}

/// Last child standing moves on to deleting the namespace hash itself.
fn finish_detach_child(req: &mut RedisRequest, shared: &ScanShared) -> Outcome {
    let left = shared.inflight.fetch_sub(1, Ordering::AcqRel) - 1;
    if left == 0 {
        req.transition_to(3);
        Outcome::Send
    } else {
        Outcome::Consumed
    }
}

fn handle_nsdetach_delns(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let status = match int_of(value) {
        Some(1) => ErrorCode::Success,
        Some(_) => ErrorCode::Unavail,
        None => ErrorCode::Backend,
    };
    let _ = ctx.namespaces.destroy(req.user.ns_hdl);

    let aggregated = match shared_of(req) {
        Some(shared) if shared.status() != ErrorCode::Success => shared.status(),
        _ => status,
    };
    complete(aggregated, 0)
}

fn handle_nsdelete_check(value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let RespValue::Array(fields) = value else {
        return backend_error(value, ctx.buf, "nsdelete/check");
    };
    if fields.len() != 2 {
        return complete(ErrorCode::Backend, 0);
    }
    let Some(refcnt) = str_of(&fields[0], ctx.buf).and_then(parse_decimal) else {
        // HMGET answered with nils: no such namespace
        return complete(ErrorCode::NsInval, 0);
    };
    if refcnt > 1 {
        complete(ErrorCode::NsBusy, 0)
    } else {
        Outcome::Next
    }
}

fn handle_nsdelete_mark(value: &RespValue) -> Outcome {
    match int_of(value) {
        // the flags field must have existed already
        Some(0) => complete(ErrorCode::Success, 0),
        Some(_) => {
            error!("nsdelete marked a namespace that had no metadata, possible inconsistency");
            complete(ErrorCode::NsInval, 0)
        }
        None => complete(ErrorCode::Backend, 0),
    }
}

fn handle_nsquery(req: &RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let RespValue::Array(items) = value else {
        return backend_error(value, ctx.buf, "nsquery");
    };
    // id, refcnt, groups and flags plus values at the least
    if items.len() < 8 {
        return complete(ErrorCode::NsInval, 0);
    }

    let mut text = Vec::new();
    for item in items {
        let Some(bytes) = str_of(item, ctx.buf) else {
            return complete(ErrorCode::Backend, 0);
        };
        text.extend_from_slice(bytes);
        text.push(b':');
    }

    let copied = scatter_copy(&text, &req.user.sge);
    if copied == text.len() {
        complete(ErrorCode::Success, copied as i64)
    } else {
        complete(ErrorCode::Ubuffer, text.len() as i64)
    }
}

fn handle_iterator(req: &mut RedisRequest, value: &RespValue, ctx: &mut StageCtx) -> Outcome {
    let CompoundState::Iter { handle } = &req.state else {
        return complete(ErrorCode::Iterator, 0);
    };
    let handle = *handle;
    let Some((cursor, keys)) = scan_reply(value, ctx.buf) else {
        return backend_error(value, ctx.buf, "iterator");
    };

    let Some(iter) = ctx.iterators.get_mut(handle) else {
        return complete(ErrorCode::Iterator, 0);
    };

    for key in keys {
        let Some(full) = str_of(key, ctx.buf) else {
            continue;
        };
        match strip_namespace(full) {
            Some(at) => iter.cached.push_back(full[at..].to_vec()),
            None => {
                error!("scan returned a key without a namespace separator");
                ctx.iterators.free(handle);
                return complete(ErrorCode::Iterator, 0);
            }
        }
    }

    if cursor == b"0" {
        // shard exhausted, move to the next connection
        iter.conn_pos += 1;
        iter.cursor = b"0".to_vec();
    } else {
        iter.cursor = cursor;
    }

    if let Some(name) = iter.cached.pop_front() {
        let copied = scatter_copy(&name, &req.user.sge);
        if copied < name.len() {
            return complete(ErrorCode::Ubuffer, name.len() as i64);
        }
        // NUL-terminate when there is room, the caller is length-agnostic
        if let Some(list) = req.user.sge.first() {
            if name.len() < list.len {
                // SAFETY: in-bounds per the check above
                unsafe { list.as_mut_slice()[name.len()] = 0 };
            }
        }
        return complete(ErrorCode::Success, handle as i64);
    }

    if iter.exhausted() {
        ctx.iterators.free(handle);
        return complete(ErrorCode::Success, 0);
    }

    // nothing cached yet: scan the next batch (possibly on the next shard)
    if let Some(conn) = iter.current_conn() {
        req.location = crate::request::Location::Conn(conn);
    }
    Outcome::Send
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{stage_table, Location};
    use crate::sr_buffer::SrBuffer;
    use std::io::Write;
    use std::sync::Arc;
    use tuple_protocol::{OpCode, Request, Sge};

    fn ctx_parts() -> (SrBuffer, ConnectionMgr, NamespaceRegistry, IteratorTable) {
        (
            SrBuffer::new(4096),
            ConnectionMgr::new(),
            NamespaceRegistry::new(),
            IteratorTable::new(),
        )
    }

    fn make_ctx<'a>(
        buf: &'a SrBuffer,
        conn_mgr: &'a ConnectionMgr,
        deferred: &'a mut VecDeque<RedisRequest>,
        namespaces: &'a mut NamespaceRegistry,
        iterators: &'a mut IteratorTable,
    ) -> StageCtx<'a> {
        StageCtx {
            buf,
            conn_mgr,
            deferred,
            namespaces,
            iterators,
            conn_index: 0,
            remaining_responses: 0,
            aux: None,
        }
    }

    fn parse_one(buf: &mut SrBuffer, wire: &[u8]) -> RespValue {
        buf.write_all(wire).unwrap();
        crate::protocol::parse(buf).unwrap()
    }

    #[test]
    fn put_needs_a_positive_integer() {
        assert_eq!(
            handle_put(&RespValue::Int(1)),
            Outcome::Complete {
                status: ErrorCode::Success,
                rc: 1
            }
        );
        assert_eq!(
            handle_put(&RespValue::Int(0)),
            Outcome::Complete {
                status: ErrorCode::NoMemory,
                rc: 0
            }
        );
    }

    #[test]
    fn get_scatters_into_user_segments() {
        let (mut buf, conn_mgr, mut namespaces, mut iterators) = ctx_parts();
        let mut deferred = VecDeque::new();

        let mut out = [0u8; 16];
        let req = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::Get,
                key: Some(b"HELLO".to_vec()),
                sge: vec![Sge::from_slice(&mut out)],
                ..Request::default()
            }),
            Location::Slot(0),
        );

        let value = parse_one(&mut buf, b"$5\r\nWORLD\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        let outcome = handle_get(&req, &value, &mut ctx);

        assert_eq!(
            outcome,
            Outcome::Complete {
                status: ErrorCode::Success,
                rc: 5
            }
        );
        assert_eq!(&out[..5], b"WORLD");
    }

    #[test]
    fn get_on_missing_key_retries_unless_immediate() {
        let (mut buf, conn_mgr, mut namespaces, mut iterators) = ctx_parts();
        let mut deferred = VecDeque::new();

        let req = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::Get,
                key: Some(b"HELLO".to_vec()),
                ..Request::default()
            }),
            Location::Slot(0),
        );
        let value = parse_one(&mut buf, b"$-1\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        assert_eq!(handle_get(&req, &value, &mut ctx), Outcome::Retry);

        let immediate = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::Get,
                key: Some(b"HELLO".to_vec()),
                flags: FLAG_IMMEDIATE,
                ..Request::default()
            }),
            Location::Slot(0),
        );
        let value = parse_one(&mut buf, b"$-1\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        assert_eq!(
            handle_get(&immediate, &value, &mut ctx),
            Outcome::Complete {
                status: ErrorCode::Unavail,
                rc: 0
            }
        );
    }

    #[test]
    fn move_stages_stash_and_check() {
        let (mut buf, conn_mgr, mut namespaces, mut iterators) = ctx_parts();
        let mut deferred = VecDeque::new();

        let mut req = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::Move,
                key: Some(b"HELLO".to_vec()),
                ..Request::default()
            }),
            Location::Slot(0),
        );

        let dump = parse_one(&mut buf, b"$8\r\n\x00abcdef\x01\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        assert_eq!(handle_move_dump(&mut req, &dump, &mut ctx), Outcome::Next);
        match &req.state {
            CompoundState::Move { dumped: Some(d) } => assert_eq!(d.as_slice(), b"\x00abcdef\x01"),
            _ => panic!("dump not stashed"),
        }

        req.transition();
        let busy = parse_one(&mut buf, b"-BUSYKEY Target key name already exists.\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        assert_eq!(
            handle_move_restore(&mut req, &busy, &mut ctx),
            Outcome::Complete {
                status: ErrorCode::Exists,
                rc: 0
            }
        );
    }

    #[test]
    fn detach_check_walks_the_multi_block() {
        let (mut buf, conn_mgr, mut namespaces, mut iterators) = ctx_parts();
        let mut deferred = VecDeque::new();

        let handle = namespaces.create(b"KS").unwrap();
        let mut req = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::NsDetach,
                ns_hdl: handle,
                key: Some(b"KS".to_vec()),
                ..Request::default()
            }),
            Location::Slot(0),
        );

        for (remaining, wire) in [
            (3u8, &b"+OK\r\n"[..]),
            (2, &b"+QUEUED\r\n"[..]),
            (1, &b"+QUEUED\r\n"[..]),
        ] {
            let value = parse_one(&mut buf, wire);
            let mut ctx =
                make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
            ctx.remaining_responses = remaining;
            assert_eq!(handle_nsdetach_check(&mut req, &value, &mut ctx), Outcome::More);
        }

        // refcount drops to 2, no delete mark: plain detach
        let exec = parse_one(&mut buf, b"*2\r\n:2\r\n*2\r\n$1\r\n2\r\n$1\r\n0\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        ctx.remaining_responses = 0;
        assert_eq!(
            handle_nsdetach_check(&mut req, &exec, &mut ctx),
            Outcome::Complete {
                status: ErrorCode::Success,
                rc: 0
            }
        );
    }

    #[test]
    fn directory_scan_accumulates_and_completes() {
        let (mut buf, conn_mgr, mut namespaces, mut iterators) = ctx_parts();
        let mut deferred = VecDeque::new();

        let mut list = [0u8; 64];
        let mut req = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::Directory,
                match_template: Some(b"*".to_vec()),
                sge: vec![
                    Sge::from_slice(&mut list),
                    Sge {
                        base: std::ptr::null_mut(),
                        len: 10,
                    },
                ],
                ..Request::default()
            }),
            Location::Conn(0),
        );
        req.transition();
        let shared = ScanShared::new();
        shared.inflight.fetch_add(1, Ordering::AcqRel);
        req.state = CompoundState::Scan(ScanState {
            cursor: b"0".to_vec(),
            shared,
            to_delete: false,
            del_key: None,
        });

        let reply = parse_one(
            &mut buf,
            b"*2\r\n$1\r\n0\r\n*2\r\n$9\r\nKS::HELLO\r\n$9\r\nKS::WORLD\r\n",
        );
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        let outcome = handle_directory_scan(&mut req, &reply, &mut ctx);

        assert_eq!(
            outcome,
            Outcome::Complete {
                status: ErrorCode::Success,
                rc: 11
            }
        );
        assert_eq!(&list[..11], b"HELLO\nWORLD");
    }

    #[test]
    fn directory_scan_repeats_on_live_cursor() {
        let (mut buf, conn_mgr, mut namespaces, mut iterators) = ctx_parts();
        let mut deferred = VecDeque::new();

        let mut list = [0u8; 64];
        let mut req = RedisRequest::new(
            Arc::new(Request {
                opcode: OpCode::Directory,
                sge: vec![
                    Sge::from_slice(&mut list),
                    Sge {
                        base: std::ptr::null_mut(),
                        len: 10,
                    },
                ],
                ..Request::default()
            }),
            Location::Conn(0),
        );
        req.transition();
        let shared = ScanShared::new();
        shared.inflight.fetch_add(1, Ordering::AcqRel);
        req.state = CompoundState::Scan(ScanState {
            cursor: b"0".to_vec(),
            shared: shared.clone(),
            to_delete: false,
            del_key: None,
        });

        let reply = parse_one(&mut buf, b"*2\r\n$4\r\n1729\r\n*1\r\n$7\r\nKS::ABC\r\n");
        let mut ctx = make_ctx(&buf, &conn_mgr, &mut deferred, &mut namespaces, &mut iterators);
        assert_eq!(handle_directory_scan(&mut req, &reply, &mut ctx), Outcome::Send);
        match &req.state {
            CompoundState::Scan(scan) => assert_eq!(scan.cursor, b"1729".to_vec()),
            _ => panic!("scan state lost"),
        }
        // still one child in flight
        assert_eq!(shared.inflight.load(Ordering::Acquire), 1);
    }
}
