// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Backend requests: a user request plus engine state, and the per-opcode
//! stage tables the state machine walks.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tuple_protocol::{ErrorCode, OpCode, Request};

use crate::locator::ConnIndex;

/// Where a backend request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Route by hash slot through the locator.
    Slot(u16),

    /// Pinned to one connection (fan-out children, redirects).
    Conn(ConnIndex),
}

/// RESP template selector, one per distinct command a stage can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Put,
    Get,
    Read,
    Remove,
    MoveDump,
    MoveRestore,
    MoveDel,
    DirMeta,
    DirScan,
    NsCreateId,
    NsCreateMeta,
    NsAttachCheck,
    NsAttachIncr,
    NsDetachCheck,
    NsDetachScan,
    NsDetachDelKeys,
    NsDetachDelNs,
    NsDeleteCheck,
    NsDeleteMark,
    NsQuery,
    IterScan,
}

/// One row of an opcode's stage table.
#[derive(Debug)]
pub struct CommandStage {
    pub stage: u8,
    pub command: Command,

    /// RESP replies this stage consumes before its handler concludes
    /// (MULTI/EXEC blocks answer with more than one).
    pub expected_responses: u8,

    /// This stage's reply carries data destined for user memory.
    pub result: bool,

    pub is_final: bool,
    pub next: u8,
}

const fn stage(
    stage: u8,
    command: Command,
    expected_responses: u8,
    result: bool,
    is_final: bool,
    next: u8,
) -> CommandStage {
    CommandStage {
        stage,
        command,
        expected_responses,
        result,
        is_final,
        next,
    }
}

static PUT_STAGES: [CommandStage; 1] = [stage(0, Command::Put, 1, false, true, 0)];
static GET_STAGES: [CommandStage; 1] = [stage(0, Command::Get, 1, true, true, 0)];
static READ_STAGES: [CommandStage; 1] = [stage(0, Command::Read, 1, true, true, 0)];
static REMOVE_STAGES: [CommandStage; 1] = [stage(0, Command::Remove, 1, false, true, 0)];

static MOVE_STAGES: [CommandStage; 3] = [
    stage(0, Command::MoveDump, 1, false, false, 1),
    stage(1, Command::MoveRestore, 1, false, false, 2),
    stage(2, Command::MoveDel, 1, false, true, 2),
];

static DIRECTORY_STAGES: [CommandStage; 2] = [
    stage(0, Command::DirMeta, 1, false, false, 1),
    stage(1, Command::DirScan, 1, true, true, 1),
];

static NSCREATE_STAGES: [CommandStage; 2] = [
    stage(0, Command::NsCreateId, 1, false, false, 1),
    stage(1, Command::NsCreateMeta, 1, false, true, 1),
];

static NSATTACH_STAGES: [CommandStage; 2] = [
    stage(0, Command::NsAttachCheck, 1, false, false, 1),
    stage(1, Command::NsAttachIncr, 1, false, true, 1),
];

static NSDETACH_STAGES: [CommandStage; 4] = [
    // MULTI, HINCRBY, HMGET, EXEC answer with +OK, +QUEUED, +QUEUED, array
    stage(0, Command::NsDetachCheck, 4, false, false, 1),
    stage(1, Command::NsDetachScan, 1, false, false, 2),
    stage(2, Command::NsDetachDelKeys, 1, false, false, 3),
    stage(3, Command::NsDetachDelNs, 1, false, true, 3),
];

static NSDELETE_STAGES: [CommandStage; 2] = [
    stage(0, Command::NsDeleteCheck, 1, false, false, 1),
    stage(1, Command::NsDeleteMark, 1, false, true, 1),
];

static NSQUERY_STAGES: [CommandStage; 1] = [stage(0, Command::NsQuery, 1, true, true, 0)];
static ITERATOR_STAGES: [CommandStage; 1] = [stage(0, Command::IterScan, 1, true, true, 0)];

/// Stage table of an opcode. CANCEL and UNSPEC never reach the wire and
/// have no stages.
pub fn stage_table(opcode: OpCode) -> &'static [CommandStage] {
    match opcode {
        OpCode::Put => &PUT_STAGES,
        OpCode::Get => &GET_STAGES,
        OpCode::Read => &READ_STAGES,
        OpCode::Remove => &REMOVE_STAGES,
        OpCode::Move => &MOVE_STAGES,
        OpCode::Directory => &DIRECTORY_STAGES,
        OpCode::NsCreate => &NSCREATE_STAGES,
        OpCode::NsAttach => &NSATTACH_STAGES,
        OpCode::NsDetach => &NSDETACH_STAGES,
        OpCode::NsDelete => &NSDELETE_STAGES,
        OpCode::NsQuery => &NSQUERY_STAGES,
        OpCode::Iterator => &ITERATOR_STAGES,
        OpCode::Cancel | OpCode::Unspec => &[],
    }
}

/// State shared by the children of one fan-out (DIRECTORY, NSDETACH).
/// The last child to drop the inflight count to zero emits the completion.
pub struct ScanShared {
    /// Children currently queued or awaiting a reply.
    pub inflight: AtomicU64,

    /// Keys accepted so far, bounded by the caller's limit.
    pub keycount: AtomicU64,

    /// Bytes appended to the user's key-list segment.
    pub filled: AtomicUsize,

    /// First error observed by any child; `u8::MAX` means none.
    error: AtomicU8,
}

impl ScanShared {
    pub fn new() -> Arc<ScanShared> {
        Arc::new(ScanShared {
            inflight: AtomicU64::new(0),
            keycount: AtomicU64::new(0),
            filled: AtomicUsize::new(0),
            error: AtomicU8::new(u8::MAX),
        })
    }

    pub fn record_error(&self, status: ErrorCode) {
        let _ = self.error.compare_exchange(
            u8::MAX,
            status as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Aggregated completion status: the first recorded error, else success.
    pub fn status(&self) -> ErrorCode {
        match self.error.load(Ordering::Acquire) {
            u8::MAX => ErrorCode::Success,
            raw => ErrorCode::from_u8(raw).unwrap_or(ErrorCode::Generic),
        }
    }
}

/// Compound-operation scratch state.
pub enum CompoundState {
    None,

    /// MOVE: the stashed DUMP payload between stages.
    Move { dumped: Option<Vec<u8>> },

    /// DIRECTORY / NSDETACH scan fan-out.
    Scan(ScanState),

    /// ITERATOR: handle into the engine's iterator table.
    Iter { handle: u64 },
}

pub struct ScanState {
    /// Current SCAN cursor on this child's connection.
    pub cursor: Vec<u8>,

    pub shared: Arc<ScanShared>,

    /// NSDETACH: the namespace is marked for deletion.
    pub to_delete: bool,

    /// NSDETACH DELKEYS: full wire key this child deletes.
    pub del_key: Option<Vec<u8>>,
}

/// A user request wrapped with engine state. Owned by a connection's
/// posted queue while awaiting a reply, by the engine otherwise.
pub struct RedisRequest {
    pub user: Arc<Request>,
    pub step: &'static CommandStage,
    pub location: Location,
    pub state: CompoundState,
    pub inception: Instant,

    /// Replies already consumed within the current stage.
    pub responses_seen: u8,

    /// Redirects taken so far.
    pub hops: u8,

    /// An ASKING handshake precedes the next reply.
    pub ask_pending: bool,
}

impl RedisRequest {
    pub fn new(user: Arc<Request>, location: Location) -> RedisRequest {
        let table = stage_table(user.opcode);
        assert!(!table.is_empty(), "opcode {:?} has no wire stages", user.opcode);
        RedisRequest {
            user,
            step: &table[0],
            location,
            state: CompoundState::None,
            inception: Instant::now(),
            responses_seen: 0,
            hops: 0,
            ask_pending: false,
        }
    }

    pub fn opcode(&self) -> OpCode {
        self.user.opcode
    }

    /// Advance to the stage named by the current stage's `next`.
    pub fn transition(&mut self) {
        let table = stage_table(self.user.opcode);
        self.step = &table[self.step.next as usize];
        self.responses_seen = 0;
    }

    /// Jump to an explicit stage (NSDETACH skips DELKEYS when a scan turns
    /// up no keys).
    pub fn transition_to(&mut self, stage: u8) {
        let table = stage_table(self.user.opcode);
        self.step = &table[stage as usize];
        self.responses_seen = 0;
    }

    /// Back to the first stage, for replay against another connection.
    pub fn rewind(&mut self) {
        let table = stage_table(self.user.opcode);
        self.step = &table[0];
        self.responses_seen = 0;
        self.ask_pending = false;
    }

    /// Clone for fan-out: same user request and shared scan state, pinned
    /// to `conn`.
    pub fn clone_for_conn(&self, conn: ConnIndex) -> RedisRequest {
        let state = match &self.state {
            CompoundState::Scan(scan) => CompoundState::Scan(ScanState {
                cursor: scan.cursor.clone(),
                shared: Arc::clone(&scan.shared),
                to_delete: scan.to_delete,
                del_key: scan.del_key.clone(),
            }),
            _ => CompoundState::None,
        };
        RedisRequest {
            user: Arc::clone(&self.user),
            step: self.step,
            location: Location::Conn(conn),
            state,
            inception: self.inception,
            responses_seen: 0,
            hops: 0,
            ask_pending: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opcode: OpCode) -> Arc<Request> {
        Arc::new(Request {
            opcode,
            key: Some(b"k".to_vec()),
            ..Request::default()
        })
    }

    #[test]
    fn transitions_follow_the_table() {
        let mut req = RedisRequest::new(request(OpCode::Move), Location::Slot(1));
        assert_eq!(req.step.command, Command::MoveDump);
        req.transition();
        assert_eq!(req.step.command, Command::MoveRestore);
        req.transition();
        assert_eq!(req.step.command, Command::MoveDel);
        assert!(req.step.is_final);
    }

    #[test]
    fn rewind_restarts_the_script() {
        let mut req = RedisRequest::new(request(OpCode::NsCreate), Location::Slot(9));
        req.transition();
        assert_eq!(req.step.stage, 1);
        req.rewind();
        assert_eq!(req.step.stage, 0);
    }

    #[test]
    fn detach_check_expects_the_multi_block() {
        let table = stage_table(OpCode::NsDetach);
        assert_eq!(table[0].expected_responses, 4);
        assert!(table[3].is_final);
    }

    #[test]
    fn scan_shared_keeps_first_error() {
        let shared = ScanShared::new();
        assert_eq!(shared.status(), ErrorCode::Success);
        shared.record_error(ErrorCode::Iterator);
        shared.record_error(ErrorCode::Generic);
        assert_eq!(shared.status(), ErrorCode::Iterator);
    }
}
