// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! RESP command templates, one renderer per stage table entry.
//!
//! Rendering produces a prefix byte string for the connection's send
//! buffer and, for PUT, the list of user segments to follow as a vectored
//! write so payloads never get copied.

use tuple_protocol::{sge_total_len, Sge};

use crate::protocol::{self, TERMINATOR};
use crate::request::{Command, CompoundState, RedisRequest};
use crate::{wire_key, Error};

pub struct RenderedCommand {
    pub prefix: Vec<u8>,

    /// Segments to send after the prefix via vectored write; ends with
    /// the protocol terminator.
    pub vectored: Option<Vec<Sge>>,
}

impl RenderedCommand {
    fn plain(prefix: Vec<u8>) -> RenderedCommand {
        RenderedCommand {
            prefix,
            vectored: None,
        }
    }
}

/// An SGE naming the static `\r\n` terminator. The memory is never
/// written through.
pub fn terminator_sge() -> Sge {
    Sge {
        base: TERMINATOR.as_ptr() as *mut u8,
        len: TERMINATOR.len(),
    }
}

/// Render the current stage of `req`.
///
/// `ns` is the namespace name the engine resolved for the request (for
/// namespace lifecycle opcodes this is the target name itself), `dest_ns`
/// the MOVE destination, and `iter_cursor` the current cursor of an
/// ITERATOR request.
pub fn render(
    req: &RedisRequest,
    ns: &[u8],
    dest_ns: Option<&[u8]>,
    iter_cursor: Option<&[u8]>,
) -> Result<RenderedCommand, Error> {
    let key = req.user.key.as_deref();

    match req.step.command {
        Command::Put => {
            let wkey = wire_key(ns, key.ok_or(Error::Invalid)?);
            let value_len = sge_total_len(&req.user.sge);

            let mut prefix = Vec::new();
            protocol::serialize_array_header(&mut prefix, 3)?;
            protocol::serialize_bulk(&mut prefix, Some(b"RPUSH"))?;
            protocol::serialize_bulk(&mut prefix, Some(&wkey))?;
            prefix.extend_from_slice(format!("${value_len}\r\n").as_bytes());

            let mut vectored = req.user.sge.clone();
            vectored.push(terminator_sge());
            Ok(RenderedCommand {
                prefix,
                vectored: Some(vectored),
            })
        }

        Command::Get => {
            let wkey = wire_key(ns, key.ok_or(Error::Invalid)?);
            Ok(RenderedCommand::plain(command(&[b"LPOP", &wkey])?))
        }

        Command::Read => {
            let wkey = wire_key(ns, key.ok_or(Error::Invalid)?);
            Ok(RenderedCommand::plain(command(&[b"LINDEX", &wkey, b"0"])?))
        }

        Command::Remove | Command::MoveDel => {
            let wkey = wire_key(ns, key.ok_or(Error::Invalid)?);
            Ok(RenderedCommand::plain(command(&[b"DEL", &wkey])?))
        }

        Command::MoveDump => {
            let wkey = wire_key(ns, key.ok_or(Error::Invalid)?);
            Ok(RenderedCommand::plain(command(&[b"DUMP", &wkey])?))
        }

        Command::MoveRestore => {
            let dest = dest_ns.ok_or(Error::Invalid)?;
            let dkey = wire_key(dest, key.ok_or(Error::Invalid)?);
            let CompoundState::Move { dumped: Some(payload) } = &req.state else {
                return Err(Error::Invalid);
            };
            Ok(RenderedCommand::plain(command(&[
                b"RESTORE",
                &dkey,
                b"0",
                payload,
            ])?))
        }

        Command::DirMeta | Command::NsQuery => {
            Ok(RenderedCommand::plain(command(&[b"HGETALL", ns])?))
        }

        Command::DirScan => {
            let CompoundState::Scan(scan) = &req.state else {
                return Err(Error::Invalid);
            };
            let pattern = wire_key(ns, req.user.match_template.as_deref().unwrap_or(b"*"));
            Ok(RenderedCommand::plain(command(&[
                b"SCAN",
                &scan.cursor,
                b"MATCH",
                &pattern,
                b"COUNT",
                b"100",
            ])?))
        }

        Command::NsCreateId => Ok(RenderedCommand::plain(command(&[
            b"HSETNX",
            ns,
            b"id",
            ns,
        ])?)),

        Command::NsCreateMeta => {
            let group = req.user.group.to_string();
            Ok(RenderedCommand::plain(command(&[
                b"HMSET",
                ns,
                b"refcnt",
                b"1",
                b"groups",
                group.as_bytes(),
                b"flags",
                b"0",
            ])?))
        }

        Command::NsAttachCheck => Ok(RenderedCommand::plain(command(&[
            b"HEXISTS",
            ns,
            b"refcnt",
        ])?)),

        Command::NsAttachIncr => Ok(RenderedCommand::plain(command(&[
            b"HINCRBY",
            ns,
            b"refcnt",
            b"1",
        ])?)),

        Command::NsDetachCheck => {
            // one transaction: decrement the refcount and read it back
            // together with the delete mark
            let mut prefix = command(&[b"MULTI"])?;
            prefix.extend(command(&[b"HINCRBY", ns, b"refcnt", b"-1"])?);
            prefix.extend(command(&[b"HMGET", ns, b"refcnt", b"flags"])?);
            prefix.extend(command(&[b"EXEC"])?);
            Ok(RenderedCommand::plain(prefix))
        }

        Command::NsDetachScan => {
            let CompoundState::Scan(scan) = &req.state else {
                return Err(Error::Invalid);
            };
            let pattern = wire_key(ns, b"*");
            Ok(RenderedCommand::plain(command(&[
                b"SCAN",
                &scan.cursor,
                b"MATCH",
                &pattern,
                b"COUNT",
                b"100",
            ])?))
        }

        Command::NsDetachDelKeys => {
            let CompoundState::Scan(scan) = &req.state else {
                return Err(Error::Invalid);
            };
            let del_key = scan.del_key.as_deref().ok_or(Error::Invalid)?;
            Ok(RenderedCommand::plain(command(&[b"DEL", del_key])?))
        }

        Command::NsDetachDelNs => Ok(RenderedCommand::plain(command(&[b"DEL", ns])?)),

        Command::NsDeleteCheck => Ok(RenderedCommand::plain(command(&[
            b"HMGET",
            ns,
            b"refcnt",
            b"flags",
        ])?)),

        Command::NsDeleteMark => Ok(RenderedCommand::plain(command(&[
            b"HSET",
            ns,
            b"flags",
            b"1",
        ])?)),

        Command::IterScan => {
            let cursor = iter_cursor.ok_or(Error::Invalid)?;
            let pattern = wire_key(ns, req.user.match_template.as_deref().unwrap_or(b"*"));
            Ok(RenderedCommand::plain(command(&[
                b"SCAN",
                cursor,
                b"MATCH",
                &pattern,
                b"COUNT",
                b"100",
            ])?))
        }
    }
}

/// Render the ASKING handshake sent ahead of a redirected command.
pub fn render_asking() -> Vec<u8> {
    command(&[b"ASKING"]).expect("static command")
}

/// Render the topology discovery command.
pub fn render_cluster_slots() -> Vec<u8> {
    command(&[b"CLUSTER", b"SLOTS"]).expect("static command")
}

fn command(parts: &[&[u8]]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    protocol::serialize_command(&mut out, parts)?;
    Ok(out)
}
