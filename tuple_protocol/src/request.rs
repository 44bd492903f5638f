// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! User requests and their upstream wire format.
//!
//! The request record travels from an application (or the forwarding
//! daemon's remote client) into the engine. On the wire it is a fixed
//! newline-delimited header followed by an opcode-specific payload block:
//!
//! ```text
//! <opcode>\n<ns_hdl>\n<user>\n<next>\n<group>\n<keylen>\n<matchlen>\n<flags>\n<key><match>\n
//! ```

use log::*;

use crate::sge::{self, Sge};
use crate::{read_bytes, read_u64, OpCode, WireError, MAX_KEY_LEN, SGE_MAX};

/// One user operation, owned by the engine from submission until its
/// completion has been emitted.
#[derive(Debug, Default, Clone)]
pub struct Request {
    pub opcode: OpCode,

    /// Namespace handle as returned by a create/attach completion.
    pub ns_hdl: u64,

    /// Opaque user cookie, echoed in the completion.
    pub user: u64,

    /// Chain token linking grouped requests on the wire.
    pub next: u64,

    pub group: u64,

    /// Tuple name. Length-driven: embedded zero bytes are legal.
    pub key: Option<Vec<u8>>,

    /// Glob-style match template for DIRECTORY and ITERATOR.
    pub match_template: Option<Vec<u8>>,

    pub flags: u64,

    /// Source (PUT) or destination (GET/READ/...) memory segments.
    pub sge: Vec<Sge>,

    /// Destination group and namespace handle, MOVE only.
    pub dest_group: u64,
    pub dest_hdl: u64,
}

impl Request {
    /// Field-level checks applied before a request enters the engine.
    pub fn validate(&self) -> Result<(), WireError> {
        if let Some(key) = &self.key {
            if key.len() > MAX_KEY_LEN {
                return Err(WireError::NameTooLong);
            }
        }
        if let Some(pattern) = &self.match_template {
            if pattern.len() > MAX_KEY_LEN {
                return Err(WireError::NameTooLong);
            }
        }
        if self.sge.len() > SGE_MAX {
            return Err(WireError::TooManySegments);
        }
        if self.opcode == OpCode::Put {
            for s in &self.sge {
                if s.len > 0 && s.base.is_null() {
                    return Err(WireError::NullSegment);
                }
            }
        }
        Ok(())
    }

    /// Encode header and payload block.
    ///
    /// SAFETY: for PUT and NSCREATE the segment memory is read; all
    /// segments must satisfy the [`Sge::as_slice`] contract.
    pub unsafe fn serialize(&self) -> Result<Vec<u8>, WireError> {
        self.validate()?;

        let key: &[u8] = self.key.as_deref().unwrap_or(&[]);
        let pattern: &[u8] = self.match_template.as_deref().unwrap_or(&[]);

        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
                self.opcode as u8,
                self.ns_hdl,
                self.user,
                self.next,
                self.group,
                key.len(),
                pattern.len(),
                self.flags,
            )
            .as_bytes(),
        );
        out.extend_from_slice(key);
        out.extend_from_slice(pattern);
        out.push(b'\n');

        match self.opcode {
            OpCode::Get | OpCode::Read | OpCode::NsQuery | OpCode::Iterator => {
                sge::serialize_header(&self.sge, &mut out)?;
            }
            OpCode::Directory => {
                // segment 0 receives the key list, segment 1 encodes the
                // caller's key-count limit
                if self.sge.len() != 2 {
                    return Err(WireError::TooManySegments);
                }
                sge::serialize_header(&self.sge, &mut out)?;
            }
            OpCode::Put | OpCode::NsCreate => {
                sge::serialize(&self.sge, &mut out)?;
            }
            OpCode::Move => {
                out.extend_from_slice(format!("{}\n{}\n", self.dest_group, self.dest_hdl).as_bytes());
            }
            OpCode::Remove
            | OpCode::Cancel
            | OpCode::NsAttach
            | OpCode::NsDetach
            | OpCode::NsDelete
            | OpCode::Unspec => {}
        }

        Ok(out)
    }
}

/// A request decoded from the wire. Payload segments are owned here; the
/// receiving side re-anchors them before handing the request to an engine.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WireRequest {
    pub opcode: OpCode,
    pub ns_hdl: u64,
    pub user: u64,
    pub next: u64,
    pub group: u64,
    pub key: Option<Vec<u8>>,
    pub match_template: Option<Vec<u8>>,
    pub flags: u64,

    /// Per-segment lengths from the SGE header (`-1` marks NIL).
    pub sge_lens: Vec<i64>,

    /// Segment payloads; only populated for data-carrying opcodes.
    pub payloads: Vec<Option<Vec<u8>>>,

    pub dest_group: u64,
    pub dest_hdl: u64,
}

impl WireRequest {
    pub fn deserialize(data: &mut &[u8]) -> Result<WireRequest, WireError> {
        let raw_opcode = read_u64(data)?;
        let opcode = u8::try_from(raw_opcode)
            .ok()
            .and_then(OpCode::from_u8)
            .ok_or_else(|| {
                debug!("request with unknown opcode {raw_opcode}");
                WireError::BadField
            })?;

        let ns_hdl = read_u64(data)?;
        let user = read_u64(data)?;
        let next = read_u64(data)?;
        let group = read_u64(data)?;
        let key_len = read_u64(data)? as usize;
        let match_len = read_u64(data)? as usize;
        let flags = read_u64(data)?;

        if key_len > MAX_KEY_LEN || match_len > MAX_KEY_LEN {
            return Err(WireError::NameTooLong);
        }

        let key = if key_len > 0 {
            Some(read_bytes(data, key_len)?.to_vec())
        } else {
            None
        };
        let match_template = if match_len > 0 {
            Some(read_bytes(data, match_len)?.to_vec())
        } else {
            None
        };
        if read_bytes(data, 1)? != b"\n" {
            return Err(WireError::Decode);
        }

        let mut request = WireRequest {
            opcode,
            ns_hdl,
            user,
            next,
            group,
            key,
            match_template,
            flags,
            ..WireRequest::default()
        };

        match opcode {
            OpCode::Get | OpCode::Read | OpCode::NsQuery | OpCode::Iterator => {
                request.sge_lens = sge::deserialize_header(data)?;
            }
            OpCode::Directory => {
                request.sge_lens = sge::deserialize_header(data)?;
                if request.sge_lens.len() != 2 {
                    return Err(WireError::TooManySegments);
                }
            }
            OpCode::Put | OpCode::NsCreate => {
                request.payloads = sge::deserialize(data)?;
                request.sge_lens = request
                    .payloads
                    .iter()
                    .map(|p| p.as_ref().map_or(-1, |b| b.len() as i64))
                    .collect();
            }
            OpCode::Move => {
                request.dest_group = read_u64(data)?;
                request.dest_hdl = read_u64(data)?;
            }
            OpCode::Remove
            | OpCode::Cancel
            | OpCode::NsAttach
            | OpCode::NsDetach
            | OpCode::NsDelete
            | OpCode::Unspec => {}
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_key() {
        let request = Request {
            opcode: OpCode::Remove,
            key: Some(vec![b'k'; MAX_KEY_LEN + 1]),
            ..Request::default()
        };
        assert_eq!(request.validate(), Err(WireError::NameTooLong));
    }

    #[test]
    fn key_with_embedded_zero_survives() {
        let request = Request {
            opcode: OpCode::Remove,
            ns_hdl: 3,
            user: 99,
            key: Some(b"he\0llo".to_vec()),
            ..Request::default()
        };

        let bytes = unsafe { request.serialize().unwrap() };
        let mut rest = bytes.as_slice();
        let decoded = WireRequest::deserialize(&mut rest).unwrap();

        assert!(rest.is_empty());
        assert_eq!(decoded.opcode, OpCode::Remove);
        assert_eq!(decoded.key.as_deref(), Some(&b"he\0llo"[..]));
        assert_eq!(decoded.user, 99);
    }
}
