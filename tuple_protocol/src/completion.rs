// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Completion records and their upstream wire format:
//!
//! ```text
//! <opcode>\n<status>\n<rc>\n<user>\n<next>\n
//! ```
//!
//! followed by an SGE data block for the opcodes that return data
//! (GET/READ/DIRECTORY/ITERATOR/NSQUERY).

use crate::sge::{self, Sge};
use crate::{read_i64, read_u64, ErrorCode, OpCode, WireError};

/// The API-visible outcome of one request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub opcode: OpCode,
    pub status: ErrorCode,

    /// Bytes transferred, a namespace handle, or a negative error detail.
    pub rc: i64,

    /// User cookie copied from the request.
    pub user: u64,

    /// Chain token copied from the request.
    pub next: u64,
}

impl Completion {
    /// Encode the completion; `sge` supplies the data block for opcodes
    /// that return data and is ignored otherwise.
    ///
    /// SAFETY: when a data block is emitted, the segments must satisfy the
    /// [`Sge::as_slice`] contract.
    pub unsafe fn serialize(&self, sge: &[Sge]) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "{}\n{}\n{}\n{}\n{}\n",
                self.opcode as u8, self.status as u8, self.rc, self.user, self.next,
            )
            .as_bytes(),
        );

        if self.opcode.returns_data() && carries_payload(self.status) {
            sge::serialize(sge, &mut out)?;
        }
        Ok(out)
    }
}

/// A completion decoded from the wire, with any returned data owned.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WireCompletion {
    pub completion: Completion,
    pub payloads: Vec<Option<Vec<u8>>>,
}

impl WireCompletion {
    pub fn deserialize(data: &mut &[u8]) -> Result<WireCompletion, WireError> {
        let opcode = read_u64(data)?;
        let opcode = u8::try_from(opcode)
            .ok()
            .and_then(OpCode::from_u8)
            .ok_or(WireError::BadField)?;
        let status = read_u64(data)?;
        let status = u8::try_from(status)
            .ok()
            .and_then(ErrorCode::from_u8)
            .ok_or(WireError::BadField)?;
        let rc = read_i64(data)?;
        let user = read_u64(data)?;
        let next = read_u64(data)?;

        let completion = Completion {
            opcode,
            status,
            rc,
            user,
            next,
        };

        let payloads = if opcode.returns_data() && carries_payload(status) {
            sge::deserialize(data)?
        } else {
            Vec::new()
        };

        Ok(WireCompletion {
            completion,
            payloads,
        })
    }
}

/// Data blocks travel on success and on buffer-truncation, where the prefix
/// in the user buffer is still valid.
fn carries_payload(status: ErrorCode) -> bool {
    status == ErrorCode::Success || status == ErrorCode::Ubuffer
}
