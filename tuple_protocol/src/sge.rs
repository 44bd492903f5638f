// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Scatter/gather segments and their ASCII list encoding.
//!
//! An SGE names one contiguous region of caller memory. The engine never
//! copies PUT payloads into owned buffers; it carries these descriptors and
//! hands them to vectored socket I/O. The wire encoding is line oriented:
//!
//! ```text
//! <total_len>\n<sge_count>\n<len_0>\n...<len_n>\n<payload_0><payload_1>...
//! ```
//!
//! A NIL segment (no backing memory at all) is encoded with length `-1` and
//! contributes no payload bytes.

use crate::{read_bytes, read_i64, WireError};

/// Max number of segments in one request (IOV_MAX replacement).
pub const SGE_MAX: usize = 256;

/// One scatter/gather element: a borrowed view of caller memory.
///
/// The pointer is not a Rust reference on purpose: requests outlive the call
/// that submitted them and cross into the engine thread. The submitter
/// guarantees the region stays valid and unaliased until the completion for
/// the owning request has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub base: *mut u8,
    pub len: usize,
}

// SAFETY: an Sge is a plain descriptor. The validity contract above makes
// the engine thread the only accessor between submission and completion,
// even when the owning request is shared through an Arc.
unsafe impl Send for Sge {}
unsafe impl Sync for Sge {}

impl Sge {
    /// The NIL segment: no memory attached.
    pub fn null() -> Sge {
        Sge {
            base: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn from_slice(buf: &mut [u8]) -> Sge {
        Sge {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// View the segment as a byte slice.
    ///
    /// SAFETY: the caller must uphold the submission contract: `base` points
    /// to `len` initialized bytes that no one else mutates for the duration
    /// of the borrow.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.base.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.base, self.len)
        }
    }

    /// Mutable view of the segment.
    ///
    /// SAFETY: same as [`Sge::as_slice`], plus exclusivity of the mutable
    /// borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        if self.base.is_null() {
            &mut []
        } else {
            std::slice::from_raw_parts_mut(self.base, self.len)
        }
    }
}

/// Total payload size of an SGE list in bytes.
pub fn sge_total_len(sges: &[Sge]) -> usize {
    sges.iter().map(|s| s.len).sum()
}

/// Append the list header (total, count, per-segment lengths) to `out`.
pub fn serialize_header(sges: &[Sge], out: &mut Vec<u8>) -> Result<(), WireError> {
    if sges.is_empty() || sges.len() > SGE_MAX {
        return Err(WireError::TooManySegments);
    }

    out.extend_from_slice(format!("{}\n{}\n", sge_total_len(sges), sges.len()).as_bytes());
    for sge in sges {
        let len: i64 = if sge.is_null() && sge.len == 0 {
            -1
        } else {
            sge.len as i64
        };
        out.extend_from_slice(format!("{len}\n").as_bytes());
    }
    Ok(())
}

/// Append header plus the raw payload bytes of every segment to `out`.
///
/// SAFETY: every non-NIL segment must satisfy the [`Sge::as_slice`]
/// contract.
pub unsafe fn serialize(sges: &[Sge], out: &mut Vec<u8>) -> Result<(), WireError> {
    for sge in sges {
        if sge.len != 0 && sge.base.is_null() {
            return Err(WireError::NullSegment);
        }
    }
    serialize_header(sges, out)?;
    for sge in sges {
        out.extend_from_slice(sge.as_slice());
    }
    Ok(())
}

/// Decode a list header, returning the per-segment lengths (`-1` for NIL).
pub fn deserialize_header(data: &mut &[u8]) -> Result<Vec<i64>, WireError> {
    let total = read_i64(data)?;
    let count = read_i64(data)?;
    if count < 1 || count as usize > SGE_MAX {
        return Err(WireError::TooManySegments);
    }

    let mut lens = Vec::with_capacity(count as usize);
    let mut seen: i64 = 0;
    for _ in 0..count {
        let len = read_i64(data)?;
        if len < -1 {
            return Err(WireError::Decode);
        }
        if len > 0 {
            seen += len;
        }
        lens.push(len);
    }
    if seen != total {
        return Err(WireError::Decode);
    }
    Ok(lens)
}

/// Decode header and payloads into owned segments; `None` encodes NIL.
pub fn deserialize(data: &mut &[u8]) -> Result<Vec<Option<Vec<u8>>>, WireError> {
    let lens = deserialize_header(data)?;
    let mut segments = Vec::with_capacity(lens.len());
    for len in lens {
        if len < 0 {
            segments.push(None);
        } else {
            segments.push(Some(read_bytes(data, len as usize)?.to_vec()));
        }
    }
    Ok(segments)
}
