// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Zero-copy data movement between the wire and user memory.
//!
//! Small values are copied out of the receive buffer. For a bulk payload
//! that overran the buffer, the already-received prefix is copied into the
//! earliest user segments and a receive SGE list is planned for the tail:
//! the user segment straddling the boundary is split, the remaining user
//! segments follow kernel-direct, oversize payloads spill into the scrap
//! region, and the receive buffer takes the protocol terminator plus any
//! pipelined follow-up bytes.

use tuple_protocol::{sge_total_len, Sge};

/// Engine-wide overflow region for payloads beyond user buffer capacity.
pub const SCRAP_SPACE_LEN: usize = 512 * 1024 * 1024;

/// Copy `payload` into the segment list, in order. Returns bytes copied
/// (bounded by the list's capacity).
pub fn scatter_copy(payload: &[u8], sges: &[Sge]) -> usize {
    let mut pos = 0;
    for sge in sges {
        if pos == payload.len() || sge.len == 0 || sge.is_null() {
            if pos == payload.len() {
                break;
            }
            continue;
        }
        let count = (payload.len() - pos).min(sge.len);
        // SAFETY: destination validity per the Sge submission contract.
        unsafe {
            sge.as_mut_slice()[..count].copy_from_slice(&payload[pos..pos + count]);
        }
        pos += count;
    }
    pos
}

/// The receive plan for the tail of a partial bulk string.
pub struct TailPlan {
    /// Receive list: user segment tails, scrap spill, buffer region.
    pub sges: Vec<Sge>,

    /// Payload tail plus terminator; `recv_direct` must not stop short.
    pub expected: usize,

    /// Payload bytes that will land in user memory.
    pub user_tail: usize,

    /// Payload bytes routed to the scrap region.
    pub scrap_tail: usize,
}

/// Build the receive list for a payload of `total` bytes of which
/// `already` were copied into the user segments. `buffer_region` is the
/// (reset) receive buffer's free space for the terminator and pipelined
/// follow-ups; `scrap` the overflow region (may be the NIL segment when no
/// spill is expected).
pub fn plan_tail_receive(
    user_sges: &[Sge],
    already: usize,
    total: usize,
    buffer_region: Sge,
    scrap: Sge,
) -> TailPlan {
    assert!(total >= already);
    assert!(buffer_region.len >= 2);

    let remaining = total - already;
    let capacity = sge_total_len(user_sges);
    let user_tail = remaining.min(capacity.saturating_sub(already));
    let scrap_tail = remaining - user_tail;

    let mut sges = Vec::with_capacity(user_sges.len() + 2);
    let mut skip = already;
    let mut left = user_tail;

    for sge in user_sges {
        if left == 0 {
            break;
        }
        if skip >= sge.len {
            skip -= sge.len;
            continue;
        }
        // this segment straddles the prefix/tail boundary
        let tail_len = (sge.len - skip).min(left);
        sges.push(Sge {
            // SAFETY: staying within the segment per the checks above
            base: unsafe { sge.base.add(skip) },
            len: tail_len,
        });
        left -= tail_len;
        skip = 0;
    }

    if scrap_tail > 0 {
        assert!(scrap.len >= scrap_tail);
        sges.push(Sge {
            base: scrap.base,
            len: scrap_tail,
        });
    }

    sges.push(buffer_region);

    TailPlan {
        sges,
        expected: remaining + 2,
        user_tail,
        scrap_tail,
    }
}
