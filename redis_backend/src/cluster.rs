// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Cluster topology: CLUSTER SLOTS parsing and application to the
//! connection table and locator.

use std::time::Duration;

use log::*;

use crate::conn_mgr::ConnectionMgr;
use crate::connection::Connection;
use crate::event_mgr::EventMgr;
use crate::locator::Locator;
use crate::protocol::RespValue;
use crate::slot_bitmap::SLOT_COUNT;
use crate::sr_buffer::SrBuffer;
use crate::{Error, SR_BUFFER_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub first: u16,
    pub last: u16,

    /// Master endpoint as `host:port`.
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub ranges: Vec<SlotRange>,
}

impl ClusterInfo {
    /// The whole keyspace on one endpoint; used when the peer is a plain
    /// single-instance server with cluster support disabled.
    pub fn single_node(address: &str) -> ClusterInfo {
        ClusterInfo {
            ranges: vec![SlotRange {
                first: 0,
                last: (SLOT_COUNT - 1) as u16,
                address: address.to_string(),
            }],
        }
    }
}

/// Decode a CLUSTER SLOTS reply: an array of
/// `[first, last, [ip, port, ...], ...replicas]` entries. Replicas are
/// ignored; requests go to masters.
pub fn parse_cluster_slots(value: &RespValue, buf: &SrBuffer) -> Result<ClusterInfo, Error> {
    let RespValue::Array(entries) = value else {
        return Err(Error::Protocol);
    };

    let mut info = ClusterInfo::default();
    for entry in entries {
        let RespValue::Array(fields) = entry else {
            return Err(Error::Protocol);
        };
        if fields.len() < 3 {
            return Err(Error::Protocol);
        }
        let (RespValue::Int(first), RespValue::Int(last)) = (&fields[0], &fields[1]) else {
            return Err(Error::Protocol);
        };
        if *first < 0 || *last < *first || *last >= SLOT_COUNT as i64 {
            return Err(Error::Protocol);
        }

        let RespValue::Array(master) = &fields[2] else {
            return Err(Error::Protocol);
        };
        if master.len() < 2 {
            return Err(Error::Protocol);
        }
        let RespValue::Str(ip) = &master[0] else {
            return Err(Error::Protocol);
        };
        let RespValue::Int(port) = &master[1] else {
            return Err(Error::Protocol);
        };

        let ip = std::str::from_utf8(ip.bytes(buf)).map_err(|_| Error::Protocol)?;
        info.ranges.push(SlotRange {
            first: *first as u16,
            last: *last as u16,
            address: format!("{ip}:{port}"),
        });
    }
    Ok(info)
}

/// Make the routing state match `info`: ensure a linked connection exists
/// per master endpoint and assign its ranges in the locator and the
/// connection's own slot bitmap.
pub fn apply(
    info: &ClusterInfo,
    conn_mgr: &mut ConnectionMgr,
    locator: &mut Locator,
    event_mgr: &mut EventMgr,
    authfile: &str,
    timeout: Duration,
) -> Result<(), Error> {
    for range in &info.ranges {
        let index = match conn_mgr.get_by_host(&range.address) {
            Some(index) => index,
            None => {
                let url = format!("sock://{}", range.address);
                let mut conn = Connection::new(SR_BUFFER_SIZE);
                conn.link(&url, authfile, timeout)?;
                let index = conn_mgr.add(conn)?;
                event_mgr.add(conn_mgr.get_mut(index).expect("just added"))?;
                info!("connected cluster endpoint {} as {}", range.address, index);
                index
            }
        };

        let conn = conn_mgr.get_mut(index).expect("endpoint exists");
        for slot in range.first..=range.last {
            conn.slots.set(slot);
            locator.assign(slot, index);
        }
        debug!(
            "slots [{}, {}] owned by connection {}",
            range.first, range.last, index
        );
    }
    Ok(())
}
