// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Redis-cluster backend for the tuple store client.
//!
//! The engine maps user operations onto RESP commands, routes them to the
//! owning cluster shard by hash slot, and drives a per-opcode state machine
//! over non-blocking connections. See `engine::RedisBackend` for the
//! submission/completion surface.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod conn_mgr;
pub mod connection;
pub mod crc16;
pub mod engine;
pub mod event_mgr;
pub mod locator;
pub mod namespace;
pub mod process;
pub mod protocol;
pub mod request;
pub mod slot_bitmap;
pub mod sr_buffer;
pub mod transport;

use std::fmt;

/// Separator between the namespace and the tuple name on the wire.
pub const NAMESPACE_SEPARATOR: &[u8] = b"::";

/// Default size of each connection's send and receive buffer. Array
/// replies cannot be streamed piecewise, so this bounds the largest SCAN
/// batch (SCAN COUNT x max wire-key length) with headroom.
pub const SR_BUFFER_SIZE: usize = 512 * 1024;

/// Redirect hops after which a request gives up with a backend error.
pub const MAX_REDIRECT_HOPS: u8 = 8;

/// Engine-internal failures. API-visible status codes are
/// `tuple_protocol::ErrorCode`; this type covers what can go wrong between
/// the engine and the cluster.
#[derive(Debug)]
pub enum Error {
    /// An argument failed a range or state check.
    Invalid,

    /// Key or match template longer than the wire permits.
    NameTooLong,

    /// The peer sent bytes that do not parse as RESP.
    Protocol,

    /// Address resolution or TCP connect failed.
    NoConnect,

    /// The AUTH exchange was rejected.
    NoAuth,

    /// The authfile could not be read.
    NoFile,

    /// The connection is not in a state that allows the operation.
    NotReady,

    /// A send or receive buffer ran out of space.
    Full,

    /// A bounded wait for socket readiness expired.
    Timeout,

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::NameTooLong => write!(f, "key or match template too long"),
            Self::Protocol => write!(f, "malformed RESP data"),
            Self::NoConnect => write!(f, "connection to storage backend failed"),
            Self::NoAuth => write!(f, "authorization rejected"),
            Self::NoFile => write!(f, "authfile not readable"),
            Self::NotReady => write!(f, "connection not ready"),
            Self::Full => write!(f, "buffer out of space"),
            Self::Timeout => write!(f, "timed out waiting for the peer"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

/// Join namespace and tuple name into the on-the-wire key.
pub fn wire_key(ns: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ns.len() + NAMESPACE_SEPARATOR.len() + key.len());
    out.extend_from_slice(ns);
    out.extend_from_slice(NAMESPACE_SEPARATOR);
    out.extend_from_slice(key);
    out
}
