// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod completion;
pub mod request;
pub mod sge;

use std::fmt;

pub use completion::{Completion, WireCompletion};
pub use request::{Request, WireRequest};
pub use sge::{sge_total_len, Sge, SGE_MAX};

/// Longest key or match template accepted by the engine, in bytes.
pub const MAX_KEY_LEN: usize = 1023;

/// Request flag: a GET for a missing key fails immediately with "not
/// available" instead of being held back for a retry.
pub const FLAG_IMMEDIATE: u64 = 0x1;

/// Request flag: a GET/READ whose value exceeds the user buffer completes
/// with the truncated prefix instead of an error.
pub const FLAG_PARTIAL: u64 = 0x2;

/// The user-visible operations of the tuple store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    #[default]
    Unspec = 0,
    Put,
    Get,
    Read,
    Remove,
    Move,
    Directory,
    NsCreate,
    NsAttach,
    NsDetach,
    NsDelete,
    NsQuery,
    Cancel,
    Iterator,
}

impl OpCode {
    pub const MAX: u8 = 14;

    pub fn from_u8(op: u8) -> Option<OpCode> {
        match op {
            0 => Some(OpCode::Unspec),
            1 => Some(OpCode::Put),
            2 => Some(OpCode::Get),
            3 => Some(OpCode::Read),
            4 => Some(OpCode::Remove),
            5 => Some(OpCode::Move),
            6 => Some(OpCode::Directory),
            7 => Some(OpCode::NsCreate),
            8 => Some(OpCode::NsAttach),
            9 => Some(OpCode::NsDetach),
            10 => Some(OpCode::NsDelete),
            11 => Some(OpCode::NsQuery),
            12 => Some(OpCode::Cancel),
            13 => Some(OpCode::Iterator),
            _ => None,
        }
    }

    /// Opcodes whose completion carries data back through the SGE block.
    pub fn returns_data(&self) -> bool {
        matches!(
            self,
            OpCode::Get | OpCode::Read | OpCode::Directory | OpCode::Iterator | OpCode::NsQuery
        )
    }

    /// Opcodes that are safe to re-issue after a connection loss.
    pub fn idempotent(&self) -> bool {
        matches!(
            self,
            OpCode::Get
                | OpCode::Read
                | OpCode::Directory
                | OpCode::NsQuery
                | OpCode::Cancel
                | OpCode::Iterator
        )
    }
}

/// Status codes surfaced at the API boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    Success = 0,
    Generic,
    Invalid,
    InProgress,
    Timeout,
    Unavail,
    Exists,
    NsBusy,
    NsInval,
    NoMemory,
    TagError,
    NoFile,
    NoAuth,
    NoConnect,
    Cancelled,
    NotImpl,
    Backend,
    Iterator,
    Plugin,
    Ubuffer,
}

impl ErrorCode {
    pub fn from_u8(status: u8) -> Option<ErrorCode> {
        match status {
            0 => Some(ErrorCode::Success),
            1 => Some(ErrorCode::Generic),
            2 => Some(ErrorCode::Invalid),
            3 => Some(ErrorCode::InProgress),
            4 => Some(ErrorCode::Timeout),
            5 => Some(ErrorCode::Unavail),
            6 => Some(ErrorCode::Exists),
            7 => Some(ErrorCode::NsBusy),
            8 => Some(ErrorCode::NsInval),
            9 => Some(ErrorCode::NoMemory),
            10 => Some(ErrorCode::TagError),
            11 => Some(ErrorCode::NoFile),
            12 => Some(ErrorCode::NoAuth),
            13 => Some(ErrorCode::NoConnect),
            14 => Some(ErrorCode::Cancelled),
            15 => Some(ErrorCode::NotImpl),
            16 => Some(ErrorCode::Backend),
            17 => Some(ErrorCode::Iterator),
            18 => Some(ErrorCode::Plugin),
            19 => Some(ErrorCode::Ubuffer),
            _ => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Operation successful",
            ErrorCode::Generic => "A general or unknown error has occurred",
            ErrorCode::Invalid => "Invalid argument",
            ErrorCode::InProgress => "Operation in progress",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::Unavail => "Entry not available",
            ErrorCode::Exists => "Entry already exists",
            ErrorCode::NsBusy => "Namespace still referenced by a client",
            ErrorCode::NsInval => "Namespace is invalid",
            ErrorCode::NoMemory => "Insufficient memory or storage",
            ErrorCode::TagError => "Invalid tag",
            ErrorCode::NoFile => "File not found",
            ErrorCode::NoAuth => "Access authorization required or failed",
            ErrorCode::NoConnect => "Connection to a storage backend failed",
            ErrorCode::Cancelled => "Operation was cancelled",
            ErrorCode::NotImpl => "Operation not implemented",
            ErrorCode::Backend => "Unspecified back-end error",
            ErrorCode::Iterator => "Invalid iterator or error iterating the namespace",
            ErrorCode::Plugin => "Error while processing request/data in data adapter",
            ErrorCode::Ubuffer => "Insufficient user buffer space",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// The possible errors that can arise from building or (de)serializing
/// requests and completions.
#[derive(Debug)]
pub enum Error {
    /// Malformed or out-of-bounds wire data.
    Wire(WireError),

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "Wire error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

#[derive(Debug, PartialEq)]
pub enum WireError {
    /// Generic decoding error: a field is missing, non-numeric, or the
    /// buffer ends mid-record.
    Decode,

    /// Key or match template exceeds MAX_KEY_LEN.
    NameTooLong,

    /// SGE list longer than SGE_MAX.
    TooManySegments,

    /// A PUT segment with non-zero length but no backing memory.
    NullSegment,

    /// Opcode or status field outside the known range.
    BadField,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Decode => "Error decoding",
                Self::NameTooLong => "Key or match template too long",
                Self::TooManySegments => "Too many scatter/gather segments",
                Self::NullSegment => "Data segment without backing memory",
                Self::BadField => "Field value out of range",
            }
        )
    }
}

/// Split one `\n`-terminated field off the front of `data`.
pub(crate) fn read_field<'a>(data: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let pos = data
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(WireError::Decode)?;
    let field = &data[..pos];
    *data = &data[pos + 1..];
    Ok(field)
}

pub(crate) fn read_i64(data: &mut &[u8]) -> Result<i64, WireError> {
    let field = read_field(data)?;
    let s = std::str::from_utf8(field).map_err(|_| WireError::Decode)?;
    s.parse::<i64>().map_err(|_| WireError::Decode)
}

pub(crate) fn read_u64(data: &mut &[u8]) -> Result<u64, WireError> {
    let field = read_field(data)?;
    let s = std::str::from_utf8(field).map_err(|_| WireError::Decode)?;
    s.parse::<u64>().map_err(|_| WireError::Decode)
}

/// Take `len` raw bytes off the front of `data`.
pub(crate) fn read_bytes<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8], WireError> {
    if data.len() < len {
        return Err(WireError::Decode);
    }
    let bytes = &data[..len];
    *data = &data[len..];
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        assert_eq!(ErrorCode::Success.message(), "Operation successful");
        assert_eq!(
            ErrorCode::NsBusy.message(),
            "Namespace still referenced by a client"
        );
        assert_eq!(
            ErrorCode::NoConnect.message(),
            "Connection to a storage backend failed"
        );
    }

    #[test]
    fn opcode_round_trip() {
        for op in 0..OpCode::MAX {
            let decoded = OpCode::from_u8(op).unwrap();
            assert_eq!(decoded as u8, op);
        }
        assert!(OpCode::from_u8(OpCode::MAX).is_none());
    }

    #[test]
    fn field_reader() {
        let mut data: &[u8] = b"17\nabc\n";
        assert_eq!(read_i64(&mut data).unwrap(), 17);
        assert_eq!(read_field(&mut data).unwrap(), b"abc");
        assert_eq!(read_field(&mut data), Err(WireError::Decode));
    }
}
