// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! One TCP endpoint of the cluster: socket, buffers, status, posted queue.
//!
//! Linking is a blocking sequence (resolve, connect, AUTH) after which the
//! socket turns non-blocking and is handed to the readiness multiplexer.
//! All later I/O happens on the engine thread.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::*;
use mio::net::TcpStream;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::uio::{readv, writev};
use std::io::{IoSlice, IoSliceMut};
use tuple_protocol::Sge;

use crate::config::host_of_url;
use crate::locator::ConnIndex;
use crate::protocol;
use crate::request::RedisRequest;
use crate::slot_bitmap::SlotBitmap;
use crate::sr_buffer::SrBuffer;
use crate::Error;

/// Marks a connection not (yet) registered with the connection manager.
pub const CONN_INDEX_UNSET: ConnIndex = ConnIndex::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unspec,
    Initialized,
    Connected,
    Authorized,
    PendingData,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverable {
    Recoverable,
    Unrecoverable,
}

pub struct Connection {
    stream: Option<TcpStream>,
    url: String,
    authfile: String,
    address: Option<SocketAddr>,
    status: ConnectionStatus,
    last_alive: Instant,

    /// Table slot in the connection manager; what the locator stores.
    pub index: ConnIndex,

    /// Hash slots this endpoint owns, per the last topology refresh.
    pub slots: SlotBitmap,

    pub sendbuf: SrBuffer,
    pub recvbuf: SrBuffer,

    /// Submitted, not yet answered requests, in send order.
    pub posted: Mutex<VecDeque<RedisRequest>>,
}

impl Connection {
    pub fn new(buffer_size: usize) -> Connection {
        Connection {
            stream: None,
            url: String::new(),
            authfile: String::new(),
            address: None,
            status: ConnectionStatus::Initialized,
            last_alive: Instant::now(),
            index: CONN_INDEX_UNSET,
            slots: SlotBitmap::new(),
            sendbuf: SrBuffer::new(buffer_size),
            recvbuf: SrBuffer::new(buffer_size),
            posted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn last_alive(&self) -> Instant {
        self.last_alive
    }

    /// Ready to accept new sends.
    pub fn ready_to_send(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Authorized | ConnectionStatus::PendingData
        )
    }

    /// Ready to receive (PENDING_DATA additionally guarantees bytes are
    /// waiting).
    pub fn ready_to_recv(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Authorized | ConnectionStatus::PendingData
        )
    }

    /// The readiness callback path: a readable socket has pending data.
    pub fn set_active(&mut self) {
        if self.status == ConnectionStatus::Authorized {
            self.status = ConnectionStatus::PendingData;
        }
    }

    /// Receive buffer drained; back to plain AUTHORIZED.
    pub fn set_drained(&mut self) {
        if self.status == ConnectionStatus::PendingData {
            self.status = ConnectionStatus::Authorized;
        }
    }

    pub fn fail(&mut self) {
        if self.status != ConnectionStatus::Failed {
            warn!("connection {} ({}) failed", self.index, self.url);
        }
        self.status = ConnectionStatus::Failed;
        self.stream = None;
    }

    /// Resolve `sock://host:port`, connect, authorize. Returns an error
    /// without touching the state when the connection is already linked.
    pub fn link(&mut self, url: &str, authfile: &str, timeout: Duration) -> Result<(), Error> {
        if matches!(
            self.status,
            ConnectionStatus::Connected
                | ConnectionStatus::Authorized
                | ConnectionStatus::PendingData
        ) {
            debug!("link called on an already linked connection ({url})");
            return Err(Error::NotReady);
        }

        let host = host_of_url(url);
        let address = host
            .to_socket_addrs()
            .map_err(|e| {
                debug!("cannot resolve {host}: {e}");
                Error::NoConnect
            })?
            .next()
            .ok_or(Error::NoConnect)?;

        let mut stream = StdTcpStream::connect_timeout(&address, timeout).map_err(|e| {
            debug!("connect {address} failed: {e}");
            Error::NoConnect
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        self.status = ConnectionStatus::Connected;

        authorize(&mut stream, authfile).map_err(|e| {
            self.status = ConnectionStatus::Failed;
            e
        })?;
        self.status = ConnectionStatus::Authorized;

        stream.set_nonblocking(true)?;
        self.stream = Some(TcpStream::from_std(stream));
        self.url = url.to_string();
        self.authfile = authfile.to_string();
        self.address = Some(address);
        self.last_alive = Instant::now();
        trace!("linked and authorized {url}");
        Ok(())
    }

    /// Whether a reconnect has a chance: the peer name must still resolve.
    pub fn recoverable(&self) -> Recoverable {
        match host_of_url(&self.url).to_socket_addrs() {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    Recoverable::Recoverable
                } else {
                    Recoverable::Unrecoverable
                }
            }
            _ => Recoverable::Unrecoverable,
        }
    }

    /// Retry the link sequence against the remembered address.
    pub fn reconnect(&mut self, timeout: Duration) -> Result<(), Error> {
        if self.url.is_empty() {
            return Err(Error::Invalid);
        }
        self.stream = None;
        self.status = ConnectionStatus::Initialized;
        self.sendbuf.reset();
        self.recvbuf.reset();
        let url = self.url.clone();
        let authfile = self.authfile.clone();
        self.link(&url, &authfile, timeout)
    }

    /// Drop the socket without touching address bookkeeping.
    pub fn unlink(&mut self) {
        self.stream = None;
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn registered_stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    #[cfg(test)]
    pub(crate) fn set_status_for_test(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    fn raw_fd(&self) -> Result<RawFd, Error> {
        self.stream
            .as_ref()
            .map(|s| s.as_raw_fd())
            .ok_or(Error::NotReady)
    }

    /// Flush the send buffer. Bytes that would block stay for the next
    /// flush round.
    pub fn send(&mut self) -> Result<usize, Error> {
        if !self.ready_to_send() {
            return Err(Error::NotReady);
        }
        let stream = self.stream.as_mut().ok_or(Error::NotReady)?;

        let mut sent = 0;
        while self.sendbuf.unprocessed() > 0 {
            match stream.write(self.sendbuf.unprocessed_slice()) {
                Ok(0) => {
                    self.fail();
                    return Err(Error::Io(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(count) => {
                    self.sendbuf.advance(count);
                    sent += count;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail();
                    return Err(e.into());
                }
            }
        }
        if self.sendbuf.is_empty() {
            self.sendbuf.reset();
        }
        Ok(sent)
    }

    /// Vectored write of command fragments, e.g. a rendered prefix followed
    /// by the caller's PUT segments. Blocks (bounded by `timeout`) until
    /// everything is on the wire so that posted-queue order matches wire
    /// order.
    pub fn send_cmd(&mut self, sges: &[Sge], timeout: Duration) -> Result<usize, Error> {
        if !self.ready_to_send() {
            return Err(Error::NotReady);
        }
        // anything already buffered goes first
        self.send()?;
        if !self.sendbuf.is_empty() {
            wait_for(self.raw_fd()?, PollFlags::POLLOUT, timeout)?;
            self.send()?;
            if !self.sendbuf.is_empty() {
                return Err(Error::Full);
            }
        }

        let fd = self.raw_fd()?;
        let total: usize = sges.iter().map(|s| s.len).sum();
        let mut written = 0;
        let mut seg = 0;
        let mut seg_off = 0;

        while written < total {
            // SAFETY: segment memory is valid per the Sge submission
            // contract; the slices only live for this call.
            let iov: Vec<IoSlice> = sges[seg..]
                .iter()
                .enumerate()
                .filter(|(_, s)| s.len > 0)
                .map(|(i, s)| {
                    let slice = unsafe { s.as_slice() };
                    if i == 0 {
                        IoSlice::new(&slice[seg_off..])
                    } else {
                        IoSlice::new(slice)
                    }
                })
                .collect();

            // SAFETY: fd belongs to the stream we still own.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match writev(borrowed, &iov) {
                Ok(count) => {
                    written += count;
                    let mut remain = count;
                    while remain > 0 {
                        let left = sges[seg].len - seg_off;
                        if remain >= left {
                            remain -= left;
                            seg += 1;
                            seg_off = 0;
                        } else {
                            seg_off += remain;
                            remain = 0;
                        }
                    }
                }
                Err(nix::Error::EAGAIN) => wait_for(fd, PollFlags::POLLOUT, timeout)?,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    self.fail();
                    return Err(e.into());
                }
            }
        }
        Ok(written)
    }

    /// Read whatever is available into the receive buffer.
    pub fn recv(&mut self) -> Result<usize, Error> {
        if !self.ready_to_recv() {
            return Err(Error::NotReady);
        }
        let stream = self.stream.as_mut().ok_or(Error::NotReady)?;

        if self.recvbuf.remaining() == 0 {
            self.recvbuf.compact();
            if self.recvbuf.remaining() == 0 {
                return Err(Error::Full);
            }
        }

        match stream.read(self.recvbuf.free_slice()) {
            Ok(0) => {
                debug!("peer {} closed the connection", self.url);
                self.fail();
                Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()))
            }
            Ok(count) => {
                self.recvbuf.add_data(count, false);
                self.last_alive = Instant::now();
                Ok(count)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.fail();
                Err(e.into())
            }
        }
    }

    /// Receive with a bounded wait for the socket to turn readable. Used
    /// by synchronous exchanges (topology discovery) outside the event
    /// loop.
    pub fn recv_wait(&mut self, timeout: Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let count = self.recv()?;
            if count > 0 {
                return Ok(count);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::Timeout);
            }
            wait_for(self.raw_fd()?, PollFlags::POLLIN, left)?;
        }
    }

    /// Vectored read of exactly `expected` bytes scattered into `sges`
    /// (plus opportunistic extra into the final segment). Used to stream
    /// oversized bulk payloads straight into user memory.
    pub fn recv_direct(
        &mut self,
        sges: &[Sge],
        expected: usize,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let fd = self.raw_fd()?;
        let capacity: usize = sges.iter().map(|s| s.len).sum();
        assert!(expected <= capacity);

        let mut received = 0;
        let mut seg = 0;
        let mut seg_off = 0;

        while received < expected {
            // SAFETY: destination memory is valid per the Sge contract and
            // unaliased while the request is in flight.
            let mut iov: Vec<IoSliceMut> = sges[seg..]
                .iter()
                .enumerate()
                .filter(|(_, s)| s.len > 0)
                .map(|(i, s)| {
                    let slice = unsafe { s.as_mut_slice() };
                    if i == 0 {
                        IoSliceMut::new(&mut slice[seg_off..])
                    } else {
                        IoSliceMut::new(slice)
                    }
                })
                .collect();

            // SAFETY: fd belongs to the stream we still own.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match readv(borrowed, &mut iov) {
                Ok(0) => {
                    self.fail();
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(count) => {
                    received += count;
                    self.last_alive = Instant::now();
                    let mut remain = count;
                    while remain > 0 && seg < sges.len() {
                        let left = sges[seg].len - seg_off;
                        if remain >= left {
                            remain -= left;
                            seg += 1;
                            seg_off = 0;
                        } else {
                            seg_off += remain;
                            remain = 0;
                        }
                    }
                }
                Err(nix::Error::EAGAIN) => wait_for(fd, PollFlags::POLLIN, timeout)?,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    self.fail();
                    return Err(e.into());
                }
            }
        }
        Ok(received)
    }
}

/// Wait for readiness on `fd`, bounded by `timeout`.
fn wait_for(fd: RawFd, flags: PollFlags, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(Error::Timeout);
        }
        let slice_ms = left.as_millis().min(100) as u16;

        // SAFETY: the caller owns the fd for the duration of the wait.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, flags)];
        match poll(&mut fds, PollTimeout::from(slice_ms)) {
            Ok(0) => continue,
            Ok(_) => return Ok(()),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// The blocking AUTH (or PING, when no secret is configured) exchange run
/// right after connect.
fn authorize(stream: &mut StdTcpStream, authfile: &str) -> Result<(), Error> {
    let mut cmd = Vec::new();
    let expect: &[u8] = if authfile.is_empty() {
        protocol::serialize_command(&mut cmd, &[b"PING"])?;
        b"+PONG\r\n"
    } else {
        let secret = std::fs::read_to_string(authfile).map_err(|e| {
            debug!("cannot read authfile {authfile}: {e}");
            Error::NoFile
        })?;
        let secret = secret.lines().next().unwrap_or("").trim().to_string();
        if secret.is_empty() {
            return Err(Error::NoFile);
        }
        protocol::serialize_command(&mut cmd, &[b"AUTH", secret.as_bytes()])?;
        b"+OK\r\n"
    };

    stream.write_all(&cmd).map_err(|_| Error::NoConnect)?;

    let mut reply = [0u8; 256];
    let mut have = 0;
    loop {
        let count = stream.read(&mut reply[have..]).map_err(|_| Error::NoAuth)?;
        if count == 0 {
            return Err(Error::NoAuth);
        }
        have += count;
        if reply[..have].ends_with(protocol::TERMINATOR) {
            break;
        }
        if have == reply.len() {
            return Err(Error::NoAuth);
        }
    }

    if &reply[..have] == expect {
        Ok(())
    } else {
        debug!(
            "authorization rejected: {}",
            String::from_utf8_lossy(&reply[..have]).trim_end()
        );
        Err(Error::NoAuth)
    }
}
