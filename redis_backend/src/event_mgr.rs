// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Read-readiness multiplexer over the connection table.
//!
//! `next()` drains an internal active queue first; when that is empty it
//! polls the readiness source once (bounded by `wait`) and queues whatever
//! turned readable. A connection transitions to PENDING_DATA the moment
//! its readiness event is seen.

use std::collections::VecDeque;
use std::time::Duration;

use log::*;
use mio::{Events, Interest, Poll, Token};

use crate::conn_mgr::ConnectionMgr;
use crate::connection::Connection;
use crate::locator::ConnIndex;
use crate::Error;

pub struct EventMgr {
    poll: Poll,
    events: Events,
    active: VecDeque<ConnIndex>,
}

impl EventMgr {
    pub fn new() -> Result<EventMgr, Error> {
        Ok(EventMgr {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            active: VecDeque::new(),
        })
    }

    /// Watch a linked connection's socket for readability.
    pub fn add(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let index = conn.index;
        let stream = conn.registered_stream().ok_or(Error::NotReady)?;
        self.poll
            .registry()
            .register(stream, Token(index as usize), Interest::READABLE)?;
        trace!("watching connection {index}");
        Ok(())
    }

    /// Re-arm after a reconnect replaced the socket.
    pub fn rearm(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let index = conn.index;
        let stream = conn.registered_stream().ok_or(Error::NotReady)?;
        self.poll
            .registry()
            .reregister(stream, Token(index as usize), Interest::READABLE)?;
        Ok(())
    }

    pub fn remove(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let index = conn.index;
        if let Some(stream) = conn.registered_stream() {
            self.poll.registry().deregister(stream)?;
        }
        self.active.retain(|&i| i != index);
        Ok(())
    }

    /// Next connection with bytes to read, or `None`. Polls at most once;
    /// `wait` bounds the poll (zero for a pure poll).
    pub fn next(&mut self, conn_mgr: &mut ConnectionMgr, wait: Duration) -> Option<ConnIndex> {
        if let Some(index) = self.active.pop_front() {
            return Some(index);
        }

        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return None,
            Err(e) => {
                error!("readiness poll failed: {e}");
                return None;
            }
        }

        for event in self.events.iter() {
            if event.is_readable() || event.is_read_closed() {
                let index = event.token().0 as ConnIndex;
                match conn_mgr.get_mut(index) {
                    Some(conn) => {
                        conn.set_active();
                        if !self.active.contains(&index) {
                            self.active.push_back(index);
                        }
                    }
                    None => debug!("readiness event for unknown connection {index}"),
                }
            }
        }

        self.active.pop_front()
    }
}
