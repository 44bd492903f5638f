// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bounded table of cluster connections. The table slot index is what the
//! locator stores, so lookups stay O(1) and nothing holds pointers across
//! components.

use std::net::SocketAddr;
use std::time::Duration;

use log::*;

use crate::connection::{Connection, ConnectionStatus, Recoverable};
use crate::locator::{ConnIndex, Locator};
use crate::request::RedisRequest;
use crate::Error;

pub const MAX_CONNECTIONS: usize = 128;

pub struct ConnectionMgr {
    connections: Vec<Option<Connection>>,

    /// Failure slots: indices awaiting a recovery attempt.
    failed: Vec<ConnIndex>,
}

impl Default for ConnectionMgr {
    fn default() -> ConnectionMgr {
        ConnectionMgr::new()
    }
}

impl ConnectionMgr {
    pub fn new() -> ConnectionMgr {
        let mut connections = Vec::with_capacity(MAX_CONNECTIONS);
        connections.resize_with(MAX_CONNECTIONS, || None);
        ConnectionMgr {
            connections,
            failed: Vec::new(),
        }
    }

    pub fn add(&mut self, mut conn: Connection) -> Result<ConnIndex, Error> {
        let slot = self
            .connections
            .iter()
            .position(|c| c.is_none())
            .ok_or(Error::Full)?;
        conn.index = slot as ConnIndex;
        self.connections[slot] = Some(conn);
        Ok(slot as ConnIndex)
    }

    /// Detach a connection from the table without closing it. Pending
    /// recovery bookkeeping for the index is dropped.
    pub fn remove(&mut self, index: ConnIndex) -> Option<Connection> {
        self.failed.retain(|&i| i != index);
        self.connections.get_mut(index as usize)?.take()
    }

    pub fn get(&self, index: ConnIndex) -> Option<&Connection> {
        self.connections.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: ConnIndex) -> Option<&mut Connection> {
        self.connections.get_mut(index as usize)?.as_mut()
    }

    pub fn get_by_address(&self, address: &SocketAddr) -> Option<ConnIndex> {
        self.indices()
            .find(|&i| self.get(i).and_then(Connection::address) == Some(*address))
    }

    /// Find a connection by `host:port` (as announced in redirects and
    /// CLUSTER SLOTS replies).
    pub fn get_by_host(&self, host: &str) -> Option<ConnIndex> {
        self.indices().find(|&i| {
            self.get(i)
                .map(|c| crate::config::host_of_url(c.url()) == host)
                .unwrap_or(false)
        })
    }

    pub fn conn_count(&self) -> usize {
        self.indices().count()
    }

    fn indices(&self) -> impl Iterator<Item = ConnIndex> + '_ {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| i as ConnIndex)
    }

    /// Connections able to carry requests right now.
    pub fn healthy(&self) -> Vec<ConnIndex> {
        self.indices()
            .filter(|&i| {
                matches!(
                    self.get(i).map(Connection::status),
                    Some(ConnectionStatus::Authorized) | Some(ConnectionStatus::PendingData)
                )
            })
            .collect()
    }

    /// Mark a connection failed and queue it for recovery.
    pub fn fail(&mut self, index: ConnIndex) {
        if let Some(conn) = self.get_mut(index) {
            conn.fail();
            if !self.failed.contains(&index) {
                self.failed.push(index);
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Try to reconnect every failure slot. Recovered connections get
    /// their owned slot ranges re-assigned in the locator; unrecoverable
    /// ones are dropped from the table. Returns the recovered indices.
    pub fn recover(&mut self, locator: &mut Locator, timeout: Duration) -> Vec<ConnIndex> {
        let mut recovered = Vec::new();
        let pending = std::mem::take(&mut self.failed);

        for index in pending {
            let Some(conn) = self.connections[index as usize].as_mut() else {
                continue;
            };

            if conn.recoverable() == Recoverable::Unrecoverable {
                warn!("connection {index} ({}) is unrecoverable, dropping", conn.url());
                locator.reassociate(Some(index), None);
                self.connections[index as usize] = None;
                continue;
            }

            match conn.reconnect(timeout) {
                Ok(()) => {
                    for slot in conn.slots.iter_set() {
                        locator.assign(slot, index);
                    }
                    info!("recovered connection {index} ({})", conn.url());
                    recovered.push(index);
                }
                Err(e) => {
                    debug!("reconnect of {index} failed: {e}");
                    self.failed.push(index);
                }
            }
        }
        recovered
    }

    /// Fan-out helper: one clone of `template` per healthy connection,
    /// each pinned to its connection.
    pub fn request_each(&self, template: &RedisRequest) -> Vec<RedisRequest> {
        self.healthy()
            .into_iter()
            .map(|index| template.clone_for_conn(index))
            .collect()
    }
}
