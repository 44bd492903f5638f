// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! In-process mirror of attached namespaces.
//!
//! A record exists per namespace this process created or attached; the
//! record's table handle (index + 1, zero is invalid) is what the API
//! layer carries around as the namespace handle. The cluster-side
//! metadata hash stays authoritative; this registry only tracks local
//! references.

use tuple_protocol::ErrorCode;

/// Handle of a registry entry; 0 is never valid.
pub type NsHandle = u64;

pub struct Namespace {
    pub name: Vec<u8>,
    pub refcount: u64,
}

pub struct NamespaceRegistry {
    entries: Vec<Option<Namespace>>,
}

impl Default for NamespaceRegistry {
    fn default() -> NamespaceRegistry {
        NamespaceRegistry::new()
    }
}

impl NamespaceRegistry {
    pub fn new() -> NamespaceRegistry {
        NamespaceRegistry {
            entries: Vec::new(),
        }
    }

    fn slot_of(handle: NsHandle) -> Option<usize> {
        (handle > 0).then(|| (handle - 1) as usize)
    }

    pub fn get(&self, handle: NsHandle) -> Option<&Namespace> {
        self.entries.get(Self::slot_of(handle)?)?.as_ref()
    }

    pub fn name_of(&self, handle: NsHandle) -> Option<&[u8]> {
        self.get(handle).map(|ns| ns.name.as_slice())
    }

    pub fn lookup(&self, name: &[u8]) -> Option<NsHandle> {
        self.entries
            .iter()
            .position(|e| e.as_ref().map(|ns| ns.name == name).unwrap_or(false))
            .map(|slot| (slot + 1) as NsHandle)
    }

    /// First insert of a namespace; refcount starts at one.
    pub fn create(&mut self, name: &[u8]) -> Result<NsHandle, ErrorCode> {
        if self.lookup(name).is_some() {
            return Err(ErrorCode::Exists);
        }
        let record = Namespace {
            name: name.to_vec(),
            refcount: 1,
        };
        let slot = match self.entries.iter().position(|e| e.is_none()) {
            Some(slot) => {
                self.entries[slot] = Some(record);
                slot
            }
            None => {
                self.entries.push(Some(record));
                self.entries.len() - 1
            }
        };
        Ok((slot + 1) as NsHandle)
    }

    /// Find-or-insert and bump the reference count.
    pub fn attach(&mut self, name: &[u8]) -> Result<NsHandle, ErrorCode> {
        match self.lookup(name) {
            Some(handle) => {
                let slot = Self::slot_of(handle).unwrap();
                let ns = self.entries[slot].as_mut().unwrap();
                ns.refcount += 1;
                Ok(handle)
            }
            None => self.create(name),
        }
    }

    /// Drop one reference; returns the count left.
    pub fn detach(&mut self, handle: NsHandle) -> Result<u64, ErrorCode> {
        let slot = Self::slot_of(handle).ok_or(ErrorCode::NsInval)?;
        let ns = self
            .entries
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(ErrorCode::NsInval)?;
        if ns.refcount == 0 {
            return Err(ErrorCode::NsInval);
        }
        ns.refcount -= 1;
        Ok(ns.refcount)
    }

    /// Remove a fully detached record.
    pub fn destroy(&mut self, handle: NsHandle) -> Result<(), ErrorCode> {
        let slot = Self::slot_of(handle).ok_or(ErrorCode::NsInval)?;
        match self.entries.get_mut(slot) {
            Some(entry @ Some(_)) => {
                if entry.as_ref().unwrap().refcount > 0 {
                    return Err(ErrorCode::NsBusy);
                }
                *entry = None;
                Ok(())
            }
            _ => Err(ErrorCode::NsInval),
        }
    }
}
