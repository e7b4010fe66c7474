//! Live connection registry
//!
//! The registry is the only authority on whether a token is live. Entries
//! are added at admission and removed exactly once, when the owning session
//! tears down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use linkshare_core::Token;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::group::GroupId;
use crate::messages::ServerMessage;

/// One admitted client connection
#[derive(Debug)]
pub struct Endpoint {
    token: Token,
    connection: Connection,
    /// Group this endpoint currently belongs to
    group: Mutex<Option<GroupId>>,
    torn_down: AtomicBool,
}

impl Endpoint {
    pub fn new(token: Token, connection: Connection) -> Self {
        Self {
            token,
            connection,
            group: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Current group membership
    pub fn group(&self) -> Option<GroupId> {
        *self.group.lock()
    }

    pub fn send(&self, msg: ServerMessage) -> Result<(), TransportError> {
        self.connection.send(msg)
    }

    /// Lock the group back-reference; used when pairing must see and update
    /// both sides atomically
    pub(crate) fn membership(&self) -> MutexGuard<'_, Option<GroupId>> {
        self.group.lock()
    }

    /// Clear the back-reference if it still points at `group`
    pub(crate) fn leave(&self, group: GroupId) -> bool {
        let mut current = self.group.lock();
        if *current == Some(group) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Notify the client it is being dropped and close its connection.
    /// Never fails; the client may already be gone.
    pub(crate) fn disconnect(&self) {
        if let Err(e) = self.connection.send(ServerMessage::Disconnected) {
            debug!("Ignoring failed disconnect notice to {}: {}", self.token, e);
        }
        self.connection.close(None);
    }

    /// Returns `true` for the first caller only
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

/// Token to endpoint mapping for every live connection
#[derive(Debug, Default)]
pub struct Registry {
    endpoints: DashMap<Token, Arc<Endpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under its token.
    ///
    /// Returns `false` without touching the registry if the token is taken.
    pub fn insert(&self, endpoint: Arc<Endpoint>) -> bool {
        match self.endpoints.entry(endpoint.token.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                true
            }
        }
    }

    pub fn lookup(&self, token: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(token).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, token: &str) -> bool {
        self.endpoints.contains_key(token)
    }

    /// Remove `endpoint`'s entry, but only if the token still maps to it
    pub fn remove(&self, endpoint: &Arc<Endpoint>) -> bool {
        self.endpoints
            .remove_if(endpoint.token(), |_, current| Arc::ptr_eq(current, endpoint))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
