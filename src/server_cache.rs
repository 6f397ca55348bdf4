//! Per-connection cache of engine server handles.
//!
//! Entries are keyed by connection identity first, so two host connections
//! sharing one bridge never see each other's handles. A structural change to
//! a generator clears its entries under every connection, since all of them
//! read the same project; handles are rebuilt on next use.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::connection::ConnectionId;
use crate::engine::{PredictServer, QueryServer};
use crate::types::GeneratorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKey {
    Query,
    Predict,
}

/// A cached server handle
#[derive(Clone)]
pub enum ServerHandle {
    Query(Arc<dyn QueryServer>),
    Predict(Arc<dyn PredictServer>),
}

impl ServerHandle {
    pub fn key(&self) -> ServerKey {
        match self {
            ServerHandle::Query(_) => ServerKey::Query,
            ServerHandle::Predict(_) => ServerKey::Predict,
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerHandle::{:?}", self.key())
    }
}

type GeneratorEntries = HashMap<GeneratorId, HashMap<ServerKey, ServerHandle>>;

#[derive(Default)]
pub struct ServerCache {
    entries: Mutex<HashMap<ConnectionId, GeneratorEntries>>,
}

impl ServerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conn: ConnectionId, generator: GeneratorId, key: ServerKey) -> Option<ServerHandle> {
        let entries = self.entries.lock();
        let handle = entries.get(&conn)?.get(&generator)?.get(&key).cloned();
        debug!(
            "Server cache {} for {} generator {} {:?}",
            if handle.is_some() { "hit" } else { "miss" },
            conn,
            generator,
            key
        );
        handle
    }

    pub fn set(&self, conn: ConnectionId, generator: GeneratorId, handle: ServerHandle) {
        let mut entries = self.entries.lock();
        entries
            .entry(conn)
            .or_default()
            .entry(generator)
            .or_default()
            .insert(handle.key(), handle);
    }

    /// Drop one handle, or every handle of the generator when `key` is `None`.
    pub fn invalidate(&self, conn: ConnectionId, generator: GeneratorId, key: Option<ServerKey>) {
        let mut entries = self.entries.lock();
        let Some(generators) = entries.get_mut(&conn) else {
            return;
        };
        match key {
            None => {
                generators.remove(&generator);
            }
            Some(key) => {
                if let Some(handles) = generators.get_mut(&generator) {
                    handles.remove(&key);
                }
            }
        }
        debug!("Invalidated {:?} handles for {} generator {}", key, conn, generator);
    }

    /// Drop every handle of the generator under every connection.
    pub fn invalidate_generator(&self, generator: GeneratorId) {
        let mut entries = self.entries.lock();
        let mut dropped = 0;
        for generators in entries.values_mut() {
            if let Some(handles) = generators.remove(&generator) {
                dropped += handles.len();
            }
        }
        debug!("Invalidated {} handles for generator {} on all connections", dropped, generator);
    }

    /// Forget everything cached for a connection.
    pub fn forget_connection(&self, conn: ConnectionId) {
        if self.entries.lock().remove(&conn).is_some() {
            debug!("Released server handles for {}", conn);
        }
    }

    /// Number of cached handles across all connections.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .flat_map(|generators| generators.values())
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
