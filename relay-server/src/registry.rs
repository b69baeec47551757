//! Per-node map from user ID to that user's live connection.
//!
//! Written by connection setup/teardown, read concurrently by the consumer
//! pool and the shutdown routine. The lock is never held across an await.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::UserId;
use crate::connection::ExitGate;

/// Non-owning reference to a live connection: its outbound queue and its
/// exit gate.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: UserId,
    outbound: mpsc::Sender<String>,
    gate: ExitGate,
}

impl ConnectionHandle {
    pub fn new(id: UserId, outbound: mpsc::Sender<String>, gate: ExitGate) -> Self {
        Self { id, outbound, gate }
    }

    /// Enqueue without waiting. A full queue means the client is not keeping
    /// up; the connection is told to exit rather than stall the caller.
    pub fn deliver(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(user_id = self.id, "Outbound queue full, disconnecting slow client");
                self.gate.trigger();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue, waiting for room. Returns `false` once the queue is closed.
    pub async fn enqueue(&self, frame: String) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Fire this connection's exit gate.
    pub fn exit(&self) -> bool {
        self.gate.trigger()
    }

    pub fn gate(&self) -> &ExitGate {
        &self.gate
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning any handle it displaced.
    pub fn insert(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.write().insert(handle.id, handle)
    }

    /// Remove `id` only if it still maps to the connection owning `gate`.
    pub fn remove(&self, id: UserId, gate: &ExitGate) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write();
        match connections.get(&id) {
            Some(existing) if existing.gate.same_gate(gate) => connections.remove(&id),
            _ => None,
        }
    }

    pub fn lookup(&self, id: UserId) -> Option<ConnectionHandle> {
        self.connections.read().get(&id).cloned()
    }

    /// Run `f` over every registered connection.
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionHandle)) {
        for handle in self.connections.read().values() {
            f(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
