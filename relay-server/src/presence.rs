//! Presence directory: which node owns which user, and which nodes are live.
//!
//! Records carry no expiry. They exist while the connection is live and are
//! removed explicitly on disconnect or shutdown. A node that crashes without
//! a clean shutdown leaves its records behind.

use std::collections::HashSet;
use std::sync::Arc;

use crate::UserId;
use crate::store::{PresenceStore, StoreError};

#[derive(Clone)]
pub struct PresenceDirectory {
    store: Arc<dyn PresenceStore>,
}

impl PresenceDirectory {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Record that `user` is attached to `node`.
    pub async fn advertise(&self, user: UserId, node: &str) -> Result<(), StoreError> {
        self.store.set_owner(user, node).await?;
        self.store.add_member(node, user).await
    }

    /// Remove `user`'s presence record and its entry in the owning node's
    /// membership set.
    pub async fn withdraw(&self, user: UserId) -> Result<(), StoreError> {
        let owner = self.store.get_owner(user).await?;
        self.store.delete_owner(user).await?;
        if let Some(node) = owner {
            self.store.remove_member(&node, user).await?;
        }
        Ok(())
    }

    pub async fn owner_of(&self, user: UserId) -> Result<Option<String>, StoreError> {
        self.store.get_owner(user).await
    }

    /// Users currently advertised on `node` (informational).
    pub async fn members_of(&self, node: &str) -> Result<Vec<UserId>, StoreError> {
        self.store.members(node).await
    }

    pub async fn register_node(&self, node: &str) -> Result<(), StoreError> {
        self.store.register_node(node).await?;
        tracing::info!(%node, "Node registered in live-node directory");
        Ok(())
    }

    pub async fn deregister_node(&self, node: &str) -> Result<(), StoreError> {
        self.store.deregister_node(node).await?;
        tracing::info!(%node, "Node removed from live-node directory");
        Ok(())
    }

    pub async fn live_nodes(&self) -> Result<HashSet<String>, StoreError> {
        self.store.live_nodes().await
    }
}
