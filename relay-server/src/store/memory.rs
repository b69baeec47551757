use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PresenceStore, StoreError};
use crate::UserId;

#[derive(Default)]
struct Inner {
    seeded: bool,
    /// Front = most recently returned, back = next to hand out.
    pool: VecDeque<UserId>,
    owners: HashMap<UserId, String>,
    members: HashMap<String, HashSet<UserId>>,
    nodes: HashSet<String>,
}

/// In-process presence store. Clone the `Arc` to share it between nodes
/// running in the same process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of free identities left in the pool.
    pub fn pool_len(&self) -> usize {
        self.inner.lock().pool.len()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn seed_pool(&self, size: u32) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.seeded {
            return Ok(false);
        }
        for id in 0..size {
            inner.pool.push_front(UserId::from(id));
        }
        inner.seeded = true;
        Ok(true)
    }

    async fn pool_pop(&self) -> Result<Option<UserId>, StoreError> {
        Ok(self.inner.lock().pool.pop_back())
    }

    async fn pool_push(&self, id: UserId) -> Result<(), StoreError> {
        self.inner.lock().pool.push_front(id);
        Ok(())
    }

    async fn set_owner(&self, user: UserId, node: &str) -> Result<(), StoreError> {
        self.inner.lock().owners.insert(user, node.to_string());
        Ok(())
    }

    async fn get_owner(&self, user: UserId) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().owners.get(&user).cloned())
    }

    async fn delete_owner(&self, user: UserId) -> Result<(), StoreError> {
        self.inner.lock().owners.remove(&user);
        Ok(())
    }

    async fn add_member(&self, node: &str, user: UserId) -> Result<(), StoreError> {
        self.inner
            .lock()
            .members
            .entry(node.to_string())
            .or_default()
            .insert(user);
        Ok(())
    }

    async fn remove_member(&self, node: &str, user: UserId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.members.get_mut(node) {
            set.remove(&user);
            if set.is_empty() {
                inner.members.remove(node);
            }
        }
        Ok(())
    }

    async fn members(&self, node: &str) -> Result<Vec<UserId>, StoreError> {
        let inner = self.inner.lock();
        let mut ids: Vec<UserId> = inner
            .members
            .get(node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn register_node(&self, node: &str) -> Result<(), StoreError> {
        self.inner.lock().nodes.insert(node.to_string());
        Ok(())
    }

    async fn deregister_node(&self, node: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.nodes.remove(node);
        inner.members.remove(node);
        Ok(())
    }

    async fn live_nodes(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.inner.lock().nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_only_once() {
        let store = MemoryStore::new();
        assert!(store.seed_pool(3).await.unwrap());
        assert!(!store.seed_pool(3).await.unwrap());
        assert_eq!(store.pool_len(), 3);
    }

    #[tokio::test]
    async fn drained_pool_is_not_reseeded() {
        let store = MemoryStore::new();
        store.seed_pool(1).await.unwrap();
        assert_eq!(store.pool_pop().await.unwrap(), Some(0));
        assert!(!store.seed_pool(1).await.unwrap());
        assert_eq!(store.pool_pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn pool_hands_out_ids_in_seed_order() {
        let store = MemoryStore::new();
        store.seed_pool(3).await.unwrap();
        assert_eq!(store.pool_pop().await.unwrap(), Some(0));
        assert_eq!(store.pool_pop().await.unwrap(), Some(1));
        store.pool_push(0).await.unwrap();
        // Returned IDs go to the back of the line.
        assert_eq!(store.pool_pop().await.unwrap(), Some(2));
        assert_eq!(store.pool_pop().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn deregister_drops_membership() {
        let store = MemoryStore::new();
        store.register_node("a").await.unwrap();
        store.add_member("a", 4).await.unwrap();
        store.add_member("a", 2).await.unwrap();
        assert_eq!(store.members("a").await.unwrap(), vec![2, 4]);

        store.deregister_node("a").await.unwrap();
        assert!(store.live_nodes().await.unwrap().is_empty());
        assert!(store.members("a").await.unwrap().is_empty());
    }
}
