//! Reusable user identities drawn from the shared pool.
//!
//! The pool lives in the presence store, so identities are unique across
//! every node at any instant: an ID is either in the pool or held by exactly
//! one live connection.

use std::sync::Arc;

use crate::UserId;
use crate::store::{PresenceStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("identity pool exhausted")]
    Exhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct IdentityAllocator {
    store: Arc<dyn PresenceStore>,
}

impl IdentityAllocator {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Seed the shared pool with `size` IDs on first cluster bootstrap.
    pub async fn bootstrap(&self, size: u32) -> Result<bool, StoreError> {
        let seeded = self.store.seed_pool(size).await?;
        if seeded {
            tracing::info!(size, "Identity pool seeded");
        }
        Ok(seeded)
    }

    pub async fn acquire(&self) -> Result<UserId, AcquireError> {
        self.store.pool_pop().await?.ok_or(AcquireError::Exhausted)
    }

    /// Return an ID to the pool. Call at most once per acquired ID.
    pub async fn release(&self, id: UserId) -> Result<(), StoreError> {
        self.store.pool_push(id).await
    }

    /// Acquire an ID wrapped in a [`Lease`] that guarantees its return.
    pub async fn lease(&self) -> Result<Lease, AcquireError> {
        let id = self.acquire().await?;
        Ok(Lease {
            id,
            allocator: Some(self.clone()),
        })
    }
}

/// An acquired identity that goes back to the pool exactly once: through
/// [`Lease::release`] on teardown, or on drop if the connection never got
/// that far (e.g. the upgrade failed).
pub struct Lease {
    id: UserId,
    allocator: Option<IdentityAllocator>,
}

impl Lease {
    pub fn id(&self) -> UserId {
        self.id
    }

    pub async fn release(mut self) {
        if let Some(allocator) = self.allocator.take() {
            release_logged(&allocator, self.id).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(allocator) = self.allocator.take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release_logged(&allocator, id).await });
            }
            Err(_) => tracing::error!(user_id = id, "Identity leaked: no runtime to release it"),
        }
    }
}

async fn release_logged(allocator: &IdentityAllocator, id: UserId) {
    if let Err(e) = allocator.release(id).await {
        tracing::error!(user_id = id, "Failed to return identity to pool: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    async fn allocator(size: u32) -> (Arc<MemoryStore>, IdentityAllocator) {
        let store = MemoryStore::new();
        let allocator = IdentityAllocator::new(store.clone());
        allocator.bootstrap(size).await.unwrap();
        (store, allocator)
    }

    #[tokio::test]
    async fn acquire_hands_out_distinct_ids_until_exhausted() {
        let (_, allocator) = allocator(3).await;
        let mut seen = HashSet::new();
        for _ in 0..3 {
            assert!(seen.insert(allocator.acquire().await.unwrap()));
        }
        assert!(matches!(allocator.acquire().await, Err(AcquireError::Exhausted)));
    }

    #[tokio::test]
    async fn released_id_is_acquirable_again() {
        let (_, allocator) = allocator(1).await;
        let id = allocator.acquire().await.unwrap();
        assert!(allocator.acquire().await.is_err());
        allocator.release(id).await.unwrap();
        assert_eq!(allocator.acquire().await.unwrap(), id);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_collide() {
        let (_, allocator) = allocator(50).await;
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let allocator = allocator.clone();
            tasks.push(tokio::spawn(async move { allocator.acquire().await.unwrap() }));
        }
        let mut ids = HashSet::new();
        for task in tasks {
            assert!(ids.insert(task.await.unwrap()));
        }
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn lease_release_returns_id_once() {
        let (store, allocator) = allocator(2).await;
        let lease = allocator.lease().await.unwrap();
        assert_eq!(store.pool_len(), 1);
        lease.release().await;
        assert_eq!(store.pool_len(), 2);
    }

    #[tokio::test]
    async fn dropped_lease_returns_id() {
        let (store, allocator) = allocator(2).await;
        let lease = allocator.lease().await.unwrap();
        drop(lease);
        for _ in 0..50 {
            if store.pool_len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dropped lease was not returned to the pool");
    }
}
