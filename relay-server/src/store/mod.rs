//! Shared presence store: the key-value service every node can reach.
//!
//! The store hosts three things:
//! - the identity pool (a list of free user IDs),
//! - user → owning node records plus per-node membership sets,
//! - the live-node directory.
//!
//! [`MemoryStore`] backs tests and single-process clusters; [`RedisStore`]
//! is the production backend.

mod memory;
mod redis_store;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::UserId;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt value under {key}: {value}")]
    Corrupt { key: String, value: String },
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Fill the identity pool with `0..size` unless it was seeded before.
    /// Returns `true` if this call seeded the pool.
    async fn seed_pool(&self, size: u32) -> Result<bool, StoreError>;
    /// Take the least recently returned free ID, if any.
    async fn pool_pop(&self) -> Result<Option<UserId>, StoreError>;
    async fn pool_push(&self, id: UserId) -> Result<(), StoreError>;

    async fn set_owner(&self, user: UserId, node: &str) -> Result<(), StoreError>;
    async fn get_owner(&self, user: UserId) -> Result<Option<String>, StoreError>;
    async fn delete_owner(&self, user: UserId) -> Result<(), StoreError>;

    async fn add_member(&self, node: &str, user: UserId) -> Result<(), StoreError>;
    async fn remove_member(&self, node: &str, user: UserId) -> Result<(), StoreError>;
    async fn members(&self, node: &str) -> Result<Vec<UserId>, StoreError>;

    async fn register_node(&self, node: &str) -> Result<(), StoreError>;
    /// Remove `node` from the directory and drop its membership set.
    async fn deregister_node(&self, node: &str) -> Result<(), StoreError>;
    async fn live_nodes(&self) -> Result<HashSet<String>, StoreError>;
}
