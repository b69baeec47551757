//! Message broker: one named work queue per node.
//!
//! A [`NodeChannel`] is the publish handle for one node's queue. A
//! [`QueueConsumer`] drains a queue; when several consumers share a queue
//! each message goes to exactly one of them.

mod memory;
mod redis_queue;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::memory::MemoryBroker;
pub use self::redis_queue::RedisBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("channel to node {0} is closed")]
    Closed(String),
    #[error("no channel to node {0}")]
    NoChannel(String),
    #[error("presence store: {0}")]
    Directory(#[from] crate::store::StoreError),
    #[error("broker bridge is shut down")]
    ShutDown,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a publish channel bound to `node`'s queue.
    async fn open_channel(&self, node: &str) -> Result<Arc<dyn NodeChannel>, BrokerError>;
    /// Start consuming `node`'s queue.
    async fn consume(&self, node: &str) -> Result<Box<dyn QueueConsumer>, BrokerError>;
}

#[async_trait]
pub trait NodeChannel: Send + Sync {
    async fn publish(&self, payload: &str) -> Result<(), BrokerError>;
    /// Release the channel. Later publishes fail with [`BrokerError::Closed`].
    async fn close(&self);
}

#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next delivery. `Ok(None)` means the queue is gone.
    async fn next(&mut self) -> Result<Option<String>, BrokerError>;
}

/// Queue name for a node, shared by every broker backend.
pub fn queue_name(prefix: &str, node: &str) -> String {
    format!("{prefix}:queue:{node}")
}
