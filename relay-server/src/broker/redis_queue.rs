use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{Broker, BrokerError, NodeChannel, QueueConsumer, queue_name};

/// Seconds a consumer blocks in BRPOP before polling again.
const BRPOP_TIMEOUT_SECS: u64 = 1;

/// Broker backed by Redis lists: LPUSH to publish, BRPOP to consume.
pub struct RedisBroker {
    client: redis::Client,
    prefix: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        // Fail fast if the broker is unreachable.
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }
}

struct RedisChannel {
    node: String,
    queue: String,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

#[async_trait]
impl NodeChannel for RedisChannel {
    async fn publish(&self, payload: &str) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed(self.node.clone()));
        }
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Owns a dedicated connection: BRPOP would stall every other command
/// multiplexed on a shared one.
struct RedisConsumer {
    queue: String,
    conn: MultiplexedConnection,
}

#[async_trait]
impl QueueConsumer for RedisConsumer {
    async fn next(&mut self) -> Result<Option<String>, BrokerError> {
        loop {
            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(&self.queue)
                .arg(BRPOP_TIMEOUT_SECS)
                .query_async(&mut self.conn)
                .await?;
            if let Some((_, payload)) = popped {
                return Ok(Some(payload));
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn open_channel(&self, node: &str) -> Result<Arc<dyn NodeChannel>, BrokerError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Arc::new(RedisChannel {
            node: node.to_string(),
            queue: queue_name(&self.prefix, node),
            conn,
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(&self, node: &str) -> Result<Box<dyn QueueConsumer>, BrokerError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisConsumer {
            queue: queue_name(&self.prefix, node),
            conn,
        }))
    }
}
