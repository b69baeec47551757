use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, NodeChannel, QueueConsumer, queue_name};

struct Queue {
    tx: mpsc::UnboundedSender<String>,
    /// Shared by every consumer of the queue: one message, one consumer.
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

/// In-process broker. Share one instance between nodes in the same process
/// to simulate a cluster.
pub struct MemoryBroker {
    prefix: String,
    queues: Mutex<HashMap<String, Queue>>,
}

impl MemoryBroker {
    pub fn new(prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            queues: Mutex::new(HashMap::new()),
        })
    }

    fn queue(
        &self,
        node: &str,
    ) -> (
        mpsc::UnboundedSender<String>,
        Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    ) {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(queue_name(&self.prefix, node))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Queue {
                    tx,
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                }
            });
        (queue.tx.clone(), Arc::clone(&queue.rx))
    }
}

struct MemoryChannel {
    node: String,
    tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

#[async_trait]
impl NodeChannel for MemoryChannel {
    async fn publish(&self, payload: &str) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed(self.node.clone()));
        }
        self.tx
            .send(payload.to_string())
            .map_err(|_| BrokerError::Closed(self.node.clone()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct MemoryConsumer {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<String>, BrokerError> {
        Ok(self.rx.lock().await.recv().await)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self, node: &str) -> Result<Arc<dyn NodeChannel>, BrokerError> {
        let (tx, _) = self.queue(node);
        Ok(Arc::new(MemoryChannel {
            node: node.to_string(),
            tx,
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(&self, node: &str) -> Result<Box<dyn QueueConsumer>, BrokerError> {
        let (_, rx) = self.queue(node);
        Ok(Box::new(MemoryConsumer { rx }))
    }
}
