//! Broker bridge: one publish channel per live node, this node included.
//!
//! Channel membership follows the live-node directory. A reconciliation
//! pass opens channels for newly live nodes and closes channels for nodes
//! that left. Passes run on a fixed interval and on demand whenever a
//! publish targets a node without a channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerError, NodeChannel};
use crate::presence::PresenceDirectory;

/// Nodes whose channels changed during one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

pub struct BrokerBridge {
    broker: Arc<dyn Broker>,
    directory: PresenceDirectory,
    channels: RwLock<HashMap<String, Arc<dyn NodeChannel>>>,
    /// Serializes reconciliation passes so two passes never open the same
    /// channel twice.
    reconcile_lock: tokio::sync::Mutex<()>,
    /// Set by `close_all`; no channel is opened afterwards.
    closed: AtomicBool,
}

impl BrokerBridge {
    pub fn new(broker: Arc<dyn Broker>, directory: PresenceDirectory) -> Self {
        Self {
            broker,
            directory,
            channels: RwLock::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ShutDown);
        }
        Ok(())
    }

    fn channel(&self, node: &str) -> Option<Arc<dyn NodeChannel>> {
        self.channels.read().get(node).cloned()
    }

    /// Nodes with an open channel, sorted.
    pub fn open_channels(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.channels.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Open a channel to `node` unless one exists already.
    pub async fn ensure_channel(&self, node: &str) -> Result<Arc<dyn NodeChannel>, BrokerError> {
        if let Some(channel) = self.channel(node) {
            return Ok(channel);
        }
        let _pass = self.reconcile_lock.lock().await;
        self.open_locked(node).await
    }

    async fn open_locked(&self, node: &str) -> Result<Arc<dyn NodeChannel>, BrokerError> {
        self.check_open()?;
        if let Some(channel) = self.channel(node) {
            return Ok(channel);
        }
        let channel = self.broker.open_channel(node).await?;
        self.channels
            .write()
            .insert(node.to_string(), Arc::clone(&channel));
        tracing::info!(%node, "Broker channel opened");
        Ok(channel)
    }

    /// Publish to `node`'s queue. A missing channel triggers one immediate
    /// reconciliation pass before giving up.
    pub async fn publish(&self, node: &str, payload: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let channel = match self.channel(node) {
            Some(channel) => channel,
            None => {
                tracing::debug!(%node, "No broker channel, reconciling before publish");
                self.reconcile().await?;
                self.channel(node)
                    .ok_or_else(|| BrokerError::NoChannel(node.to_string()))?
            }
        };
        channel.publish(payload).await
    }

    /// Bring the channel set in line with the live-node directory.
    pub async fn reconcile(&self) -> Result<ReconcileReport, BrokerError> {
        let _pass = self.reconcile_lock.lock().await;
        self.check_open()?;
        let live = self.directory.live_nodes().await?;
        let mut report = ReconcileReport::default();

        let mut missing: Vec<&String> = live
            .iter()
            .filter(|node| !self.channels.read().contains_key(node.as_str()))
            .collect();
        missing.sort();
        for node in missing {
            match self.open_locked(node).await {
                Ok(_) => report.opened.push(node.clone()),
                Err(e) => tracing::warn!(%node, "Failed to open broker channel: {e}"),
            }
        }

        let stale: Vec<(String, Arc<dyn NodeChannel>)> = {
            let mut channels = self.channels.write();
            let gone: Vec<String> = channels
                .keys()
                .filter(|node| !live.contains(node.as_str()))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|node| channels.remove(&node).map(|c| (node, c)))
                .collect()
        };
        for (node, channel) in stale {
            channel.close().await;
            tracing::info!(%node, "Broker channel closed (node left)");
            report.closed.push(node);
        }
        report.closed.sort();

        tracing::debug!(
            opened = report.opened.len(),
            closed = report.closed.len(),
            open = self.channels.read().len(),
            "Broker channels reconciled"
        );
        Ok(report)
    }

    /// Close and forget every channel (shutdown). Later publishes and
    /// reconciliation passes fail with [`BrokerError::ShutDown`].
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let _pass = self.reconcile_lock.lock().await;
        let drained: Vec<(String, Arc<dyn NodeChannel>)> =
            self.channels.write().drain().collect();
        for (node, channel) in drained {
            channel.close().await;
            tracing::debug!(%node, "Broker channel closed (shutdown)");
        }
    }
}

/// Spawn the periodic reconciler. It stops when `shutdown` is cancelled.
pub fn spawn_reconciler(
    bridge: Arc<BrokerBridge>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = bridge.reconcile().await {
                        tracing::error!("Broker channel reconciliation failed: {e}");
                    }
                }
            }
        }
        tracing::debug!("Reconciler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;

    fn bridge() -> (PresenceDirectory, Arc<MemoryBroker>, BrokerBridge) {
        let directory = PresenceDirectory::new(MemoryStore::new());
        let broker = MemoryBroker::new("t");
        let bridge = BrokerBridge::new(broker.clone(), directory.clone());
        (directory, broker, bridge)
    }

    #[tokio::test]
    async fn reconcile_converges_to_live_nodes() {
        let (directory, _, bridge) = bridge();
        directory.register_node("a").await.unwrap();
        directory.register_node("b").await.unwrap();

        let report = bridge.reconcile().await.unwrap();
        assert_eq!(report.opened, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(bridge.open_channels(), vec!["a", "b"]);

        directory.deregister_node("a").await.unwrap();
        directory.register_node("c").await.unwrap();
        let report = bridge.reconcile().await.unwrap();
        assert_eq!(report.opened, vec!["c".to_string()]);
        assert_eq!(report.closed, vec!["a".to_string()]);
        assert_eq!(bridge.open_channels(), vec!["b", "c"]);

        // A pass with nothing to do changes nothing.
        assert_eq!(bridge.reconcile().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn publish_to_unknown_channel_repairs_first() {
        let (directory, broker, bridge) = bridge();
        directory.register_node("late").await.unwrap();
        let mut consumer = broker.consume("late").await.unwrap();

        bridge.publish("late", "payload").await.unwrap();
        assert_eq!(bridge.open_channels(), vec!["late"]);
        assert_eq!(consumer.next().await.unwrap().as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn publish_to_dead_node_fails() {
        let (_, _, bridge) = bridge();
        assert!(matches!(
            bridge.publish("ghost", "x").await,
            Err(BrokerError::NoChannel(node)) if node == "ghost"
        ));
    }

    #[tokio::test]
    async fn ensure_channel_is_idempotent() {
        let (_, _, bridge) = bridge();
        let first = bridge.ensure_channel("n").await.unwrap();
        let second = bridge.ensure_channel("n").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bridge.open_channels(), vec!["n"]);
    }

    #[tokio::test]
    async fn close_all_empties_channel_set() {
        let (directory, _, bridge) = bridge();
        directory.register_node("a").await.unwrap();
        bridge.reconcile().await.unwrap();
        let channel = bridge.ensure_channel("a").await.unwrap();

        bridge.close_all().await;
        assert!(bridge.open_channels().is_empty());
        assert!(channel.publish("x").await.is_err());
    }

    #[tokio::test]
    async fn closed_bridge_never_reopens_channels() {
        let (directory, broker, bridge) = bridge();
        directory.register_node("a").await.unwrap();
        bridge.reconcile().await.unwrap();
        let mut consumer = broker.consume("a").await.unwrap();

        bridge.close_all().await;
        assert!(matches!(
            bridge.publish("a", "late").await,
            Err(BrokerError::ShutDown)
        ));
        assert!(matches!(bridge.reconcile().await, Err(BrokerError::ShutDown)));
        assert!(matches!(
            bridge.ensure_channel("a").await,
            Err(BrokerError::ShutDown)
        ));
        assert!(bridge.open_channels().is_empty());

        let nothing = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler_tracks_directory_changes() {
        let (directory, _, bridge) = bridge();
        let bridge = Arc::new(bridge);
        let shutdown = CancellationToken::new();
        let task = spawn_reconciler(Arc::clone(&bridge), Duration::from_secs(60), shutdown.clone());

        directory.register_node("x").await.unwrap();
        assert!(bridge.open_channels().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(bridge.open_channels(), vec!["x"]);

        shutdown.cancel();
        task.await.unwrap();
    }
}
