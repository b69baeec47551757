//! Inbound consumer pool: workers draining this node's broker queue into
//! the local connection registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::envelope::{Envelope, Kind};
use crate::registry::ConnectionRegistry;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Hand one broker delivery to local connections. Returns how many
/// connections accepted it.
///
/// `group` goes to every registered connection, `once` to the connection
/// holding `Target`. A `once` target that already disconnected is dropped,
/// not re-queued.
pub fn dispatch(registry: &ConnectionRegistry, payload: String) -> usize {
    let envelope: Envelope = match serde_json::from_str(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Dropping undecodable broker delivery: {e}");
            return 0;
        }
    };
    match envelope.kind() {
        Some(Kind::Group) => {
            let mut delivered = 0;
            registry.for_each(|handle| {
                if handle.deliver(payload.clone()) {
                    delivered += 1;
                }
            });
            delivered
        }
        Some(Kind::Once) => match registry.lookup(envelope.target) {
            Some(handle) => usize::from(handle.deliver(payload)),
            None => {
                tracing::debug!(target_id = envelope.target, "Once target no longer local, dropping");
                0
            }
        },
        None => {
            tracing::warn!(kind = %envelope.kind, "Dropping broker delivery with unknown type");
            0
        }
    }
}

/// Start `workers` tasks consuming `node`'s queue until `shutdown` fires.
pub fn spawn_pool(
    broker: Arc<dyn Broker>,
    node: String,
    registry: Arc<ConnectionRegistry>,
    workers: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let broker = Arc::clone(&broker);
            let node = node.clone();
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_worker(worker, broker, node, registry, shutdown).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker: usize,
    broker: Arc<dyn Broker>,
    node: String,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        let consumer = tokio::select! {
            _ = shutdown.cancelled() => return,
            consumer = broker.consume(&node) => consumer,
        };
        match consumer {
            Ok(mut consumer) => {
                backoff = MIN_BACKOFF;
                tracing::debug!(worker, queue = %node, "Consumer attached");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        next = consumer.next() => match next {
                            Ok(Some(payload)) => {
                                dispatch(&registry, payload);
                            }
                            Ok(None) => {
                                tracing::warn!(worker, queue = %node, "Queue closed, consumer exiting");
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(worker, queue = %node, "Consume failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    worker,
                    queue = %node,
                    backoff_secs = backoff.as_secs(),
                    "Failed to attach consumer: {e}"
                );
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::connection::ExitGate;
    use crate::registry::ConnectionHandle;

    fn register(registry: &ConnectionRegistry, id: i64) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        registry.insert(ConnectionHandle::new(id, tx, ExitGate::new()));
        rx
    }

    #[test]
    fn group_reaches_every_local_connection() {
        let registry = ConnectionRegistry::new();
        let mut a = register(&registry, 1);
        let mut b = register(&registry, 2);
        let payload = r#"{"Data":"hi","Target":0,"Type":"group","FormId":1}"#.to_string();

        assert_eq!(dispatch(&registry, payload.clone()), 2);
        assert_eq!(a.try_recv().unwrap(), payload);
        assert_eq!(b.try_recv().unwrap(), payload);
    }

    #[test]
    fn once_reaches_only_its_target() {
        let registry = ConnectionRegistry::new();
        let mut a = register(&registry, 1);
        let mut b = register(&registry, 2);
        let payload = r#"{"Data":"psst","Target":2,"Type":"once","FormId":1}"#.to_string();

        assert_eq!(dispatch(&registry, payload.clone()), 1);
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap(), payload);
    }

    #[test]
    fn once_to_departed_target_is_dropped() {
        let registry = ConnectionRegistry::new();
        let mut a = register(&registry, 1);
        let payload = r#"{"Data":"late","Target":9,"Type":"once","FormId":1}"#.to_string();
        assert_eq!(dispatch(&registry, payload), 0);
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn garbage_and_unknown_types_are_dropped() {
        let registry = ConnectionRegistry::new();
        let mut a = register(&registry, 1);
        assert_eq!(dispatch(&registry, "{{{".into()), 0);
        assert_eq!(dispatch(&registry, r#"{"Data":"x","Type":"shout"}"#.into()), 0);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let broker = MemoryBroker::new("t");
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = register(&registry, 3);
        let shutdown = CancellationToken::new();
        let tasks = spawn_pool(broker.clone(), "me".into(), Arc::clone(&registry), 4, shutdown.clone());

        let channel = broker.open_channel("me").await.unwrap();
        let payload = r#"{"Data":"hey","Target":3,"Type":"once","FormId":1}"#;
        channel.publish(payload).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
