//! Node assembly: shared state, startup and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::{self, BrokerBridge};
use crate::broker::{Broker, MemoryBroker, RedisBroker};
use crate::config::RelayConfig;
use crate::consumer;
use crate::identity::IdentityAllocator;
use crate::presence::PresenceDirectory;
use crate::registry::ConnectionRegistry;
use crate::store::{MemoryStore, PresenceStore, RedisStore};
use crate::web;

/// The two shared collaborators every node talks to.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn PresenceStore>,
    pub broker: Arc<dyn Broker>,
}

impl Backends {
    /// In-process collaborators. Nodes built from clones of one value form a
    /// cluster inside a single process.
    pub fn in_memory(prefix: &str) -> Self {
        Self {
            store: MemoryStore::new(),
            broker: MemoryBroker::new(prefix),
        }
    }

    /// Redis-backed collaborators when URLs are configured, in-memory ones
    /// otherwise.
    pub async fn connect(config: &RelayConfig) -> Result<Self> {
        let store: Arc<dyn PresenceStore> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisStore::connect(url, &config.key_prefix)
                    .await
                    .context("presence store unreachable")?,
            ),
            None => {
                tracing::warn!("No presence store URL configured, using in-memory store");
                MemoryStore::new()
            }
        };
        let broker: Arc<dyn Broker> = match config.broker_url() {
            Some(url) => Arc::new(
                RedisBroker::connect(url, &config.key_prefix)
                    .await
                    .context("broker unreachable")?,
            ),
            None => {
                tracing::warn!("No broker URL configured, using in-memory broker");
                MemoryBroker::new(&config.key_prefix)
            }
        };
        Ok(Self { store, broker })
    }
}

/// Everything a node's connections and background tasks share.
pub struct SharedState {
    pub node_id: String,
    pub config: RelayConfig,
    pub identities: IdentityAllocator,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: PresenceDirectory,
    pub bridge: Arc<BrokerBridge>,
    pub broker: Arc<dyn Broker>,
    /// Connection tasks, awaited during shutdown.
    pub connections: TaskTracker,
    /// Stops the reconciler and consumer pool.
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    draining: AtomicBool,
    started_at: Instant,
}

impl SharedState {
    pub fn new(config: RelayConfig, backends: Backends) -> Arc<Self> {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let directory = PresenceDirectory::new(Arc::clone(&backends.store));
        let bridge = Arc::new(BrokerBridge::new(
            Arc::clone(&backends.broker),
            directory.clone(),
        ));
        Arc::new(Self {
            node_id,
            identities: IdentityAllocator::new(backends.store),
            registry: Arc::new(ConnectionRegistry::new()),
            directory,
            bridge,
            broker: backends.broker,
            connections: TaskTracker::new(),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
            started_at: Instant::now(),
            config,
        })
    }

    /// Seed the identity pool, join the cluster and start the background
    /// tasks. Nothing is accepted before this returns.
    pub async fn boot(&self) -> Result<()> {
        self.identities
            .bootstrap(self.config.identity_pool_size)
            .await
            .context("identity pool bootstrap failed")?;
        self.directory
            .register_node(&self.node_id)
            .await
            .context("node registration failed")?;
        let report = self
            .bridge
            .reconcile()
            .await
            .context("initial broker channel setup failed")?;
        tracing::info!(
            node_id = %self.node_id,
            channels = report.opened.len(),
            "Broker channels ready"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(bridge::spawn_reconciler(
            Arc::clone(&self.bridge),
            self.config.reconcile_interval(),
            self.background.clone(),
        ));
        tasks.extend(consumer::spawn_pool(
            Arc::clone(&self.broker),
            self.node_id.clone(),
            Arc::clone(&self.registry),
            self.config.consumer_workers,
            self.background.clone(),
        ));
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Drain the node and leave the cluster. Safe to call more than once;
    /// only the first call does anything.
    ///
    /// Every local connection is told to exit, then teardowns get until the
    /// shutdown window closes to finish. After that the consumers and the
    /// reconciler stop, channels close and the node record is removed.
    pub async fn shutdown(&self) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + self.config.shutdown_timeout();

        let mut signalled = 0usize;
        self.registry.for_each(|handle| {
            if handle.exit() {
                signalled += 1;
            }
        });
        tracing::info!(node_id = %self.node_id, connections = signalled, "Shutting down, exit sent to local connections");

        self.connections.close();
        if tokio::time::timeout_at(deadline, self.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.registry.len(),
                "Shutdown window elapsed with connections still open"
            );
        }

        self.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let grace = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_secs(1));
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Background tasks did not stop in time");
        }

        self.bridge.close_all().await;
        if let Err(e) = self.directory.deregister_node(&self.node_id).await {
            tracing::error!(node_id = %self.node_id, "Failed to deregister node: {e}");
        }
        tracing::info!(node_id = %self.node_id, "Node shutdown complete");
    }
}

pub struct Server {
    config: RelayConfig,
    backends: Backends,
}

impl Server {
    pub fn new(config: RelayConfig, backends: Backends) -> Self {
        Self { config, backends }
    }

    /// Serve until SIGINT/SIGTERM, then drain and leave the cluster.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        let state = SharedState::new(self.config, self.backends);
        state.boot().await?;
        tracing::info!(
            node_id = %state.node_id,
            addr = %listener.local_addr()?,
            ws_path = %state.config.ws_path,
            "Relay node listening"
        );

        let app = web::router(Arc::clone(&state));
        let draining = Arc::clone(&state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown().await;
        })
        .await?;
        Ok(())
    }

    /// Start serving in the background (for testing). The node drains when
    /// [`RunningNode::shutdown`] is called.
    pub async fn start(self) -> Result<RunningNode> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let state = SharedState::new(self.config, self.backends);
        state.boot().await?;
        tracing::info!(node_id = %state.node_id, "Listening on {addr}");

        let stop = CancellationToken::new();
        let app = web::router(Arc::clone(&state));
        let draining = Arc::clone(&state);
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                stopped.cancelled().await;
                draining.shutdown().await;
            })
            .await
        });

        Ok(RunningNode {
            addr,
            state,
            stop,
            handle,
        })
    }
}

/// A node started with [`Server::start`].
pub struct RunningNode {
    pub addr: SocketAddr,
    pub state: Arc<SharedState>,
    stop: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

impl RunningNode {
    pub async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        self.handle.await??;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}

/// Node state over fresh in-memory backends, registered and with its own
/// channel open, but without background tasks.
#[cfg(test)]
pub(crate) async fn test_state(pool: u32) -> Arc<SharedState> {
    test_state_with(RelayConfig {
        identity_pool_size: pool,
        ..RelayConfig::default()
    })
    .await
}

#[cfg(test)]
pub(crate) async fn test_state_with(mut config: RelayConfig) -> Arc<SharedState> {
    config.node_id = Some("node-test".to_string());
    let pool = config.identity_pool_size;
    let state = SharedState::new(config, Backends::in_memory("test"));
    state.identities.bootstrap(pool).await.unwrap();
    state.directory.register_node(&state.node_id).await.unwrap();
    state.bridge.reconcile().await.unwrap();
    state
}
