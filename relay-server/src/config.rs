//! Node configuration (command-line flags with environment fallbacks).

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "relay-server", about = "WebSocket chat relay node")]
pub struct RelayConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis URL for the shared presence store. Without it the node runs
    /// against in-memory collaborators (single-process cluster).
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Redis URL for the broker queues (defaults to --redis-url).
    #[arg(long, env = "RELAY_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Namespace for every shared key and queue name.
    #[arg(long, env = "RELAY_KEY_PREFIX", default_value = "relay")]
    pub key_prefix: String,

    /// Fixed node identifier (a fresh UUIDv7 is generated when unset).
    #[arg(long, env = "RELAY_NODE_ID")]
    pub node_id: Option<String>,

    /// Number of identities seeded into the shared pool at cluster bootstrap.
    #[arg(long, env = "RELAY_IDENTITY_POOL_SIZE", default_value = "100")]
    pub identity_pool_size: u32,

    /// Worker tasks draining this node's broker queue.
    #[arg(long, env = "RELAY_CONSUMER_WORKERS", default_value = "10")]
    pub consumer_workers: usize,

    /// Seconds between broker channel reconciliation passes.
    #[arg(long, env = "RELAY_RECONCILE_INTERVAL_SECS", default_value = "60")]
    pub reconcile_interval_secs: u64,

    /// Upper bound on graceful shutdown, in seconds.
    #[arg(long, env = "RELAY_SHUTDOWN_TIMEOUT_SECS", default_value = "15")]
    pub shutdown_timeout_secs: u64,

    /// Frames buffered per connection before it counts as a slow consumer.
    #[arg(long, env = "RELAY_OUTBOUND_QUEUE_CAPACITY", default_value = "256")]
    pub outbound_queue_capacity: usize,

    /// Per-frame socket write timeout, in seconds.
    #[arg(long, env = "RELAY_WRITE_TIMEOUT_SECS", default_value = "30")]
    pub write_timeout_secs: u64,

    /// Echo a routed `once` message back onto the sender's own connection.
    #[arg(
        long,
        env = "RELAY_ECHO_ONCE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub echo_once: bool,

    /// Path of the WebSocket upgrade endpoint.
    #[arg(long, env = "RELAY_WS_PATH", default_value = "/chat_home")]
    pub ws_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("ws path must start with '/': {0}")]
    WsPath(String),
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            redis_url: None,
            broker_url: None,
            key_prefix: "relay".to_string(),
            node_id: None,
            identity_pool_size: 100,
            consumer_workers: 10,
            reconcile_interval_secs: 60,
            shutdown_timeout_secs: 15,
            outbound_queue_capacity: 256,
            write_timeout_secs: 30,
            echo_once: true,
            ws_path: "/chat_home".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_pool_size == 0 {
            return Err(ConfigError::Zero("identity pool size"));
        }
        if self.consumer_workers == 0 {
            return Err(ConfigError::Zero("consumer workers"));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Zero("reconcile interval"));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Zero("outbound queue capacity"));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::Zero("write timeout"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::WsPath(self.ws_path.clone()));
        }
        Ok(())
    }

    /// Broker URL, falling back to the presence store URL.
    pub fn broker_url(&self) -> Option<&str> {
        self.broker_url.as_deref().or(self.redis_url.as_deref())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}
