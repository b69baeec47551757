//! Inbound frame routing for one connection.

use std::sync::Arc;

use crate::UserId;
use crate::envelope::{
    ClientFrame, Envelope, ILLEGAL_TYPE, Kind, MALFORMED_FRAME, PUSH_FAILED,
};
use crate::registry::ConnectionHandle;
use crate::server::SharedState;

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not a client frame; the sender was told.
    Malformed,
    /// `Type` was neither `group` nor `once`; the sender was told.
    IllegalType,
    /// Fanned out to this many node queues.
    Group { published: usize },
    /// Published to the target's node, optionally echoed to the sender.
    Once { node: String, echoed: bool },
    /// Target has no presence record; the sender got the offline notice.
    Offline,
    /// Presence lookup or encoding failed; the sender was told.
    Failed,
}

pub struct Router {
    state: Arc<SharedState>,
    conn: ConnectionHandle,
}

impl Router {
    pub fn new(state: Arc<SharedState>, conn: ConnectionHandle) -> Self {
        Self { state, conn }
    }

    pub fn user_id(&self) -> UserId {
        self.conn.id
    }

    /// Route one text frame received from this connection's client.
    pub async fn route(&self, text: &str) -> RouteOutcome {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id = self.conn.id, "Unparseable frame: {e}");
                self.reply(MALFORMED_FRAME.to_string()).await;
                return RouteOutcome::Malformed;
            }
        };
        let envelope = Envelope::from_client(frame, self.conn.id);
        let Some(kind) = envelope.kind() else {
            tracing::warn!(user_id = self.conn.id, kind = %envelope.kind, "Illegal message type");
            self.reply(ILLEGAL_TYPE.to_string()).await;
            return RouteOutcome::IllegalType;
        };
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(user_id = self.conn.id, "Failed to encode envelope: {e}");
                self.reply(PUSH_FAILED.to_string()).await;
                return RouteOutcome::Failed;
            }
        };
        match kind {
            Kind::Group => self.route_group(&payload).await,
            Kind::Once => self.route_once(envelope.target, payload).await,
        }
    }

    async fn route_group(&self, payload: &str) -> RouteOutcome {
        let mut published = 0;
        for node in self.state.bridge.open_channels() {
            match self.state.bridge.publish(&node, payload).await {
                Ok(()) => published += 1,
                Err(e) => tracing::warn!(user_id = self.conn.id, %node, "Group publish failed: {e}"),
            }
        }
        tracing::debug!(user_id = self.conn.id, published, "Group message routed");
        RouteOutcome::Group { published }
    }

    async fn route_once(&self, target: UserId, payload: String) -> RouteOutcome {
        let node = match self.state.directory.owner_of(target).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                tracing::debug!(user_id = self.conn.id, target_id = target, "Once target offline");
                match Envelope::offline_notice(self.conn.id).to_json() {
                    Ok(notice) => {
                        self.reply(notice).await;
                    }
                    Err(e) => tracing::error!("Failed to encode offline notice: {e}"),
                }
                return RouteOutcome::Offline;
            }
            Err(e) => {
                tracing::error!(user_id = self.conn.id, target_id = target, "Presence lookup failed: {e}");
                self.reply(PUSH_FAILED.to_string()).await;
                return RouteOutcome::Failed;
            }
        };
        if let Err(e) = self.state.bridge.publish(&node, &payload).await {
            tracing::warn!(user_id = self.conn.id, %node, "Once publish failed: {e}");
        }
        let echoed = self.state.config.echo_once && self.reply(payload).await;
        RouteOutcome::Once { node, echoed }
    }

    /// Queue a frame back to this connection's own client.
    async fn reply(&self, frame: String) -> bool {
        self.conn.enqueue(frame).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::RelayConfig;
    use crate::connection::ExitGate;
    use crate::server::{test_state, test_state_with};

    async fn router(state: &Arc<SharedState>, id: UserId) -> (Router, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = ConnectionHandle::new(id, tx, ExitGate::new());
        state.registry.insert(handle.clone());
        state.directory.advertise(id, &state.node_id).await.unwrap();
        (Router::new(Arc::clone(state), handle), rx)
    }

    #[tokio::test]
    async fn malformed_frame_gets_raw_reply() {
        let state = test_state(4).await;
        let (router, mut rx) = router(&state, 1).await;
        assert_eq!(router.route("not json").await, RouteOutcome::Malformed);
        assert_eq!(rx.recv().await.unwrap(), MALFORMED_FRAME);
    }

    #[tokio::test]
    async fn unknown_type_gets_raw_reply() {
        let state = test_state(4).await;
        let (router, mut rx) = router(&state, 1).await;
        let outcome = router.route(r#"{"Data":"x","Target":0,"Type":"shout"}"#).await;
        assert_eq!(outcome, RouteOutcome::IllegalType);
        assert_eq!(rx.recv().await.unwrap(), ILLEGAL_TYPE);
    }

    #[tokio::test]
    async fn missing_type_is_illegal() {
        let state = test_state(4).await;
        let (router, mut rx) = router(&state, 1).await;
        assert_eq!(router.route(r#"{"Data":"x"}"#).await, RouteOutcome::IllegalType);
        assert_eq!(rx.recv().await.unwrap(), ILLEGAL_TYPE);
    }

    #[tokio::test]
    async fn group_publishes_to_every_open_channel() {
        let state = test_state(4).await;
        state.directory.register_node("other").await.unwrap();
        state.bridge.reconcile().await.unwrap();
        let mut other = state.broker.consume("other").await.unwrap();
        let (router, _rx) = router(&state, 1).await;

        let outcome = router.route(r#"{"Data":"hi","Target":0,"Type":"group"}"#).await;
        assert_eq!(outcome, RouteOutcome::Group { published: 2 });

        let delivered = other.next().await.unwrap().unwrap();
        let envelope: Envelope = serde_json::from_str(&delivered).unwrap();
        assert_eq!(envelope.form_id, 1);
        assert_eq!(envelope.data, "hi");
    }

    #[tokio::test]
    async fn client_supplied_sender_is_overwritten() {
        let state = test_state(4).await;
        let mut own = state.broker.consume(&state.node_id).await.unwrap();
        let (router, _rx) = router(&state, 3).await;

        router
            .route(r#"{"Data":"x","Target":0,"Type":"group","FormId":999}"#)
            .await;
        let envelope: Envelope =
            serde_json::from_str(&own.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(envelope.form_id, 3);
    }

    #[tokio::test]
    async fn once_to_offline_target_returns_notice() {
        let state = test_state(4).await;
        let (router, mut rx) = router(&state, 1).await;

        let outcome = router.route(r#"{"Data":"x","Target":42,"Type":"once"}"#).await;
        assert_eq!(outcome, RouteOutcome::Offline);

        let notice: Envelope = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(notice, Envelope::offline_notice(1));
    }

    #[tokio::test]
    async fn once_publishes_to_owner_and_echoes() {
        let state = test_state(4).await;
        state.directory.register_node("far").await.unwrap();
        state.directory.advertise(8, "far").await.unwrap();
        let mut far = state.broker.consume("far").await.unwrap();
        let (router, mut rx) = router(&state, 1).await;

        let outcome = router.route(r#"{"Data":"psst","Target":8,"Type":"once"}"#).await;
        assert_eq!(
            outcome,
            RouteOutcome::Once { node: "far".into(), echoed: true }
        );

        let published = far.next().await.unwrap().unwrap();
        let echo = rx.recv().await.unwrap();
        assert_eq!(published, echo);
        let envelope: Envelope = serde_json::from_str(&echo).unwrap();
        assert_eq!(envelope.target, 8);
        assert_eq!(envelope.form_id, 1);
    }

    #[tokio::test]
    async fn once_without_echo_only_publishes() {
        let state = test_state_with(RelayConfig {
            identity_pool_size: 4,
            echo_once: false,
            ..RelayConfig::default()
        })
        .await;
        state.directory.register_node("far").await.unwrap();
        state.directory.advertise(8, "far").await.unwrap();
        let mut far = state.broker.consume("far").await.unwrap();
        let (router, mut rx) = router(&state, 1).await;

        let outcome = router.route(r#"{"Data":"psst","Target":8,"Type":"once"}"#).await;
        assert_eq!(
            outcome,
            RouteOutcome::Once { node: "far".into(), echoed: false }
        );

        let published: Envelope =
            serde_json::from_str(&far.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(published.target, 8);
        assert_eq!(published.form_id, 1);
        assert!(rx.try_recv().is_err());
    }
}
