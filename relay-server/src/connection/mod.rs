//! Per-client connection lifecycle.
//!
//! Each accepted connection runs three cooperating units over one shared
//! [`ExitGate`]:
//! - **writer** drains the outbound queue onto the socket,
//! - **reader** feeds inbound frames through the [`routing`] state machine,
//! - **owner** (the task running [`serve`]) waits for the gate to fire and
//!   then tears the connection down exactly once.
//!
//! Whichever of reader or writer sees a failure first fires the gate; later
//! triggers are no-ops. Teardown order: socket and outbound queue close
//! (reader and writer finish), registry entry removed, presence withdrawn,
//! identity returned to the pool.

pub mod gate;
pub mod routing;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::UserId;
use crate::envelope::Greeting;
use crate::identity::Lease;
use crate::registry::ConnectionHandle;
use crate::server::SharedState;

pub use gate::ExitGate;
use routing::Router;

/// Serve one connection until it exits, then tear it down.
///
/// `writer` and `reader` carry text frames. Any transport (a WebSocket, a
/// test channel) adapts to this shape.
pub async fn serve<W, R, E>(
    state: Arc<SharedState>,
    lease: Lease,
    mut writer: W,
    reader: R,
    client_ip: String,
) where
    W: Sink<String> + Unpin + Send + 'static,
    W::Error: Display,
    R: Stream<Item = Result<String, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let id = lease.id();

    let greeting = match (Greeting { id }).to_json() {
        Ok(greeting) => greeting,
        Err(e) => {
            tracing::error!(user_id = id, "Failed to encode greeting: {e}");
            lease.release().await;
            return;
        }
    };

    let gate = ExitGate::new();
    let (tx, rx) = mpsc::channel::<String>(state.config.outbound_queue_capacity);
    let handle = ConnectionHandle::new(id, tx, gate.clone());

    // Reachable before the client learns its identity.
    if state.registry.insert(handle.clone()).is_some() {
        tracing::error!(user_id = id, "Identity was already registered locally");
    }
    if let Err(e) = state.directory.advertise(id, &state.node_id).await {
        tracing::error!(user_id = id, "Failed to advertise presence: {e}");
    }
    // Registered after the shutdown broadcast went out: leave immediately.
    if state.is_draining() {
        gate.trigger();
    }

    let write_timeout = state.config.write_timeout();
    let greeted = tokio::select! {
        biased;
        _ = gate.fired() => Err("exit before greeting was written".to_string()),
        sent = tokio::time::timeout(write_timeout, writer.send(greeting)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("greeting write timed out".to_string()),
        },
    };

    let tasks = match greeted {
        Ok(()) => {
            tracing::info!(user_id = id, %client_ip, "User online");
            let writer_task = tokio::spawn(write_loop(
                writer,
                rx,
                gate.clone(),
                write_timeout,
                id,
            ));
            let router = Router::new(Arc::clone(&state), handle);
            let reader_task = tokio::spawn(read_loop(reader, router, gate.clone()));
            Some((reader_task, writer_task))
        }
        Err(reason) => {
            tracing::warn!(user_id = id, %client_ip, "Failed to send greeting: {reason}");
            gate.trigger();
            drop(writer);
            drop(reader);
            None
        }
    };

    gate.fired().await;

    if let Some((reader_task, writer_task)) = tasks {
        if let Err(e) = reader_task.await {
            tracing::error!(user_id = id, "Reader task failed: {e}");
        }
        if let Err(e) = writer_task.await {
            tracing::error!(user_id = id, "Writer task failed: {e}");
        }
    }
    state.registry.remove(id, &gate);
    if let Err(e) = state.directory.withdraw(id).await {
        tracing::error!(user_id = id, "Failed to withdraw presence: {e}");
    }
    lease.release().await;
    tracing::info!(user_id = id, %client_ip, "User offline");
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    gate: ExitGate,
    write_timeout: Duration,
    id: UserId,
) where
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = gate.fired() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            tracing::debug!(user_id = id, "Outbound queue closed");
            gate.trigger();
            break;
        };
        match tokio::time::timeout(write_timeout, writer.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(user_id = id, "Write failed: {e}");
                gate.trigger();
                break;
            }
            Err(_) => {
                tracing::warn!(user_id = id, "Write timed out");
                gate.trigger();
                break;
            }
        }
    }
    outbound.close();
    let _ = tokio::time::timeout(write_timeout, writer.close()).await;
}

async fn read_loop<R, E>(mut reader: R, router: Router, gate: ExitGate)
where
    R: Stream<Item = Result<String, E>> + Unpin,
    E: Display + Send,
{
    let id = router.user_id();
    loop {
        let frame = tokio::select! {
            biased;
            _ = gate.fired() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(text)) => {
                router.route(&text).await;
            }
            Some(Err(e)) => {
                tracing::warn!(user_id = id, "Read failed: {e}");
                gate.trigger();
                break;
            }
            None => {
                tracing::debug!(user_id = id, "Connection closed by client");
                gate.trigger();
                break;
            }
        }
    }
}
