//! One-shot exit signal shared by a connection's reader, writer and owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Fires at most once no matter how many tasks observe a failure. Waiters
/// on [`ExitGate::fired`] all wake when it does.
#[derive(Clone, Default)]
pub struct ExitGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    fired: AtomicBool,
    token: CancellationToken,
}

impl ExitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the gate. Returns `true` only for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        let first = self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.token.cancel();
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Wait until the gate fires.
    pub async fn fired(&self) {
        self.inner.token.cancelled().await
    }

    pub fn same_gate(&self, other: &ExitGate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn fires_exactly_once_under_contention() {
        let gate = ExitGate::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let winners = Arc::clone(&winners);
            tasks.push(tokio::spawn(async move {
                if gate.trigger() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(gate.is_fired());
    }

    #[tokio::test]
    async fn waiters_wake_on_fire() {
        let gate = ExitGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.fired().await })
        };
        assert!(gate.trigger());
        waiter.await.unwrap();
        // Waiting after the fact returns immediately.
        gate.fired().await;
    }

    #[test]
    fn clones_share_one_gate() {
        let a = ExitGate::new();
        let b = a.clone();
        assert!(a.same_gate(&b));
        assert!(!a.same_gate(&ExitGate::new()));
        assert!(b.trigger());
        assert!(!a.trigger());
    }
}
