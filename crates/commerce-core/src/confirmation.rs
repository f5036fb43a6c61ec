//! One-shot human-in-the-loop rendezvous for `await_confirmation` (§4.5,
//! §9). Not a callback: the stage blocks cooperatively on a typed
//! rendezvous with a deadline, keyed by session id so the Transport
//! Adapter's `/api/order/confirm` (which only knows the session, not the
//! run) can deliver into whichever run currently awaits it.

use dashmap::DashMap;
use tokio::sync::oneshot;

/// What a client supplies to resolve a pending confirmation.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationInput {
    pub accepted: bool,
    pub selected_index: Option<usize>,
}

struct Pending {
    run_id: String,
    tx: oneshot::Sender<ConfirmationInput>,
}

/// Registry of in-flight `await_confirmation` rendezvous, one per session.
/// Re-entering `await_confirmation` for the same session (e.g. the Purchase
/// Executor's high-risk re-confirmation) replaces whatever was pending.
#[derive(Clone, Default)]
pub struct ConfirmationRegistry {
    pending: std::sync::Arc<DashMap<String, Pending>>,
}

impl ConfirmationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new rendezvous for `run_id` on `session_id`, returning the
    /// receiving half. Any previously pending rendezvous on this session is
    /// dropped (its sender disconnects, so a stale client delivery fails
    /// harmlessly).
    pub fn register(&self, session_id: &str, run_id: &str) -> oneshot::Receiver<ConfirmationInput> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            session_id.to_string(),
            Pending {
                run_id: run_id.to_string(),
                tx,
            },
        );
        rx
    }

    /// Delivers client input into the session's pending rendezvous, if any.
    /// Returns `false` if there was nothing pending (already resolved,
    /// timed out, or never opened).
    pub fn deliver(&self, session_id: &str, input: ConfirmationInput) -> bool {
        match self.pending.remove(session_id) {
            Some((_, pending)) => pending.tx.send(input).is_ok(),
            None => false,
        }
    }

    /// The run id currently awaiting confirmation on this session, if any.
    pub fn pending_run_id(&self, session_id: &str) -> Option<String> {
        self.pending.get(session_id).map(|p| p.run_id.clone())
    }

    /// Clears a pending rendezvous without resolving it (used once a wait
    /// times out, so a late client delivery doesn't resurrect it).
    pub fn clear(&self, session_id: &str) {
        self.pending.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_resolves_pending_receiver() {
        let registry = ConfirmationRegistry::new();
        let rx = registry.register("s1", "r1");
        assert!(registry.deliver(
            "s1",
            ConfirmationInput {
                accepted: true,
                selected_index: Some(0),
            }
        ));
        let input = rx.await.unwrap();
        assert!(input.accepted);
    }

    #[tokio::test]
    async fn deliver_to_unknown_session_is_false() {
        let registry = ConfirmationRegistry::new();
        assert!(!registry.deliver(
            "missing",
            ConfirmationInput {
                accepted: true,
                selected_index: None,
            }
        ));
    }

    #[tokio::test]
    async fn re_register_replaces_prior_pending() {
        let registry = ConfirmationRegistry::new();
        let first = registry.register("s1", "r1");
        let _second = registry.register("s1", "r1-reconfirm");
        assert!(registry.deliver(
            "s1",
            ConfirmationInput {
                accepted: false,
                selected_index: None,
            }
        ));
        // The first receiver's sender was dropped on re-register.
        assert!(first.await.is_err());
    }
}
