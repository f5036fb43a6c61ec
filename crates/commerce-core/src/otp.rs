//! Out-of-band OTP relay (§4.3, §4.8 phase 4).
//!
//! Mirrors `confirmation.rs`'s one-shot-keyed-by-session shape: the
//! connector requests a code through its `OtpChannel` half, the Purchase
//! Executor relays that request to the client as an `otp_required` event,
//! and whatever code the client posts back is delivered here.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
pub struct OtpRegistry {
    pending: Arc<DashMap<String, oneshot::Sender<String>>>,
}

impl OtpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(session_id.to_string(), tx);
        rx
    }

    pub fn deliver(&self, session_id: &str, code: String) -> bool {
        match self.pending.remove(session_id) {
            Some((_, tx)) => tx.send(code).is_ok(),
            None => false,
        }
    }

    pub fn clear(&self, session_id: &str) {
        self.pending.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_resolves_pending_receiver() {
        let registry = OtpRegistry::new();
        let rx = registry.register("s1");
        assert!(registry.deliver("s1", "123456".to_string()));
        assert_eq!(rx.await.unwrap(), "123456");
    }

    #[tokio::test]
    async fn deliver_without_pending_request_is_false() {
        let registry = OtpRegistry::new();
        assert!(!registry.deliver("s1", "000000".to_string()));
    }
}
