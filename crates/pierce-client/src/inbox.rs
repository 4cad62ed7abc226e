//! Per-peer delivery of coordinator replies
//!
//! Signaling handlers run on the channel's read loop and must not block, so
//! they only push replies into the inbox of the attempt waiting on that peer.

use crate::error::ConnectError;
use pierce_signal::{
    ConnectPayload, ErrorCode, NodeId, RelayResponsePayload, Signal, SignalEnvelope,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

type Waiter = (u64, mpsc::UnboundedSender<SignalEnvelope>);

/// Routes replies to the attempt waiting on their peer
#[derive(Default)]
pub(crate) struct Inbox {
    waiters: Mutex<HashMap<NodeId, Waiter>>,
    next_id: AtomicU64,
}

impl Inbox {
    /// Start receiving replies about `peer`, replacing any earlier subscriber
    pub(crate) fn subscribe(self: &Arc<Self>, peer: &str) -> PeerInbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.to_string(), (id, tx));
        if previous.is_some() {
            tracing::debug!("Newer attempt to {} takes over its replies", peer);
        }
        PeerInbox {
            inbox: Arc::clone(self),
            peer: peer.to_string(),
            id,
            rx,
        }
    }

    /// Hand `envelope` to the attempt it concerns; `false` if none is waiting
    pub(crate) fn deliver(&self, envelope: &SignalEnvelope) -> bool {
        let Some(peer) = peer_of(envelope) else {
            return false;
        };
        let waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        match waiters.get(peer) {
            Some((_, tx)) => tx.send(envelope.clone()).is_ok(),
            None => false,
        }
    }

    fn unsubscribe(&self, peer: &str, id: u64) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if waiters.get(peer).is_some_and(|(current, _)| *current == id) {
            waiters.remove(peer);
        }
    }
}

/// Remote peer a coordinator reply is about
fn peer_of(envelope: &SignalEnvelope) -> Option<&str> {
    match &envelope.body {
        Signal::Answer(payload) => payload.source_id.as_deref().or(Some(envelope.sender_id.as_str())),
        Signal::RelayResponse(payload) => payload.target_id.as_deref().or(payload.source_id.as_deref()),
        Signal::Error(payload) => payload.peer_id.as_deref(),
        _ => None,
    }
}

/// Replies about one peer, for the lifetime of one attempt
pub(crate) struct PeerInbox {
    inbox: Arc<Inbox>,
    peer: NodeId,
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl PeerInbox {
    /// Wait for the coordinator's answer to a `connect`
    pub(crate) async fn answer(&mut self, timeout: Duration) -> Result<ConnectPayload, ConnectError> {
        self.wait(timeout, |body| match body {
            Signal::Answer(payload) => Some(payload),
            _ => None,
        })
        .await
    }

    /// Wait for a relay allocation
    pub(crate) async fn relay(&mut self, timeout: Duration) -> Result<RelayResponsePayload, ConnectError> {
        self.wait(timeout, |body| match body {
            Signal::RelayResponse(payload) => Some(payload),
            _ => None,
        })
        .await
    }

    async fn wait<T>(
        &mut self,
        timeout: Duration,
        pick: impl Fn(Signal) -> Option<T>,
    ) -> Result<T, ConnectError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Err(ConnectError::ShuttingDown),
                Err(_) => return Err(ConnectError::Timeout(timeout)),
            };
            if let Signal::Error(error) = &envelope.body {
                match error.code {
                    ErrorCode::PeerOffline => return Err(ConnectError::PeerOffline(self.peer.clone())),
                    ErrorCode::RelayUnavailable => {
                        return Err(ConnectError::RelayUnavailable(error.message.clone()));
                    }
                    _ => {
                        tracing::debug!("Coordinator error about {}: {}", self.peer, error.message);
                        continue;
                    }
                }
            }
            let kind = envelope.kind();
            match pick(envelope.body) {
                Some(value) => return Ok(value),
                None => tracing::trace!("Ignoring {} about {} while waiting", kind, self.peer),
            }
        }
    }
}

impl Drop for PeerInbox {
    fn drop(&mut self) {
        self.inbox.unsubscribe(&self.peer, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pierce_nat::NatClass;

    fn answer_from(peer: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            peer,
            Signal::Answer(ConnectPayload {
                nat_type: NatClass::FullCone,
                external_ip: "203.0.113.4".parse().unwrap(),
                external_port: 5000,
                local_addr: None,
                connection_type: None,
                source_id: Some(peer.to_string()),
            }),
        )
        .to("node-a")
    }

    #[tokio::test]
    async fn test_routes_by_peer() {
        let inbox = Arc::new(Inbox::default());
        let mut b = inbox.subscribe("node-b");
        let _c = inbox.subscribe("node-c");

        assert!(inbox.deliver(&answer_from("node-b")));
        assert!(!inbox.deliver(&answer_from("node-z")));
        let payload = b.answer(Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload.external_port, 5000);
    }

    #[tokio::test]
    async fn test_peer_offline_error() {
        let inbox = Arc::new(Inbox::default());
        let mut b = inbox.subscribe("node-b");
        let offline = SignalEnvelope::new(
            "coordinator",
            Signal::error(ErrorCode::PeerOffline, "peer node-b is offline", Some("node-b".into())),
        );
        assert!(inbox.deliver(&offline));
        assert!(matches!(
            b.answer(Duration::from_secs(1)).await,
            Err(ConnectError::PeerOffline(peer)) if peer == "node-b"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let inbox = Arc::new(Inbox::default());
        let mut b = inbox.subscribe("node-b");
        // An answer does not satisfy a relay wait
        inbox.deliver(&answer_from("node-b"));
        assert!(matches!(
            b.relay(Duration::from_secs(2)).await,
            Err(ConnectError::Timeout(_))
        ));
    }

    #[test]
    fn test_drop_unsubscribes_only_itself() {
        let inbox = Arc::new(Inbox::default());
        let first = inbox.subscribe("node-b");
        let second = inbox.subscribe("node-b");
        drop(first);
        assert!(inbox.deliver(&answer_from("node-b")));
        drop(second);
        assert!(!inbox.deliver(&answer_from("node-b")));
    }
}
