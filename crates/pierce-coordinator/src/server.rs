//! WebSocket front end of the coordinator
//!
//! Each accepted connection is upgraded with an `Authorization: Bearer`
//! check, then bound to the `senderId` of its first envelope. From then on
//! every envelope on that connection must carry the same sender id.

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use futures_util::{SinkExt, StreamExt};
use pierce_signal::{
    AuthError, AuthValidator, ErrorCode, NodeId, Signal, SignalEnvelope, bearer_token,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header::AUTHORIZATION};
use tokio_util::sync::CancellationToken;

/// Signaling server bound to a [`Coordinator`]
#[derive(Clone)]
pub struct SignalServer {
    coordinator: Arc<Coordinator>,
    auth: Arc<dyn AuthValidator>,
}

impl SignalServer {
    /// Create a server for `coordinator`
    pub fn new(coordinator: Arc<Coordinator>, auth: Arc<dyn AuthValidator>) -> Self {
        Self { coordinator, auth }
    }

    /// Bind `addr` and accept connections until the coordinator shuts down
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the coordinator is
    /// already shutting down.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, CoordinatorError> {
        if self.coordinator.cancel.is_cancelled() {
            return Err(CoordinatorError::ShuttingDown);
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Signaling server listening on ws://{}", local);

        let server = self.clone();
        self.coordinator
            .tracker
            .spawn(async move { server.accept_loop(listener).await });
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let cancel = self.coordinator.cancel.clone();
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    self.coordinator
                        .tracker
                        .spawn(async move { server.handle_connection(stream, peer).await });
                }
                Err(e) => tracing::warn!("Signaling accept failed: {}", e),
            }
        }
        tracing::debug!("Signaling accept loop stopped");
    }

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut pinned: Result<Option<NodeId>, AuthError> = Ok(None);
        let auth = Arc::clone(&self.auth);
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let token = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(bearer_token);
            pinned = auth.validate(token);
            match &pinned {
                Ok(_) => Ok(response),
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                }
            }
        };

        let upgrade = tokio::time::timeout(
            self.coordinator.config().handshake_timeout,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await;
        let ws = match upgrade {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                tracing::debug!("Upgrade from {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                tracing::debug!("Upgrade from {} timed out", peer);
                return;
            }
        };
        let pinned = match pinned {
            Ok(pinned) => pinned,
            Err(e) => {
                tracing::warn!("Rejected signaling connection from {}: {}", peer, e);
                return;
            }
        };

        tracing::debug!("Signaling connection from {}", peer);
        self.serve(ws, peer, pinned).await;
    }

    async fn serve(&self, ws: WebSocketStream<TcpStream>, peer: SocketAddr, pinned: Option<NodeId>) {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut queue) = mpsc::channel(self.coordinator.config().peer_queue.max(1));
        let shutdown = self.coordinator.cancel.clone();
        let mut evicted = CancellationToken::new();
        let mut bound: Option<(NodeId, u64)> = None;

        let reason = loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break "coordinator shutting down";
                }
                () = evicted.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break "evicted";
                }
                queued = queue.recv() => {
                    let Some(envelope) = queued else { break "queue closed" };
                    if let Err(e) = write_envelope(&mut sink, &envelope).await {
                        tracing::debug!("Write to {} failed: {}", peer, e);
                        break "write failed";
                    }
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break "peer closed",
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!("Read from {} failed: {}", peer, e);
                            break "read failed";
                        }
                    };
                    let envelope = match SignalEnvelope::from_json(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::debug!("Invalid envelope from {}: {}", peer, e);
                            self.local_error(&outbound, bound.as_ref(), ErrorCode::InvalidEnvelope, e.to_string());
                            continue;
                        }
                    };

                    let sender = match &bound {
                        Some((node_id, _)) => {
                            if envelope.sender_id != *node_id {
                                self.local_error(
                                    &outbound,
                                    bound.as_ref(),
                                    ErrorCode::Unauthorized,
                                    format!("connection is bound to {node_id}"),
                                );
                                continue;
                            }
                            node_id.clone()
                        }
                        None => {
                            let claimed = envelope.sender_id.clone();
                            let mismatch = pinned.as_ref().filter(|pinned| **pinned != claimed);
                            if let Some(pinned) = mismatch {
                                tracing::warn!("Connection from {} claimed {} with credentials for {}", peer, claimed, pinned);
                                let rejection = SignalEnvelope::new(
                                    self.coordinator.config().node_id.clone(),
                                    Signal::error(ErrorCode::Unauthorized, format!("credentials are for {pinned}"), None),
                                )
                                .to(claimed);
                                let _ = write_envelope(&mut sink, &rejection).await;
                                let _ = sink.send(Message::Close(None)).await;
                                break "unauthorized sender";
                            }
                            if claimed.is_empty() {
                                self.local_error(&outbound, None, ErrorCode::InvalidEnvelope, "senderId is empty");
                                continue;
                            }
                            let conn_id = self.coordinator.next_conn_id();
                            let handle = self.coordinator.register_peer(&claimed, conn_id, outbound.clone());
                            evicted = handle.cancel;
                            bound = Some((claimed.clone(), conn_id));
                            claimed
                        }
                    };
                    self.coordinator.handle_envelope(&sender, envelope).await;
                }
            }
        };

        match bound {
            Some((node_id, conn_id)) => {
                tracing::debug!("Signaling connection for {} ended: {}", node_id, reason);
                self.coordinator.unregister_peer(&node_id, conn_id);
            }
            None => tracing::debug!("Signaling connection from {} ended: {}", peer, reason),
        }
    }

    /// Queue an error for this connection only
    fn local_error(
        &self,
        outbound: &mpsc::Sender<SignalEnvelope>,
        bound: Option<&(NodeId, u64)>,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        let mut envelope = SignalEnvelope::new(
            self.coordinator.config().node_id.clone(),
            Signal::error(code, message, None),
        );
        envelope.receiver_id = bound.map(|(node_id, _)| node_id.clone());
        if outbound.try_send(envelope).is_err() {
            tracing::debug!("Dropped error reply, queue full");
        }
    }
}

async fn write_envelope<S>(sink: &mut S, envelope: &SignalEnvelope) -> Result<(), CoordinatorError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Dropping unencodable {} envelope: {}", envelope.kind(), e);
            return Ok(());
        }
    };
    sink.send(Message::Text(text))
        .await
        .map_err(|e| CoordinatorError::Io(std::io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use pierce_nat::{NatClass, Strategy};
    use pierce_signal::{
        AllowAll, ChannelConfig, ConnectPayload, NatReport, SignalKind, SignalingChannel,
        StaticTokens,
    };
    use std::time::Duration;

    async fn start(auth: Arc<dyn AuthValidator>) -> (Arc<Coordinator>, String) {
        let coordinator = Coordinator::start(CoordinatorConfig::default());
        let server = SignalServer::new(Arc::clone(&coordinator), auth);
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (coordinator, format!("ws://{addr}"))
    }

    fn channel(url: &str, node_id: &str, token: Option<&str>) -> SignalingChannel {
        SignalingChannel::open(ChannelConfig {
            reconnect_initial: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
            auth_token: token.map(str::to_string),
            ..ChannelConfig::new(url, node_id)
        })
    }

    fn hello(node_id: &str, class: NatClass) -> SignalEnvelope {
        SignalEnvelope::new(
            node_id,
            Signal::Offer(NatReport {
                nat_type: class,
                external_ip: "203.0.113.20".parse().unwrap(),
                external_port: 40000,
                local_addr: None,
                relay_port: None,
                health: None,
            }),
        )
    }

    async fn wait_online(coordinator: &Coordinator, node_id: &str) {
        for _ in 0..100 {
            if coordinator.peer_info(node_id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{node_id} never came online");
    }

    #[tokio::test]
    async fn test_connect_through_server() {
        let (coordinator, url) = start(Arc::new(AllowAll)).await;

        let b = channel(&url, "node-b", None);
        b.set_hello(hello("node-b", NatClass::PortRestrictedCone));
        let (connect_tx, mut connects) = mpsc::unbounded_channel();
        b.register_handler(SignalKind::Connect, move |env| {
            let _ = connect_tx.send(env.clone());
        });
        wait_online(&coordinator, "node-b").await;

        let a = channel(&url, "node-a", None);
        let (answer_tx, mut answers) = mpsc::unbounded_channel();
        a.register_handler(SignalKind::Answer, move |env| {
            let _ = answer_tx.send(env.clone());
        });
        a.signal(
            Some("node-b"),
            Signal::Connect(ConnectPayload {
                nat_type: NatClass::RestrictedCone,
                external_ip: "198.51.100.1".parse().unwrap(),
                external_port: 41000,
                local_addr: None,
                connection_type: None,
                source_id: None,
            }),
        )
        .unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), connects.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.sender_id, "node-a");
        let answer = tokio::time::timeout(Duration::from_secs(5), answers.recv())
            .await
            .unwrap()
            .unwrap();
        let Signal::Answer(payload) = answer.body else {
            panic!("expected answer");
        };
        assert_eq!(payload.connection_type, Some(Strategy::HolePunch));
        assert_eq!(payload.nat_type, NatClass::PortRestrictedCone);

        a.shutdown().await;
        b.shutdown().await;
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (coordinator, url) = start(Arc::new(AllowAll)).await;
        let a = channel(&url, "node-a", None);
        a.set_hello(hello("node-a", NatClass::None));
        wait_online(&coordinator, "node-a").await;

        a.shutdown().await;
        for _ in 0..100 {
            if coordinator.peer_info("node-a").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(coordinator.peer_info("node-a").is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let tokens = StaticTokens::new([("secret".to_string(), "node-a".to_string())]);
        let (coordinator, url) = start(Arc::new(tokens)).await;

        let anonymous = channel(&url, "node-a", None);
        assert!(anonymous.wait_connected(Duration::from_millis(500)).await.is_err());
        anonymous.shutdown().await;

        let authorized = channel(&url, "node-a", Some("secret"));
        authorized.set_hello(hello("node-a", NatClass::FullCone));
        authorized.wait_connected(Duration::from_secs(5)).await.unwrap();
        wait_online(&coordinator, "node-a").await;
        authorized.shutdown().await;

        // Valid token, wrong identity
        let impostor = channel(&url, "node-x", Some("secret"));
        let (error_tx, mut errors) = mpsc::unbounded_channel();
        impostor.register_handler(SignalKind::Error, move |env| {
            let _ = error_tx.send(env.clone());
        });
        impostor.set_hello(hello("node-x", NatClass::FullCone));
        let rejected = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        let Signal::Error(error) = rejected.body else {
            panic!("expected error");
        };
        assert_eq!(error.code, ErrorCode::Unauthorized);
        assert!(coordinator.peer_info("node-x").is_none());
        impostor.shutdown().await;

        coordinator.shutdown().await;
    }
}
