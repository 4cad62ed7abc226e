//! Client side of the signaling channel
//!
//! One supervisor task owns the WebSocket and runs the connection state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> ... -> Closed
//! ```
//!
//! While connected it flushes the outbound queue, answers inbound `ping`
//! envelopes with `pong`, sends a `ping` every keepalive period and times the
//! `pong` that answers it, and hands every other envelope to the handlers
//! registered for its type, in registration order. A lost connection is retried with exponential back-off until the
//! owner calls [`SignalingChannel::close`].

use crate::envelope::{Signal, SignalEnvelope, SignalKind};
use crate::error::SignalError;
use crate::peer::NodeId;
use crate::rtt::RttEstimator;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Envelope handler
///
/// Runs on the channel's read loop; it must not block. Long work belongs on a
/// task the handler spawns or a queue it feeds.
pub type Handler = Arc<dyn Fn(&SignalEnvelope) + Send + Sync>;

/// Signaling channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Coordinator URL (`ws://host:port/path`)
    pub url: String,
    /// This node's id, used as `senderId`
    pub node_id: NodeId,
    /// Keepalive period
    pub keepalive: Duration,
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
    /// Outbound queue capacity, in envelopes
    pub send_queue: usize,
    /// Deadline for the WebSocket upgrade
    pub connect_timeout: Duration,
    /// Bearer token presented on upgrade
    pub auth_token: Option<String>,
}

impl ChannelConfig {
    /// Defaults for `url` and `node_id`
    #[must_use]
    pub fn new(url: impl Into<String>, node_id: impl Into<NodeId>) -> Self {
        Self {
            url: url.into(),
            node_id: node_id.into(),
            keepalive: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            send_queue: 256,
            connect_timeout: Duration::from_secs(10),
            auth_token: None,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected; a reconnect may be pending
    Disconnected,
    /// Upgrade in progress
    Connecting,
    /// Read loop running
    Connected,
    /// Closed by the owner; terminal
    Closed,
}

#[derive(Default)]
struct Shared {
    handlers: RwLock<HashMap<SignalKind, Vec<Handler>>>,
    /// Hello envelope and its version, bumped on every `set_hello`
    hello: Mutex<Option<(u64, SignalEnvelope)>>,
    hello_changed: Notify,
    rtt: Mutex<RttEstimator>,
}

impl Shared {
    fn handlers_for(&self, kind: SignalKind) -> Vec<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    fn hello(&self) -> Option<(u64, SignalEnvelope)> {
        self.hello.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn rtt(&self) -> std::sync::MutexGuard<'_, RttEstimator> {
        self.rtt.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Persistent, reconnecting signaling channel to the coordinator
pub struct SignalingChannel {
    node_id: NodeId,
    outbound: mpsc::Sender<SignalEnvelope>,
    shared: Arc<Shared>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Start the channel; connection happens in the background
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn open(config: ChannelConfig) -> Self {
        let (outbound, rx) = mpsc::channel(config.send_queue.max(1));
        let (state_tx, state) = watch::channel(ChannelState::Disconnected);
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        let node_id = config.node_id.clone();

        let supervisor = Supervisor {
            config,
            outbound: rx,
            shared: Arc::clone(&shared),
            state: state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            node_id,
            outbound,
            shared,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// This node's id
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Queue an envelope for sending
    ///
    /// Envelopes are written in the order they were queued. Envelopes queued
    /// while disconnected are flushed after the next successful connect.
    ///
    /// # Errors
    ///
    /// `Backpressure` when the queue is full, `Closed` after [`close`](Self::close).
    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalError> {
        if self.cancel.is_cancelled() {
            return Err(SignalError::Closed);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SignalError::Closed,
        })
    }

    /// Build and queue an envelope from this node
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn signal(&self, receiver: Option<&str>, body: Signal) -> Result<(), SignalError> {
        let mut envelope = SignalEnvelope::new(self.node_id.clone(), body);
        envelope.receiver_id = receiver.map(str::to_owned);
        self.send(envelope)
    }

    /// Register a handler for envelopes of `kind`
    ///
    /// Several handlers may be registered per kind; they run in registration
    /// order. Handlers for `ping` never run, pings are answered internally.
    pub fn register_handler<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Envelope written first on every (re)connect, e.g. the registration offer
    ///
    /// Replacing the hello while connected writes the new one on the live
    /// connection too, so each version reaches the server once per connection.
    pub fn set_hello(&self, envelope: SignalEnvelope) {
        {
            let mut hello = self.shared.hello.lock().unwrap_or_else(PoisonError::into_inner);
            let version = hello.as_ref().map_or(1, |(version, _)| version + 1);
            *hello = Some((version, envelope));
        }
        self.shared.hello_changed.notify_one();
    }

    /// Smoothed round-trip time of keepalive pings, once one was answered
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.shared.rtt().smoothed()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// State change notifications
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Wait until the channel reports `Connected`
    ///
    /// # Errors
    ///
    /// `Timeout` if not connected in time, `Closed` if the channel closes.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SignalError> {
        let mut state = self.state.clone();
        let wait = state.wait_for(|s| matches!(s, ChannelState::Connected | ChannelState::Closed));
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(s)) if *s == ChannelState::Connected => Ok(()),
            Ok(_) => Err(SignalError::Closed),
            Err(_) => Err(SignalError::Timeout),
        }
    }

    /// Stop the channel; idempotent
    ///
    /// Cancels any pending reconnect and closes the socket.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Closing signaling channel for {}", self.node_id);
            self.cancel.cancel();
        }
    }

    /// Close and wait for the supervisor to exit
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    config: ChannelConfig,
    outbound: mpsc::Receiver<SignalEnvelope>,
    shared: Arc<Shared>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = self.config.reconnect_initial;

        while !self.cancel.is_cancelled() {
            self.state.send_replace(ChannelState::Connecting);
            tracing::debug!("Connecting to signaling server {}", self.config.url);

            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout, connect(&self.config)) => result,
            };

            match connected {
                Ok(Ok(ws)) => {
                    backoff = self.config.reconnect_initial;
                    self.state.send_replace(ChannelState::Connected);
                    tracing::info!("Signaling channel connected to {}", self.config.url);

                    let reason = self.serve(ws).await;
                    self.state.send_replace(ChannelState::Disconnected);
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!("Signaling channel lost: {}", reason);
                }
                Ok(Err(e)) => {
                    self.state.send_replace(ChannelState::Disconnected);
                    tracing::warn!("Signaling connect failed: {}", e);
                }
                Err(_) => {
                    self.state.send_replace(ChannelState::Disconnected);
                    tracing::warn!(
                        "Signaling connect timed out after {:?}",
                        self.config.connect_timeout
                    );
                }
            }

            tracing::debug!("Reconnecting in {:?}", backoff);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }

        self.state.send_replace(ChannelState::Closed);
        tracing::debug!("Signaling supervisor for {} stopped", self.config.node_id);
    }

    /// Drive one connection until it fails or the channel closes
    async fn serve(&mut self, ws: WsStream) -> String {
        let (mut sink, mut stream) = ws.split();

        let mut hello_written = 0;
        if let Some((version, hello)) = self.shared.hello() {
            if let Err(e) = write_envelope(&mut sink, &hello).await {
                return format!("hello failed: {e}");
            }
            hello_written = version;
        }

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive,
            self.config.keepalive,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "closed".into();
                }
                _ = keepalive.tick() => {
                    if last_rx.elapsed() > self.config.keepalive * 2 {
                        return "keepalive timeout".into();
                    }
                    let ping = SignalEnvelope::new(self.config.node_id.clone(), Signal::Ping);
                    if let Err(e) = write_envelope(&mut sink, &ping).await {
                        return format!("keepalive failed: {e}");
                    }
                    self.shared.rtt().ping_sent(Instant::now());
                }
                () = self.shared.hello_changed.notified() => {
                    let Some((version, hello)) = self.shared.hello() else { continue };
                    if version != hello_written {
                        if let Err(e) = write_envelope(&mut sink, &hello).await {
                            return format!("hello failed: {e}");
                        }
                        hello_written = version;
                    }
                }
                queued = self.outbound.recv() => {
                    let Some(envelope) = queued else {
                        return "owner dropped".into();
                    };
                    if let Err(e) = write_envelope(&mut sink, &envelope).await {
                        return format!("write failed: {e}");
                    }
                }
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return format!("read failed: {e}"),
                        None => return "server closed the connection".into(),
                    };
                    last_rx = Instant::now();
                    match message {
                        Message::Text(text) => {
                            if let Some(reply) = self.dispatch(&text) {
                                if let Err(e) = write_envelope(&mut sink, &reply).await {
                                    return format!("pong failed: {e}");
                                }
                            }
                        }
                        Message::Close(_) => return "server closed the connection".into(),
                        // Control frames are answered by tungstenite
                        _ => {}
                    }
                }
            }
        }
    }

    /// Deliver one text frame; returns a reply to write, if any
    fn dispatch(&self, text: &str) -> Option<SignalEnvelope> {
        let envelope = match SignalEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping invalid envelope: {}", e);
                return None;
            }
        };

        let kind = envelope.kind();
        if kind == SignalKind::Ping {
            let pong = SignalEnvelope::new(self.config.node_id.clone(), Signal::Pong)
                .to(envelope.sender_id);
            return Some(pong);
        }
        if kind == SignalKind::Pong {
            if let Some(sample) = self.shared.rtt().pong_received(Instant::now()) {
                tracing::trace!("Signaling round trip {:?}", sample);
            }
        }

        let handlers = self.shared.handlers_for(kind);
        if handlers.is_empty() {
            tracing::trace!("No handler for {} envelope from {}", kind, envelope.sender_id);
        }
        for handler in &handlers {
            handler(&envelope);
        }
        None
    }
}

async fn connect(config: &ChannelConfig) -> Result<WsStream, SignalError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| SignalError::InvalidUrl(e.to_string()))?;
    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| SignalError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

async fn write_envelope<S>(sink: &mut S, envelope: &SignalEnvelope) -> Result<(), SignalError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = envelope.to_json()?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ErrorCode, Signal};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast_config(url: String) -> ChannelConfig {
        ChannelConfig {
            reconnect_initial: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
            ..ChannelConfig::new(url, "node-a")
        }
    }

    /// Accepts connections forever; each connection's text frames are pushed
    /// into `frames`, and `script` frames are written right after the upgrade.
    async fn scripted_server(
        script: Vec<String>,
    ) -> (String, mpsc::UnboundedReceiver<String>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    for frame in script {
                        ws.send(Message::Text(frame)).await.unwrap();
                    }
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = tx.send(text);
                        }
                    }
                });
            }
        });
        (url, rx, accepted)
    }

    fn text(env: SignalEnvelope) -> String {
        env.to_json().unwrap()
    }

    #[tokio::test]
    async fn test_hello_then_queue_in_order() {
        let (url, mut frames, _) = scripted_server(Vec::new()).await;
        let channel = SignalingChannel::open(fast_config(url));
        channel.set_hello(SignalEnvelope::new("node-a", Signal::RelayRequest));
        channel
            .signal(Some("node-b"), Signal::IceCandidate(serde_json::json!(1)))
            .unwrap();
        channel
            .signal(Some("node-b"), Signal::IceCandidate(serde_json::json!(2)))
            .unwrap();

        let kinds: Vec<SignalKind> = [
            frames.recv().await.unwrap(),
            frames.recv().await.unwrap(),
            frames.recv().await.unwrap(),
        ]
        .iter()
        .map(|t| SignalEnvelope::from_json(t).unwrap())
        .map(|e| {
            if let Signal::IceCandidate(v) = &e.body {
                assert!(v == 1 || v == 2);
            }
            e.kind()
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                SignalKind::RelayRequest,
                SignalKind::IceCandidate,
                SignalKind::IceCandidate
            ]
        );
        channel.shutdown().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_ping_answered_without_handlers() {
        let ping = text(SignalEnvelope::new("coordinator", Signal::Ping).to("node-a"));
        let error = text(SignalEnvelope::new(
            "coordinator",
            Signal::error(ErrorCode::PeerOffline, "peer offline", None),
        ));
        let (url, mut frames, _) = scripted_server(vec![ping, error]).await;

        let channel = SignalingChannel::open(fast_config(url));
        let ping_calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls = Arc::clone(&ping_calls);
        channel.register_handler(SignalKind::Ping, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        let (first, second) = (Arc::clone(&order), Arc::clone(&order));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        channel.register_handler(SignalKind::Error, move |_| first.lock().unwrap().push(1));
        channel.register_handler(SignalKind::Error, move |_| {
            second.lock().unwrap().push(2);
            let _ = done_tx.send(());
        });

        let reply = SignalEnvelope::from_json(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind(), SignalKind::Pong);
        assert_eq!(reply.receiver_id.as_deref(), Some("coordinator"));

        done_rx.recv().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(ping_calls.load(Ordering::SeqCst), 0);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_when_queue_full() {
        // Nothing listens here, so the queue never drains
        let config = ChannelConfig {
            send_queue: 2,
            ..fast_config("ws://127.0.0.1:1".into())
        };
        let channel = SignalingChannel::open(config);
        channel.signal(None, Signal::RelayRequest).unwrap();
        channel.signal(None, Signal::RelayRequest).unwrap();
        assert!(matches!(
            channel.signal(None, Signal::RelayRequest),
            Err(SignalError::Backpressure)
        ));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_reconnects() {
        let channel = SignalingChannel::open(fast_config("ws://127.0.0.1:1".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.close();
        channel.close();
        channel.shutdown().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.signal(None, Signal::Ping),
            Err(SignalError::Closed)
        ));
        assert!(matches!(
            channel.wait_connected(Duration::from_millis(50)).await,
            Err(SignalError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_hello_replaced_while_connected() {
        let (url, mut frames, _) = scripted_server(Vec::new()).await;
        let channel = SignalingChannel::open(fast_config(url));
        channel.set_hello(SignalEnvelope::new("node-a", Signal::RelayRequest));
        channel.wait_connected(Duration::from_secs(2)).await.unwrap();
        let first = SignalEnvelope::from_json(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind(), SignalKind::RelayRequest);

        channel.set_hello(SignalEnvelope::new(
            "node-a",
            Signal::IceCandidate(serde_json::json!("v2")),
        ));
        let second = SignalEnvelope::from_json(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(second.body, Signal::IceCandidate(serde_json::json!("v2")));

        // Each hello went out exactly once; the next frame is the queued one
        channel.signal(None, Signal::Pong).unwrap();
        let third = SignalEnvelope::from_json(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(third.kind(), SignalKind::Pong);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_keepalive_measures_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let envelope = SignalEnvelope::from_json(&text).unwrap();
                if envelope.kind() == SignalKind::Ping {
                    let pong = SignalEnvelope::new("coordinator", Signal::Pong).to("node-a");
                    ws.send(Message::Text(pong.to_json().unwrap())).await.unwrap();
                }
            }
        });

        let channel = SignalingChannel::open(ChannelConfig {
            keepalive: Duration::from_millis(50),
            ..fast_config(url)
        });
        assert_eq!(channel.rtt(), None);
        let mut measured = None;
        for _ in 0..100 {
            measured = channel.rtt();
            if measured.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let rtt = measured.expect("no round trip measured");
        assert!(rtt < Duration::from_secs(1), "{rtt:?}");
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            // First connection is dropped right after the upgrade
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = tx.send(text);
            }
        });

        let channel = SignalingChannel::open(fast_config(url));
        channel.set_hello(SignalEnvelope::new("node-a", Signal::RelayRequest));
        let hello = SignalEnvelope::from_json(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(hello.kind(), SignalKind::RelayRequest);
        channel.wait_connected(Duration::from_secs(2)).await.unwrap();
        channel.shutdown().await;
    }
}
