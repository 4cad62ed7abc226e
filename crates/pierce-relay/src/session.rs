//! Relay sessions and byte forwarding

use crate::bandwidth::{BandwidthCounter, BandwidthLimiter};
use chrono::{DateTime, Utc};
use pierce_signal::NodeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Forwarding chunk size
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Generate a random session identifier
#[must_use]
pub fn new_session_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Traffic direction within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the requesting node to the target
    AToB,
    /// From the target back to the requester
    BToA,
}

/// One paired relay session
#[derive(Debug)]
pub struct RelaySession {
    id: String,
    node_a: NodeId,
    node_b: NodeId,
    created_at: DateTime<Utc>,
    started: Instant,
    last_active_ms: AtomicU64,
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
    counter: Mutex<BandwidthCounter>,
    cancel: CancellationToken,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session identifier
    pub id: String,
    /// Requesting node
    pub node_a: NodeId,
    /// Target node
    pub node_b: NodeId,
    /// Bytes forwarded from A to B
    pub bytes_a_to_b: u64,
    /// Bytes forwarded from B to A
    pub bytes_b_to_a: u64,
    /// Current combined throughput, bytes per second
    pub rate: u64,
    /// When the legs were paired
    pub created_at: DateTime<Utc>,
    /// When the last chunk was forwarded (pairing time if none yet)
    pub last_active_at: DateTime<Utc>,
    /// Time since the last forwarded chunk
    pub idle: Duration,
}

impl RelaySession {
    /// New session between `node_a` and `node_b`
    pub fn new(id: impl Into<String>, node_a: NodeId, node_b: NodeId, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            node_a,
            node_b,
            created_at: Utc::now(),
            started: now,
            last_active_ms: AtomicU64::new(0),
            a_to_b: AtomicU64::new(0),
            b_to_a: AtomicU64::new(0),
            counter: Mutex::new(BandwidthCounter::new(now)),
            cancel,
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The two endpoints, requester first
    #[must_use]
    pub fn nodes(&self) -> (&str, &str) {
        (&self.node_a, &self.node_b)
    }

    /// Sending node for `direction`
    #[must_use]
    pub fn sender(&self, direction: Direction) -> &str {
        match direction {
            Direction::AToB => &self.node_a,
            Direction::BToA => &self.node_b,
        }
    }

    /// Close both legs
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bytes forwarded in `direction`
    #[must_use]
    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::AToB => self.a_to_b.load(Ordering::Relaxed),
            Direction::BToA => self.b_to_a.load(Ordering::Relaxed),
        }
    }

    /// Time since the last forwarded chunk (or since pairing)
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last = self.started + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }

    fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::AToB => self.a_to_b.fetch_add(bytes, Ordering::Relaxed),
            Direction::BToA => self.b_to_a.fetch_add(bytes, Ordering::Relaxed),
        };
        let elapsed = Instant::now().saturating_duration_since(self.started);
        self.last_active_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Snapshot of counters
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let rate = lock(&self.counter).rate(Instant::now());
        let idle = self.idle();
        let last_active_at = chrono::Duration::from_std(idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
            .unwrap_or(self.created_at);
        SessionSnapshot {
            id: self.id.clone(),
            node_a: self.node_a.clone(),
            node_b: self.node_b.clone(),
            bytes_a_to_b: self.bytes(Direction::AToB),
            bytes_b_to_a: self.bytes(Direction::BToA),
            rate,
            created_at: self.created_at,
            last_active_at,
            idle,
        }
    }

    /// Forward both directions until either side ends or the session is closed
    ///
    /// `stream_a` belongs to the requester, `stream_b` to the target. Returns
    /// once both halves have stopped; both streams are shut down.
    pub async fn run(&self, stream_a: TcpStream, stream_b: TcpStream, limiter: &BandwidthLimiter) {
        let node_a = limiter.acquire(&self.node_a);
        let node_b = limiter.acquire(&self.node_b);

        let (read_a, write_a) = stream_a.into_split();
        let (read_b, write_b) = stream_b.into_split();

        tokio::join!(
            self.pump(Direction::AToB, read_a, write_b, &node_a, limiter),
            self.pump(Direction::BToA, read_b, write_a, &node_b, limiter),
        );

        limiter.release(&self.node_a);
        limiter.release(&self.node_b);
    }

    async fn pump<R, W>(
        &self,
        direction: Direction,
        mut reader: R,
        mut writer: W,
        node: &Mutex<BandwidthCounter>,
        limiter: &BandwidthLimiter,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                () = self.cancel.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(session = %self.id, ?direction, "Relay read failed: {}", e);
                        break;
                    }
                },
            };

            if !limiter.admit(node, &self.counter, n as u64, &self.cancel).await {
                break;
            }

            let written = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = writer.write_all(&buf[..n]) => result,
            };
            if let Err(e) = written {
                tracing::debug!(session = %self.id, ?direction, "Relay write failed: {}", e);
                break;
            }
            self.record(direction, n as u64);
        }

        // Either side ending tears down the whole session
        self.cancel.cancel();
        let _ = writer.shutdown().await;
    }
}
