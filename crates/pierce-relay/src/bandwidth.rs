//! Bandwidth accounting and admission
//!
//! A [`BandwidthCounter`] keeps a running total plus a one-second sliding
//! window split into ten 100 ms slots. Slots expire purely by clock time, so
//! an idle counter decays to zero without any traffic.
//!
//! [`BandwidthLimiter`] gates every forwarded chunk against the sending node's
//! counter and the session's counter. A chunk that would push either window
//! over its cap is delayed until enough of the window has expired; it is never
//! dropped or split.

use crate::session::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SLOTS: usize = 10;
const SLOT: Duration = Duration::from_millis(100);

/// Total bytes plus a sliding one-second window
#[derive(Debug, Clone)]
pub struct BandwidthCounter {
    total: u64,
    slots: [u64; SLOTS],
    /// Absolute index of the newest slot
    head: u64,
    window_start: Instant,
}

impl BandwidthCounter {
    /// Empty counter anchored at `now`
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            total: 0,
            slots: [0; SLOTS],
            head: 0,
            window_start: now,
        }
    }

    fn slot_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        (elapsed.as_nanos() / SLOT.as_nanos()) as u64
    }

    fn advance(&mut self, now: Instant) {
        let index = self.slot_index(now);
        if index <= self.head {
            return;
        }
        let stale = (index - self.head).min(SLOTS as u64);
        for step in 1..=stale {
            self.slots[((self.head + step) % SLOTS as u64) as usize] = 0;
        }
        self.head = index;
    }

    /// Account `bytes` at `now`
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.advance(now);
        self.slots[(self.head % SLOTS as u64) as usize] += bytes;
        self.total += bytes;
    }

    /// Bytes seen over the last second
    pub fn window_bytes(&mut self, now: Instant) -> u64 {
        self.advance(now);
        self.slots.iter().sum()
    }

    /// Throughput estimate in bytes per second
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.window_bytes(now)
    }

    /// Bytes recorded since creation
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Delay before `bytes` more fit under `cap` bytes per second
    ///
    /// An empty window always admits, so a chunk larger than the cap still
    /// gets through, once per window.
    pub fn time_until_admit(&mut self, bytes: u64, cap: u64, now: Instant) -> Duration {
        let mut in_window = self.window_bytes(now);
        if in_window == 0 || in_window + bytes <= cap {
            return Duration::ZERO;
        }

        // Walk the slots from oldest to newest until enough has expired
        let oldest = self.head.saturating_sub(SLOTS as u64 - 1);
        for index in oldest..=self.head {
            in_window -= self.slots[(index % SLOTS as u64) as usize];
            if in_window == 0 || in_window + bytes <= cap {
                // Slot `index` leaves the window once the head reaches index + SLOTS
                let expires = self.window_start + SLOT * (index + SLOTS as u64) as u32;
                return expires.saturating_duration_since(now);
            }
        }
        SLOT
    }
}

/// Throughput ceilings, in bytes per second; `None` means uncapped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthCaps {
    /// Per node, across all of its sessions
    pub node: Option<u64>,
    /// Per session, both directions combined
    pub session: Option<u64>,
}

/// Per-node counters shared by every session the node takes part in
#[derive(Debug, Default)]
pub struct BandwidthLimiter {
    caps: BandwidthCaps,
    nodes: Mutex<HashMap<String, (usize, Arc<Mutex<BandwidthCounter>>)>>,
}

impl BandwidthLimiter {
    /// Limiter enforcing `caps`
    #[must_use]
    pub fn new(caps: BandwidthCaps) -> Self {
        Self {
            caps,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Configured caps
    #[must_use]
    pub fn caps(&self) -> BandwidthCaps {
        self.caps
    }

    /// Take a reference on `node`'s counter, creating it if needed
    pub fn acquire(&self, node: &str) -> Arc<Mutex<BandwidthCounter>> {
        let mut nodes = lock(&self.nodes);
        let entry = nodes
            .entry(node.to_owned())
            .or_insert_with(|| (0, Arc::new(Mutex::new(BandwidthCounter::new(Instant::now())))));
        entry.0 += 1;
        Arc::clone(&entry.1)
    }

    /// Drop a reference on `node`'s counter; the last release removes it
    pub fn release(&self, node: &str) {
        let mut nodes = lock(&self.nodes);
        if let Some(entry) = nodes.get_mut(node) {
            entry.0 = entry.0.saturating_sub(1);
            if entry.0 == 0 {
                nodes.remove(node);
            }
        }
    }

    /// (total bytes, bytes per second) for a node with live sessions
    #[must_use]
    pub fn node_usage(&self, node: &str) -> Option<(u64, u64)> {
        let counter = lock(&self.nodes).get(node).map(|(_, c)| Arc::clone(c))?;
        let mut counter = lock(&counter);
        let rate = counter.rate(Instant::now());
        Some((counter.total(), rate))
    }

    /// Check and account one chunk without waiting
    ///
    /// Returns zero when the chunk was admitted and recorded on both counters,
    /// otherwise the delay to wait before asking again. Node is locked before
    /// session, always.
    pub fn try_admit(
        &self,
        node: &Mutex<BandwidthCounter>,
        session: &Mutex<BandwidthCounter>,
        bytes: u64,
    ) -> Duration {
        let now = Instant::now();
        let mut node = lock(node);
        let mut session = lock(session);

        let node_wait = self
            .caps
            .node
            .map_or(Duration::ZERO, |cap| node.time_until_admit(bytes, cap, now));
        let session_wait = self
            .caps
            .session
            .map_or(Duration::ZERO, |cap| session.time_until_admit(bytes, cap, now));
        let wait = node_wait.max(session_wait);

        if wait.is_zero() {
            node.record(bytes, now);
            session.record(bytes, now);
        }
        wait
    }

    /// Wait until one chunk is admitted, then account it
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn admit(
        &self,
        node: &Mutex<BandwidthCounter>,
        session: &Mutex<BandwidthCounter>,
        bytes: u64,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let wait = self.try_admit(node, session, bytes);
            if wait.is_zero() {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_decays_by_time() {
        let start = Instant::now();
        let mut counter = BandwidthCounter::new(start);
        counter.record(1000, start);
        assert_eq!(counter.window_bytes(start), 1000);

        tokio::time::advance(Duration::from_millis(500)).await;
        counter.record(500, Instant::now());
        assert_eq!(counter.window_bytes(Instant::now()), 1500);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(counter.window_bytes(Instant::now()), 500);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(counter.window_bytes(Instant::now()), 0);
        assert_eq!(counter.total(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_admit() {
        let start = Instant::now();
        let mut counter = BandwidthCounter::new(start);

        // Empty window admits even an oversized chunk
        assert_eq!(counter.time_until_admit(5000, 1000, start), Duration::ZERO);

        counter.record(800, start);
        assert_eq!(counter.time_until_admit(200, 1000, start), Duration::ZERO);
        // The 800 bytes in slot 0 leave the window at t = 1s
        assert_eq!(
            counter.time_until_admit(300, 1000, start),
            Duration::from_secs(1)
        );

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(
            counter.time_until_admit(300, 1000, Instant::now()),
            Duration::from_millis(750)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_converges_to_cap() {
        let cap = 64 * 1024;
        let chunk = 4 * 1024u64;
        let limiter = BandwidthLimiter::new(BandwidthCaps {
            node: Some(cap),
            session: None,
        });
        let node = limiter.acquire("node-a");
        let session = Mutex::new(BandwidthCounter::new(Instant::now()));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let mut sent = 0u64;
        while start.elapsed() < Duration::from_secs(10) {
            assert!(limiter.admit(&node, &session, chunk, &cancel).await);
            sent += chunk;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let rate = sent as f64 / elapsed;
        assert!(rate <= (cap + chunk) as f64, "rate {rate} over cap");
        assert!(rate >= cap as f64 * 0.8, "rate {rate} far below cap");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_cap_applies_independently() {
        let limiter = BandwidthLimiter::new(BandwidthCaps {
            node: None,
            session: Some(1000),
        });
        let node = limiter.acquire("node-a");
        let session = Mutex::new(BandwidthCounter::new(Instant::now()));

        assert_eq!(limiter.try_admit(&node, &session, 600), Duration::ZERO);
        assert!(!limiter.try_admit(&node, &session, 600).is_zero());
        // Refused chunks are not accounted
        assert_eq!(lock(&session).total(), 600);
        assert_eq!(lock(&node).total(), 600);
    }

    #[test]
    fn test_node_counters_released() {
        let limiter = BandwidthLimiter::new(BandwidthCaps::default());
        let _first = limiter.acquire("node-a");
        let _second = limiter.acquire("node-a");
        limiter.release("node-a");
        assert!(limiter.node_usage("node-a").is_some());
        limiter.release("node-a");
        assert!(limiter.node_usage("node-a").is_none());
        // Releasing an unknown node is harmless
        limiter.release("node-b");
    }

    #[tokio::test]
    async fn test_admit_cancelled() {
        let limiter = BandwidthLimiter::new(BandwidthCaps {
            node: Some(10),
            session: None,
        });
        let node = limiter.acquire("n");
        let session = Mutex::new(BandwidthCounter::new(Instant::now()));
        let cancel = CancellationToken::new();
        assert!(limiter.admit(&node, &session, 10, &cancel).await);
        cancel.cancel();
        assert!(!limiter.admit(&node, &session, 10, &cancel).await);
    }
}
