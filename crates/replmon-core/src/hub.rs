//! Broadcast hub: keeps a changing set of live subscribers fed with snapshots.
//!
//! Subscriber lifecycle:
//!
//! ```text
//! subscribe() ──▶ subscribed ──write failure / unregister() / close()──▶ closed
//!                    │
//!                    └── welcome snapshot sent on entry
//! ```
//!
//! Writes to one subscriber are serialised and never go back in time: a
//! snapshot older than the last one that subscriber received is skipped. A
//! slow welcome therefore cannot land after a newer tick.
//!
//! The registry is the only shared mutable state. It sits behind a read/write
//! lock that is never held across an `.await`: a broadcast copies the member
//! list under the read lock, writes to every member concurrently with no lock
//! held, then removes the failed members in a separate write-lock pass. A slow
//! subscriber is bounded by the write timeout and cannot delay the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::collector::SnapshotCollector;
use crate::model::Snapshot;

/// Registry key of a subscriber.
pub type SubscriberId = u64;

/// Lifecycle state of a subscriber as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Subscribed,
    Closed,
}

/// Error type for delivering a snapshot to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The peer has gone away.
    Closed,
    /// The snapshot could not be encoded for the wire.
    Encode(String),
    /// The transport rejected the write.
    Write(String),
    /// The write did not finish within the hub's write timeout.
    Timeout,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Closed => f.write_str("subscriber closed"),
            SinkError::Encode(msg) => write!(f, "encode failed: {}", msg),
            SinkError::Write(msg) => write!(f, "write failed: {}", msg),
            SinkError::Timeout => f.write_str("write timed out"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Outbound half of one subscriber connection.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn send(&self, snapshot: Arc<Snapshot>) -> Result<(), SinkError>;

    /// Called once after the subscriber has been removed from the registry.
    async fn close(&self) {}
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// A registered sink plus the timestamp of the newest snapshot written to it.
struct Member {
    sink: Arc<dyn SnapshotSink>,
    last_sent: tokio::sync::Mutex<Option<DateTime<Utc>>>,
}

impl Member {
    fn new(sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            sink,
            last_sent: tokio::sync::Mutex::new(None),
        }
    }

    /// Sends `snapshot` unless something at least as new was already sent.
    async fn send_newer(&self, snapshot: Arc<Snapshot>) -> Result<(), SinkError> {
        let mut last_sent = self.last_sent.lock().await;
        if last_sent.is_some_and(|sent| snapshot.timestamp <= sent) {
            return Ok(());
        }
        let timestamp = snapshot.timestamp;
        self.sink.send(snapshot).await?;
        *last_sent = Some(timestamp);
        Ok(())
    }
}

type Registry = HashMap<SubscriberId, Arc<Member>>;

/// Subscriber registry plus the periodic collect-and-push loop.
pub struct BroadcastHub {
    collector: Arc<SnapshotCollector>,
    subscribers: RwLock<Registry>,
    latest: RwLock<Option<Arc<Snapshot>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(collector: Arc<SnapshotCollector>, write_timeout: Duration) -> Self {
        Self {
            collector,
            subscribers: RwLock::new(HashMap::new()),
            latest: RwLock::new(None),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    pub fn collector(&self) -> &SnapshotCollector {
        &self.collector
    }

    /// Most recent snapshot produced by a tick or a welcome collection.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    pub fn state(&self, id: SubscriberId) -> SubscriberState {
        if self.registry().contains_key(&id) {
            SubscriberState::Subscribed
        } else {
            SubscriberState::Closed
        }
    }

    /// Registers `sink` and sends it the welcome snapshot.
    ///
    /// The welcome payload is the latest snapshot, or a fresh collection if
    /// none exists yet. A sink that fails its welcome write is dropped again
    /// and the error is returned.
    pub async fn subscribe(&self, sink: Arc<dyn SnapshotSink>) -> Result<SubscriberId, SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let member = Arc::new(Member::new(sink));
        let active = {
            let mut registry = self.registry_mut();
            registry.insert(id, Arc::clone(&member));
            registry.len()
        };
        info!(subscriber = id, active_subscribers = active, "subscriber connected");

        let welcome = match self.latest() {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = Arc::new(self.collector.collect().await);
                self.latest
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert_with(|| Arc::clone(&snapshot));
                snapshot
            }
        };

        match self.deliver(&member, welcome).await {
            Ok(()) => Ok(id),
            Err(e) => {
                warn!(subscriber = id, error = %e, "welcome write failed");
                self.unregister(id).await;
                Err(e)
            }
        }
    }

    /// Removes and closes a subscriber. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: SubscriberId) -> bool {
        match self.remove(id) {
            Some(member) => {
                member.sink.close().await;
                true
            }
            None => false,
        }
    }

    /// Collects a fresh snapshot for a synchronous pull.
    ///
    /// Independent of the tick loop: the result is not cached and the tick
    /// schedule is left alone.
    pub async fn pull(&self) -> Snapshot {
        self.collector.collect().await
    }

    /// One refresh cycle: collect, publish as latest, push to every subscriber.
    pub async fn tick(&self) -> Arc<Snapshot> {
        let snapshot = Arc::new(self.collector.collect().await);
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        let report = self.broadcast(Arc::clone(&snapshot)).await;
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast completed"
        );
        snapshot
    }

    /// Pushes `snapshot` to every registered subscriber and drops the ones
    /// whose write fails or times out.
    pub async fn broadcast(&self, snapshot: Arc<Snapshot>) -> BroadcastReport {
        let members: Vec<(SubscriberId, Arc<Member>)> = self
            .registry()
            .iter()
            .map(|(id, member)| (*id, Arc::clone(member)))
            .collect();

        if members.is_empty() {
            return BroadcastReport::default();
        }

        let writes = members.iter().map(|(id, member)| {
            let snapshot = Arc::clone(&snapshot);
            async move { (*id, self.deliver(member, snapshot).await) }
        });
        let results = join_all(writes).await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(subscriber = id, error = %e, "dropping subscriber");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let removed: Vec<Arc<Member>> = {
                let mut registry = self.registry_mut();
                failed.iter().filter_map(|id| registry.remove(id)).collect()
            };
            report.dropped = removed.len();
            for member in removed {
                member.sink.close().await;
            }
        }

        report
    }

    /// Runs [`Self::tick`] every `interval` until the task is cancelled.
    ///
    /// The first tick fires immediately. Ticks that fall behind are skipped
    /// rather than bunched up.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut snapshot_count: u64 = 0;

        loop {
            tick.tick().await;

            let t0 = Instant::now();
            let snapshot = self.tick().await;
            let elapsed = t0.elapsed();
            snapshot_count += 1;

            if snapshot_count == 1 {
                info!(
                    duration_ms = elapsed.as_millis() as u64,
                    health = ?snapshot.summary.health_status,
                    sources = snapshot.databases.len(),
                    "first snapshot collected"
                );
            } else {
                debug!(
                    duration_ms = elapsed.as_millis() as u64,
                    snapshot_count,
                    subscribers = self.subscriber_count(),
                    "tick completed"
                );
            }

            if elapsed > interval / 2 {
                warn!(
                    duration_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "tick exceeded 50% of interval"
                );
            }
        }
    }

    /// Closes and removes every subscriber.
    pub async fn close(&self) {
        let drained: Vec<Arc<Member>> = {
            let mut registry = self.registry_mut();
            registry.drain().map(|(_, member)| member).collect()
        };
        info!(subscribers = drained.len(), "closing broadcast hub");
        for member in drained {
            member.sink.close().await;
        }
    }

    async fn deliver(&self, member: &Member, snapshot: Arc<Snapshot>) -> Result<(), SinkError> {
        match tokio::time::timeout(self.write_timeout, member.send_newer(snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        }
    }

    fn remove(&self, id: SubscriberId) -> Option<Arc<Member>> {
        let (member, active) = {
            let mut registry = self.registry_mut();
            (registry.remove(&id), registry.len())
        };
        if member.is_some() {
            info!(subscriber = id, active_subscribers = active, "subscriber disconnected");
        }
        member
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Thresholds;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Records every snapshot; fails every write after the first `ok_writes`.
    struct RecordingSink {
        received: Mutex<Vec<Arc<Snapshot>>>,
        ok_writes: usize,
        /// Extra latency on the very first write.
        welcome_delay: Duration,
        closed: AtomicUsize,
    }

    impl RecordingSink {
        fn healthy() -> Arc<Self> {
            Self::failing_after(usize::MAX)
        }

        fn failing_after(ok_writes: usize) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                ok_writes,
                welcome_delay: Duration::ZERO,
                closed: AtomicUsize::new(0),
            })
        }

        fn slow_welcome(welcome_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                ok_writes: usize::MAX,
                welcome_delay,
                closed: AtomicUsize::new(0),
            })
        }

        fn received(&self) -> Vec<Arc<Snapshot>> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotSink for RecordingSink {
        async fn send(&self, snapshot: Arc<Snapshot>) -> Result<(), SinkError> {
            let first = self.received.lock().unwrap().is_empty();
            if first && !self.welcome_delay.is_zero() {
                tokio::time::sleep(self.welcome_delay).await;
            }
            let mut received = self.received.lock().unwrap();
            if received.len() >= self.ok_writes {
                return Err(SinkError::Write("broken pipe".to_string()));
            }
            received.push(snapshot);
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Accepts the welcome, then hangs on every later write.
    struct StallingSink {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSink for StallingSink {
        async fn send(&self, _snapshot: Arc<Snapshot>) -> Result<(), SinkError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    }

    fn hub(write_timeout: Duration) -> BroadcastHub {
        let collector = SnapshotCollector::new(Thresholds::default(), Duration::from_secs(1));
        BroadcastHub::new(Arc::new(collector), write_timeout)
    }

    #[tokio::test]
    async fn failed_subscriber_is_dropped_and_others_still_receive() {
        let hub = hub(Duration::from_secs(1));
        let a = RecordingSink::healthy();
        let b = RecordingSink::failing_after(1);
        let c = RecordingSink::healthy();
        hub.subscribe(a.clone()).await.unwrap();
        let b_id = hub.subscribe(b.clone()).await.unwrap();
        hub.subscribe(c.clone()).await.unwrap();
        assert_eq!(hub.subscriber_count(), 3);

        let snapshot = hub.tick().await;

        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.state(b_id), SubscriberState::Closed);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);
        for sink in [&a, &c] {
            let received = sink.received();
            assert_eq!(received.len(), 2);
            assert!(Arc::ptr_eq(received.last().unwrap(), &snapshot));
        }
    }

    #[tokio::test]
    async fn welcome_collects_when_nothing_cached() {
        let hub = hub(Duration::from_secs(1));
        assert!(hub.latest().is_none());

        let sink = RecordingSink::healthy();
        let id = hub.subscribe(sink.clone()).await.unwrap();

        assert_eq!(hub.state(id), SubscriberState::Subscribed);
        assert_eq!(sink.received().len(), 1);
        assert!(Arc::ptr_eq(&sink.received()[0], &hub.latest().unwrap()));
    }

    #[tokio::test]
    async fn welcome_reuses_latest_snapshot() {
        let hub = hub(Duration::from_secs(1));
        let latest = hub.tick().await;

        let sink = RecordingSink::healthy();
        hub.subscribe(sink.clone()).await.unwrap();

        assert!(Arc::ptr_eq(&sink.received()[0], &latest));
    }

    #[tokio::test]
    async fn failed_welcome_is_not_registered() {
        let hub = hub(Duration::from_secs(1));
        let sink = RecordingSink::failing_after(0);

        let err = hub.subscribe(sink.clone()).await.unwrap_err();

        assert!(matches!(err, SinkError::Write(_)));
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_subscriber_times_out_without_delaying_others() {
        let hub = hub(Duration::from_millis(50));
        let stalled = Arc::new(StallingSink {
            writes: AtomicUsize::new(0),
        });
        let healthy = RecordingSink::healthy();
        hub.subscribe(stalled).await.unwrap();
        hub.subscribe(healthy.clone()).await.unwrap();

        let t0 = Instant::now();
        let report = hub.broadcast(Arc::new(hub.pull().await)).await;

        assert!(t0.elapsed() < Duration::from_secs(2));
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(healthy.received().len(), 2);
    }

    #[tokio::test]
    async fn unregister_closes_subscriber() {
        let hub = hub(Duration::from_secs(1));
        let sink = RecordingSink::healthy();
        let id = hub.subscribe(sink.clone()).await.unwrap();

        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert_eq!(hub.state(id), SubscriberState::Closed);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_welcome_never_lands_after_newer_tick() {
        let hub = Arc::new(hub(Duration::from_secs(1)));
        let sink = RecordingSink::slow_welcome(Duration::from_millis(100));

        let subscribing = tokio::spawn({
            let hub = Arc::clone(&hub);
            let sink = sink.clone();
            async move { hub.subscribe(sink).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let tick = hub.tick().await;
        subscribing.await.unwrap().unwrap();

        let received = sink.received();
        assert_eq!(received.len(), 2);
        assert!(received[0].timestamp < received[1].timestamp);
        assert!(Arc::ptr_eq(&received[1], &tick));
    }

    #[tokio::test]
    async fn older_snapshot_is_skipped() {
        let hub = hub(Duration::from_secs(1));
        let sink = RecordingSink::healthy();
        hub.subscribe(sink.clone()).await.unwrap();

        let older = Arc::new(hub.pull().await);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let newer = Arc::new(hub.pull().await);
        hub.broadcast(Arc::clone(&newer)).await;
        let report = hub.broadcast(older).await;

        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0 });
        let received = sink.received();
        assert_eq!(received.len(), 2);
        assert!(Arc::ptr_eq(&received[1], &newer));
    }

    #[tokio::test]
    async fn pull_does_not_replace_latest() {
        let hub = hub(Duration::from_secs(1));
        let latest = hub.tick().await;

        let pulled = hub.pull().await;

        assert!(pulled.timestamp >= latest.timestamp);
        assert!(Arc::ptr_eq(&hub.latest().unwrap(), &latest));
    }

    #[tokio::test]
    async fn close_drains_registry() {
        let hub = hub(Duration::from_secs(1));
        let a = RecordingSink::healthy();
        let b = RecordingSink::healthy();
        hub.subscribe(a.clone()).await.unwrap();
        hub.subscribe(b.clone()).await.unwrap();

        hub.close().await;

        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_pushes_on_every_tick() {
        let hub = Arc::new(hub(Duration::from_secs(1)));
        let sink = RecordingSink::healthy();
        hub.subscribe(sink.clone()).await.unwrap();

        let task = tokio::spawn(Arc::clone(&hub).run(Duration::from_millis(40)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        task.abort();

        // Welcome plus at least the immediate first tick and one more.
        assert!(sink.received().len() >= 3, "got {}", sink.received().len());
        let received = sink.received();
        assert!(
            received
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp)
        );
    }
}
