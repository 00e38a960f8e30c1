//! Prioritized asynchronous outbound message queue.
//!
//! Four priority bands (Critical first), FIFO within a band. Workers pull
//! batches and hand each message to an injected [`Delivery`] implementation;
//! a failed delivery re-enters through the retry queue until the retry budget
//! is spent, at which point a failure event is emitted exactly once. Retried
//! messages rejoin the *back* of their band; ordering is only guaranteed up
//! to the first delivery attempt.
//!
//! Flow control: at `max_queue_size` the queue sheds load. With flow control
//! enabled, Normal/Low messages are dropped (a `queue_full` event fires);
//! Critical/High enqueues, or any enqueue with flow control off, are
//! rejected back to the producer instead. Above `flow_control_threshold` the
//! health tick emits a warning each pass.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::Serialize,
    tokio::sync::{Notify, broadcast},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

pub mod types;

pub use types::{OutboundMessage, Priority, Target};

/// Delivery sink for drained messages. Implemented by the acceptor, which
/// owns the client table; the queue never holds a reference back into the
/// server.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Attempt to deliver one message. `false` requests a retry.
    async fn deliver(&self, message: &OutboundMessage) -> bool;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub max_queue_size: usize,
    pub flow_control_threshold: usize,
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Idle worker wake-up period when no notification arrives.
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub enable_flow_control: bool,
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 50,
            max_queue_size: 10_000,
            flow_control_threshold: 8_000,
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            health_interval: Duration::from_secs(30),
            enable_flow_control: true,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// Flow control shed a droppable (Normal/Low) message.
    #[error("queue full, message dropped")]
    Dropped,

    /// The enqueue was refused outright.
    #[error("queue full, enqueue rejected")]
    Rejected,

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Events observers can subscribe to.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Terminal outcome for one message: delivered, or dropped after the
    /// retry budget. Emitted exactly once per message.
    Processed { message_id: String, success: bool },
    /// The queue hit its cap or crossed the flow-control threshold.
    QueueFull { size: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub current_queue_size: usize,
    pub retry_queue_size: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub messages_per_second: u64,
    pub worker_count: usize,
    pub max_queue_size: usize,
    pub batch_size: usize,
}

struct QueueInner {
    /// One FIFO per priority band, indexed by `Priority::index`.
    bands: [VecDeque<OutboundMessage>; 4],
    retry: VecDeque<OutboundMessage>,
}

pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    message_available: Notify,
    config: QueueConfig,
    shutdown: CancellationToken,
    size: AtomicUsize,
    id_counter: AtomicU64,
    total_enqueued: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_retried: AtomicU64,
    tick_counter: AtomicU64,
    rate_gauge: AtomicU64,
    events: broadcast::Sender<QueueEvent>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                bands: [const { VecDeque::new() }; 4],
                retry: VecDeque::new(),
            }),
            message_available: Notify::new(),
            config,
            shutdown: CancellationToken::new(),
            size: AtomicUsize::new(0),
            id_counter: AtomicU64::new(0),
            total_enqueued: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_retried: AtomicU64::new(0),
            tick_counter: AtomicU64::new(0),
            rate_gauge: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Enqueue a message for a user or client. Returns the assigned id.
    pub fn enqueue(
        &self,
        target: Target,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<String, EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::ShuttingDown);
        }

        let size = self.size.load(Ordering::Acquire);
        if size >= self.config.max_queue_size {
            let _ = self.events.send(QueueEvent::QueueFull { size });
            if self.config.enable_flow_control && priority >= Priority::Normal {
                warn!(size, ?priority, "queue full, dropping message");
                return Err(EnqueueError::Dropped);
            }
            error!(size, ?priority, "queue full, rejecting enqueue");
            return Err(EnqueueError::Rejected);
        }

        let message = OutboundMessage {
            message_id: self.generate_message_id(),
            target,
            payload,
            priority,
            enqueued_at: roost_common::epoch_millis(),
            retry_count: 0,
        };
        let id = message.message_id.clone();

        if let Ok(mut inner) = self.inner.lock() {
            inner.bands[priority.index()].push_back(message);
        }
        self.size.fetch_add(1, Ordering::AcqRel);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.message_available.notify_one();
        Ok(id)
    }

    /// Enqueue the same payload for many users; returns how many enqueues
    /// succeeded.
    pub fn enqueue_for_users(
        &self,
        user_ids: &[String],
        payload: &serde_json::Value,
        priority: Priority,
    ) -> usize {
        user_ids
            .iter()
            .filter(|user_id| {
                self.enqueue(Target::User((*user_id).clone()), payload.clone(), priority)
                    .is_ok()
            })
            .count()
    }

    pub fn queue_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self.size.load(Ordering::Acquire) < self.config.flow_control_threshold
    }

    pub fn statistics(&self) -> QueueStatistics {
        let retry_queue_size = self.inner.lock().map(|i| i.retry.len()).unwrap_or(0);
        QueueStatistics {
            current_queue_size: self.queue_size(),
            retry_queue_size,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            messages_per_second: self.rate_gauge.load(Ordering::Relaxed),
            worker_count: self.config.worker_count,
            max_queue_size: self.config.max_queue_size,
            batch_size: self.config.batch_size,
        }
    }

    /// Spawn the worker pool plus the retry and health tickers. The returned
    /// handles finish after [`MessageQueue::shutdown`].
    pub fn start(self: &Arc<Self>, delivery: Arc<dyn Delivery>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count + 2);
        for worker in 0..self.config.worker_count {
            let queue = Arc::clone(self);
            let delivery = Arc::clone(&delivery);
            handles.push(tokio::spawn(async move {
                queue.run_worker(worker, delivery).await;
            }));
        }

        let queue = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            queue.run_retry_tick().await;
        }));

        let queue = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            queue.run_health_tick().await;
        }));

        info!(
            workers = self.config.worker_count,
            batch = self.config.batch_size,
            max = self.config.max_queue_size,
            "message queue started"
        );
        handles
    }

    /// Drain for up to the grace period, then stop the workers and discard
    /// whatever is left.
    pub async fn shutdown(&self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.queue_size() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.shutdown.cancel();
        self.message_available.notify_waiters();

        let discarded = self
            .inner
            .lock()
            .map(|mut inner| {
                let count =
                    inner.bands.iter().map(VecDeque::len).sum::<usize>() + inner.retry.len();
                for band in &mut inner.bands {
                    band.clear();
                }
                inner.retry.clear();
                count
            })
            .unwrap_or(0);
        self.size.store(0, Ordering::Release);
        if discarded > 0 {
            warn!(discarded, "message queue shut down with undelivered messages");
        } else {
            info!("message queue shut down");
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn run_worker(&self, worker: usize, delivery: Arc<dyn Delivery>) {
        debug!(worker, "queue worker started");
        loop {
            let batch = self.next_batch(self.config.batch_size);
            if batch.is_empty() {
                if self.shutdown.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => {},
                    _ = self.message_available.notified() => {},
                    _ = tokio::time::sleep(self.config.poll_interval) => {},
                }
                continue;
            }

            for message in batch {
                if self.shutdown.is_cancelled() {
                    return;
                }
                let success = delivery.deliver(&message).await;
                if success {
                    self.total_processed.fetch_add(1, Ordering::Relaxed);
                    self.tick_counter.fetch_add(1, Ordering::Relaxed);
                    let _ = self.events.send(QueueEvent::Processed {
                        message_id: message.message_id,
                        success: true,
                    });
                } else if message.retry_count < self.config.max_retries {
                    let mut retry = message;
                    retry.retry_count += 1;
                    self.total_retried.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut inner) = self.inner.lock() {
                        inner.retry.push_back(retry);
                    }
                } else {
                    self.total_failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        message_id = %message.message_id,
                        retries = message.retry_count,
                        "message dropped after retry budget"
                    );
                    let _ = self.events.send(QueueEvent::Processed {
                        message_id: message.message_id,
                        success: false,
                    });
                }
            }
        }
        debug!(worker, "queue worker stopped");
    }

    /// Move everything in the retry queue to the back of its priority band.
    async fn run_retry_tick(&self) {
        let mut tick = tokio::time::interval(self.config.retry_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {},
            }
            let moved = self
                .inner
                .lock()
                .map(|mut inner| {
                    let mut moved = 0;
                    while let Some(message) = inner.retry.pop_front() {
                        let band = message.priority.index();
                        inner.bands[band].push_back(message);
                        moved += 1;
                    }
                    moved
                })
                .unwrap_or(0);
            if moved > 0 {
                self.size.fetch_add(moved, Ordering::AcqRel);
                self.message_available.notify_waiters();
            }
        }
    }

    /// Reset the throughput counter and warn when the backlog is high.
    async fn run_health_tick(&self) {
        let mut tick = tokio::time::interval(self.config.health_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let secs = self.config.health_interval.as_secs().max(1);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {},
            }
            let processed = self.tick_counter.swap(0, Ordering::Relaxed);
            self.rate_gauge.store(processed / secs, Ordering::Relaxed);

            let size = self.queue_size();
            if size >= self.config.flow_control_threshold {
                warn!(
                    size,
                    max = self.config.max_queue_size,
                    "queue backlog above flow-control threshold"
                );
                let _ = self.events.send(QueueEvent::QueueFull { size });
            }
        }
    }

    /// Pop up to `limit` messages, highest band first, FIFO within a band.
    fn next_batch(&self, limit: usize) -> Vec<OutboundMessage> {
        let mut batch = Vec::new();
        if let Ok(mut inner) = self.inner.lock() {
            for band in &mut inner.bands {
                while batch.len() < limit {
                    match band.pop_front() {
                        Some(message) => batch.push(message),
                        None => break,
                    }
                }
                if batch.len() == limit {
                    break;
                }
            }
        }
        if !batch.is_empty() {
            self.size.fetch_sub(batch.len(), Ordering::AcqRel);
        }
        batch
    }

    fn generate_message_id(&self) -> String {
        format!(
            "msg_{}_{}",
            roost_common::epoch_millis(),
            self.id_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct RecordingDelivery {
        delivered: Mutex<Vec<OutboundMessage>>,
        fail_first: AtomicUsize,
    }

    impl RecordingDelivery {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(0),
            })
        }

        fn failing(n: usize) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(n),
            })
        }

        fn ids(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.message_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, message: &OutboundMessage) -> bool {
            let remaining = self.fail_first.load(Ordering::Acquire);
            if remaining > 0 {
                self.fail_first.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            self.delivered.lock().unwrap().push(message.clone());
            true
        }
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({"action": "notify"})
    }

    fn small_config() -> QueueConfig {
        QueueConfig {
            worker_count: 1,
            retry_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_millis(500),
            ..QueueConfig::default()
        }
    }

    #[test]
    fn message_ids_are_monotonic_and_distinct() {
        let queue = MessageQueue::new(QueueConfig::default());
        let a = queue.generate_message_id();
        let b = queue.generate_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with("msg_"));
    }

    #[tokio::test]
    async fn drains_in_priority_then_fifo_order() {
        let queue = MessageQueue::new(small_config());
        // 10 Low, then 1 Critical, then 10 Normal, all to the same user.
        let mut low_ids = Vec::new();
        for _ in 0..10 {
            low_ids.push(
                queue
                    .enqueue(Target::User("u1".into()), payload(), Priority::Low)
                    .unwrap(),
            );
        }
        let critical_id = queue
            .enqueue(Target::User("u1".into()), payload(), Priority::Critical)
            .unwrap();
        let mut normal_ids = Vec::new();
        for _ in 0..10 {
            normal_ids.push(
                queue
                    .enqueue(Target::User("u1".into()), payload(), Priority::Normal)
                    .unwrap(),
            );
        }

        // Single worker drains everything once started.
        let delivery = RecordingDelivery::new();
        let handles = queue.start(delivery.clone() as Arc<dyn Delivery>);
        tokio::time::timeout(Duration::from_secs(5), async {
            while delivery.ids().len() < 21 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }

        let mut expected = vec![critical_id];
        expected.extend(normal_ids);
        expected.extend(low_ids);
        assert_eq!(delivery.ids(), expected);
    }

    #[tokio::test]
    async fn failed_message_is_dropped_after_retry_budget_with_one_event() {
        let mut config = small_config();
        config.max_retries = 3;
        let queue = MessageQueue::new(config);
        let mut events = queue.subscribe();

        // Fail every attempt: 1 initial + 3 retries, then dropped.
        let delivery = RecordingDelivery::failing(usize::MAX);
        let id = queue
            .enqueue(Target::User("u1".into()), payload(), Priority::High)
            .unwrap();
        let handles = queue.start(delivery as Arc<dyn Delivery>);

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    QueueEvent::Processed { message_id, success } if message_id == id => {
                        return success;
                    },
                    _ => {},
                }
            }
        })
        .await
        .unwrap();
        assert!(!event, "terminal event must report failure");

        // No second terminal event for the same id.
        let extra = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                if let QueueEvent::Processed { message_id, .. } = events.recv().await.unwrap()
                    && message_id == id
                {
                    return;
                }
            }
        })
        .await;
        assert!(extra.is_err(), "duplicate terminal event");

        let stats = queue.statistics();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_retried, 3);

        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn retried_message_eventually_delivers() {
        let queue = MessageQueue::new(small_config());
        let delivery = RecordingDelivery::failing(2);
        let id = queue
            .enqueue(Target::Client("c1".into()), payload(), Priority::Normal)
            .unwrap();
        let handles = queue.start(delivery.clone() as Arc<dyn Delivery>);

        tokio::time::timeout(Duration::from_secs(5), async {
            while delivery.ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(delivery.ids(), vec![id]);
        assert_eq!(queue.statistics().total_retried, 2);

        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn flow_control_drops_normal_but_rejects_critical() {
        let config = QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        };
        let queue = MessageQueue::new(config);
        queue
            .enqueue(Target::User("u".into()), payload(), Priority::Normal)
            .unwrap();
        queue
            .enqueue(Target::User("u".into()), payload(), Priority::Normal)
            .unwrap();

        assert_eq!(
            queue
                .enqueue(Target::User("u".into()), payload(), Priority::Low)
                .unwrap_err(),
            EnqueueError::Dropped
        );
        assert_eq!(
            queue
                .enqueue(Target::User("u".into()), payload(), Priority::Critical)
                .unwrap_err(),
            EnqueueError::Rejected
        );
    }

    #[test]
    fn flow_control_off_rejects_everything_at_cap() {
        let config = QueueConfig {
            max_queue_size: 1,
            enable_flow_control: false,
            ..QueueConfig::default()
        };
        let queue = MessageQueue::new(config);
        queue
            .enqueue(Target::User("u".into()), payload(), Priority::Low)
            .unwrap();
        assert_eq!(
            queue
                .enqueue(Target::User("u".into()), payload(), Priority::Low)
                .unwrap_err(),
            EnqueueError::Rejected
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_new_messages() {
        let queue = MessageQueue::new(small_config());
        queue.shutdown().await;
        assert_eq!(
            queue
                .enqueue(Target::User("u".into()), payload(), Priority::High)
                .unwrap_err(),
            EnqueueError::ShuttingDown
        );
    }

    #[test]
    fn enqueue_for_users_counts_successes() {
        let config = QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        };
        let queue = MessageQueue::new(config);
        let users: Vec<String> = (0..4).map(|i| format!("u{i}")).collect();
        let sent = queue.enqueue_for_users(&users, &payload(), Priority::Normal);
        assert_eq!(sent, 2);
    }
}
