use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{EventBusError, Result};
use crate::kafka::base_client_config;
use crate::kafka::message::{InboundMessage, TopicPartition};
use crate::kafka::rebalance::{AssignmentBarrier, RebalanceContext};
use crate::metrics::KafkaMetrics;

/// Per-message callback; the offset is committed only when it returns `Ok`
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

/// Stores the next offset to consume for a partition
pub trait OffsetCommitter: Send + Sync {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;
}

struct WorkerHandle {
    tx: mpsc::Sender<InboundMessage>,
    join: JoinHandle<()>,
}

struct WorkerContext {
    handler: Arc<dyn MessageHandler>,
    committer: Arc<dyn OffsetCommitter>,
    barrier: Arc<AssignmentBarrier>,
    /// Failed partitions and the assignment generation they failed in
    failed: Mutex<HashMap<TopicPartition, u64>>,
    failures: mpsc::UnboundedSender<TopicPartition>,
    drain_timeout: Duration,
    metrics: KafkaMetrics,
}

impl WorkerContext {
    /// Whether messages for `tp` must be dropped; clears the mark once reassigned
    fn blocked(&self, tp: &TopicPartition) -> bool {
        let mut failed = self.failed.lock();
        match failed.get(tp).copied() {
            Some(generation) if self.barrier.generation() > generation => {
                failed.remove(tp);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// One sequential worker per assigned partition
///
/// Messages of a partition are handled strictly in order by that partition's
/// worker; different partitions run concurrently. A worker that fails stops
/// without committing, and further messages for its partition are dropped
/// until the next assignment (they are redelivered from the committed offset).
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    workers: HashMap<TopicPartition, WorkerHandle>,
    failures_rx: mpsc::UnboundedReceiver<TopicPartition>,
    queue_capacity: usize,
}

impl WorkerPool {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        committer: Arc<dyn OffsetCommitter>,
        barrier: Arc<AssignmentBarrier>,
        queue_capacity: usize,
        drain_timeout: Duration,
        metrics: KafkaMetrics,
    ) -> Self {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        Self {
            ctx: Arc::new(WorkerContext {
                handler,
                committer,
                barrier,
                failed: Mutex::new(HashMap::new()),
                failures,
                drain_timeout,
                metrics,
            }),
            workers: HashMap::new(),
            failures_rx,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn barrier(&self) -> &Arc<AssignmentBarrier> {
        &self.ctx.barrier
    }

    /// Hand a message to its partition's worker, starting one if needed
    ///
    /// Waits when the worker's queue is full.
    pub async fn dispatch(&mut self, message: InboundMessage) {
        let tp = message.topic_partition();

        let mut message = message;
        for _ in 0..2 {
            // A failing worker marks its partition before closing the queue
            if self.ctx.blocked(&tp) {
                debug!(partition = %tp, offset = message.offset, "Dropping message for failed partition");
                return;
            }

            let stale = self
                .workers
                .get(&tp)
                .map_or(true, |handle| handle.tx.is_closed());
            if stale {
                let handle = self.spawn_worker(tp.clone());
                self.workers.insert(tp.clone(), handle);
            }

            let tx = match self.workers.get(&tp) {
                Some(handle) => handle.tx.clone(),
                None => break,
            };
            match tx.send(message).await {
                Ok(()) => return,
                // The worker stopped between the check and the send
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }

        warn!(partition = %tp, offset = message.offset, "Partition worker unavailable, message left uncommitted");
    }

    /// Next partition whose worker stopped on a handler error
    pub async fn next_failure(&mut self) -> Option<TopicPartition> {
        self.failures_rx.recv().await
    }

    pub fn is_failed(&self, tp: &TopicPartition) -> bool {
        self.ctx.failed.lock().contains_key(tp)
    }

    /// Stop the workers of `tps` and wait (bounded) for them to finish
    pub async fn revoke(&mut self, tps: &[TopicPartition], timeout: Duration) -> bool {
        for tp in tps {
            self.workers.remove(tp);
        }
        self.ctx.barrier.drain(tps, timeout).await
    }

    pub fn active_workers(&self) -> usize {
        self.workers.values().filter(|h| !h.join.is_finished()).count()
    }

    /// Let workers finish their queued messages, aborting whatever is left after `timeout`
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        let mut joins: Vec<JoinHandle<()>> = self
            .workers
            .drain()
            .map(|(_, handle)| {
                drop(handle.tx);
                handle.join
            })
            .collect();

        let finished =
            tokio::time::timeout(timeout, futures::future::join_all(joins.iter_mut())).await;

        match finished {
            Ok(_) => true,
            Err(_) => {
                warn!(workers = joins.len(), "Drain timeout reached, aborting partition workers");
                for join in &joins {
                    join.abort();
                }
                false
            }
        }
    }

    fn spawn_worker(&self, tp: TopicPartition) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let ctx = Arc::clone(&self.ctx);
        let join = tokio::spawn(run_worker(ctx, tp, rx));
        WorkerHandle { tx, join }
    }
}

async fn run_worker(
    ctx: Arc<WorkerContext>,
    tp: TopicPartition,
    mut rx: mpsc::Receiver<InboundMessage>,
) {
    let lease = ctx.barrier.acquire(tp.clone()).await;
    let revoked = lease.revoked().clone();
    ctx.metrics.active_partition_workers.inc();
    debug!(partition = %tp, "Partition worker started");

    loop {
        let message = tokio::select! {
            biased;
            _ = revoked.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        // Once revoked, in-flight work gets the drain timeout to finish
        let abort = async {
            revoked.cancelled().await;
            tokio::time::sleep(ctx.drain_timeout).await;
        };

        let outcome = tokio::select! {
            result = ctx.handler.handle(&message) => Some(result),
            _ = abort => None,
        };

        match outcome {
            Some(Ok(())) => {
                match ctx
                    .committer
                    .commit(&message.topic, message.partition, message.offset + 1)
                {
                    Ok(()) => ctx.metrics.offsets_committed_total.inc(),
                    Err(e) => warn!(partition = %tp, offset = message.offset, "Offset commit failed: {}", e),
                }
            }
            Some(Err(e)) => {
                ctx.metrics.consumer_errors_total.inc();
                error!(
                    partition = %tp,
                    offset = message.offset,
                    "Handler failed, releasing partition: {}", e
                );
                ctx.failed.lock().insert(tp.clone(), ctx.barrier.generation());
                rx.close();
                let _ = ctx.failures.send(tp.clone());
                break;
            }
            None => {
                warn!(partition = %tp, offset = message.offset, "In-flight message aborted on revoke");
                break;
            }
        }
    }

    ctx.metrics.active_partition_workers.dec();
    debug!(partition = %tp, "Partition worker stopped");
    drop(lease);
}

/// Commits through the group consumer
pub struct KafkaOffsetCommitter {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
}

impl OffsetCommitter for KafkaOffsetCommitter {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| EventBusError::Kafka(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| EventBusError::Kafka(e.to_string()))
    }
}

/// Consumer group member that feeds a [`WorkerPool`]
pub struct PartitionedConsumer {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    topics: Vec<String>,
    pool: WorkerPool,
    drain_timeout: Duration,
    metrics: KafkaMetrics,
}

impl PartitionedConsumer {
    /// Create the consumer and join the group for `topics`
    pub fn subscribe(
        config: &KafkaConfig,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        queue_capacity: usize,
        drain_timeout: Duration,
        metrics: KafkaMetrics,
    ) -> Result<Self> {
        let barrier = AssignmentBarrier::new();
        let context = RebalanceContext::new(Arc::clone(&barrier), drain_timeout, metrics.clone());

        let consumer: StreamConsumer<RebalanceContext> = base_client_config(config)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                EventBusError::Kafka(e.to_string())
            })?;
        let consumer = Arc::new(consumer);

        subscribe_topics(&consumer, &topics)?;
        info!(group = %config.group_id, topics = ?topics, "Consumer subscribed");

        let committer = Arc::new(KafkaOffsetCommitter {
            consumer: Arc::clone(&consumer),
        });
        let pool = WorkerPool::new(
            handler,
            committer,
            barrier,
            queue_capacity,
            drain_timeout,
            metrics.clone(),
        );

        Ok(Self {
            consumer,
            topics,
            pool,
            drain_timeout,
            metrics,
        })
    }

    /// Consume until `cancel` fires, then drain the workers
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!("Starting partitioned consumer loop");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(tp) = self.pool.next_failure() => {
                    warn!(partition = %tp, "Releasing assignment after handler failure");
                    self.resubscribe()?;
                }
                received = self.consumer.recv() => match received {
                    Ok(msg) => {
                        self.metrics.messages_consumed_total.inc();
                        let message = to_inbound(&msg);
                        drop(msg);
                        self.pool.dispatch(message).await;
                    }
                    Err(e) => {
                        self.metrics.consumer_errors_total.inc();
                        error!("Kafka consumer error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        info!("Stopping consumption, draining partition workers");
        let drained = self.pool.shutdown(self.drain_timeout).await;
        self.consumer.unsubscribe();
        info!(drained, "Partitioned consumer stopped");
        Ok(())
    }

    fn resubscribe(&self) -> Result<()> {
        self.consumer.unsubscribe();
        subscribe_topics(&self.consumer, &self.topics)
    }
}

fn subscribe_topics(consumer: &StreamConsumer<RebalanceContext>, topics: &[String]) -> Result<()> {
    let names: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer.subscribe(&names).map_err(|e| {
        error!("Failed to subscribe to topics: {}", e);
        EventBusError::Kafka(e.to_string())
    })
}

fn to_inbound(msg: &BorrowedMessage<'_>) -> InboundMessage {
    let headers: BTreeMap<String, String> = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    h.value
                        .map(|v| (h.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: msg.payload().map(<[u8]>::to_vec),
        headers,
        timestamp_ms: msg.timestamp().to_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServiceMetrics;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<(i32, i64)>>,
        commits: Mutex<Vec<(i32, i64)>>,
        fail_offset: Option<i64>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &InboundMessage) -> Result<()> {
            if Some(message.offset) == self.fail_offset {
                return Err(EventBusError::BrokerUnavailable("dlq down".into()));
            }
            self.handled.lock().push((message.partition, message.offset));
            Ok(())
        }
    }

    impl OffsetCommitter for Recorder {
        fn commit(&self, _topic: &str, partition: i32, next_offset: i64) -> Result<()> {
            self.commits.lock().push((partition, next_offset));
            Ok(())
        }
    }

    fn message(partition: i32, offset: i64) -> InboundMessage {
        InboundMessage {
            topic: "cdc.forms".into(),
            partition,
            offset,
            key: None,
            payload: Some(b"{}".to_vec()),
            headers: BTreeMap::new(),
            timestamp_ms: None,
        }
    }

    fn pool(recorder: Arc<Recorder>) -> WorkerPool {
        let metrics = ServiceMetrics::new().unwrap();
        WorkerPool::new(
            recorder.clone(),
            recorder,
            AssignmentBarrier::new(),
            16,
            Duration::from_millis(200),
            metrics.kafka,
        )
    }

    #[tokio::test]
    async fn test_messages_handled_in_partition_order() {
        let recorder = Arc::new(Recorder::default());
        let mut pool = pool(recorder.clone());

        for offset in 0..5 {
            pool.dispatch(message(0, offset)).await;
            pool.dispatch(message(1, offset)).await;
        }
        assert!(pool.shutdown(Duration::from_secs(1)).await);

        let handled = recorder.handled.lock().clone();
        for partition in [0, 1] {
            let offsets: Vec<i64> = handled
                .iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, o)| *o)
                .collect();
            assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        }
        assert!(recorder.commits.lock().contains(&(0, 5)));
    }

    #[tokio::test]
    async fn test_failed_message_is_not_committed() {
        let recorder = Arc::new(Recorder {
            fail_offset: Some(1),
            ..Default::default()
        });
        let mut pool = pool(recorder.clone());

        pool.dispatch(message(0, 0)).await;
        pool.dispatch(message(0, 1)).await;

        let failed = tokio::time::timeout(Duration::from_secs(1), pool.next_failure())
            .await
            .unwrap();
        assert_eq!(failed, Some(TopicPartition::new("cdc.forms", 0)));

        // Dropped until the partition is assigned again
        pool.dispatch(message(0, 2)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert_eq!(*recorder.commits.lock(), vec![(0, 1)]);
        assert_eq!(*recorder.handled.lock(), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_closed_queue_of_failed_worker_does_not_restart_partition() {
        let recorder = Arc::new(Recorder {
            fail_offset: Some(1),
            ..Default::default()
        });
        let mut pool = pool(recorder.clone());
        let tp = TopicPartition::new("cdc.forms", 0);

        pool.dispatch(message(0, 0)).await;
        pool.dispatch(message(0, 1)).await;

        // Wait for the worker to stop without consuming the failure notice
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.active_workers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(pool.is_failed(&tp));

        pool.dispatch(message(0, 2)).await;
        pool.dispatch(message(0, 3)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert!(recorder.commits.lock().iter().all(|(_, next)| *next <= 1));
        assert_eq!(*recorder.handled.lock(), vec![(0, 0)]);
        assert_eq!(pool.next_failure().await, Some(tp));
    }

    #[tokio::test]
    async fn test_failed_partition_resumes_after_reassignment() {
        let recorder = Arc::new(Recorder {
            fail_offset: Some(0),
            ..Default::default()
        });
        let mut pool = pool(recorder.clone());

        pool.dispatch(message(3, 0)).await;
        pool.next_failure().await;
        assert!(pool.is_failed(&TopicPartition::new("cdc.forms", 3)));

        pool.barrier().mark_assigned();
        pool.dispatch(message(3, 1)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert!(!pool.is_failed(&TopicPartition::new("cdc.forms", 3)));
        assert_eq!(*recorder.handled.lock(), vec![(3, 1)]);
    }
}
