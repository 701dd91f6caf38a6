//! Revoke-then-assign barrier between consumer group rebalances and partition workers
//!
//! A worker holds a [`PartitionLease`] for as long as it processes a partition.
//! On revoke the lease's token is cancelled and the rebalance callback waits
//! (bounded) for the lease to be dropped. A worker for a newly assigned
//! partition cannot obtain its lease while a previous one is still held.

use parking_lot::{Condvar, Mutex};
use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::TopicPartitionList;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kafka::message::TopicPartition;
use crate::metrics::KafkaMetrics;

#[derive(Default)]
struct Slot {
    held: bool,
    token: CancellationToken,
}

/// Tracks which partitions currently have a live worker
#[derive(Default)]
pub struct AssignmentBarrier {
    slots: Mutex<HashMap<TopicPartition, Slot>>,
    released: Condvar,
    notify: Notify,
    generation: AtomicU64,
}

impl AssignmentBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bumped on every completed assignment
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn mark_assigned(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait until no other worker holds `tp`, then take it
    pub async fn acquire(self: &Arc<Self>, tp: TopicPartition) -> PartitionLease {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.slots.lock();
                let slot = slots.entry(tp.clone()).or_default();
                if !slot.held {
                    slot.held = true;
                    slot.token = CancellationToken::new();
                    return PartitionLease {
                        barrier: Arc::clone(self),
                        token: slot.token.clone(),
                        tp,
                    };
                }
            }

            notified.await;
        }
    }

    /// Signal the workers of `tps` to stop
    pub fn revoke(&self, tps: &[TopicPartition]) {
        let slots = self.slots.lock();
        for tp in tps {
            if let Some(slot) = slots.get(tp) {
                slot.token.cancel();
            }
        }
    }

    /// Revoke and block the calling thread until the workers released their leases
    ///
    /// Returns `false` if `timeout` passed with a lease still held.
    pub fn revoke_and_wait(&self, tps: &[TopicPartition], timeout: Duration) -> bool {
        self.revoke(tps);

        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        while any_held(&slots, tps) {
            if self.released.wait_until(&mut slots, deadline).timed_out() {
                return !any_held(&slots, tps);
            }
        }
        true
    }

    /// Async counterpart of [`AssignmentBarrier::revoke_and_wait`]
    pub async fn drain(&self, tps: &[TopicPartition], timeout: Duration) -> bool {
        self.revoke(tps);

        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !any_held(&self.slots.lock(), tps) {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn is_held(&self, tp: &TopicPartition) -> bool {
        self.slots.lock().get(tp).is_some_and(|s| s.held)
    }

    pub fn held(&self) -> Vec<TopicPartition> {
        let mut held: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.held)
            .map(|(tp, _)| tp.clone())
            .collect();
        held.sort();
        held
    }

    fn release(&self, tp: &TopicPartition) {
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(tp) {
                slot.held = false;
            }
        }
        self.released.notify_all();
        self.notify.notify_waiters();
    }
}

fn any_held(slots: &HashMap<TopicPartition, Slot>, tps: &[TopicPartition]) -> bool {
    tps.iter()
        .any(|tp| slots.get(tp).is_some_and(|slot| slot.held))
}

/// Exclusive right to process one partition; released on drop
pub struct PartitionLease {
    barrier: Arc<AssignmentBarrier>,
    token: CancellationToken,
    tp: TopicPartition,
}

impl PartitionLease {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// Cancelled when the partition is revoked
    pub fn revoked(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PartitionLease {
    fn drop(&mut self) {
        self.barrier.release(&self.tp);
    }
}

impl std::fmt::Debug for PartitionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLease")
            .field("tp", &self.tp)
            .field("revoked", &self.token.is_cancelled())
            .finish()
    }
}

/// Consumer context that holds revocation until partition workers have drained
pub struct RebalanceContext {
    barrier: Arc<AssignmentBarrier>,
    drain_timeout: Duration,
    metrics: KafkaMetrics,
}

impl RebalanceContext {
    pub fn new(barrier: Arc<AssignmentBarrier>, drain_timeout: Duration, metrics: KafkaMetrics) -> Self {
        Self {
            barrier,
            drain_timeout,
            metrics,
        }
    }
}

pub(crate) fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let revoked = partitions_of(tpl);
                self.metrics.rebalances_total.with_label_values(&["revoke"]).inc();
                info!(partitions = ?revoked, "Partitions revoked, draining workers");

                if !self.barrier.revoke_and_wait(&revoked, self.drain_timeout) {
                    warn!(
                        timeout_ms = self.drain_timeout.as_millis() as u64,
                        "Partition workers did not drain before revoke deadline"
                    );
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!("Rebalance error: {}", e),
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned = partitions_of(tpl);
            self.barrier.mark_assigned();
            self.metrics.rebalances_total.with_label_values(&["assign"]).inc();
            info!(partitions = ?assigned, "Partitions assigned");
        }
    }
}
