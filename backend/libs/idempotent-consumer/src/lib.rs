//! # Idempotent Consumer Library
//!
//! Check-and-set deduplication for at-least-once event processing. Each
//! processor records the event ids it has handled per entity key, so a
//! redelivered event (after a rebalance, a retry or a crash before commit)
//! does not repeat its side effects.
//!
//! ## Architecture
//!
//! ```text
//! Kafka → Worker → IdempotencyGuard::try_claim(scope, entity, event_id)
//!                        │
//!             ┌──────────┼──────────────┐
//!          Claimed   AlreadyProcessed  InFlight
//!             │          (skip)        (retry later)
//!       processor runs
//!             │
//!     token.complete()  ── or drop → claim released
//! ```
//!
//! ## Usage Example
//!
//! ```rust
//! use idempotent_consumer::{ClaimOutcome, GuardConfig, IdempotencyGuard};
//!
//! let guard = IdempotencyGuard::new(GuardConfig::default());
//!
//! match guard.try_claim("form-processor", "form-42", "evt-1").unwrap() {
//!     ClaimOutcome::Claimed(token) => {
//!         // side effects here
//!         token.complete();
//!     }
//!     ClaimOutcome::AlreadyProcessed => {}
//!     ClaimOutcome::InFlight => {}
//! }
//!
//! assert!(guard.is_processed("form-processor", "form-42", "evt-1").unwrap());
//! ```
//!
//! ## Bounds
//!
//! - **Per key**: only the most recent `ids_per_key` event ids are kept
//! - **Keys**: past `max_keys`, the least recently touched idle keys are evicted
//! - **Retention**: `cleanup_old_events` drops ids older than `retention`
//!
//! ## Concurrency Safety
//!
//! A claim is taken under the shard lock of the entity key, so when ten
//! workers race on the same event id exactly one gets `Claimed`. The rest see
//! `InFlight` until the holder completes, after which they see
//! `AlreadyProcessed`.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Result of processing an event with idempotency check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Event was processed successfully (first time)
    Success,

    /// Event was already processed before (duplicate)
    AlreadyProcessed,

    /// Event processing failed with error message
    Failed(String),
}

impl ProcessingResult {
    /// Check if processing was successful (either first time or already processed)
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Success | ProcessingResult::AlreadyProcessed
        )
    }

    /// Check if processing failed
    pub fn is_failed(&self) -> bool {
        matches!(self, ProcessingResult::Failed(_))
    }
}

/// Bounds for the in-memory store
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Maximum number of (scope, entity) keys tracked
    pub max_keys: usize,
    /// Recent event ids remembered per key
    pub ids_per_key: usize,
    /// How long a processed id is remembered
    pub retention: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_keys: 100_000,
            ids_per_key: 64,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Processor scope plus entity key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub scope: String,
    pub key: String,
}

impl EntityKey {
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.key)
    }
}

#[derive(Default)]
struct KeyState {
    processed: VecDeque<(String, Instant)>,
    in_flight: HashSet<String>,
    touched: Option<Instant>,
}

impl KeyState {
    fn contains(&self, event_id: &str) -> bool {
        self.processed.iter().any(|(id, _)| id == event_id)
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }
}

struct Inner {
    config: GuardConfig,
    entries: DashMap<EntityKey, KeyState>,
}

impl Inner {
    fn finish(&self, key: &EntityKey, event_id: &str, succeeded: bool) {
        if let Some(mut state) = self.entries.get_mut(key) {
            state.in_flight.remove(event_id);
            if succeeded {
                push_bounded(&mut state, event_id, self.config.ids_per_key);
            }
        }
    }
}

fn push_bounded(state: &mut KeyState, event_id: &str, limit: usize) {
    let now = Instant::now();
    if !state.contains(event_id) {
        state.processed.push_back((event_id.to_string(), now));
    }
    while state.processed.len() > limit.max(1) {
        state.processed.pop_front();
    }
    state.touched = Some(now);
}

/// Outcome of [`IdempotencyGuard::try_claim`]
pub enum ClaimOutcome {
    /// Caller owns the event; call [`ClaimToken::complete`] once side effects are durable
    Claimed(ClaimToken),
    /// The event id is already recorded for this key
    AlreadyProcessed,
    /// Another worker holds the claim right now
    InFlight,
}

impl fmt::Debug for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimOutcome::Claimed(token) => write!(f, "Claimed({})", token.event_id),
            ClaimOutcome::AlreadyProcessed => write!(f, "AlreadyProcessed"),
            ClaimOutcome::InFlight => write!(f, "InFlight"),
        }
    }
}

/// Exclusive claim on one (scope, entity, event id)
///
/// Dropping the token without completing releases the claim so the event can
/// be processed again.
pub struct ClaimToken {
    inner: Arc<Inner>,
    key: EntityKey,
    event_id: String,
    completed: bool,
}

impl ClaimToken {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Record the event as processed
    pub fn complete(mut self) {
        self.completed = true;
        self.inner.finish(&self.key, &self.event_id, true);
        debug!(entity = %self.key, event_id = %self.event_id, "Event marked as processed");
    }
}

impl Drop for ClaimToken {
    fn drop(&mut self) {
        if !self.completed {
            self.inner.finish(&self.key, &self.event_id, false);
        }
    }
}

/// Idempotency guard for event processing
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct IdempotencyGuard {
    inner: Arc<Inner>,
}

impl IdempotencyGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    /// Atomically check the event id and claim it when unseen
    pub fn try_claim(
        &self,
        scope: &str,
        entity_key: &str,
        event_id: &str,
    ) -> IdempotencyResult<ClaimOutcome> {
        Self::validate_event_id(event_id)?;

        let key = EntityKey::new(scope, entity_key);
        let outcome = {
            let mut state = self.inner.entries.entry(key.clone()).or_default();
            state.touched = Some(Instant::now());

            if state.contains(event_id) {
                debug!(entity = %key, event_id = %event_id, "Event already processed");
                ClaimOutcome::AlreadyProcessed
            } else if !state.in_flight.insert(event_id.to_string()) {
                debug!(entity = %key, event_id = %event_id, "Event is in flight");
                ClaimOutcome::InFlight
            } else {
                ClaimOutcome::Claimed(ClaimToken {
                    inner: self.inner.clone(),
                    key,
                    event_id: event_id.to_string(),
                    completed: false,
                })
            }
        };

        self.evict_if_needed();
        Ok(outcome)
    }

    /// Check if an event has already been processed for the key
    pub fn is_processed(
        &self,
        scope: &str,
        entity_key: &str,
        event_id: &str,
    ) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;

        let key = EntityKey::new(scope, entity_key);
        Ok(self
            .inner
            .entries
            .get(&key)
            .map(|state| state.contains(event_id))
            .unwrap_or(false))
    }

    /// Record an event as processed without a claim
    ///
    /// Returns `true` when the id was newly recorded.
    pub fn mark_processed(
        &self,
        scope: &str,
        entity_key: &str,
        event_id: &str,
    ) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;

        let key = EntityKey::new(scope, entity_key);
        let inserted = {
            let mut state = self.inner.entries.entry(key).or_default();
            let fresh = !state.contains(event_id);
            push_bounded(&mut state, event_id, self.inner.config.ids_per_key);
            fresh
        };

        self.evict_if_needed();
        Ok(inserted)
    }

    /// Run `f` only if the event is new for the key
    ///
    /// - `Success` when `f` ran and succeeded (the id is recorded)
    /// - `AlreadyProcessed` when the id was seen before
    /// - `Failed(msg)` when `f` failed (the claim is released)
    /// - `Err(InFlight)` when another worker holds the claim
    pub async fn process_if_new<F, Fut>(
        &self,
        scope: &str,
        entity_key: &str,
        event_id: &str,
        f: F,
    ) -> IdempotencyResult<ProcessingResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        let token = match self.try_claim(scope, entity_key, event_id)? {
            ClaimOutcome::Claimed(token) => token,
            ClaimOutcome::AlreadyProcessed => return Ok(ProcessingResult::AlreadyProcessed),
            ClaimOutcome::InFlight => {
                return Err(IdempotencyError::InFlight {
                    entity: EntityKey::new(scope, entity_key).to_string(),
                    event_id: event_id.to_string(),
                })
            }
        };

        match f().await {
            Ok(()) => {
                token.complete();
                Ok(ProcessingResult::Success)
            }
            Err(e) => {
                warn!(
                    entity = %token.key(),
                    event_id = %event_id,
                    error = ?e,
                    "Event processing failed"
                );
                Ok(ProcessingResult::Failed(e.to_string()))
            }
        }
    }

    /// Drop processed ids older than the retention window
    ///
    /// Returns the number of ids removed. Keys left without ids or claims are
    /// removed too.
    pub fn cleanup_old_events(&self) -> u64 {
        let retention = self.inner.config.retention;
        let mut deleted: u64 = 0;

        self.inner.entries.retain(|_, state| {
            let before = state.processed.len();
            state
                .processed
                .retain(|(_, processed_at)| processed_at.elapsed() < retention);
            deleted += (before - state.processed.len()) as u64;
            !(state.processed.is_empty() && state.in_flight.is_empty())
        });

        if deleted > 0 {
            info!(
                deleted_count = deleted,
                remaining_keys = self.inner.entries.len(),
                "Cleaned up old processed events"
            );
        } else {
            debug!("No old events to cleanup");
        }

        deleted
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn evict_if_needed(&self) {
        let max_keys = self.inner.config.max_keys;
        let len = self.inner.entries.len();
        if len <= max_keys {
            return;
        }

        // Evict a little below the limit so the scan does not run on every claim
        let target = len - max_keys + max_keys / 100;
        let mut idle: Vec<(EntityKey, Option<Instant>)> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.value().is_idle())
            .map(|entry| (entry.key().clone(), entry.value().touched))
            .collect();
        idle.sort_by_key(|(_, touched)| *touched);

        let mut evicted = 0;
        for (key, _) in idle.into_iter().take(target) {
            if self
                .inner
                .entries
                .remove_if(&key, |_, state| state.is_idle())
                .is_some()
            {
                evicted += 1;
            }
        }

        debug!(evicted, remaining = self.inner.entries.len(), "Evicted idle keys");
    }

    /// Validate event_id format
    fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
        if event_id.is_empty() {
            return Err(IdempotencyError::InvalidEventId(
                "Event ID cannot be empty".to_string(),
            ));
        }

        if event_id.len() > 255 {
            return Err(IdempotencyError::InvalidEventId(format!(
                "Event ID too long: {} characters (max 255)",
                event_id.len()
            )));
        }

        Ok(())
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}
