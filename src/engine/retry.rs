//! Transient-failure retry queue
//!
//! Tracks per-item exponential backoff state for entities whose last
//! attempt failed transiently. The engine's loop sleeps until the earliest
//! due time and re-offers every due item to its pending set; a later
//! success (or terminal outcome) clears the item's state, resetting the
//! escalation.

use crate::domain::tags::{AttachmentId, StorageKind, Tag};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Retry Policy
// =============================================================================

/// Backoff shape for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            // Deterministic intervals; retries never give up on their own.
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

// =============================================================================
// Work Items
// =============================================================================

/// One retryable unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkItem {
    Storage(StorageKind, Tag),
    Attachment(StorageKind, AttachmentId),
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::Storage(_, tag) => write!(f, "{tag}"),
            WorkItem::Attachment(_, id) => write!(f, "{id}"),
        }
    }
}

// =============================================================================
// Retry Queue
// =============================================================================

#[derive(Debug)]
struct RetryEntry {
    backoff: ExponentialBackoff,
    due: Option<Instant>,
}

/// Per-item backoff state and due times.
#[derive(Debug)]
pub struct RetryQueue {
    policy: RetryPolicy,
    entries: BTreeMap<WorkItem, RetryEntry>,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: BTreeMap::new(),
        }
    }

    /// Record a transient failure for `item`, returning the delay before
    /// its next attempt. Consecutive failures escalate; the escalation
    /// survives the item being taken and re-offered.
    pub fn schedule(&mut self, item: WorkItem, now: Instant) -> Duration {
        let entry = self.entries.entry(item).or_insert_with(|| RetryEntry {
            backoff: self.policy.backoff(),
            due: None,
        });
        // max_elapsed_time is None, so next_backoff always yields.
        let delay = entry
            .backoff
            .next_backoff()
            .unwrap_or(self.policy.max_interval);
        entry.due = Some(now + delay);
        delay
    }

    /// Forget an item's backoff state after a success or terminal outcome.
    pub fn clear(&mut self, item: &WorkItem) {
        self.entries.remove(item);
    }

    /// The earliest due time across all scheduled items.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.values().filter_map(|entry| entry.due).min()
    }

    /// Take every item due at `now` for re-offering. The items' backoff
    /// state is kept so another failure keeps escalating.
    pub fn take_due(&mut self, now: Instant) -> Vec<WorkItem> {
        let mut due = Vec::new();
        for (item, entry) in &mut self.entries {
            if matches!(entry.due, Some(at) if at <= now) {
                entry.due = None;
                due.push(item.clone());
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::Storage(StorageKind::Volume, Tag::volume("1"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_escalates_and_caps() {
        let mut queue = RetryQueue::new(RetryPolicy {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(4),
        });

        let now = Instant::now();
        assert_eq!(queue.schedule(item(), now), Duration::from_secs(1));
        assert_eq!(queue.schedule(item(), now), Duration::from_secs(2));
        assert_eq!(queue.schedule(item(), now), Duration::from_secs(4));
        // Capped.
        assert_eq!(queue.schedule(item(), now), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_escalation() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        let now = Instant::now();

        queue.schedule(item(), now);
        queue.schedule(item(), now);
        queue.clear(&item());
        assert!(queue.is_empty());

        assert_eq!(queue.schedule(item(), now), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_due_keeps_state() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        let now = Instant::now();

        queue.schedule(item(), now);
        assert!(queue.take_due(now).is_empty());

        let later = now + Duration::from_secs(1);
        assert_eq!(queue.take_due(later), vec![item()]);
        // Nothing due any more, but the escalation survives.
        assert!(queue.take_due(later).is_empty());
        assert_eq!(queue.next_due(), None);
        assert_eq!(queue.schedule(item(), later), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_due_is_earliest() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        let now = Instant::now();

        let slow = WorkItem::Storage(StorageKind::Volume, Tag::volume("slow"));
        queue.schedule(slow.clone(), now);
        queue.schedule(slow, now); // due in 2s
        let fast = item();
        queue.schedule(fast, now); // due in 1s

        assert_eq!(queue.next_due(), Some(now + Duration::from_secs(1)));
    }
}
