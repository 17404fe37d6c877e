//! In-process event broker.
//!
//! Fans progress events out to subscribers keyed by job id and keeps an
//! accumulated-code cache per job so late joiners can be brought up to date
//! with a single replay. One instance per process, constructed explicitly
//! and shared via `Arc` with no module-level globals, so every test can build a
//! fresh broker.
//!
//! The broker is a best-effort acceleration layer: delivery failures are
//! logged and skipped, and the durable job record remains authoritative.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;

use crate::models::{EventPayload, StreamEvent};

/// How long topic state survives after a terminal event, so slow subscribers
/// can finish draining before the cache and subscriber set are evicted.
pub const EVICTION_GRACE: Duration = Duration::from_secs(5);

/// Subscriber callback. A returned error is logged and the subscriber is
/// skipped for that event; it never blocks delivery to others.
pub type SubscriberFn = Arc<dyn Fn(&StreamEvent) -> Result<()> + Send + Sync>;

struct Topic {
    subscribers: Vec<(u64, SubscriberFn)>,
    /// Concatenation of all code-chunk payloads seen so far, in arrival
    /// order. Monotonically non-decreasing in length until eviction.
    cache: String,
    /// Identity of this topic incarnation; a scheduled eviction only fires
    /// if the generation still matches, so a topic re-created for a new run
    /// is never torn down by a stale timer.
    generation: u64,
}

pub struct EventBroker {
    topics: Mutex<HashMap<String, Topic>>,
    next_subscriber_id: AtomicU64,
    next_generation: AtomicU64,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        // A poisoned map means a panic mid-mutation; the topic map is plain
        // data, so continuing with it is safe.
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh_topic(&self) -> Topic {
        Topic {
            subscribers: Vec::new(),
            cache: String::new(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Register a subscriber for a job id. If accumulated code already
    /// exists, the callback immediately receives one synthetic `code-update`
    /// event carrying the full buffer before this returns, so a late joiner
    /// starts with full context instead of only future deltas.
    ///
    /// The returned guard unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, job_id: &str, callback: SubscriberFn) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let replay = {
            let mut topics = self.lock_topics();
            let topic = topics
                .entry(job_id.to_string())
                .or_insert_with(|| self.fresh_topic());
            topic.subscribers.push((id, Arc::clone(&callback)));
            if topic.cache.is_empty() {
                None
            } else {
                Some(StreamEvent::update(job_id, topic.cache.clone()))
            }
        };

        // Delivered outside the lock so a callback may re-enter the broker.
        if let Some(event) = replay {
            if let Err(e) = callback(&event) {
                tracing::warn!(job_id, subscriber = id, "Replay delivery failed: {:#}", e);
            }
        }

        Subscription {
            broker: Arc::downgrade(self),
            job_id: job_id.to_string(),
            id,
        }
    }

    /// Deliver an event to every subscriber of its job id, in registration
    /// order. `code-chunk` payloads are appended to the topic cache first. A
    /// terminal event schedules topic eviction after [`EVICTION_GRACE`].
    pub fn emit(self: &Arc<Self>, event: &StreamEvent) {
        let (subscribers, evict_generation) = {
            let mut topics = self.lock_topics();
            let topic = topics
                .entry(event.job_id.clone())
                .or_insert_with(|| self.fresh_topic());
            if let EventPayload::CodeChunk { code } = &event.payload {
                topic.cache.push_str(code);
            }
            let evict = event.is_terminal().then_some(topic.generation);
            (topic.subscribers.clone(), evict)
        };

        for (id, callback) in &subscribers {
            if let Err(e) = callback(event) {
                tracing::warn!(
                    job_id = %event.job_id,
                    subscriber = id,
                    "Subscriber delivery failed: {:#}",
                    e
                );
            }
        }

        if let Some(generation) = evict_generation {
            self.schedule_eviction(event.job_id.clone(), generation);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, job_id: String, generation: u64) {
        let broker = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(EVICTION_GRACE).await;
                    if let Some(broker) = broker.upgrade() {
                        broker.evict_if_current(&job_id, generation);
                    }
                });
            }
            Err(_) => {
                // No runtime to defer on; evict in place.
                self.evict_if_current(&job_id, generation);
            }
        }
    }

    /// Remove a topic, but only if it is still the incarnation the eviction
    /// was scheduled for. Cache and subscriber set go together: a topic is
    /// never left half-evicted.
    fn evict_if_current(&self, job_id: &str, generation: u64) {
        let mut topics = self.lock_topics();
        if topics
            .get(job_id)
            .is_some_and(|t| t.generation == generation)
        {
            topics.remove(job_id);
            tracing::debug!(job_id, "Evicted topic after terminal grace period");
        }
    }

    /// Current accumulated code for a job id; empty if none.
    pub fn accumulated(&self, job_id: &str) -> String {
        self.lock_topics()
            .get(job_id)
            .map(|t| t.cache.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.lock_topics()
            .get(job_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop topic state immediately. Test isolation hook.
    pub fn clear(&self, job_id: &str) {
        self.lock_topics().remove(job_id);
    }

    fn remove_subscriber(&self, job_id: &str, id: u64) {
        let mut topics = self.lock_topics();
        if let Some(topic) = topics.get_mut(job_id) {
            topic.subscribers.retain(|(sid, _)| *sid != id);
            if topic.subscribers.is_empty() && topic.cache.is_empty() {
                // Nothing left worth keeping; collect the topic now.
                topics.remove(job_id);
            }
        }
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription guard returned by [`EventBroker::subscribe`]. Dropping it
/// (or calling [`Subscription::unsubscribe`]) removes the subscriber.
pub struct Subscription {
    broker: Weak<EventBroker>,
    job_id: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_subscriber(&self.job_id, self.id);
        }
    }
}
