//! A rate-limited, de-duplicating work queue feeding the single reconcile worker.
//!
//! Two limiters are composed. Failed requests are re-added after a per-key exponential backoff (100ms doubling
//! up to 3s), and every request handed to the worker first takes a token from a global bucket of one request
//! per second with a burst of one.
use models::key::ObjectKey;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use nonzero_ext::nonzero;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{event, Level};

/// The delay before the first retry of a failed request.
const BACKOFF_BASE_DELAY: Duration = Duration::from_millis(100);
/// Retries of a failed request are never delayed by more than this.
const BACKOFF_MAX_DELAY: Duration = Duration::from_secs(3);

const REQUESTS_PER_SECOND: NonZeroU32 = nonzero!(1u32);
const REQUEST_BURST: NonZeroU32 = nonzero!(1u32);

type SimpleRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Failure counts beyond this all map to the maximum delay.
const BACKOFF_MAX_STEPS: u32 = 16;

/// The per-key backoff after `failures` consecutive failures, counting from zero.
pub fn backoff(failures: u32) -> Duration {
    // tokio-retry multiplies by the base on every step; a base of 2 scaled by half the first delay doubles.
    ExponentialBackoff::from_millis(2)
        .factor(BACKOFF_BASE_DELAY.as_millis() as u64 / 2)
        .max_delay(BACKOFF_MAX_DELAY)
        .nth(failures.min(BACKOFF_MAX_STEPS) as usize)
        .unwrap_or(BACKOFF_MAX_DELAY)
}

/// A cloneable handle used to enqueue requests from the watch pump and from delayed retries.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<ObjectKey>,
    pending: Arc<Mutex<HashSet<ObjectKey>>>,
}

impl QueueHandle {
    /// Enqueues `key` unless it is already waiting. Returns true if the key was enqueued.
    pub fn add(&self, key: ObjectKey) -> bool {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending.contains(&key) {
            event!(Level::TRACE, request = %key, "Request is already queued.");
            return false;
        }

        match self.sender.send(key.clone()) {
            Ok(()) => {
                pending.insert(key);
                true
            }
            Err(_) => {
                event!(Level::DEBUG, request = %key, "Queue has shut down. Dropping request.");
                false
            }
        }
    }

    /// Enqueues `key` after `delay` has elapsed.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.add(key);
        });
    }
}

pub struct WorkQueue {
    handle: QueueHandle,
    receiver: mpsc::UnboundedReceiver<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    limiter: SimpleRateLimiter,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        WorkQueue {
            handle: QueueHandle {
                sender,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            receiver,
            failures: HashMap::new(),
            limiter: RateLimiter::direct(
                Quota::per_second(REQUESTS_PER_SECOND).allow_burst(REQUEST_BURST),
            ),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Waits for the next request, pacing dispatch through the global token bucket.
    pub async fn next(&mut self) -> Option<ObjectKey> {
        let key = self.receiver.recv().await?;
        match self.handle.pending.lock() {
            Ok(mut pending) => pending.remove(&key),
            Err(poisoned) => poisoned.into_inner().remove(&key),
        };

        if let Err(e) = self.limiter.check() {
            event!(Level::DEBUG, request = %key, "Rate limited: {}.", e);
            self.limiter.until_ready().await;
        }
        Some(key)
    }

    /// Re-enqueues a failed request after its per-key backoff.
    pub fn add_rate_limited(&mut self, key: ObjectKey) {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let delay = backoff(*failures);
        *failures = failures.saturating_add(1);

        event!(Level::DEBUG, request = %key, ?delay, "Retrying request after backoff.");
        self.handle.add_after(key, delay);
    }

    /// Re-enqueues a request which succeeded but asked to run again. Its backoff is reset.
    pub fn requeue(&mut self, key: ObjectKey) {
        self.forget(&key);
        self.handle.add(key);
    }

    /// Clears the failure history of `key`.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
