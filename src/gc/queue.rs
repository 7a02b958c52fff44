//! Deduplicating, rate-limited work queues
//!
//! Semantics follow the usual controller work queue: an item is handed to at
//! most one worker at a time, re-adding an item that is being processed
//! defers it until `done`, and failed items come back with per-item
//! exponential backoff bounded by an overall token bucket.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Backoff settings for a queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// First per-item retry delay
    pub base_delay: Duration,
    /// Cap on the per-item retry delay
    pub max_delay: Duration,
    /// Sustained retries per second across all items
    pub qps: f64,
    /// Retries allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last: Instant,
}

/// Per-item exponential backoff combined with a token bucket
///
/// The delay for an item is the larger of the two limiters.
#[derive(Debug)]
pub struct RateLimiter<T> {
    config: RateLimiterConfig,
    failures: Mutex<HashMap<T, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl<T: Eq + Hash + Clone> RateLimiter<T> {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket {
                tokens: f64::from(config.burst),
                last: Instant::now(),
            }),
        }
    }

    /// Delay before the item should be retried; counts as a failure
    pub fn when(&self, item: &T) -> Duration {
        let exponential = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            1u32.checked_shl(exp)
                .and_then(|factor| self.config.base_delay.checked_mul(factor))
                .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
        };
        exponential.max(self.reserve())
    }

    // Takes one token, returning how long until that token is actually available.
    fn reserve(&self) -> Duration {
        if self.config.qps.is_nan() || self.config.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * self.config.qps).min(f64::from(self.config.burst));
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.config.qps)
                .unwrap_or(self.config.max_delay)
        }
    }

    pub fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Work queue shared by producers (graph builders) and workers
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    limiter: RateLimiter<T>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, config: RateLimiterConfig) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: RateLimiter::new(config),
        }
    }

    /// Add an item; duplicates of a queued item are dropped
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                // Picked up again once the current worker calls `done`.
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Wait for the next item; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark an item as finished; requeues it if it was added while in flight
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Add after the item's backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clear the item's failure history
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.queue.len()
        };
        debug!(queue = self.name, pending, "Shutting down work queue");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
