/*
 * This file is part of module-reconciler, licensed under the MIT License (MIT).
 *
 * Copyright (c) 2024 easybill GmbH
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
pub(crate) mod runner;

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio::sync::{Mutex, Notify};

type Bucket = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Tuning knobs for [`WorkQueue`], mirroring SPEC_FULL.md §4.5's literal parameters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct QueueConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub bucket_rate_per_sec: u32,
    pub bucket_burst: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1000),
            bucket_rate_per_sec: 50,
            bucket_burst: 300,
        }
    }
}

struct QueueState {
    queue: VecDeque<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: std::collections::HashMap<String, u32>,
    shutting_down: bool,
}

/// A per-key rate-limited queue with exponential back-off per key plus a global
/// token-bucket cap, carrying stringified `<source>/<module>@<version>` keys.
/// Guarantees that the same key is never handed to two `get()` callers at once
/// (client-go's `workqueue` per-key serialization, reimplemented here with a
/// `dirty`/`processing` pair instead of goroutine-local state).
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
    bucket: Bucket,
}

impl WorkQueue {
    pub(crate) fn new(config: QueueConfig) -> Self {
        let rate = NonZeroU32::new(config.bucket_rate_per_sec.max(1)).unwrap();
        let burst = NonZeroU32::new(config.bucket_burst.max(1)).unwrap();
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                failures: std::collections::HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            bucket: RateLimiter::direct(quota),
        }
    }

    /// Adds `item` immediately, unless it is already queued or already being
    /// processed (in which case it is marked dirty and re-added once `done`
    /// is called for the in-flight copy).
    pub(crate) async fn add(&self, item: String) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `item` after `delay`, unless the queue has since shut down.
    pub(crate) fn add_after(self: &Arc<Self>, item: String, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(item).await;
        });
    }

    /// Adds `item` back with exponential per-key back-off (base delay 500 ms,
    /// doubling per consecutive failure, capped at the configured max delay),
    /// after waiting for a token from the global bucket so that surplus events
    /// are delayed rather than dropped.
    pub(crate) async fn add_rate_limited(self: &Arc<Self>, item: String) {
        let delay = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let exponent = (*failures).min(30);
            *failures += 1;
            let scaled = self.base_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
            scaled.min(self.max_delay)
        };
        self.bucket.until_ready().await;
        self.add_after(item, delay);
    }

    /// Resets the back-off state for `item`, as done on a successful reconcile.
    pub(crate) async fn forget(&self, item: &str) {
        self.state.lock().await.failures.remove(item);
    }

    /// Pops the next available item, blocking until one is ready or the queue
    /// has shut down. The returned item is marked `processing` until `done` is
    /// called for it.
    pub(crate) async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks `item` as no longer being processed. If it was re-added (marked
    /// dirty) while in flight, it is pushed back onto the queue now.
    pub(crate) async fn done(&self, item: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        drop(state);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}
