//! Rate-limited work queue of application keys (`namespace/name`).
//!
//! While a key is being processed, further adds for the same key coalesce
//! into a single re-queue that happens when the current processing round
//! calls [`WorkQueue::done`]. Failed syncs re-add with a per-key exponential
//! backoff that [`WorkQueue::forget`] resets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Adds a key immediately. A key already marked dirty coalesces; a key
    /// currently processing is parked until `done` re-queues it.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("work queue poisoned");
        if state.shut_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_owned());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Adds a key after the backoff delay accumulated by previous
    /// rate-limited adds since the last `forget`.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("work queue poisoned");
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.to_owned()).or_insert(0);
            let exponent = (*failures).min(20);
            *failures += 1;
            BASE_DELAY
                .saturating_mul(1u32 << exponent)
                .min(MAX_DELAY)
        };
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Blocks until a key is available. Returns `None` once the queue is shut
    /// down and drained of in-flight notifications.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("work queue poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a processing round finished. A key re-added while processing is
    /// queued again so the next round observes the union of state changes.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("work queue poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.queue.iter().any(|queued| queued == key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Resets the backoff history of a key after a successful sync.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("work queue poisoned");
        state.failures.remove(key);
    }

    /// Unblocks all `get` callers. In-flight syncs finish; subsequent `get`
    /// calls return `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().expect("work queue poisoned");
            state.shut_down = true;
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().expect("work queue poisoned").queue.len()
    }
}
