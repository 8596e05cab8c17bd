// ── Slow operation gauge ──
//
// Each registered handler watches one operation category with one
// threshold. Every call of that category arms one timer per handler; a
// timer that fires before the call settles bumps the handler's count and
// reports `+1`, and the settling of a call whose timer already fired
// reports `-1`. Calls that settle in time are never reported.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use strum::Display;
use tokio::task::JoinHandle;
use tracing::debug;

/// Operation categories tracked for slowness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OpCategory {
    Read,
    Write,
    Auth,
}

/// Invoked with the handler's current slow count and the change (`+1`/`-1`).
pub type SlownessCallback = Arc<dyn Fn(usize, i32) + Send + Sync>;

struct Handler {
    category: OpCategory,
    threshold: Duration,
    callback: SlownessCallback,
    count: AtomicUsize,
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const DONE: u8 = 2;

struct Timer {
    handler: Arc<Handler>,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

/// Registry of slowness handlers. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct SlownessTracker {
    handlers: Arc<RwLock<Vec<Arc<Handler>>>>,
}

impl std::fmt::Debug for SlownessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SlownessTracker")
            .field("handlers", &handlers.len())
            .finish()
    }
}

impl SlownessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report calls of `category` outstanding for longer than `threshold`.
    pub fn on_slow(
        &self,
        category: OpCategory,
        threshold: Duration,
        callback: impl Fn(usize, i32) + Send + Sync + 'static,
    ) {
        let handler = Arc::new(Handler {
            category,
            threshold,
            callback: Arc::new(callback),
            count: AtomicUsize::new(0),
        });
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Arm the timers for one call. Dropping the guard settles the call.
    pub fn start(&self, category: OpCategory) -> SlowOpGuard {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let timers = handlers
            .iter()
            .filter(|h| h.category == category)
            .map(|handler| {
                let state = Arc::new(AtomicU8::new(PENDING));
                let task = tokio::spawn({
                    let handler = Arc::clone(handler);
                    let state = Arc::clone(&state);
                    async move {
                        tokio::time::sleep(handler.threshold).await;
                        if state
                            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            let count = handler.count.fetch_add(1, Ordering::AcqRel) + 1;
                            debug!(category = %handler.category, count, "operation is slow");
                            (handler.callback)(count, 1);
                        }
                    }
                });
                Timer {
                    handler: Arc::clone(handler),
                    state,
                    task,
                }
            })
            .collect();
        SlowOpGuard { timers }
    }
}

/// Outstanding call. Settled when dropped.
pub struct SlowOpGuard {
    timers: Vec<Timer>,
}

impl SlowOpGuard {
    pub fn finish(self) {
        drop(self);
    }
}

impl Drop for SlowOpGuard {
    fn drop(&mut self) {
        for timer in self.timers.drain(..) {
            if timer
                .state
                .compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                timer.task.abort();
            } else if timer
                .state
                .compare_exchange(FIRED, DONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let count = timer.handler.count.fetch_sub(1, Ordering::AcqRel) - 1;
                (timer.handler.callback)(count, -1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(tracker: &SlownessTracker, category: OpCategory, ms: u64) -> Arc<Mutex<Vec<(usize, i32)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.on_slow(category, Duration::from_millis(ms), move |count, delta| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push((count, delta));
        });
        seen
    }

    fn events(seen: &Arc<Mutex<Vec<(usize, i32)>>>) -> Vec<(usize, i32)> {
        seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[tokio::test(start_paused = true)]
    async fn fast_calls_are_never_reported() {
        let tracker = SlownessTracker::new();
        let seen = recording(&tracker, OpCategory::Write, 100);
        let guard = tracker.start(OpCategory::Write);
        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.finish();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events(&seen).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_count_up_then_down() {
        let tracker = SlownessTracker::new();
        let seen = recording(&tracker, OpCategory::Read, 100);
        let first = tracker.start(OpCategory::Read);
        let second = tracker.start(OpCategory::Read);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(events(&seen), vec![(1, 1), (2, 1)]);

        drop(first);
        second.finish();
        assert_eq!(events(&seen), vec![(1, 1), (2, 1), (1, -1), (0, -1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn categories_are_independent() {
        let tracker = SlownessTracker::new();
        let auth = recording(&tracker, OpCategory::Auth, 10);
        let _write = tracker.start(OpCategory::Write);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events(&auth).is_empty());
    }
}
