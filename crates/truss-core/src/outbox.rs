// ── Batched outbound queue ──
//
// Items pushed during one synchronous stretch are posted together as one
// batch. The first push into an empty queue schedules a flush task; the
// flush runs on a later scheduler turn and posts whatever accumulated.
// While paused, items accumulate without scheduling; resuming schedules a
// flush if anything is waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{trace, warn};

pub(crate) struct Outbox<T> {
    queue: Mutex<Vec<T>>,
    sender: mpsc::UnboundedSender<Vec<T>>,
    active: AtomicBool,
}

impl<T: Send + 'static> Outbox<T> {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Vec<T>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Vec::new()),
            sender,
            active: AtomicBool::new(true),
        })
    }

    /// Queue an item, scheduling a flush if it is the first one.
    pub(crate) fn push(self: &Arc<Self>, item: T) {
        let first = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push(item);
            queue.len() == 1
        };
        if first && self.is_active() {
            self.schedule();
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn pause(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn resume(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiting = !self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if waiting {
            self.schedule();
        }
    }

    /// Returns `false` once the receiving side is gone.
    pub(crate) fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn schedule(self: &Arc<Self>) {
        let outbox = Arc::clone(self);
        tokio::spawn(async move { outbox.flush() });
    }

    /// Post everything queued as a single batch.
    pub(crate) fn flush(&self) {
        if !self.is_active() {
            return;
        }
        // Held across the send so concurrent flushes post batches in push order.
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut *queue);
        trace!(size = batch.len(), "flushing batch");
        if self.sender.send(batch).is_err() {
            warn!("dropping batch: channel closed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushes_in_one_turn_share_a_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        outbox.push(1);
        outbox.push(2);
        outbox.push(3);
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);

        outbox.push(4);
        assert_eq!(rx.recv().await.unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn paused_outbox_holds_items_until_resumed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        outbox.pause();
        outbox.push("a");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        outbox.resume();
        assert_eq!(rx.recv().await.unwrap(), vec!["a"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flushes_keep_push_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 500;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let outbox = Arc::clone(&outbox);
                tokio::spawn(async move {
                    for i in 0..PER_PRODUCER {
                        outbox.push((p, i));
                        if i % 7 == 0 {
                            outbox.flush();
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        outbox.flush();

        let mut last = [None; PRODUCERS];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            for (p, i) in rx.recv().await.unwrap() {
                assert!(last[p] < Some(i), "producer {p}: {i} after {:?}", last[p]);
                last[p] = Some(i);
                received += 1;
            }
        }
    }
}
