//! FIFO hand-off queue between I/O tasks and workers.
//!
//! `enqueue` appends and wakes one waiter; `dequeue` waits until an item
//! is available and returns the oldest one. Strict arrival order per
//! queue instance: no priorities, no deduplication. The length is
//! advisory, for diagnostics only, never for flow control.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// A thread-safe FIFO queue with blocking consumption.
///
/// Multiple producers and multiple consumers may share one instance
/// behind an `Arc`; each released item wakes exactly one waiting
/// consumer.
pub struct RequestQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> RequestQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Append an item and wake one waiter.
    pub fn enqueue(&self, item: T) {
        {
            let mut items = self.items.lock().expect("request queue lock poisoned");
            items.push_back(item);
        }
        self.ready.notify_one();
    }

    /// Wait until an item is available and return the oldest one.
    ///
    /// Cancellation-safe: dropping the returned future (e.g. from a
    /// `select!` arm) never loses an item.
    pub async fn dequeue(&self) -> T {
        loop {
            let ready = self.ready.notified();
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            ready.await;
        }
    }

    /// Pop the oldest item if one is queued.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = {
            let mut items = self.items.lock().expect("request queue lock poisoned");
            items.pop_front()
        };
        if item.is_some() {
            // A waiter may have been woken for an item another consumer
            // took; pass the wakeup along if anything is still queued.
            if !self.is_empty() {
                self.ready.notify_one();
            }
        }
        item
    }

    /// Advisory queue depth.
    pub fn len(&self) -> usize {
        self.items.lock().expect("request queue lock poisoned").len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = RequestQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);

        assert_eq!(q.dequeue().await, 1);
        assert_eq!(q.dequeue().await, 2);
        assert_eq!(q.dequeue().await, 3);
    }

    #[tokio::test]
    async fn test_len_is_advisory() {
        let q = RequestQueue::new();
        assert!(q.is_empty());
        q.enqueue("a");
        q.enqueue("b");
        assert_eq!(q.len(), 2);
        q.try_dequeue();
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let q = Arc::new(RequestQueue::new());

        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        q.enqueue(99u32);
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer not woken")
            .unwrap();
        assert_eq!(got, 99);
    }

    #[tokio::test]
    async fn test_try_dequeue_empty() {
        let q: RequestQueue<u32> = RequestQueue::new();
        assert_eq!(q.try_dequeue(), None);
    }

    #[tokio::test]
    async fn test_multiple_consumers_drain_everything() {
        let q = Arc::new(RequestQueue::new());
        let total = 100u32;

        let mut consumers = Vec::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..4 {
            let q = q.clone();
            let tx = tx.clone();
            consumers.push(tokio::spawn(async move {
                loop {
                    let item = q.dequeue().await;
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            }));
        }

        for i in 0..total {
            q.enqueue(i);
        }

        let mut seen = Vec::new();
        while seen.len() < total as usize {
            let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("consumers stalled")
                .unwrap();
            seen.push(item);
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());

        for c in consumers {
            c.abort();
        }
    }

    #[tokio::test]
    async fn test_dequeue_in_select_does_not_lose_items() {
        let q = Arc::new(RequestQueue::new());

        // Race a dequeue against an immediate sleep several times; every
        // enqueued item must still come out.
        for i in 0..20u32 {
            q.enqueue(i);
            tokio::select! {
                item = q.dequeue() => assert_eq!(item, i),
                _ = tokio::time::sleep(Duration::from_millis(1)) => {
                    assert_eq!(q.dequeue().await, i);
                }
            }
        }
        assert!(q.is_empty());
    }
}
