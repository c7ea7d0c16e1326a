// Bounded SPSC stage queues
// Three overflow policies back the stage matrix: drop-oldest (hot path,
// counted), newest-wins drain (book -> metrics), and awaiting backpressure
// (cold path toward the sinks).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    item_notify: Notify,
    space_notify: Notify,
    dropped: AtomicU64,
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

/// Item returned to the caller when the receiver is gone.
#[derive(Debug)]
pub struct SendError<T>(pub T);

pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "queue capacity must be positive");
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        capacity,
        item_notify: Notify::new(),
        space_notify: Notify::new(),
        dropped: AtomicU64::new(0),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

impl<T> Sender<T> {
    /// Never blocks: evicts the oldest queued item when full.
    pub fn push_or_drop_oldest(&self, item: T) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        if inner.items.len() >= self.shared.capacity {
            inner.items.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.items.push_back(item);
        drop(inner);
        self.shared.item_notify.notify_one();
    }

    /// Waits for space: true backpressure toward the consumer.
    pub async fn push(&self, item: T) -> Result<(), SendError<T>> {
        let mut item = Some(item);
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if inner.closed {
                    return Err(SendError(item.take().expect("item present")));
                }
                if inner.items.len() < self.shared.capacity {
                    inner.items.push_back(item.take().expect("item present"));
                    drop(inner);
                    self.shared.item_notify.notify_one();
                    return Ok(());
                }
            }
            self.shared.space_notify.notified().await;
        }
    }

    /// Blocks up to `grace` waiting for space, then falls back to evicting
    /// the oldest item.
    pub async fn push_within(&self, item: T, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        let mut item = Some(item);
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if inner.closed {
                    return;
                }
                if inner.items.len() < self.shared.capacity {
                    inner.items.push_back(item.take().expect("item present"));
                    drop(inner);
                    self.shared.item_notify.notify_one();
                    return;
                }
            }
            let wait = tokio::time::timeout_at(deadline, self.shared.space_notify.notified());
            if wait.await.is_err() {
                self.push_or_drop_oldest(item.take().expect("item present"));
                return;
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue; the receiver drains remaining items then sees None.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
        self.shared.item_notify.notify_one();
        self.shared.space_notify.notify_one();
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> Drop for Receiver<T> {
    // A vanished consumer must not leave producers blocked
    fn drop(&mut self) {
        self.shared.inner.lock().closed = true;
        self.shared.space_notify.notify_one();
    }
}

impl<T> Receiver<T> {
    /// Next item, or None once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.shared.space_notify.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.shared.item_notify.notified().await;
        }
    }

    /// Drain everything queued right now and keep only the newest.
    /// Returns (newest, discarded_count). Never waits.
    pub fn latest_now(&mut self) -> (Option<T>, u64) {
        let mut inner = self.shared.inner.lock();
        let mut discarded = 0u64;
        let mut newest = None;
        while let Some(item) = inner.items.pop_front() {
            if newest.is_some() {
                discarded += 1;
            }
            newest = Some(item);
        }
        drop(inner);
        if newest.is_some() {
            self.shared.space_notify.notify_one();
        }
        (newest, discarded)
    }

    /// True once the sender closed and everything queued has been drained.
    pub fn is_closed(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.closed && inner.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
