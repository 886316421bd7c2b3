//! Bounded multi-producer/multi-consumer FIFO queue with a close signal.

use super::{QueueProbe, QueueStats};
use crate::cancellation::CancellationToken;
use crate::errors::{QueueError, TryEnqueueError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::trace;

/// A FIFO queue shared between the producers and consumers of one pipeline
/// boundary.
///
/// - `capacity == 0` means unbounded; otherwise [`enqueue`](Self::enqueue)
///   suspends while the queue holds `capacity` items.
/// - [`close`](Self::close) is idempotent. After closing, every enqueue
///   fails, while items already queued stay dequeuable until drained.
/// - Once closed and drained, [`wait_for_items_or_close`](Self::wait_for_items_or_close)
///   returns `false` for every current and future caller.
///
/// The internal mutex is never held across an await point.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    cancel: OnceLock<Arc<CancellationToken>>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    total_enqueued: u64,
    total_dequeued: u64,
    blocked_enqueues: u64,
    high_water_mark: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (`0` = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let initial = if capacity == 0 { 16 } else { capacity.min(1024) };
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(initial),
                closed: false,
                total_enqueued: 0,
                total_dequeued: 0,
                blocked_enqueues: 0,
                high_water_mark: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            cancel: OnceLock::new(),
        }
    }

    /// Creates a queue without a capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Binds a cancellation token; once it is raised every wait fails with
    /// [`QueueError::Cancelled`].
    #[must_use]
    pub fn with_cancellation(self, token: Arc<CancellationToken>) -> Self {
        self.bind_cancellation(token);
        self
    }

    /// Binds a cancellation token to an existing queue.
    ///
    /// Only the first binding takes effect; returns whether this call bound it.
    pub fn bind_cancellation(&self, token: Arc<CancellationToken>) -> bool {
        let bound = self.cancel.set(token).is_ok();
        if bound {
            // Wake current waiters so they start observing the token.
            self.not_empty.notify_waiters();
            self.not_full.notify_waiters();
        }
        bound
    }

    /// Returns the configured capacity (`0` = unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns whether the queue has a capacity limit.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        self.capacity > 0
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Returns true once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns true once the queue is closed and every item was dequeued.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }

    /// Appends an item, suspending while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue is (or becomes) closed
    /// before the item is accepted, and [`QueueError::Cancelled`] if the bound
    /// token is raised. In both cases the item is dropped.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let mut waited = false;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                self.check_cancelled()?;
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if !self.is_full(&state) {
                    if waited {
                        state.blocked_enqueues += 1;
                    }
                    state.push(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            waited = true;
            trace!(capacity = self.capacity, "Enqueue waiting for space");
            self.suspend(notified).await?;
        }
    }

    /// Appends an item without waiting.
    ///
    /// # Errors
    ///
    /// Hands the item back when the queue is full or closed.
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryEnqueueError::Closed(item));
        }
        if self.is_full(&state) {
            return Err(TryEnqueueError::Full(item));
        }
        state.push(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item, if any, without waiting.
    ///
    /// `None` does not distinguish "nothing yet" from "stream ended"; use
    /// [`is_drained`](Self::is_drained) or
    /// [`wait_for_items_or_close`](Self::wait_for_items_or_close) for that.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front()?;
        state.total_dequeued += 1;
        drop(state);
        self.not_full.notify_one();
        Some(item)
    }

    /// Suspends until an item is available or the queue is closed and drained.
    ///
    /// Returns `true` when a dequeue attempt may succeed, `false` at
    /// end-of-stream. A `true` result is a hint: with several consumers
    /// another one may take the item first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Cancelled`] if the bound token is raised, even
    /// when items are still queued.
    pub async fn wait_for_items_or_close(&self) -> Result<bool, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                self.check_cancelled()?;
                let state = self.state.lock();
                if !state.items.is_empty() {
                    return Ok(true);
                }
                if state.closed {
                    return Ok(false);
                }
            }

            self.suspend(notified).await?;
        }
    }

    /// Removes the oldest item, suspending until one arrives.
    ///
    /// Returns `Ok(None)` at end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Cancelled`] if the bound token is raised.
    pub async fn dequeue(&self) -> Result<Option<T>, QueueError> {
        loop {
            if !self.wait_for_items_or_close().await? {
                return Ok(None);
            }
            if let Some(item) = self.try_dequeue() {
                return Ok(Some(item));
            }
        }
    }

    /// Marks the queue as complete: no further item will be accepted.
    ///
    /// Wakes every suspended producer (they fail with `Closed`) and every
    /// suspended consumer. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }

        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        true
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            capacity: self.capacity,
            current_len: state.items.len(),
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            blocked_enqueues: state.blocked_enqueues,
            high_water_mark: state.high_water_mark,
            closed: state.closed,
        }
    }

    fn is_full(&self, state: &QueueState<T>) -> bool {
        self.capacity > 0 && state.items.len() >= self.capacity
    }

    fn check_cancelled(&self) -> Result<(), QueueError> {
        match self.cancel.get() {
            Some(token) if token.is_cancelled() => {
                Err(QueueError::Cancelled(token.reason().unwrap_or_default()))
            }
            _ => Ok(()),
        }
    }

    async fn suspend(&self, notified: Pin<&mut Notified<'_>>) -> Result<(), QueueError> {
        match self.cancel.get() {
            Some(token) => {
                tokio::select! {
                    () = notified => Ok(()),
                    () = token.cancelled() => {
                        Err(QueueError::Cancelled(token.reason().unwrap_or_default()))
                    }
                }
            }
            None => {
                notified.await;
                Ok(())
            }
        }
    }
}

impl<T> QueueState<T> {
    fn push(&mut self, item: T) {
        self.items.push_back(item);
        self.total_enqueued += 1;
        self.high_water_mark = self.high_water_mark.max(self.items.len());
    }
}

impl<T: Send> QueueProbe for BoundedQueue<T> {
    fn stats(&self) -> QueueStats {
        BoundedQueue::stats(self)
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(10);
        for i in 0..5 {
            queue.enqueue(i).await.unwrap();
        }

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_try_dequeue_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(4);
        assert_eq!(queue.try_dequeue(), None);
        assert!(!queue.is_drained());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let queue = BoundedQueue::new(4);
        queue.enqueue(1).await.unwrap();
        assert!(queue.close());

        assert_eq!(queue.enqueue(2).await, Err(QueueError::Closed));
        assert_eq!(queue.try_enqueue(3), Err(TryEnqueueError::Closed(3)));

        // Items queued before close are still delivered.
        assert_eq!(queue.dequeue().await, Ok(Some(1)));
        assert_eq!(queue.dequeue().await, Ok(None));
        assert!(queue.is_drained());
    }

    #[test]
    fn test_close_is_idempotent() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert!(queue.close());
        assert!(!queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_has_single_effect() {
        let queue = Arc::new(BoundedQueue::<u32>::new(2));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_items_or_close().await })
        };

        let closers: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.close() })
            })
            .collect();

        let mut winners = 0;
        for closer in closers {
            if closer.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(waiter.await.unwrap(), Ok(false));
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn test_enqueue_suspends_when_full() {
        let queue = BoundedQueue::new(2);
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();

        let mut blocked = task::spawn(queue.enqueue(3));
        assert_pending!(blocked.poll());

        assert_eq!(queue.try_dequeue(), Some(1));
        assert!(blocked.is_woken());
        assert_ready_eq!(blocked.poll(), Ok(()));
        drop(blocked);

        let stats = queue.stats();
        assert_eq!(stats.high_water_mark, 2);
        assert_eq!(stats.blocked_enqueues, 1);
        assert_eq!(stats.current_len, 2);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let queue = BoundedQueue::new(1);
        queue.enqueue("a").await.unwrap();

        let mut blocked = task::spawn(queue.enqueue("b"));
        assert_pending!(blocked.poll());

        queue.close();
        assert!(blocked.is_woken());
        assert_ready_eq!(blocked.poll(), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_wait_for_items_wakes_on_enqueue_and_close() {
        let queue = BoundedQueue::new(0);

        let mut waiting = task::spawn(queue.wait_for_items_or_close());
        assert_pending!(waiting.poll());
        queue.try_enqueue(5).unwrap();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), Ok(true));
        drop(waiting);

        assert_eq!(queue.try_dequeue(), Some(5));

        let mut waiting = task::spawn(queue.wait_for_items_or_close());
        assert_pending!(waiting.poll());
        queue.close();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), Ok(false));
    }

    #[test]
    fn test_try_enqueue_full() {
        let queue = BoundedQueue::new(1);
        assert!(queue.try_enqueue('x').is_ok());
        assert_eq!(queue.try_enqueue('y'), Err(TryEnqueueError::Full('y')));
    }

    #[tokio::test]
    async fn test_unbounded_never_blocks() {
        let queue = BoundedQueue::unbounded();
        assert!(!queue.is_bounded());
        for i in 0..10_000 {
            queue.enqueue(i).await.unwrap();
        }
        assert_eq!(queue.len(), 10_000);
        assert_eq!(queue.stats().blocked_enqueues, 0);
    }

    #[tokio::test]
    async fn test_cancellation_wakes_waiters() {
        let token = Arc::new(CancellationToken::new());
        let queue = BoundedQueue::new(1).with_cancellation(token.clone());
        queue.enqueue(1).await.unwrap();

        let mut producer = task::spawn(queue.enqueue(2));
        assert_pending!(producer.poll());

        token.cancel("shutdown");
        assert!(producer.is_woken());
        assert_ready_eq!(producer.poll(), Err(QueueError::Cancelled("shutdown".into())));
        drop(producer);

        // Queued items are not handed out once cancelled.
        let mut consumer = task::spawn(queue.wait_for_items_or_close());
        let result = assert_ready!(consumer.poll());
        assert_eq!(result, Err(QueueError::Cancelled("shutdown".into())));
    }

    #[tokio::test]
    async fn test_bind_cancellation_once() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert!(queue.bind_cancellation(Arc::new(CancellationToken::new())));
        assert!(!queue.bind_cancellation(Arc::new(CancellationToken::new())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_producers_many_consumers() {
        let queue = Arc::new(BoundedQueue::new(3));

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..250 {
                        queue.enqueue(p * 1000 + i).await.unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.dequeue().await.unwrap() {
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        queue.close();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(tokio::time::timeout(Duration::from_secs(5), consumer).await.unwrap().unwrap());
        }
        all.sort_unstable();

        let mut expected: Vec<u64> = (0..4u64).flat_map(|p| (0..250).map(move |i| p * 1000 + i)).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
        assert!(queue.stats().high_water_mark <= 3);
    }
}
