//! Bounded, internally synchronized FIFO between acquisition and persistence.
//!
//! The ring buffer decouples the hardware-paced producer (the acquisition task)
//! from the disk-paced consumer (the persistence task). It is the only mutable
//! structure shared between the two; `push`/`pop` are its only mutation entry
//! points.
//!
//! # Overflow
//!
//! What happens when the producer outruns the consumer is explicit
//! configuration ([`OverflowPolicy`]):
//!
//! - `Block` (default): the producer waits for free space. Every record is
//!   preserved, at the cost of stalling acquisition.
//! - `DropOldest`: the oldest buffered record is evicted to make room. Order of
//!   retained records is preserved and every eviction is counted in
//!   [`RingBuffer::dropped`].
//!
//! # Closing
//!
//! The producer calls [`RingBuffer::close`] when it stops. Consumers keep
//! popping until the buffer is drained, then receive [`PopError::Empty`].
//! Closing also releases any producer blocked on a full buffer, which is how a
//! failed consumer stops acquisition.
//!
//! ```text
//!   acquisition task ──push──▶ [ r0 r1 r2 .. rC-1 ] ──pop──▶ persistence task
//!                              head            tail
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Producer behaviour when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to free a slot; no data loss.
    #[default]
    Block,
    /// Evict the oldest buffered record; freshness over completeness.
    DropOldest,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Block => write!(f, "block"),
            OverflowPolicy::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

/// Why a record was not enqueued. The record is handed back to the caller.
#[derive(Debug, PartialEq)]
pub enum PushError<T> {
    /// Buffer at capacity (non-blocking push under `Block` policy).
    Full(T),
    /// No slot became free before the deadline.
    Timeout(T),
    /// The buffer was closed; no more records are accepted.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the record that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(record) | PushError::Timeout(record) | PushError::Closed(record) => {
                record
            }
        }
    }
}

impl<T> std::fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "ring buffer full"),
            PushError::Timeout(_) => write!(f, "timed out waiting for ring buffer space"),
            PushError::Closed(_) => write!(f, "ring buffer closed"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for PushError<T> {}

/// Why `pop` returned without a record.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The buffer is closed and fully drained; no record will ever arrive.
    #[error("ring buffer closed and drained")]
    Empty,
    /// Nothing arrived before the deadline; the producer may still be running.
    #[error("timed out waiting for a record")]
    Timeout,
}

/// Snapshot of buffer occupancy and overflow counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferStats {
    /// Fixed capacity
    pub capacity: usize,
    /// Records currently buffered
    pub len: usize,
    /// Highest occupancy observed
    pub high_water_mark: usize,
    /// Records accepted by `push`
    pub pushed: u64,
    /// Records evicted under `DropOldest`
    pub dropped: u64,
}

/// Bounded FIFO with an explicit overflow policy.
pub struct RingBuffer<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    /// Signalled after every push and on close
    not_empty: Notify,
    /// Signalled after every pop and on close
    not_full: Notify,
    pushed: AtomicU64,
    dropped: AtomicU64,
    high_water_mark: AtomicUsize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` records.
    ///
    /// A zero capacity is bumped to one so a `Block` producer can always make
    /// progress.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of records evicted under `DropOldest`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Occupancy and overflow counters.
    pub fn stats(&self) -> RingBufferStats {
        let len = self.len();
        RingBufferStats {
            capacity: self.capacity,
            len,
            high_water_mark: self.high_water_mark.load(Ordering::Acquire),
            pushed: self.pushed.load(Ordering::Acquire),
            dropped: self.dropped(),
        }
    }

    /// Stop accepting records and wake every waiter.
    ///
    /// Already buffered records remain poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Enqueue without waiting.
    ///
    /// Under `Block` a full buffer yields [`PushError::Full`]; under
    /// `DropOldest` the oldest record is evicted instead and the push succeeds.
    pub fn try_push(&self, record: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            return Err(PushError::Closed(record));
        }

        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::Block => return Err(PushError::Full(record)),
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        self.dropped.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
            queue.push_back(record);
            self.high_water_mark.fetch_max(queue.len(), Ordering::AcqRel);
        }

        self.pushed.fetch_add(1, Ordering::AcqRel);
        self.not_empty.notify_waiters();
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for space under `Block` policy.
    ///
    /// Never waits under `DropOldest`.
    pub async fn push_timeout(&self, record: T, timeout: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut record = record;

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register before checking so a pop between the check and the
            // await is not missed.
            notified.as_mut().enable();

            match self.try_push(record) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(rejected)) => record = rejected,
                Err(other) => return Err(other),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PushError::Timeout(record));
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let record = self.lock().pop_front();
        if record.is_some() {
            self.not_full.notify_waiters();
        }
        record
    }

    /// Dequeue, waiting up to `timeout` for a record.
    ///
    /// Returns [`PopError::Empty`] once the buffer is closed and drained.
    pub async fn pop(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // `closed` is read first: everything pushed before `close` is
            // then visible to `try_pop`.
            let closed = self.is_closed();
            if let Some(record) = self.try_pop() {
                return Ok(record);
            }
            if closed {
                return Err(PopError::Empty);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PopError::Timeout);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A poisoned queue still holds consistent records; keep draining it.
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_block_policy_rejects_when_full() {
        let rb = RingBuffer::new(2, OverflowPolicy::Block);
        rb.try_push(1).unwrap();
        rb.try_push(2).unwrap();

        assert_eq!(rb.try_push(3), Err(PushError::Full(3)));
        assert_eq!(rb.len(), 2);
        assert_eq!(rb.dropped(), 0);
    }

    #[test]
    fn test_fifo_order_with_interleaving() {
        let rb = RingBuffer::new(3, OverflowPolicy::Block);
        let mut popped = Vec::new();

        for i in 0..10 {
            rb.try_push(i).unwrap();
            if i % 2 == 1 {
                popped.push(rb.try_pop().unwrap());
            }
            assert!(rb.len() <= rb.capacity());
        }
        while let Some(value) = rb.try_pop() {
            popped.push(value);
        }

        assert_eq!(popped, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_oldest_counts_every_overflow() {
        let rb = RingBuffer::new(3, OverflowPolicy::DropOldest);
        for i in 0..8 {
            rb.try_push(i).unwrap();
        }

        assert_eq!(rb.dropped(), 5);
        let retained: Vec<_> = std::iter::from_fn(|| rb.try_pop()).collect();
        assert_eq!(retained, vec![5, 6, 7]);

        let stats = rb.stats();
        assert_eq!(stats.pushed, 8);
        assert_eq!(stats.high_water_mark, 3);
    }

    #[test]
    fn test_zero_capacity_is_usable() {
        let rb = RingBuffer::new(0, OverflowPolicy::Block);
        assert_eq!(rb.capacity(), 1);
        rb.try_push("a").unwrap();
        assert!(matches!(rb.try_push("b"), Err(PushError::Full("b"))));
    }

    #[test]
    fn test_push_after_close_is_rejected() {
        let rb = RingBuffer::new(4, OverflowPolicy::Block);
        rb.try_push(1).unwrap();
        rb.close();

        assert_eq!(rb.try_push(2), Err(PushError::Closed(2)));
        assert_eq!(rb.try_pop(), Some(1));
    }

    #[tokio::test]
    async fn test_pop_times_out_on_open_empty_buffer() {
        let rb: RingBuffer<u32> = RingBuffer::new(4, OverflowPolicy::Block);
        let result = rb.pop(Duration::from_millis(20)).await;
        assert_eq!(result, Err(PopError::Timeout));
    }

    #[tokio::test]
    async fn test_pop_drains_then_reports_empty() {
        let rb = RingBuffer::new(4, OverflowPolicy::Block);
        rb.try_push(1).unwrap();
        rb.try_push(2).unwrap();
        rb.close();

        assert_eq!(rb.pop(Duration::from_millis(10)).await, Ok(1));
        assert_eq!(rb.pop(Duration::from_millis(10)).await, Ok(2));
        assert_eq!(rb.pop(Duration::from_millis(10)).await, Err(PopError::Empty));
    }

    #[tokio::test]
    async fn test_blocked_push_resumes_after_pop() {
        let rb = Arc::new(RingBuffer::new(1, OverflowPolicy::Block));
        rb.try_push(0).unwrap();

        let producer = {
            let rb = Arc::clone(&rb);
            tokio::spawn(async move { rb.push_timeout(1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rb.pop(Duration::from_secs(1)).await, Ok(0));

        producer.await.unwrap().unwrap();
        assert_eq!(rb.pop(Duration::from_secs(1)).await, Ok(1));
    }

    #[tokio::test]
    async fn test_blocked_push_released_by_close() {
        let rb = Arc::new(RingBuffer::new(1, OverflowPolicy::Block));
        rb.try_push(0).unwrap();

        let producer = {
            let rb = Arc::clone(&rb);
            tokio::spawn(async move { rb.push_timeout(1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        rb.close();

        let result = producer.await.unwrap();
        assert_eq!(result, Err(PushError::Closed(1)));
    }

    #[tokio::test]
    async fn test_blocked_push_times_out() {
        let rb = RingBuffer::new(1, OverflowPolicy::Block);
        rb.try_push(0).unwrap();
        let result = rb.push_timeout(1, Duration::from_millis(20)).await;
        assert_eq!(result, Err(PushError::Timeout(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_producer_consumer_preserves_order() {
        const COUNT: u64 = 2_000;
        let rb = Arc::new(RingBuffer::new(8, OverflowPolicy::Block));

        let producer = {
            let rb = Arc::clone(&rb);
            tokio::spawn(async move {
                for i in 0..COUNT {
                    rb.push_timeout(i, Duration::from_secs(5)).await.unwrap();
                    assert!(rb.len() <= rb.capacity());
                }
                rb.close();
            })
        };

        let mut received = Vec::with_capacity(COUNT as usize);
        loop {
            match rb.pop(Duration::from_secs(5)).await {
                Ok(value) => received.push(value),
                Err(PopError::Empty) => break,
                Err(PopError::Timeout) => panic!("consumer starved"),
            }
        }
        producer.await.unwrap();

        assert_eq!(received, (0..COUNT).collect::<Vec<_>>());
        assert_eq!(rb.dropped(), 0);
        assert!(rb.stats().high_water_mark <= 8);
    }
}
