//! Bounded memory pool for batch buffers.
//!
//! All buffered records live in memory handed out by a single [`BufferPool`],
//! so the producer's footprint never exceeds `buffer_memory` no matter how far
//! the network falls behind. When the budget is spent, `allocate` suspends the
//! caller until memory is returned, which is how backpressure reaches
//! `Producer::send`.
//!
//! ## Accounting
//!
//! ```text
//!  total_memory = allocated + free_list.len() * pool_size + available
//! ```
//!
//! Buffers of exactly `pool_size` bytes (the configured batch size) are kept
//! on a free list and reused. Anything else is returned to `available` and
//! dropped.
//!
//! ## Fairness
//!
//! Blocked callers queue in arrival order. Returned memory only wakes the head
//! of the queue, and a caller arriving while others wait queues behind them
//! even if enough memory happens to be free. The head accumulates memory
//! incrementally, so a large request is not starved by a stream of small ones.

use crate::clock;
use crate::error::{ProducerError, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
struct PoolState {
    /// Unallocated bytes not held on the free list
    available: usize,
    /// Recycled buffers of `pool_size` capacity
    free: VecDeque<BytesMut>,
    /// Blocked allocators, oldest first
    waiters: VecDeque<Arc<Notify>>,
    closed: bool,
}

impl PoolState {
    /// Release free-list buffers until `available` covers `size` or the list is empty.
    fn free_up(&mut self, size: usize, pool_size: usize) {
        while self.available < size && self.free.pop_back().is_some() {
            self.available += pool_size;
        }
    }

    fn free_bytes(&self, pool_size: usize) -> usize {
        self.free.len() * pool_size
    }

    fn remove_waiter(&mut self, waiter: &Arc<Notify>) {
        if let Some(pos) = self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            self.waiters.remove(pos);
        }
    }

    /// Pass the turn to the next waiter if there is anything for it to take.
    fn wake_head_if_memory(&self) {
        if self.available > 0 || !self.free.is_empty() {
            if let Some(head) = self.waiters.front() {
                head.notify_one();
            }
        }
    }
}

/// A bounded pool of byte buffers with FIFO blocking allocation.
///
/// # Examples
///
/// ```ignore
/// let pool = BufferPool::new(32 * 1024 * 1024, 16 * 1024);
///
/// let buffer = pool.allocate(16 * 1024, Duration::from_secs(60)).await?;
/// // ... fill and send ...
/// pool.deallocate(buffer, 16 * 1024);
/// ```
#[derive(Debug)]
pub struct BufferPool {
    total_memory: usize,
    pool_size: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a pool of `total_memory` bytes recycling buffers of `pool_size` bytes.
    pub fn new(total_memory: usize, pool_size: usize) -> Self {
        Self {
            total_memory,
            pool_size,
            state: Mutex::new(PoolState {
                available: total_memory,
                free: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Allocate a buffer with at least `size` bytes of capacity.
    ///
    /// Suspends while the pool is exhausted, up to `max_wait`.
    ///
    /// # Errors
    ///
    /// - `RecordTooLarge` if `size` exceeds the whole pool
    /// - `BufferExhausted` if memory did not free up within `max_wait`
    /// - `Closed` if the pool is closed before or during the wait
    pub async fn allocate(&self, size: usize, max_wait: Duration) -> Result<BytesMut> {
        if size > self.total_memory {
            return Err(ProducerError::RecordTooLarge(size, self.total_memory));
        }

        let waiter = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ProducerError::Closed);
            }
            if state.waiters.is_empty() {
                if size == self.pool_size {
                    if let Some(buffer) = state.free.pop_front() {
                        return Ok(buffer);
                    }
                }
                if state.available + state.free_bytes(self.pool_size) >= size {
                    state.free_up(size, self.pool_size);
                    state.available -= size;
                    return Ok(BytesMut::with_capacity(size));
                }
            }
            let waiter = Arc::new(Notify::new());
            state.waiters.push_back(Arc::clone(&waiter));
            waiter
        };

        trace!(size, max_wait_ms = max_wait.as_millis() as u64, "Waiting for buffer memory");
        let deadline = Instant::from_std(clock::saturating_add(clock::now(), max_wait));
        let mut accumulated = 0usize;

        loop {
            let timed_out = tokio::time::timeout_at(deadline, waiter.notified())
                .await
                .is_err();

            let mut state = self.state.lock();

            if state.closed || timed_out {
                state.available += accumulated;
                state.remove_waiter(&waiter);
                state.wake_head_if_memory();
                if state.closed {
                    return Err(ProducerError::Closed);
                }
                debug!(size, "Buffer allocation timed out");
                return Err(ProducerError::BufferExhausted(max_wait));
            }

            if accumulated == 0 && size == self.pool_size {
                if let Some(buffer) = state.free.pop_front() {
                    state.remove_waiter(&waiter);
                    state.wake_head_if_memory();
                    return Ok(buffer);
                }
            }

            state.free_up(size - accumulated, self.pool_size);
            let got = (size - accumulated).min(state.available);
            state.available -= got;
            accumulated += got;

            if accumulated >= size {
                state.remove_waiter(&waiter);
                state.wake_head_if_memory();
                return Ok(BytesMut::with_capacity(size));
            }
        }
    }

    /// Take `size` more bytes without waiting, for a batch growing past its
    /// buffer. Refuses while allocators are queued so they keep their turn.
    pub fn try_reserve(&self, size: usize) -> bool {
        let mut state = self.state.lock();
        if state.closed
            || !state.waiters.is_empty()
            || state.available + state.free_bytes(self.pool_size) < size
        {
            return false;
        }
        state.free_up(size, self.pool_size);
        state.available -= size;
        trace!(size, "Reserved extra buffer memory");
        true
    }

    /// Return `size` bytes previously handed out by `allocate`.
    ///
    /// `size` must be the amount that was requested, even if the buffer grew
    /// since.
    pub fn deallocate(&self, mut buffer: BytesMut, size: usize) {
        let mut state = self.state.lock();
        if size == self.pool_size && buffer.capacity() == self.pool_size {
            buffer.clear();
            state.free.push_back(buffer);
        } else {
            state.available += size;
        }
        if let Some(head) = state.waiters.front() {
            head.notify_one();
        }
    }

    /// Fail every blocked and future allocation with `Closed`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for waiter in &state.waiters {
            waiter.notify_one();
        }
    }

    /// Bytes that could be handed out right now, including the free list.
    pub fn available_memory(&self) -> usize {
        let state = self.state.lock();
        state.available + state.free_bytes(self.pool_size)
    }

    /// Bytes neither allocated nor pooled on the free list.
    pub fn unallocated_memory(&self) -> usize {
        self.state.lock().available
    }

    /// Number of callers blocked in `allocate`.
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Fast path
    // ============================================================================

    #[tokio::test]
    async fn test_allocate_and_recycle_pooled_buffer() {
        let pool = BufferPool::new(1024, 256);
        let buffer = pool.allocate(256, Duration::from_millis(10)).await.unwrap();
        assert_eq!(buffer.capacity(), 256);
        assert_eq!(pool.available_memory(), 768);

        pool.deallocate(buffer, 256);
        assert_eq!(pool.available_memory(), 1024);
        assert_eq!(pool.unallocated_memory(), 768);

        // The recycled buffer is handed out again.
        let again = pool.allocate(256, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.capacity(), 256);
        assert_eq!(pool.unallocated_memory(), 768);
    }

    #[tokio::test]
    async fn test_oversized_buffers_bypass_free_list() {
        let pool = BufferPool::new(1024, 256);
        let buffer = pool.allocate(600, Duration::from_millis(10)).await.unwrap();
        assert_eq!(pool.available_memory(), 424);

        pool.deallocate(buffer, 600);
        assert_eq!(pool.unallocated_memory(), 1024);
    }

    #[tokio::test]
    async fn test_free_list_is_released_for_large_requests() {
        let pool = BufferPool::new(512, 256);
        let a = pool.allocate(256, Duration::ZERO).await.unwrap();
        let b = pool.allocate(256, Duration::ZERO).await.unwrap();
        pool.deallocate(a, 256);
        pool.deallocate(b, 256);
        assert_eq!(pool.unallocated_memory(), 0);

        let big = pool.allocate(512, Duration::ZERO).await.unwrap();
        assert_eq!(big.capacity(), 512);
        assert_eq!(pool.available_memory(), 0);
    }

    #[tokio::test]
    async fn test_request_larger_than_pool_fails_fast() {
        let pool = BufferPool::new(100, 50);
        let err = pool.allocate(101, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ProducerError::RecordTooLarge(101, 100));
    }

    // ============================================================================
    // Blocking
    // ============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_allocation_times_out_after_max_wait() {
        let pool = BufferPool::new(1000, 100);
        let _held = pool.allocate(500, Duration::ZERO).await.unwrap();

        let start = Instant::now();
        let err = pool
            .allocate(1000, Duration::from_millis(50))
            .await
            .unwrap_err();
        let waited = start.elapsed();

        assert_eq!(err, ProducerError::BufferExhausted(Duration::from_millis(50)));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(60));
        // Nothing leaked while waiting.
        assert_eq!(pool.available_memory(), 500);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_allocation_wakes_on_deallocate() {
        let pool = Arc::new(BufferPool::new(200, 100));
        let a = pool.allocate(100, Duration::ZERO).await.unwrap();
        let _b = pool.allocate(100, Duration::ZERO).await.unwrap();

        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(100, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.queued(), 1);

        pool.deallocate(a, 100);
        let buffer = waiting.await.unwrap().unwrap();
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_max_wait_blocks_until_memory_frees() {
        let pool = Arc::new(BufferPool::new(100, 100));
        let held = pool.allocate(100, Duration::ZERO).await.unwrap();

        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(100, Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(pool.queued(), 1);
        assert!(!waiting.is_finished());

        pool.deallocate(held, 100);
        assert_eq!(waiting.await.unwrap().unwrap().capacity(), 100);
    }

    #[tokio::test]
    async fn test_try_reserve_respects_queue_and_budget() {
        let pool = Arc::new(BufferPool::new(300, 100));
        let recycled = pool.allocate(100, Duration::ZERO).await.unwrap();
        pool.deallocate(recycled, 100);

        // Free-list buffers count toward the budget.
        assert!(pool.try_reserve(250));
        assert_eq!(pool.available_memory(), 50);
        assert!(!pool.try_reserve(51));

        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(100, Duration::from_secs(60)).await })
        };
        while pool.queued() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!pool.try_reserve(10));

        pool.deallocate(BytesMut::new(), 250);
        assert_eq!(waiting.await.unwrap().unwrap().capacity(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_order() {
        let pool = Arc::new(BufferPool::new(300, 100));
        let held = pool.allocate(300, Duration::ZERO).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..3 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let buffer = pool.allocate(100, Duration::from_secs(10)).await.unwrap();
                order.lock().push(id);
                buffer
            }));
            // Make arrival order deterministic.
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.queued(), 3);

        pool.deallocate(held, 300);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newcomer_queues_behind_waiter() {
        let pool = Arc::new(BufferPool::new(300, 100));
        let held = pool.allocate(250, Duration::ZERO).await.unwrap();

        let head = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(200, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        // 50 bytes are free but the head waiter is first in line.
        let small = pool.allocate(50, Duration::from_millis(5)).await;
        assert!(matches!(small, Err(ProducerError::BufferExhausted(_))));

        pool.deallocate(held, 250);
        assert_eq!(head.await.unwrap().unwrap().capacity(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_waiters() {
        let pool = Arc::new(BufferPool::new(100, 100));
        let _held = pool.allocate(100, Duration::ZERO).await.unwrap();

        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(100, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert_eq!(waiting.await.unwrap().unwrap_err(), ProducerError::Closed);
        assert_eq!(
            pool.allocate(10, Duration::ZERO).await.unwrap_err(),
            ProducerError::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_exceed_total() {
        let pool = Arc::new(BufferPool::new(1000, 100));
        let outstanding = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..32usize {
            let pool = Arc::clone(&pool);
            let outstanding = Arc::clone(&outstanding);
            handles.push(tokio::spawn(async move {
                let size = if i % 3 == 0 { 250 } else { 100 };
                for _ in 0..20 {
                    let buffer = pool.allocate(size, Duration::from_secs(30)).await.unwrap();
                    let now = outstanding.fetch_add(size, std::sync::atomic::Ordering::SeqCst) + size;
                    assert!(now <= 1000);
                    tokio::task::yield_now().await;
                    outstanding.fetch_sub(size, std::sync::atomic::Ordering::SeqCst);
                    pool.deallocate(buffer, size);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.available_memory(), 1000);
        assert_eq!(pool.queued(), 0);
    }
}
