use crate::live_heap::LiveHeap;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RingError {
    /// No heap available right now, but the ring has not been stopped.
    #[error("ring buffer is empty")]
    Empty,
    /// The ring has been stopped and drained.
    #[error("ring buffer has been stopped")]
    Stopped,
}

/// Why a non-blocking push did not take the heap. The heap travels back so
///  the caller can park it.
#[derive(Debug)]
pub(crate) enum PushError {
    Full(LiveHeap),
    Stopped(LiveHeap),
}

/// Bounded queue of emitted heaps with a data counter and a space counter.
///
/// Producers never block: `try_push` either takes a space permit or reports
///  full, and the stream pauses itself on full. Consumers block on the data
///  semaphore; a producer waiting to resume blocks on the space semaphore.
///  `stop` closes both semaphores so every waiter on either side wakes.
pub(crate) struct HeapRing {
    queue: Mutex<VecDeque<LiveHeap>>,
    data: Semaphore,
    space: Semaphore,
}

impl HeapRing {
    pub(crate) fn new(capacity: usize) -> HeapRing {
        HeapRing {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            data: Semaphore::new(0),
            space: Semaphore::new(capacity),
        }
    }

    pub(crate) fn try_push(&self, heap: LiveHeap) -> Result<(), PushError> {
        match self.space.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.queue.lock().unwrap().push_back(heap);
                self.data.add_permits(1);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(PushError::Full(heap)),
            Err(TryAcquireError::Closed) => Err(PushError::Stopped(heap)),
        }
    }

    /// Wait for a heap. After a stop the remaining queued heaps are still
    ///  drained before this reports [`RingError::Stopped`].
    pub(crate) async fn pop(&self) -> Result<LiveHeap, RingError> {
        match self.data.acquire().await {
            Ok(permit) => {
                permit.forget();
                let heap = self
                    .queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("data permits match queued heaps");
                self.space.add_permits(1);
                Ok(heap)
            }
            Err(_) => self.queue.lock().unwrap().pop_front().ok_or(RingError::Stopped),
        }
    }

    pub(crate) fn try_pop(&self) -> Result<LiveHeap, RingError> {
        match self.data.try_acquire() {
            Ok(permit) => {
                permit.forget();
                let heap = self
                    .queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("data permits match queued heaps");
                self.space.add_permits(1);
                Ok(heap)
            }
            Err(TryAcquireError::NoPermits) => Err(RingError::Empty),
            Err(TryAcquireError::Closed) => {
                self.queue.lock().unwrap().pop_front().ok_or(RingError::Stopped)
            }
        }
    }

    /// Wait until at least one slot is free, without claiming it. Reports
    ///  [`RingError::Stopped`] if the ring stops while waiting.
    pub(crate) async fn wait_space(&self) -> Result<(), RingError> {
        match self.space.acquire().await {
            Ok(_permit) => Ok(()),
            Err(_) => Err(RingError::Stopped),
        }
    }

    /// Mark the ring stopped and wake every waiter on both sides. Queued
    ///  heaps remain poppable until drained. Idempotent.
    pub(crate) fn stop(&self) {
        self.data.close();
        self.space.close();
    }
}
