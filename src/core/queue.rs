use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("run queue is full ({waiting} submissions waiting)")]
    Full { waiting: usize },
    #[error("run queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub waiting: usize,
    pub running: usize,
}

/// Bounded-concurrency admission control. Waiters are admitted in FIFO order.
#[derive(Debug, Clone)]
pub struct RunQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    max_waiting: Option<usize>,
    waiting: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

impl RunQueue {
    pub fn new(capacity: usize, max_waiting: Option<usize>) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_waiting,
            waiting: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers a submission as waiting. The returned ticket must be
    /// admitted before the run may execute.
    pub fn enqueue(&self) -> Result<QueueTicket, QueueError> {
        if self.semaphore.is_closed() {
            return Err(QueueError::Closed);
        }

        let result = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                match self.max_waiting {
                    Some(max) if waiting >= max => None,
                    _ => Some(waiting + 1),
                }
            });
        if let Err(waiting) = result {
            return Err(QueueError::Full { waiting });
        }

        Ok(QueueTicket {
            queue: self.clone(),
            admitted: false,
        })
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            waiting: self.waiting.load(Ordering::Acquire),
            running: self.running.load(Ordering::Acquire),
        }
    }

    /// Wakes every waiter with [`QueueError::Closed`]. Slots already handed
    /// out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[derive(Debug)]
pub struct QueueTicket {
    queue: RunQueue,
    admitted: bool,
}

impl QueueTicket {
    /// Suspends until a slot is free. Dropping the future gives up the place
    /// in line.
    pub async fn admit(mut self) -> Result<RunSlot, QueueError> {
        let permit = self
            .queue
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Closed)?;

        self.admitted = true;
        self.queue.waiting.fetch_sub(1, Ordering::AcqRel);
        self.queue.running.fetch_add(1, Ordering::AcqRel);

        Ok(RunSlot {
            running: self.queue.running.clone(),
            _permit: permit,
        })
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.admitted {
            self.queue.waiting.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Execution slot. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct RunSlot {
    running: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}
