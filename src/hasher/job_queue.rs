//! Bounded blocking MPMC job queue with cooperative shutdown.
//!
//! # Invariants
//! - `push` blocks while the queue is full; `pop` blocks while it is empty
//!   and still open.
//! - `pop` returns `None` only once the queue is both closed and empty, so
//!   workers drain everything before exiting.
//! - Pushing stays legal after `close`: workers enqueue recursion jobs
//!   while the producer side is already done. `try_push` never blocks and
//!   hands the job back when the queue is full, letting a worker fall back
//!   to processing it inline instead of risking an all-workers-pushing
//!   deadlock.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    jobs: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer / multi-consumer queue.
pub struct JobQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> JobQueue<T> {
    /// Creates a queue holding at most `capacity` jobs.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "job queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                jobs: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocks until there is room, then enqueues.
    pub fn push(&self, job: T) {
        let mut inner = self.inner.lock().expect("job queue mutex poisoned");
        while inner.jobs.len() >= self.capacity {
            inner = self
                .not_full
                .wait(inner)
                .expect("job queue mutex poisoned");
        }
        inner.jobs.push_back(job);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Enqueues without blocking; returns the job when the queue is full.
    pub fn try_push(&self, job: T) -> Result<(), T> {
        let mut inner = self.inner.lock().expect("job queue mutex poisoned");
        if inner.jobs.len() >= self.capacity {
            return Err(job);
        }
        inner.jobs.push_back(job);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until a job is available or the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("job queue mutex poisoned");
        loop {
            if let Some(job) = inner.jobs.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(job);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("job queue mutex poisoned");
        }
    }

    /// Marks the producer side done. Waiting workers drain the backlog and
    /// then observe `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("job queue mutex poisoned");
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("job queue mutex poisoned").jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_within_capacity() {
        let q = JobQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn try_push_reports_full() {
        let q = JobQueue::new(2);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_push(3), Err(3));
        q.pop();
        assert!(q.try_push(3).is_ok());
    }

    #[test]
    fn pop_returns_none_only_when_closed_and_empty() {
        let q = Arc::new(JobQueue::new(2));
        q.push(7);
        q.close();
        // Backlog drains before the closed signal is observed.
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), None);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_after_close_is_still_delivered() {
        let q = JobQueue::new(2);
        q.close();
        q.push(9);
        assert_eq!(q.pop(), Some(9));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_queue_blocks_producer_until_consumed() {
        let q = Arc::new(JobQueue::new(1));
        q.push(1);

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                q.push(2);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop(), Some(1));
        producer.join().unwrap();
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn blocked_consumers_wake_on_close() {
        let q = Arc::new(JobQueue::<u32>::new(2));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        q.close();
        for c in consumers {
            assert_eq!(c.join().unwrap(), None);
        }
    }

    #[test]
    fn many_producers_many_consumers_deliver_everything() {
        let q = Arc::new(JobQueue::new(8));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        q.push(p * 100 + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(v) = q.pop() {
                        seen.push(v);
                    }
                    seen
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        q.close();
        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..400).collect::<Vec<u32>>());
    }
}
