//! Fixed-size pool of OS worker threads.
//!
//! Hashing is CPU-bound, so workers are real threads, not cooperative
//! tasks. The pool joins every worker on drop; shutdown is driven entirely
//! by the job queue's closed flag, so dropping the pool after closing the
//! queue is the whole teardown protocol.

use std::thread::{self, JoinHandle};

/// Joins its workers on drop.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers running `work(worker_index)`.
    pub fn spawn<F>(count: usize, work: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
        F: Clone,
    {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let work = work.clone();
            let handle = thread::Builder::new()
                .name(format!("scan-worker-{index}"))
                .spawn(move || work(index))
                .expect("spawn scan worker");
            handles.push(handle);
        }
        Self { handles }
    }

    /// Joins all workers. Equivalent to dropping the pool, but explicit.
    pub fn join(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                // Worker bodies catch panics per job; reaching this means a
                // worker died outside a job. The scan result is still
                // whatever the trackers and sinks observed.
                tracing::error!("scan worker terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::JobQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn workers_drain_the_queue_and_exit() {
        let queue = Arc::new(JobQueue::new(8));
        let processed = Arc::new(AtomicUsize::new(0));

        let pool = {
            let queue = Arc::clone(&queue);
            let processed = Arc::clone(&processed);
            WorkerPool::spawn(4, move |_| {
                while queue.pop().is_some() {
                    processed.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        for i in 0..100 {
            queue.push(i);
        }
        queue.close();
        pool.join();
        assert_eq!(processed.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn drop_joins_workers_after_close() {
        let queue = Arc::new(JobQueue::<u32>::new(2));
        let pool = {
            let queue = Arc::clone(&queue);
            WorkerPool::spawn(2, move |_| while queue.pop().is_some() {})
        };
        queue.push(1);
        // Teardown order: close the queue first, then drop the pool. Drop
        // before close would block the join on workers stuck in pop.
        queue.close();
        drop(pool);
        assert!(queue.is_empty());
    }
}
