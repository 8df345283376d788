use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded thread pool shared by the compaction managers of all buckets.
/// The engine never creates unbounded pools; the pool is injected into
/// each writer at construction.
pub struct CompactExecutor {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CompactExecutor {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = flume::unbounded();
        let workers = (0..threads)
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("compact-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                        debug!(worker = i, "compact worker exiting");
                    })
                    .expect("spawning compact worker must succeed")
            })
            .collect();
        CompactExecutor {
            sender: Some(sender),
            workers,
        }
    }

    /// Run `task` on the pool; the handle observes completion without
    /// blocking the submitting thread.
    pub fn submit<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> TaskHandle<T> {
        let (tx, rx) = flume::bounded(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });
        let sender = self
            .sender
            .as_ref()
            .expect("executor is alive until dropped");
        // workers outlive the sender; a failed send would only surface as
        // an abnormally terminated task at the handle
        let _ = sender.send(job);
        TaskHandle { rx }
    }
}

impl Drop for CompactExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Completion handle of one submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Non-blocking poll; `None` while the task is still running.
    pub fn try_poll(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Block until the task finishes. `None` when the task panicked.
    pub fn join(self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        !self.rx.is_empty() || self.rx.is_disconnected()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::CompactExecutor;

    #[test]
    fn runs_tasks_in_parallel() {
        let executor = CompactExecutor::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counter = counter.clone();
                executor.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    i * 2
                })
            })
            .collect();
        let mut results: Vec<usize> = handles.into_iter().filter_map(|h| h.join()).collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn poll_observes_completion() {
        let executor = CompactExecutor::new(1);
        let handle = executor.submit(|| 7u64);
        let value = loop {
            if let Some(v) = handle.try_poll() {
                break v;
            }
            std::thread::yield_now();
        };
        assert_eq!(value, 7);
    }

    #[test]
    fn drop_joins_workers() {
        let executor = CompactExecutor::new(2);
        let handle = executor.submit(|| 1);
        drop(executor);
        assert_eq!(handle.join(), Some(1));
    }
}
