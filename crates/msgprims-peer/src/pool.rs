//! Fixed-size worker pool for consumer callbacks.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{MessagingError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Threads draining a bounded job queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `size` workers over a queue holding at most `capacity` jobs.
    pub fn new(name: &str, size: usize, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Job>(capacity.max(1));
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(rx))
                .map_err(|err| MessagingError::Transport(err.into()))?;
            workers.push(handle);
        }
        debug!(size, capacity, "worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job. Blocks while the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or(MessagingError::Shutdown)?;
        sender
            .send(Box::new(job))
            .map_err(|_| MessagingError::Shutdown)
    }

    /// Close the queue, let queued jobs finish, and join the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            // A consumer may shut the system down from a worker thread.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        job();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new("test-pool", 2, 8).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new("test-pool", 1, 1).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(matches!(pool.submit(|| {}), Err(MessagingError::Shutdown)));
    }

    #[test]
    fn full_queue_blocks_submitter() {
        let pool = Arc::new(WorkerPool::new("test-pool", 1, 1).unwrap());
        let (release_tx, release_rx) = bounded::<()>(0);
        pool.submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
        // Worker is busy; this one fills the queue.
        pool.submit(|| {}).unwrap();

        let blocked = Arc::clone(&pool);
        let (done_tx, done_rx) = bounded::<()>(1);
        let submitter = thread::spawn(move || {
            blocked.submit(|| {}).unwrap();
            let _ = done_tx.send(());
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        release_tx.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        submitter.join().unwrap();
        pool.shutdown();
    }
}
