//! Background task runner.
//!
//! A fixed pool of worker threads fed by a job queue. Slow, blocking work
//! (bias reads, sampling, calibration math) runs here so the owning sequence
//! never blocks on hardware.
//!
//! Each `TaskRunner` owns its threads; dropping it closes the queue, lets the
//! workers finish whatever they already picked up, and joins them.
use crossbeam_channel as xch;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskRunner {
    tx: Option<xch::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskRunner {
    /// Spawn `workers` threads (at least one).
    pub fn spawn(workers: usize) -> std::io::Result<Self> {
        let (tx, rx) = xch::unbounded::<Task>();
        let mut handles = Vec::with_capacity(workers.max(1));
        for idx in 0..workers.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("senscal-worker-{idx}"))
                .spawn(move || {
                    // recv() fails once every sender is gone: queue closed and drained
                    while let Ok(task) = rx.recv() {
                        if let Err(e) = catch_unwind(AssertUnwindSafe(task)) {
                            tracing::error!(worker = idx, ?e, "background task panicked");
                        }
                    }
                    tracing::trace!(worker = idx, "worker thread exiting cleanly");
                })?;
            handles.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task. Returns false if the runner is shutting down.
    pub fn post(&self, task: Task) -> bool {
        match &self.tx {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        // Closing the queue is the shutdown signal.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(()) => tracing::trace!("worker thread joined"),
                Err(e) => tracing::warn!(?e, "worker thread panicked during shutdown"),
            }
        }
    }
}
