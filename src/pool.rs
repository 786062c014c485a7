use std::{future::Future, sync::Arc};
use tokio::sync::Semaphore;

/// Runs method invocations with at most `workers` of them in flight.
///
/// [`submit`](WorkerPool::submit) never waits: the work is spawned at once and queues
/// for a permit inside its own task, so the connection that submitted it keeps reading.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // the semaphore is never closed
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers not currently running a job.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn never_runs_more_than_workers_at_once() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }

        for _ in 0..8 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn zero_workers_means_one() {
        assert_eq!(WorkerPool::new(0).workers(), 1);
    }
}
