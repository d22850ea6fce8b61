//! Bounded worker pool.
//!
//! A fixed number of tokio tasks drain a fixed-capacity channel. `submit`
//! waits while the channel is full, so a fast producer (a listing, a list of
//! batches) is held back to the pace the workers, and the remote API behind
//! them, can sustain.
//!
//! A failing job is logged and counted but never cancels its siblings; the
//! pool always drains completely and `join` reports the failures afterwards.

use anyhow::{Result, anyhow};
use rand::Rng;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Outcomes {
    completed: usize,
    failed: usize,
    first_error: Option<anyhow::Error>,
}

impl Outcomes {
    fn record(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.completed += 1,
            Err(e) => {
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(e);
                }
            }
        }
    }
}

pub struct WorkerPool<T> {
    name: &'static str,
    sender: mpsc::Sender<T>,
    workers: Vec<JoinHandle<()>>,
    outcomes: Arc<Mutex<Outcomes>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `workers` tasks running `handler` on items from a queue holding at
    /// most `queue_size` pending items.
    pub fn new<F, Fut>(name: &'static str, workers: usize, queue_size: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<T>(queue_size.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handler = Arc::new(handler);
        let outcomes = Arc::new(Mutex::new(Outcomes::default()));

        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let outcomes = outcomes.clone();

                tokio::spawn(async move {
                    loop {
                        let item = {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        };
                        let Some(item) = item else { break };

                        let result = (*handler)(item).await;
                        if let Err(e) = &result {
                            log::error!("{name} worker {id}: job failed: {e:#}");
                        }
                        if let Ok(mut outcomes) = outcomes.lock() {
                            outcomes.record(result);
                        }
                    }
                    log::debug!("{name} worker {id} stopped");
                })
            })
            .collect();

        log::debug!("Started {name} pool with queue size {}", queue_size.max(1));

        Self {
            name,
            sender,
            workers,
            outcomes,
        }
    }

    /// Queue an item, waiting while the queue is full
    pub async fn submit(&self, item: T) -> Result<()> {
        self.sender
            .send(item)
            .await
            .map_err(|_| anyhow!("{} pool has no running workers", self.name))
    }

    /// Close the queue and wait for every queued job to finish.
    ///
    /// Returns the number of completed jobs, or the first failure annotated
    /// with how many jobs failed.
    pub async fn join(self) -> Result<usize> {
        let WorkerPool {
            name,
            sender,
            workers,
            outcomes,
        } = self;
        drop(sender);

        let mut panicked = 0;
        for handle in workers {
            if let Err(e) = handle.await {
                log::error!("{name} worker panicked: {e}");
                panicked += 1;
            }
        }

        let mut outcomes = outcomes
            .lock()
            .map_err(|_| anyhow!("{name} pool outcome lock poisoned"))?;

        if let Some(first) = outcomes.first_error.take() {
            return Err(first.context(format!(
                "{} of {} {name} jobs failed",
                outcomes.failed,
                outcomes.failed + outcomes.completed
            )));
        }

        if panicked > 0 {
            anyhow::bail!("{panicked} {name} worker(s) panicked");
        }

        Ok(outcomes.completed)
    }
}

/// A random pause from `millis`, spreading out submissions to the remote API
pub fn jitter(millis: RangeInclusive<u64>) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_all_jobs_complete() {
        let sum = Arc::new(AtomicUsize::new(0));
        let pool = {
            let sum = sum.clone();
            WorkerPool::new("sum", 3, 2, move |n: usize| {
                let sum = sum.clone();
                async move {
                    sum.fetch_add(n, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        for n in 1..=100 {
            pool.submit(n).await.unwrap();
        }

        assert_eq!(pool.join().await.unwrap(), 100);
        assert_eq!(sum.load(Ordering::SeqCst), 5050);
    }

    #[tokio::test]
    async fn test_failures_do_not_cancel_siblings() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = {
            let done = done.clone();
            WorkerPool::new("flaky", 2, 4, move |n: usize| {
                let done = done.clone();
                async move {
                    if n % 10 == 0 {
                        anyhow::bail!("job {n} failed");
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        for n in 1..=50 {
            pool.submit(n).await.unwrap();
        }

        let err = pool.join().await.unwrap_err();
        assert_eq!(done.load(Ordering::SeqCst), 45);
        assert!(format!("{err:#}").contains("5 of 50 flaky jobs failed"));
    }

    #[tokio::test]
    async fn test_submit_blocks_when_queue_is_full() {
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let pool = WorkerPool::new("gated", 1, 1, move |_: usize| {
            let mut release = release_rx.clone();
            async move {
                while !*release.borrow() {
                    release.changed().await?;
                }
                Ok(())
            }
        });

        // one job held by the worker, one waiting in the queue
        pool.submit(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.submit(3)).await;
        assert!(blocked.is_err(), "submit should wait for queue capacity");

        release_tx.send(true).unwrap();
        pool.submit(3).await.unwrap();
        assert_eq!(pool.join().await.unwrap(), 3);
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..100 {
            let pause = jitter(10..=30);
            assert!(pause >= Duration::from_millis(10) && pause <= Duration::from_millis(30));
        }
    }
}
