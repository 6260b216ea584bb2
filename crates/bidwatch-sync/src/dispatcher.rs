//! Bounded fan-out worker pool with a typed job queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Concurrent delivery workers.
pub const DELIVERY_WORKERS: usize = 8;

/// Jobs that may wait for a free worker before `submit` starts to block.
pub const DELIVERY_QUEUE_CAPACITY: usize = 64;

#[async_trait]
pub trait JobHandler<J: Send + 'static>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn handle(&self, job: J) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher queue is full")]
    Saturated,
    #[error("dispatcher is closed")]
    Closed,
}

struct Envelope<J, O> {
    job: J,
    reply: oneshot::Sender<O>,
}

/// Handle to a submitted job's result.
#[derive(Debug)]
pub struct JobTicket<O>(oneshot::Receiver<O>);

impl<O> JobTicket<O> {
    /// `None` when the job panicked or was abandoned at shutdown.
    pub async fn wait(self) -> Option<O> {
        self.0.await.ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub workers_drained: usize,
    pub workers_aborted: usize,
}

/// Fixed-size pool fed by a bounded channel.
///
/// Back-pressure policy: [`Dispatcher::submit`] waits for queue space,
/// [`Dispatcher::try_submit`] fails fast with [`DispatchError::Saturated`].
/// A job that errors or panics is logged and never affects its siblings.
pub struct Dispatcher<J, O> {
    name: &'static str,
    tx: std::sync::Mutex<Option<mpsc::Sender<Envelope<J, O>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send + 'static, O: Send + 'static> Dispatcher<J, O> {
    pub fn start<H>(name: &'static str, handler: Arc<H>, workers: usize, capacity: usize) -> Self
    where
        H: JobHandler<J, Output = O>,
    {
        let (tx, rx) = mpsc::channel::<Envelope<J, O>>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let handler = handler.clone();
                tokio::spawn(worker_loop(name, worker_id, rx, handler))
            })
            .collect::<Vec<_>>();
        info!(dispatcher = name, workers = workers.len(), capacity, "dispatcher started");
        Self {
            name,
            tx: std::sync::Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Envelope<J, O>>, DispatchError> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DispatchError::Closed)
    }

    /// Queue a job, waiting for space when the queue is full.
    pub async fn submit(&self, job: J) -> Result<JobTicket<O>, DispatchError> {
        let tx = self.sender()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Envelope { job, reply })
            .await
            .map_err(|_| DispatchError::Closed)?;
        Ok(JobTicket(rx))
    }

    /// Queue a job without waiting.
    pub fn try_submit(&self, job: J) -> Result<JobTicket<O>, DispatchError> {
        let tx = self.sender()?;
        let (reply, rx) = oneshot::channel();
        tx.try_send(Envelope { job, reply }).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DispatchError::Saturated,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })?;
        Ok(JobTicket(rx))
    }

    /// Stop accepting jobs, let queued and in-flight jobs finish, and abort
    /// whatever is still running once `grace` elapses.
    pub async fn close(&self, grace: Duration) -> ShutdownReport {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let mut handles = std::mem::take(&mut *self.workers.lock().await);
        let mut report = ShutdownReport::default();

        let deadline = tokio::time::Instant::now() + grace;
        for handle in handles.iter_mut() {
            match tokio::time::timeout_at(deadline, &mut *handle).await {
                Ok(_) => report.workers_drained += 1,
                Err(_) => {
                    handle.abort();
                    report.workers_aborted += 1;
                }
            }
        }
        if report.workers_aborted > 0 {
            warn!(
                dispatcher = self.name,
                aborted = report.workers_aborted,
                "grace period elapsed; in-flight jobs abandoned"
            );
        } else {
            info!(dispatcher = self.name, drained = report.workers_drained, "dispatcher drained");
        }
        report
    }
}

async fn worker_loop<J, O, H>(
    name: &'static str,
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Envelope<J, O>>>>,
    handler: Arc<H>,
) where
    J: Send + 'static,
    O: Send + 'static,
    H: JobHandler<J, Output = O>,
{
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(Envelope { job, reply }) = next else {
            debug!(dispatcher = name, worker_id, "queue closed; worker exiting");
            break;
        };

        // Aborting this worker drops the set, which aborts the job with it.
        let mut running = JoinSet::new();
        let handler = handler.clone();
        running.spawn(async move { handler.handle(job).await });
        match running.join_next().await {
            Some(Ok(output)) => {
                let _ = reply.send(output);
            }
            Some(Err(err)) => {
                error!(dispatcher = name, worker_id, error = %err, "job task failed");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        active: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
    }

    #[async_trait]
    impl JobHandler<u32> for CountingHandler {
        type Output = u32;

        async fn handle(&self, job: u32) -> u32 {
            if job == 0 {
                panic!("job zero always fails");
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            job * 2
        }
    }

    fn counting_handler(hold: Duration) -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_worker_count() {
        let handler = counting_handler(Duration::from_millis(50));
        let dispatcher = Dispatcher::start("test", handler.clone(), 3, 32);

        let mut tickets = Vec::new();
        for job in 1..=10 {
            tickets.push(dispatcher.submit(job).await.expect("submit"));
        }
        let mut results = Vec::new();
        for ticket in tickets {
            results.push(ticket.wait().await.expect("result"));
        }

        assert_eq!(results, (1..=10).map(|j| j * 2).collect::<Vec<_>>());
        assert_eq!(handler.peak.load(Ordering::SeqCst), 3);
        dispatcher.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_does_not_take_down_siblings() {
        let dispatcher = Dispatcher::start("test", counting_handler(Duration::from_millis(1)), 1, 8);
        let failed = dispatcher.submit(0).await.expect("submit");
        let ok = dispatcher.submit(21).await.expect("submit");
        assert_eq!(failed.wait().await, None);
        assert_eq!(ok.wait().await, Some(42));
        let report = dispatcher.close(Duration::from_secs(1)).await;
        assert_eq!(report.workers_drained, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn try_submit_reports_saturation() {
        let dispatcher = Dispatcher::start("test", counting_handler(Duration::from_secs(60)), 1, 1);
        let _running = dispatcher.submit(1).await.expect("submit");
        // Let the worker pull the first job off the queue.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _queued = dispatcher.try_submit(2).expect("queue has one slot");
        assert_eq!(dispatcher.try_submit(3).err(), Some(DispatchError::Saturated));
        dispatcher.close(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_new_jobs_and_aborts_after_grace() {
        let dispatcher = Dispatcher::start("test", counting_handler(Duration::from_secs(3600)), 2, 4);
        let stuck = dispatcher.submit(5).await.expect("submit");
        tokio::time::sleep(Duration::from_millis(1)).await;

        let report = dispatcher.close(Duration::from_secs(5)).await;
        assert_eq!(report.workers_aborted, 1);
        assert_eq!(report.workers_drained, 1);
        assert_eq!(stuck.wait().await, None);
        assert_eq!(dispatcher.submit(6).await.err(), Some(DispatchError::Closed));
    }
}
