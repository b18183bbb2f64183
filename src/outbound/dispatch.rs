//! Background dispatch of send jobs.
//!
//! The webhook hands jobs to a bounded queue and returns immediately. One
//! worker task drains the queue, running at most `concurrency` deliveries at a
//! time and retrying transient provider failures with exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{OutboundSender, validate_job};
use crate::error::DeliveryError;
use crate::pipeline::SendJob;

/// Backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Queue and worker settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            concurrency: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle for enqueueing send jobs. Cheap to clone.
///
/// The worker finishes in-flight deliveries and exits once every handle is
/// dropped.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<SendJob>,
    capacity: usize,
}

impl Dispatcher {
    /// Start the worker task.
    pub fn spawn(sender: Arc<dyn OutboundSender>, config: DispatchConfig) -> (Self, JoinHandle<()>) {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(run_worker(rx, sender, config));
        (Self { tx, capacity }, handle)
    }

    /// Enqueue a job without waiting.
    pub fn submit(&self, job: SendJob) -> Result<(), DeliveryError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => DeliveryError::QueueClosed,
        })
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<SendJob>,
    sender: Arc<dyn OutboundSender>,
    config: DispatchConfig,
) {
    let concurrency = config.concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    info!(
        provider = sender.name(),
        concurrency,
        capacity = config.queue_capacity,
        "Dispatcher started"
    );

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let sender = Arc::clone(&sender);
        let retry = config.retry.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match deliver(sender.as_ref(), &job, &retry).await {
                Ok(attempts) => info!(
                    provider = sender.name(),
                    attempts,
                    job = %job.summary(),
                    "Delivered message"
                ),
                Err(e) => error!(
                    provider = sender.name(),
                    job = %job.summary(),
                    error = %e,
                    "Failed to deliver message"
                ),
            }
        });
    }

    // Wait for in-flight deliveries before exiting.
    let _ = permits.acquire_many(concurrency as u32).await;
    debug!("Dispatcher stopped");
}

/// Deliver one job, retrying transient failures. Returns the attempts used.
pub async fn deliver(
    sender: &dyn OutboundSender,
    job: &SendJob,
    retry: &RetryPolicy,
) -> Result<u32, DeliveryError> {
    validate_job(job)?;

    let started = Instant::now();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match sender.send(job).await {
            Ok(()) => return Ok(attempt),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(
                    provider = sender.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient delivery failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
