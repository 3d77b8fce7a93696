//! Delivery queue: durable webhook jobs executed by a bounded worker pool.
//!
//! ## Lifecycle of a job
//!
//! 1. [`DeliveryQueue::enqueue`] appends an `enqueued` record to the journal
//!    and returns once it is synced. The job is then handed to the workers.
//! 2. A worker journals an `attempt` record, then makes one HTTP call bounded
//!    by the per-attempt timeout.
//! 3. On failure with budget left, the job is re-queued after
//!    `min(base * 2^(attempt-1), max)`. On success or exhaustion the job is
//!    journaled `finished` and its terminal outcome is reported to the log
//!    sink, once. Intermediate failures are never reported.
//!
//! Jobs left unfinished by a crash are replayed on the next start; the
//! journaled attempt count keeps the total number of attempts bounded.

pub mod journal;
pub mod webhook;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{DispatchError, QueueError};
use crate::models::{DeviceId, ForwardingRule, HttpMethod, LogId, LogStatus, RuleId, TriggerKind};
use crate::store::LogSink;
use journal::{Journal, JournalRecord};
use webhook::WebhookTransport;

/// Error recorded for jobs whose attempts were all used before a restart.
const EXHAUSTED_BEFORE_RESTART: &str = "attempts exhausted before restart";

/// Normalized event payload; the JSON body of every webhook call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One scheduled webhook call for one (event, rule) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub rule_id: RuleId,
    pub webhook_url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub secret_header: Option<String>,
    pub event: WebhookEvent,
    /// Log entry whose status receives the terminal outcome.
    #[serde(default)]
    pub log_id: Option<LogId>,
    /// Attempts already started.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Resolve a matched rule into a job for `event`.
    pub fn for_rule(rule: &ForwardingRule, event: WebhookEvent, log_id: Option<LogId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            webhook_url: rule.webhook_url.clone(),
            method: rule.method,
            secret_header: rule.secret_header.clone(),
            event,
            log_id,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

/// Attempt budget, per-attempt timeout and backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Directory holding the journal.
    pub dir: PathBuf,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub compact_threshold: usize,
}

type ReadyRx = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DeliveryJob>>>;

struct QueueInner {
    journal: Journal,
    ready_tx: mpsc::UnboundedSender<DeliveryJob>,
    transport: Arc<dyn WebhookTransport>,
    logs: Arc<dyn LogSink>,
    retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the delivery queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Open the journal, recover unfinished jobs and start the worker pool.
    pub async fn start(
        settings: QueueSettings,
        transport: Arc<dyn WebhookTransport>,
        logs: Arc<dyn LogSink>,
    ) -> Result<Self, QueueError> {
        let (journal, recovered) =
            Journal::open(&settings.dir, settings.compact_threshold).await?;
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let queue = Self {
            inner: Arc::new(QueueInner {
                journal,
                ready_tx,
                transport,
                logs,
                retry: settings.retry,
                shutdown_tx,
                workers: Mutex::new(Vec::new()),
            }),
        };

        let ready_rx: ReadyRx = Arc::new(tokio::sync::Mutex::new(ready_rx));
        let handles: Vec<_> = (0..settings.workers.max(1))
            .map(|n| {
                let inner = Arc::clone(&queue.inner);
                let rx = Arc::clone(&ready_rx);
                tokio::spawn(
                    worker_loop(inner, rx).instrument(tracing::debug_span!("delivery_worker", n)),
                )
            })
            .collect();
        *lock(&queue.inner.workers) = handles;

        for job in recovered {
            if job.attempts >= queue.inner.retry.max_attempts {
                warn!(job_id = %job.id, attempts = job.attempts, "Delivery job exhausted before restart");
                queue
                    .inner
                    .finish(&job, LogStatus::Failed, Some(EXHAUSTED_BEFORE_RESTART.to_string()))
                    .await;
            } else {
                let _ = queue.inner.ready_tx.send(job);
            }
        }

        info!(workers = settings.workers.max(1), "Delivery queue started");
        Ok(queue)
    }

    /// Durably accept a job. Returns once the job is on disk, not once it
    /// is delivered.
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<(), QueueError> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(QueueError::Closed);
        }
        self.inner
            .journal
            .append(JournalRecord::Enqueued { job: job.clone() })
            .await?;
        debug!(job_id = %job.id, rule_id = job.rule_id, "Delivery job enqueued");
        self.inner
            .ready_tx
            .send(job)
            .map_err(|_| QueueError::Closed)
    }

    /// Stop the workers once their in-flight attempts complete. Jobs not yet
    /// finished stay in the journal for the next start.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *lock(&self.inner.workers));
        for handle in handles {
            let _ = handle.await;
        }
        info!("Delivery queue stopped");
    }
}

async fn worker_loop(inner: Arc<QueueInner>, ready_rx: ReadyRx) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = async { ready_rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.attempt(job).await;
    }
}

impl QueueInner {
    /// Run the next attempt of `job` and route its outcome.
    async fn attempt(self: &Arc<Self>, mut job: DeliveryJob) {
        let attempt = job.attempts + 1;
        if let Err(e) = self
            .journal
            .append(JournalRecord::Attempt { id: job.id, attempt })
            .await
        {
            error!(job_id = %job.id, "Failed to journal delivery attempt: {e}");
        }
        job.attempts = attempt;

        let timeout = self.retry.attempt_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.deliver(&job)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    rule_id = job.rule_id,
                    attempt,
                    method = job.method.as_str(),
                    url = %job.webhook_url,
                    "Webhook delivered"
                );
                self.finish(&job, LogStatus::Delivered, None).await;
            }
            Err(e) if attempt >= self.retry.max_attempts => {
                warn!(
                    job_id = %job.id,
                    rule_id = job.rule_id,
                    attempt,
                    method = job.method.as_str(),
                    url = %job.webhook_url,
                    "Webhook delivery failed permanently: {e}"
                );
                self.finish(&job, LogStatus::Failed, Some(e.to_string())).await;
            }
            Err(e) => {
                let delay = self.retry.backoff(attempt);
                debug!(job_id = %job.id, attempt, ?delay, "Webhook attempt failed, retrying: {e}");
                self.schedule_retry(job, delay);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: DeliveryJob, delay: Duration) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    let _ = inner.ready_tx.send(job);
                }
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    debug!(job_id = %job.id, "Retry left in journal for next start");
                }
            }
        });
    }

    /// Mark `job` finished and report its terminal outcome.
    async fn finish(&self, job: &DeliveryJob, status: LogStatus, error: Option<String>) {
        if let Err(e) = self
            .journal
            .append(JournalRecord::Finished { id: job.id })
            .await
        {
            error!(job_id = %job.id, "Failed to journal finished delivery: {e}");
        }
        let Some(log_id) = job.log_id else {
            debug!(job_id = %job.id, status = status.as_str(), "Delivery finished without log entry");
            return;
        };
        if let Err(e) = self.logs.update_status(log_id, status, error).await {
            warn!(job_id = %job.id, log_id, "Failed to report delivery outcome: {e}");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
