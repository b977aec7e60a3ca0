//! Progress reporting to the control plane.
//!
//! Each deployment gets a bounded FIFO of `(event, seq)` pairs drained by a
//! sender task that batches by size or age and retries with exponential
//! backoff. Producers block when the queue is full; events are never
//! dropped. Sequence numbers are strictly monotone per deployment, so the
//! control plane can order at-least-once deliveries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api::client::{ApiClient, LogBlock, LogSeverity};
use crate::model::deployment::{DeploymentStatus, StageStatus};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Reporter options
#[derive(Debug, Clone)]
pub struct ReporterOptions {
    /// Queue capacity per deployment; producers block beyond this
    pub queue_capacity: usize,

    /// Maximum events per API call
    pub max_batch: usize,

    /// Flush a partial batch after this long
    pub flush_interval: Duration,

    /// Backoff applied between failed sends
    pub cooldown: CooldownOptions,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_batch: 64,
            flush_interval: Duration::from_secs(2),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// One progress event within a deployment
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    DeploymentStatus {
        status: DeploymentStatus,
        reason: String,
    },
    StageStatus {
        index: u32,
        status: StageStatus,
        reason: String,
        retried_count: u32,
    },
    StageLog {
        index: u32,
        severity: LogSeverity,
        message: String,
    },
}

#[derive(Debug)]
struct SequencedEvent {
    seq: u64,
    event: ProgressEvent,
}

struct Queue {
    tx: mpsc::Sender<SequencedEvent>,
    next_seq: u64,
}

struct Entry {
    queue: Arc<Mutex<Queue>>,
    sender: JoinHandle<()>,
}

/// Batched, ordered forwarder of stage logs and status changes
pub struct ProgressReporter {
    api: Arc<dyn ApiClient>,
    options: ReporterOptions,
    queues: Mutex<HashMap<String, Entry>>,
}

impl ProgressReporter {
    pub fn new(api: Arc<dyn ApiClient>, options: ReporterOptions) -> Self {
        Self {
            api,
            options,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// A log sink bound to one stage of one deployment
    pub fn stage_log_sink(
        self: &Arc<Self>,
        deployment_id: &str,
        stage_index: u32,
    ) -> StageLogSink {
        StageLogSink {
            reporter: self.clone(),
            deployment_id: deployment_id.to_string(),
            stage_index,
        }
    }

    /// Enqueue one event; blocks when the deployment's queue is full.
    pub async fn publish(&self, deployment_id: &str, event: ProgressEvent) {
        let queue = {
            let mut queues = self.queues.lock().await;
            let entry = queues
                .entry(deployment_id.to_string())
                .or_insert_with(|| self.spawn_sender(deployment_id));
            entry.queue.clone()
        };

        // Sequence assignment and enqueue happen under the same lock so the
        // queue order always matches the sequence order.
        let mut queue = queue.lock().await;
        let seq = queue.next_seq;
        queue.next_seq += 1;
        if queue.tx.send(SequencedEvent { seq, event }).await.is_err() {
            error!("progress queue for {} is closed", deployment_id);
        }
    }

    /// Close a deployment's queue and wait for its sender to drain.
    pub async fn finish(&self, deployment_id: &str) {
        let entry = {
            let mut queues = self.queues.lock().await;
            queues.remove(deployment_id)
        };
        let Some(Entry { queue, sender }) = entry else {
            return;
        };

        // Dropping the queue closes the channel once in-flight publishes
        // settle; the sender then drains whatever is left and exits.
        drop(queue);
        if let Err(e) = sender.await {
            error!("progress sender for {} panicked: {}", deployment_id, e);
        }
        debug!("progress queue for {} drained", deployment_id);
    }

    /// Abort all senders without draining; used on process shutdown, where
    /// at-least-once delivery permits losing not-yet-sent events.
    pub async fn shutdown(&self) {
        let mut queues = self.queues.lock().await;
        for (id, entry) in queues.drain() {
            debug!("aborting progress sender for {}", id);
            entry.sender.abort();
        }
    }

    fn spawn_sender(&self, deployment_id: &str) -> Entry {
        let (tx, rx) = mpsc::channel(self.options.queue_capacity);
        let queue = Arc::new(Mutex::new(Queue { tx, next_seq: 0 }));
        let sender = tokio::spawn(run_sender(
            self.api.clone(),
            self.options.clone(),
            deployment_id.to_string(),
            rx,
        ));
        Entry { queue, sender }
    }
}

/// Drain one deployment's queue until the channel closes.
async fn run_sender(
    api: Arc<dyn ApiClient>,
    options: ReporterOptions,
    deployment_id: String,
    mut rx: mpsc::Receiver<SequencedEvent>,
) {
    loop {
        let Some(first) = rx.recv().await else {
            info!("progress sender for {} finished", deployment_id);
            return;
        };

        let mut batch = vec![first];
        while batch.len() < options.max_batch {
            match tokio::time::timeout(options.flush_interval, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                _ => break,
            }
        }

        send_batch(api.as_ref(), &options, &deployment_id, batch).await;
    }
}

/// Deliver a batch in sequence order, retrying each call until it lands.
async fn send_batch(
    api: &dyn ApiClient,
    options: &ReporterOptions,
    deployment_id: &str,
    batch: Vec<SequencedEvent>,
) {
    // Consecutive log lines for the same stage collapse into one call.
    let mut i = 0;
    while i < batch.len() {
        match &batch[i].event {
            ProgressEvent::StageLog { index, .. } => {
                let stage_index = *index;
                let mut blocks = Vec::new();
                while i < batch.len() {
                    let ProgressEvent::StageLog {
                        index,
                        severity,
                        message,
                    } = &batch[i].event
                    else {
                        break;
                    };
                    if *index != stage_index {
                        break;
                    }
                    blocks.push(LogBlock {
                        index: batch[i].seq,
                        severity: *severity,
                        log: message.clone(),
                        created_at: Utc::now(),
                    });
                    i += 1;
                }
                retry_until_sent(options, || {
                    api.report_stage_logs(deployment_id, stage_index, blocks.clone())
                })
                .await;
            }
            ProgressEvent::StageStatus {
                index,
                status,
                reason,
                retried_count,
            } => {
                retry_until_sent(options, || {
                    api.report_stage_status_changed(
                        deployment_id,
                        *index,
                        *status,
                        reason,
                        *retried_count,
                        batch[i].seq,
                    )
                })
                .await;
                i += 1;
            }
            ProgressEvent::DeploymentStatus { status, reason } => {
                retry_until_sent(options, || {
                    api.report_deployment_status_changed(
                        deployment_id,
                        *status,
                        reason,
                        batch[i].seq,
                    )
                })
                .await;
                i += 1;
            }
        }
    }
}

async fn retry_until_sent<F, Fut>(options: &ReporterOptions, mut call: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), crate::errors::PipedError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(()) => return,
            Err(e) => {
                let delay = calc_exp_backoff(&options.cooldown, attempt);
                error!("progress report failed (attempt {}): {}; retrying in {:?}", attempt, e, delay);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Logging sink handed to stage executors
#[derive(Clone)]
pub struct StageLogSink {
    reporter: Arc<ProgressReporter>,
    deployment_id: String,
    stage_index: u32,
}

impl StageLogSink {
    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogSeverity::Info, message.into()).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.log(LogSeverity::Success, message.into()).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogSeverity::Error, message.into()).await;
    }

    async fn log(&self, severity: LogSeverity, message: String) {
        self.reporter
            .publish(
                &self.deployment_id,
                ProgressEvent::StageLog {
                    index: self.stage_index,
                    severity,
                    message,
                },
            )
            .await;
    }
}
