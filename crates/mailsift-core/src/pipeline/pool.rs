//! Envelope queue, rate-limited intake and the worker pool

use super::Pipeline;
use crate::limits::RateLimiter;
use crate::settings::SettingsCache;
use mailsift_common::types::RawEnvelope;
use mailsift_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Bounded queue between front ends and workers
pub fn envelope_queue(capacity: usize) -> (mpsc::Sender<RawEnvelope>, EnvelopeReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        EnvelopeReceiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Receiving side of the envelope queue, shared by all workers
#[derive(Clone)]
pub struct EnvelopeReceiver {
    inner: Arc<Mutex<mpsc::Receiver<RawEnvelope>>>,
}

impl EnvelopeReceiver {
    /// Next envelope, or `None` once every sender is gone and the queue
    /// is drained
    pub async fn recv(&self) -> Option<RawEnvelope> {
        self.inner.lock().await.recv().await
    }
}

/// Front-end handle for submitting envelopes
#[derive(Clone)]
pub struct Intake {
    tx: mpsc::Sender<RawEnvelope>,
    limiter: RateLimiter,
    settings: SettingsCache,
}

impl Intake {
    pub fn new(tx: mpsc::Sender<RawEnvelope>, limiter: RateLimiter, settings: SettingsCache) -> Self {
        Self {
            tx,
            limiter,
            settings,
        }
    }

    /// Queue an envelope, waiting while the queue is full.
    ///
    /// Every attempt counts against the mailbox's current window; at most
    /// `rate_limit` envelopes per window are accepted and the rest are
    /// refused with [`Error::RateLimitExceeded`].
    pub async fn submit(&self, envelope: RawEnvelope) -> Result<()> {
        let mailbox_id = envelope.mailbox_id;

        let threshold = match self.settings.cached(mailbox_id).await {
            Some(settings) if settings.rate_limit > 0 => settings.rate_limit,
            _ => self.limiter.default_threshold(),
        };

        if let Err(e) = self.limiter.record_one(mailbox_id).await {
            warn!("Failed to record message for mailbox {}: {}", mailbox_id, e);
        }
        if self.limiter.is_blocked_at(mailbox_id, threshold).await {
            return Err(Error::RateLimitExceeded(mailbox_id));
        }

        self.tx.send(envelope).await.map_err(|_| Error::QueueClosed)
    }
}

/// Running workers
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to drain the closed queue and exit
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("All workers stopped");
    }
}

/// Spawn `count` workers consuming from `receiver`
pub fn start_workers(count: usize, receiver: EnvelopeReceiver, pipeline: Arc<Pipeline>) -> WorkerPool {
    let workers = (0..count.max(1))
        .map(|worker| tokio::spawn(run_worker(worker, receiver.clone(), Arc::clone(&pipeline))))
        .collect::<Vec<_>>();

    info!("Started {} pipeline workers", workers.len());
    WorkerPool { workers }
}

async fn run_worker(worker: usize, receiver: EnvelopeReceiver, pipeline: Arc<Pipeline>) {
    while let Some(envelope) = receiver.recv().await {
        let mailbox_id = envelope.mailbox_id;
        let size = envelope.len();
        let span = info_span!("message", worker, mailbox_id);
        let pipeline = Arc::clone(&pipeline);

        let task = tokio::spawn(async move { pipeline.process(&envelope).await }.instrument(span));

        match task.await {
            Ok(Ok(delivery)) => info!(
                worker,
                mailbox_id,
                message_id = delivery.message_id,
                size,
                attachments = delivery.attachments_stored,
                pruned = delivery.pruned.len(),
                notified = delivery.notified,
                "Message processed"
            ),
            Ok(Err(e)) if e.is_transient() => warn!(
                worker,
                mailbox_id,
                code = e.code(),
                "Message abandoned: {}",
                e
            ),
            Ok(Err(e)) => error!(
                worker,
                mailbox_id,
                code = e.code(),
                "Message rejected: {}",
                e
            ),
            Err(e) if e.is_panic() => {
                error!(worker, mailbox_id, "Message processing panicked")
            }
            Err(e) => error!(worker, mailbox_id, "Message task failed: {}", e),
        }
    }

    debug!(worker, "Envelope queue closed, worker exiting");
}
