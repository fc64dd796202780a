//! In-process worker queue.
//!
//! FIFO channel drained by up to `max_parallelism` concurrent handler
//! executions. The queue doubles as the channel its envelopes are completed
//! and deferred through: completing is a no-op, deferring re-enqueues.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{HandlerPipeline, Listener};
use crate::envelope::Envelope;
use crate::routing::Endpoint;
use crate::types::{Error, Result};

/// Buffered in-process queue in front of a handler pipeline.
pub struct WorkerQueue {
    endpoint: Arc<Endpoint>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    count: AtomicUsize,
    running: watch::Sender<bool>,
    pipeline: Arc<dyn HandlerPipeline>,
    me: Weak<WorkerQueue>,
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("uri", &self.endpoint.uri.as_str())
            .field("count", &self.queue_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerQueue {
    pub fn new(endpoint: Arc<Endpoint>, pipeline: Arc<dyn HandlerPipeline>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (running, _) = watch::channel(true);
        Arc::new_cyclic(|me| Self {
            endpoint,
            tx,
            rx: Mutex::new(rx),
            count: AtomicUsize::new(0),
            running,
            pipeline,
            me: me.clone(),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn enqueue(&self, envelope: Envelope) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.tx.send(envelope).map_err(|_| {
            self.count.fetch_sub(1, Ordering::SeqCst);
            Error::cancelled(format!("worker queue {} is closed", self.endpoint.uri))
        })
    }

    /// Envelopes queued or executing.
    pub fn queue_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resume or suspend taking envelopes off the queue.
    pub fn set_running(&self, running: bool) {
        self.running.send_replace(running);
    }

    /// Spawn the drain loop.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let queue = self
            .me
            .upgrade()
            .ok_or_else(|| Error::internal("worker queue dropped before start"))?;
        Ok(tokio::spawn(queue.run(cancel)))
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.endpoint.max_parallelism.max(1)));
        let mut running = self.running.subscribe();
        let mut rx = self.rx.lock().await;

        tracing::debug!(
            "worker_queue_started: uri={}, max_parallelism={}",
            self.endpoint.uri,
            self.endpoint.max_parallelism
        );

        loop {
            let resumed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = running.wait_for(|running| *running) => result.is_ok(),
            };
            if !resumed {
                break;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let queue = self.clone();
            tokio::spawn(async move {
                let channel: Arc<dyn Listener> = queue.clone();
                queue.pipeline.execute(&queue.endpoint, envelope, channel).await;
                queue.count.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        tracing::debug!("worker_queue_stopped: uri={}", self.endpoint.uri);
    }

    /// Take every envelope still waiting. Only meaningful once stopped.
    pub async fn drain(&self) -> Vec<Envelope> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            self.count.fetch_sub(1, Ordering::SeqCst);
            drained.push(envelope);
        }
        drained
    }
}

#[async_trait]
impl Listener for WorkerQueue {
    fn address(&self) -> &Url {
        &self.endpoint.uri
    }

    async fn complete(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    async fn defer(&self, envelope: Envelope) -> Result<()> {
        self.enqueue(envelope)
    }

    async fn start(&self) -> Result<()> {
        self.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_running(false);
        Ok(())
    }
}
