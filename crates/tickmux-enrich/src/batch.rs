//! Paced batching of enrichment work.
//!
//! Items are grouped up to `max_batch_size`; the worker is invoked once per
//! item with `inter_item_delay` between invocations so a burst of work never
//! turns into a burst of outbound calls. A partial batch is flushed once no
//! new item has arrived for `idle_flush`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use tickmux_core::config::BatchConfig;
use tickmux_core::{FeedError, Result};

/// Processes one item of a batch.
#[async_trait]
pub trait BatchWorker<T>: Send + Sync + 'static {
    async fn process(&self, item: T);
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub submitted: u64,
    pub processed: u64,
    pub batches: u64,
}

/// Background batcher. Items are processed in submission order.
pub struct Batcher<T> {
    tx: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Spawn the batching task on the current runtime.
    pub fn new(worker: Arc<dyn BatchWorker<T>>, config: BatchConfig) -> Self {
        Self::with_token(worker, config, CancellationToken::new())
    }

    /// Like [`Batcher::new`], stopping when `cancel` fires.
    pub fn with_token(worker: Arc<dyn BatchWorker<T>>, config: BatchConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(batch_loop(rx, worker, config, cancel.clone(), counters.clone()));
        Self { tx, cancel, counters }
    }

    pub fn submit(&self, item: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::InvalidArgument("batcher is shut down".into()));
        }
        self.tx
            .send(item)
            .map_err(|_| FeedError::InvalidArgument("batcher is shut down".into()))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting items. Whatever is queued is flushed in the background;
    /// this call does not wait for it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
        }
    }
}

async fn batch_loop<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    worker: Arc<dyn BatchWorker<T>>,
    config: BatchConfig,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let max = config.max_batch_size.max(1);
    let mut batch: Vec<T> = Vec::with_capacity(max);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                rx.close();
                while let Ok(item) = rx.try_recv() {
                    batch.push(item);
                }
                if !batch.is_empty() {
                    tracing::debug!(pending = batch.len(), "flushing batch on shutdown");
                }
                while !batch.is_empty() {
                    let take = batch.len().min(max);
                    let chunk: Vec<T> = batch.drain(..take).collect();
                    flush(chunk, worker.as_ref(), &config, &counters).await;
                }
                break;
            }
            item = rx.recv() => match item {
                Some(item) => {
                    batch.push(item);
                    if batch.len() >= max {
                        flush(std::mem::take(&mut batch), worker.as_ref(), &config, &counters).await;
                    }
                }
                None => {
                    flush(std::mem::take(&mut batch), worker.as_ref(), &config, &counters).await;
                    break;
                }
            },
            _ = time::sleep(config.idle_flush), if !batch.is_empty() => {
                tracing::trace!(size = batch.len(), "idle flush");
                flush(std::mem::take(&mut batch), worker.as_ref(), &config, &counters).await;
            }
        }
    }
}

async fn flush<T: 'static>(batch: Vec<T>, worker: &dyn BatchWorker<T>, config: &BatchConfig, counters: &Counters) {
    if batch.is_empty() {
        return;
    }
    counters.batches.fetch_add(1, Ordering::Relaxed);
    for (i, item) in batch.into_iter().enumerate() {
        if i > 0 && !config.inter_item_delay.is_zero() {
            time::sleep(config.inter_item_delay).await;
        }
        worker.process(item).await;
        counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// One-shot: process `items` in batches of `max_batch_size`, pacing every
/// worker call by `inter_item_delay`. Returns how many items were processed.
pub async fn run_batched<T: 'static>(items: Vec<T>, worker: &dyn BatchWorker<T>, config: &BatchConfig) -> usize {
    let mut processed = 0;
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 && !config.inter_item_delay.is_zero() {
            time::sleep(config.inter_item_delay).await;
        }
        if i > 0 && i % config.max_batch_size.max(1) == 0 {
            tracing::trace!(processed, "batch boundary");
        }
        worker.process(item).await;
        processed += 1;
    }
    processed
}
