//! # Tick Batching Dispatcher
//!
//! Coalesces a high-frequency tick stream into one message per instrument per
//! window. Producers overwrite the latest tick for a token in a shared
//! `TickBuffer`; a fixed-interval flush loop swaps the buffer out atomically
//! and hands the batch to a `BatchSink`. Downstream message rate is therefore
//! bounded by `instruments / window` regardless of the upstream tick rate.
//!
//! ## Guarantees:
//! - Last write wins per token within a window; no cross-token ordering.
//! - Empty windows produce no callback.
//! - A batch larger than `max_batch_size` is delivered as several callbacks.
//! - `stop()` flushes once more, so the most recent prices are never dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Exchange-assigned numeric instrument identifier.
pub type InstrumentToken = u32;

/// One price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub token: InstrumentToken,
    pub price: f64,
    /// Price last delivered for this token. Filled by the buffer when the producer leaves it empty.
    pub prev_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(token: InstrumentToken, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self { token, price, prev_price: None, timestamp }
    }

    /// Absolute move since the previously delivered price.
    pub fn change(&self) -> Option<f64> {
        self.prev_price.map(|p| self.price - p)
    }
}

/// Latest tick per token for one window.
pub type Batch = HashMap<InstrumentToken, Tick>;

/// Receiver of flushed batches. Ownership of the batch moves to the sink.
pub trait BatchSink: Send + Sync {
    fn on_batch_ready(&self, batch: Batch);
}

/// Fans batches out over a broadcast channel; each subscriber shares one allocation.
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<Batch>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Batch>> {
        self.tx.subscribe()
    }
}

impl BatchSink for BroadcastSink {
    fn on_batch_ready(&self, batch: Batch) {
        let size = batch.len();
        if self.tx.send(Arc::new(batch)).is_err() {
            trace!(size, "batch dropped: no downstream subscribers");
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    pending: Batch,
    last_delivered: HashMap<InstrumentToken, f64>,
}

/// Shared latest-tick map written by producers and drained by the flush loop.
#[derive(Debug, Default)]
pub struct TickBuffer {
    state: Mutex<BufferState>,
}

impl TickBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite-last-wins insert.
    pub fn add_update(&self, mut tick: Tick) {
        let mut state = self.lock();
        if tick.prev_price.is_none() {
            tick.prev_price = state.last_delivered.get(&tick.token).copied();
        }
        state.pending.insert(tick.token, tick);
    }

    /// Swaps in an empty buffer and returns the old one.
    pub fn take(&self) -> Batch {
        let mut state = self.lock();
        let batch = std::mem::take(&mut state.pending);
        for (token, tick) in &batch {
            state.last_delivered.insert(*token, tick.price);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

#[derive(Debug, Default)]
struct BatchCounters {
    ticks_in: AtomicU64,
    ticks_out: AtomicU64,
    batches: AtomicU64,
}

/// Batching throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub ticks_in: u64,
    pub ticks_out: u64,
    pub batches: u64,
    pub pending: usize,
}

struct BatchCore {
    buffer: TickBuffer,
    sink: Arc<dyn BatchSink>,
    max_batch_size: usize,
    counters: BatchCounters,
}

impl BatchCore {
    fn flush(&self) -> usize {
        let batch = self.buffer.take();
        let size = batch.len();
        if size == 0 {
            return 0;
        }

        if size <= self.max_batch_size {
            self.deliver(batch);
        } else {
            let mut chunk = Batch::with_capacity(self.max_batch_size);
            for (token, tick) in batch {
                chunk.insert(token, tick);
                if chunk.len() == self.max_batch_size {
                    self.deliver(std::mem::replace(&mut chunk, Batch::with_capacity(self.max_batch_size)));
                }
            }
            if !chunk.is_empty() {
                self.deliver(chunk);
            }
        }
        size
    }

    fn deliver(&self, batch: Batch) {
        self.counters.ticks_out.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.sink.on_batch_ready(batch);
    }
}

/// Fixed-interval flush loop over a `TickBuffer`.
pub struct BatchScheduler {
    core: Arc<BatchCore>,
    interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BatchScheduler {
    pub fn new(sink: Arc<dyn BatchSink>, interval: Duration, max_batch_size: usize) -> Self {
        Self {
            core: Arc::new(BatchCore {
                buffer: TickBuffer::new(),
                sink,
                max_batch_size: max_batch_size.max(1),
                counters: BatchCounters::default(),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_update(&self, tick: Tick) {
        self.core.counters.ticks_in.fetch_add(1, Ordering::Relaxed);
        self.core.buffer.add_update(tick);
    }

    /// Flushes immediately; returns the number of ticks delivered.
    pub fn flush(&self) -> usize {
        self.core.flush()
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    /// Starts the flush loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let core = Arc::clone(&self.core);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let last = core.flush();
                        debug!(ticks = last, "final flush on stop");
                        break;
                    }
                    _ = ticker.tick() => {
                        let n = core.flush();
                        if n > 0 {
                            trace!(ticks = n, "batch flushed");
                        }
                    }
                }
            }
        });

        info!(interval_ms = period.as_millis() as u64, "batch flush loop started");
        *task = Some((cancel, handle));
    }

    /// Cancels the loop after one final flush and waits for it to exit.
    pub async fn stop(&self) {
        let running = self.lock_task().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            match handle.await {
                Ok(()) => info!("batch flush loop stopped"),
                Err(e) => warn!(error = %e, "batch flush loop ended abnormally"),
            }
        }
    }

    pub fn stats(&self) -> BatchStats {
        let c = &self.core.counters;
        BatchStats {
            ticks_in: c.ticks_in.load(Ordering::Relaxed),
            ticks_out: c.ticks_out.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            pending: self.core.buffer.len(),
        }
    }
}
