//! Debounce coordinator — coalesces rapid-fire messages into one turn.
//!
//! Each participant has at most one pending timer. Every new message
//! appends to the participant's batch and restarts the timer; when the timer
//! runs out the batch is joined with spaces and emitted once on the flush
//! channel. Pending batches are memory-only and are lost on restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pipeline::types::FlushedBatch;

struct PendingBatch {
    texts: Vec<String>,
    timer: JoinHandle<()>,
    /// Bumped on every re-arm so a stale timer can tell it was superseded.
    generation: u64,
}

struct Inner {
    wait: Duration,
    batches: Mutex<HashMap<String, PendingBatch>>,
    flush_tx: mpsc::UnboundedSender<FlushedBatch>,
}

/// Per-participant debounce timers feeding a single flush channel.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    /// Create a debouncer and the receiver its flushed batches arrive on.
    pub fn new(wait: Duration) -> (Self, mpsc::UnboundedReceiver<FlushedBatch>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            inner: Arc::new(Inner {
                wait,
                batches: Mutex::new(HashMap::new()),
                flush_tx,
            }),
        };
        (debouncer, flush_rx)
    }

    /// Add `text` to the participant's batch and restart its timer.
    pub fn push(&self, participant: &str, text: &str) {
        let mut batches = lock(&self.inner.batches);

        let generation = batches
            .get(participant)
            .map(|b| b.generation + 1)
            .unwrap_or(0);
        let timer = self.spawn_timer(participant.to_string(), generation);

        match batches.get_mut(participant) {
            Some(batch) => {
                batch.timer.abort();
                batch.timer = timer;
                batch.generation = generation;
                batch.texts.push(text.to_string());
            }
            None => {
                batches.insert(
                    participant.to_string(),
                    PendingBatch {
                        texts: vec![text.to_string()],
                        timer,
                        generation,
                    },
                );
            }
        }

        debug!(
            participant,
            queued = batches.get(participant).map(|b| b.texts.len()).unwrap_or(0),
            "Message queued for debounce"
        );
    }

    /// Drop a pending batch without flushing it.
    pub fn cancel(&self, participant: &str) -> bool {
        match lock(&self.inner.batches).remove(participant) {
            Some(batch) => {
                batch.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Number of participants with a batch waiting.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.batches).len()
    }

    pub fn is_pending(&self, participant: &str) -> bool {
        lock(&self.inner.batches).contains_key(participant)
    }

    fn spawn_timer(&self, participant: String, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.wait).await;
            inner.flush(&participant, generation);
        })
    }
}

impl Inner {
    fn flush(&self, participant: &str, generation: u64) {
        let batch = {
            let mut batches = lock(&self.batches);
            match batches.get(participant) {
                Some(b) if b.generation == generation => batches.remove(participant),
                _ => None,
            }
        };
        let Some(batch) = batch else {
            return;
        };

        let flushed = FlushedBatch {
            participant: participant.to_string(),
            message_count: batch.texts.len(),
            text: batch.texts.join(" "),
        };
        debug!(
            participant,
            messages = flushed.message_count,
            "Debounce window closed, flushing batch"
        );
        if self.flush_tx.send(flushed).is_err() {
            warn!(participant, "Flush receiver dropped, batch lost");
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
