//! Per-epoch progress publish/subscribe.
//!
//! A [`ProgressReporter`] is owned by the training loop, the only publisher.
//! Observers get a [`ProgressHandle`], which can subscribe and read the latest
//! state but never publish or close. Each subscriber gets its own unbounded
//! stream so no epoch is ever skipped, and observers only ever see copies of
//! the logs.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::types::EpochLog;

/// Identifier of one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Point-in-time view of a run's progress.
///
/// All metric fields come from the latest published epoch and are zero before
/// the first one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current_epoch: usize,
    pub total_epochs: usize,
    /// Mean loss over the training rows
    pub train_loss: f64,
    /// Accuracy over the training rows
    pub train_accuracy: f64,
    /// Loss over the held-out validation rows
    pub val_loss: f64,
    /// Accuracy over the held-out validation rows
    pub val_accuracy: f64,
}

impl ProgressSnapshot {
    /// Completed share of the run in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total_epochs == 0 {
            0.0
        } else {
            (self.current_epoch as f64 / self.total_epochs as f64).min(1.0)
        }
    }
}

#[derive(Default)]
struct ReporterState {
    latest: Option<EpochLog>,
    total_epochs: usize,
    subscribers: Vec<(SubscriberId, UnboundedSender<EpochLog>)>,
    next_id: u64,
    closed: bool,
}

type SharedState = Arc<Mutex<ReporterState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, ReporterState> {
    // Poisoning only means an observer panicked; the state is still consistent.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn subscribe(state: &SharedState) -> EpochStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = lock(state);
    let id = SubscriberId(state.next_id);
    state.next_id += 1;
    // Streams opened after close end immediately.
    if !state.closed {
        state.subscribers.push((id, tx));
    }
    EpochStream { id, rx }
}

fn unsubscribe(state: &SharedState, id: SubscriberId) -> bool {
    let mut state = lock(state);
    let before = state.subscribers.len();
    state.subscribers.retain(|(sub, _)| *sub != id);
    state.subscribers.len() != before
}

fn snapshot(state: &SharedState) -> ProgressSnapshot {
    let state = lock(state);
    let latest = state.latest;
    ProgressSnapshot {
        current_epoch: latest.map_or(0, |l| l.epoch),
        total_epochs: state.total_epochs,
        train_loss: latest.map_or(0.0, |l| l.train_loss),
        train_accuracy: latest.map_or(0.0, |l| l.train_accuracy),
        val_loss: latest.map_or(0.0, |l| l.val_loss),
        val_accuracy: latest.map_or(0.0, |l| l.val_accuracy),
    }
}

/// Publishing side of a run's progress. Not cloneable: whoever owns it is the
/// single writer.
#[derive(Default)]
pub struct ProgressReporter {
    state: SharedState,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ProgressReporter")
            .field("latest", &state.latest)
            .field("total_epochs", &state.total_epochs)
            .field("subscribers", &state.subscribers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(total_epochs: usize) -> Self {
        let reporter = Self::default();
        reporter.set_total_epochs(total_epochs);
        reporter
    }

    /// Read-only view for observers.
    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_total_epochs(&self, total_epochs: usize) {
        lock(&self.state).total_epochs = total_epochs;
    }

    /// Publish a completed epoch to every live subscriber.
    ///
    /// Epochs must be strictly increasing; anything else is dropped. Returns
    /// whether the log was accepted.
    pub fn publish(&self, log: EpochLog) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            warn!("Dropping epoch {} log: reporter is closed", log.epoch);
            return false;
        }
        if let Some(latest) = state.latest {
            if log.epoch <= latest.epoch {
                warn!(
                    "Dropping out-of-order epoch {} log (latest is {})",
                    log.epoch, latest.epoch
                );
                return false;
            }
        }

        state.latest = Some(log);
        state.subscribers.retain(|(id, tx)| {
            let alive = tx.send(log).is_ok();
            if !alive {
                debug!("Removing disconnected progress subscriber {:?}", id);
            }
            alive
        });
        true
    }

    /// Open a stream that receives every epoch published from now on.
    pub fn subscribe(&self) -> EpochStream {
        subscribe(&self.state)
    }

    /// Detach a subscriber; its stream ends after draining buffered logs.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        unsubscribe(&self.state, id)
    }

    pub fn latest(&self) -> Option<EpochLog> {
        lock(&self.state).latest
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        snapshot(&self.state)
    }

    /// End every stream. Further publishes are dropped.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// True once an epoch was published or the reporter was closed.
    pub fn is_used(&self) -> bool {
        let state = lock(&self.state);
        state.closed || state.latest.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }
}

/// Observer view of a [`ProgressReporter`].
#[derive(Clone)]
pub struct ProgressHandle {
    state: SharedState,
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProgressHandle")
            .field(&self.snapshot())
            .finish()
    }
}

impl ProgressHandle {
    pub fn subscribe(&self) -> EpochStream {
        subscribe(&self.state)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        unsubscribe(&self.state, id)
    }

    pub fn latest(&self) -> Option<EpochLog> {
        lock(&self.state).latest
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        snapshot(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }
}

/// Receiving end of a progress subscription.
#[derive(Debug)]
pub struct EpochStream {
    id: SubscriberId,
    rx: UnboundedReceiver<EpochLog>,
}

impl EpochStream {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next epoch log; `None` once the reporter closed or unsubscribed us.
    pub async fn next(&mut self) -> Option<EpochLog> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_next(&mut self) -> Option<EpochLog> {
        self.rx.try_recv().ok()
    }
}
