//! Scoped ownership of a run's large host buffers.
//!
//! Every dataset tensor and the prediction tensor is acquired into a
//! [`ResourceScope`]. Buffers are released exactly once, either explicitly via
//! [`ResourceScope::release_all`] or when the scope is dropped, which covers
//! early returns, cancellation and dropped futures alike.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use xray_core::{DatasetTensors, Error, HostTensor, Result};

use crate::trainer::RunId;

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Shared acquire/release counters.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    counters: Arc<Counters>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Buffers acquired but not yet released.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    pub fn is_balanced(&self) -> bool {
        self.acquired() == self.released()
    }

    fn record_acquire(&self) {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn record_release(&self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle to a buffer held by a [`ResourceScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

#[derive(Debug)]
struct Slot {
    name: String,
    buffer: Option<HostTensor>,
}

/// Handles to the four dataset tensors of a run.
#[derive(Debug, Clone, Copy)]
pub struct DatasetHandles {
    pub train_inputs: BufferId,
    pub train_labels: BufferId,
    pub test_inputs: BufferId,
    pub test_labels: BufferId,
}

/// Owner of one run's buffers.
#[derive(Debug)]
pub struct ResourceScope {
    run_id: RunId,
    slots: Vec<Slot>,
    ledger: ResourceLedger,
}

impl ResourceScope {
    pub fn new(run_id: RunId, ledger: ResourceLedger) -> Self {
        Self {
            run_id,
            slots: Vec::new(),
            ledger,
        }
    }

    /// Take ownership of `tensor`.
    pub fn acquire(&mut self, name: impl Into<String>, tensor: HostTensor) -> BufferId {
        let name = name.into();
        trace!(
            "{}: acquired '{}' {:?} ({} values)",
            self.run_id,
            name,
            tensor.shape(),
            tensor.data().len()
        );
        self.ledger.record_acquire();
        self.slots.push(Slot {
            name,
            buffer: Some(tensor),
        });
        BufferId(self.slots.len() - 1)
    }

    /// Acquire all four dataset tensors.
    pub fn acquire_dataset(&mut self, tensors: DatasetTensors) -> DatasetHandles {
        DatasetHandles {
            train_inputs: self.acquire("train_inputs", tensors.train_inputs),
            train_labels: self.acquire("train_labels", tensors.train_labels),
            test_inputs: self.acquire("test_inputs", tensors.test_inputs),
            test_labels: self.acquire("test_labels", tensors.test_labels),
        }
    }

    /// Borrow a held buffer. Reading a released buffer is an error.
    pub fn get(&self, id: BufferId) -> Result<&HostTensor> {
        let slot = self
            .slots
            .get(id.0)
            .ok_or_else(|| Error::ReleasedBuffer(format!("unknown buffer #{}", id.0)))?;
        slot.buffer
            .as_ref()
            .ok_or_else(|| Error::ReleasedBuffer(slot.name.clone()))
    }

    /// Release one buffer. Returns false if it was already released.
    pub fn release(&mut self, id: BufferId) -> bool {
        match self.slots.get_mut(id.0) {
            Some(slot) => Self::release_slot(&self.ledger, slot),
            None => false,
        }
    }

    /// Release every held buffer. Idempotent; returns how many were released by this call.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for slot in &mut self.slots {
            if Self::release_slot(&self.ledger, slot) {
                released += 1;
            }
        }
        if released > 0 {
            debug!("{}: released {} buffer(s)", self.run_id, released);
        }
        released
    }

    /// Number of buffers currently held.
    pub fn held(&self) -> usize {
        self.slots.iter().filter(|s| s.buffer.is_some()).count()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn release_slot(ledger: &ResourceLedger, slot: &mut Slot) -> bool {
        match slot.buffer.take() {
            Some(_) => {
                ledger.record_release();
                true
            }
            None => false,
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.release_all();
    }
}
