//! Training run lifecycle.
//!
//! A [`TrainingRun`] moves through
//! `Created -> Compiling -> Training -> Predicting -> Evaluating -> Completed`.
//! Any failure ends in `Failed` (or `Cancelled` when a cancellation is
//! honoured at an epoch boundary). Whatever the exit path, every buffer the
//! run acquired is released before `execute` returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use xray_core::logging::TrainingLogger;
use xray_core::{
    class_indices, dataset_shape, metrics, EpochLog, Error, EvaluationReport, ProgressHandle,
    ProgressReporter,
    Result, TrainingConfig, VALIDATION_SPLIT,
};

use crate::dataset::DatasetProvider;
use crate::learner::{EpochData, LearnerFactory};
use crate::model::ArchitectureSpec;
use crate::resources::{DatasetHandles, ResourceLedger, ResourceScope};

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(u64);

impl RunId {
    pub fn next() -> Self {
        Self(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{:04}", self.0)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Created,
    Compiling,
    Training,
    Predicting,
    Evaluating,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Created => "created",
            RunState::Compiling => "compiling",
            RunState::Training => "training",
            RunState::Predicting => "predicting",
            RunState::Evaluating => "evaluating",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation flag, checked at epoch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A failed run: which run, the state it was in, and why.
#[derive(Error, Debug)]
#[error("{run_id} failed while {state}: {source}")]
pub struct RunError {
    pub run_id: RunId,
    pub state: RunState,
    #[source]
    pub source: Error,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunOutcome<M> {
    pub run_id: RunId,
    pub report: EvaluationReport,
    /// One log per epoch, in epoch order
    pub history: Vec<EpochLog>,
    /// Trained model, for the caller to persist
    pub model: M,
}

/// One training run from configuration to evaluation report.
#[derive(Debug)]
pub struct TrainingRun {
    id: RunId,
    config: TrainingConfig,
    architecture: ArchitectureSpec,
    state: RunState,
    reporter: ProgressReporter,
    cancel: CancelToken,
    ledger: ResourceLedger,
}

impl TrainingRun {
    /// Create a run. Invalid configuration or architecture is rejected here,
    /// before any dataset buffer exists.
    pub fn new(config: TrainingConfig, architecture: ArchitectureSpec) -> std::result::Result<Self, RunError> {
        let id = RunId::next();
        let checked = config.validate().and_then(|_| architecture.validate());
        if let Err(source) = checked {
            return Err(RunError {
                run_id: id,
                state: RunState::Created,
                source,
            });
        }

        Ok(Self {
            id,
            reporter: ProgressReporter::new(config.epochs),
            config,
            architecture,
            state: RunState::Created,
            cancel: CancelToken::new(),
            ledger: ResourceLedger::new(),
        })
    }

    /// Publish progress through an existing reporter.
    ///
    /// The reporter must be fresh: one that was closed or already carries an
    /// epoch would drop every log of this run.
    pub fn with_reporter(
        mut self,
        reporter: ProgressReporter,
    ) -> std::result::Result<Self, RunError> {
        if reporter.is_used() {
            return Err(RunError {
                run_id: self.id,
                state: self.state,
                source: Error::Configuration(format!(
                    "{} cannot publish through a closed or previously used reporter",
                    self.id
                )),
            });
        }
        reporter.set_total_epochs(self.config.epochs);
        self.reporter = reporter;
        Ok(self)
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Read-only progress view for observers.
    pub fn reporter(&self) -> ProgressHandle {
        self.reporter.handle()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Acquire/release counters for every buffer this run owns.
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Drive the run to completion.
    ///
    /// Buffers are released and the progress streams closed on every path.
    pub async fn execute<F, P>(
        &mut self,
        factory: &F,
        provider: &P,
    ) -> std::result::Result<RunOutcome<F::Model>, RunError>
    where
        F: LearnerFactory,
        P: DatasetProvider,
    {
        if self.state != RunState::Created {
            return Err(RunError {
                run_id: self.id,
                state: self.state,
                source: Error::Configuration(format!("{} has already been executed", self.id)),
            });
        }

        let mut scope = ResourceScope::new(self.id, self.ledger.clone());
        let result = self.drive(factory, provider, &mut scope).await;
        scope.release_all();
        self.reporter.close();

        match result {
            Ok(outcome) => {
                self.transition(RunState::Completed);
                Ok(outcome)
            }
            Err(source) => {
                let state = self.state;
                if matches!(source, Error::Cancelled { .. }) {
                    self.transition(RunState::Cancelled);
                } else {
                    warn!("{} failed while {}: {}", self.id, state, source);
                    self.transition(RunState::Failed);
                }
                Err(RunError {
                    run_id: self.id,
                    state,
                    source,
                })
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        info!("{}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    async fn drive<F, P>(
        &mut self,
        factory: &F,
        provider: &P,
        scope: &mut ResourceScope,
    ) -> Result<RunOutcome<F::Model>>
    where
        F: LearnerFactory,
        P: DatasetProvider,
    {
        self.transition(RunState::Compiling);
        let mut learner = factory.build(&self.config, &self.architecture)?;
        let num_classes = learner.num_classes();

        let tensors = provider.load(&self.config.dataset_path).await?;
        let handles = scope.acquire_dataset(tensors);
        let train_targets = self.check_dataset(scope, &handles, num_classes)?;

        let train_len = split_point(train_targets.len())?;
        let train_rows: Vec<usize> = (0..train_len).collect();
        let val_rows: Vec<usize> = (train_len..train_targets.len()).collect();
        info!(
            "{}: {} training rows, {} validation rows, {} epochs",
            self.id,
            train_rows.len(),
            val_rows.len(),
            self.config.epochs
        );

        self.transition(RunState::Training);
        let total_epochs = self.config.epochs;
        let mut logger = TrainingLogger::new(total_epochs);
        let mut history = Vec::with_capacity(total_epochs);

        for epoch in 1..=total_epochs {
            logger.start_epoch(epoch);
            let inputs = scope.get(handles.train_inputs)?;

            let train = learner.train_epoch(
                epoch,
                &EpochData {
                    inputs,
                    targets: &train_targets,
                    rows: &train_rows,
                },
            )?;
            ensure_finite(epoch, train.loss)?;

            let val = learner.evaluate(&EpochData {
                inputs,
                targets: &train_targets,
                rows: &val_rows,
            })?;
            ensure_finite(epoch, val.loss)?;

            let log = EpochLog {
                epoch,
                train_loss: train.loss,
                train_accuracy: train.accuracy,
                val_loss: val.loss,
                val_accuracy: val.accuracy,
            };
            history.push(log);
            if !self.reporter.publish(log) {
                warn!("{}: progress log for epoch {} was not delivered", self.id, epoch);
            }
            logger.end_epoch(&log);

            tokio::task::yield_now().await;

            if epoch < total_epochs && self.cancel.is_cancelled() {
                info!("{}: cancellation requested after epoch {}", self.id, epoch);
                return Err(Error::Cancelled { epoch });
            }
        }
        logger.log_complete(history.last().map_or(0.0, |log| log.val_accuracy));

        self.transition(RunState::Predicting);
        let predictions = learner.predict(scope.get(handles.test_inputs)?)?;
        let predictions = scope.acquire("predictions", predictions);
        tokio::task::yield_now().await;

        self.transition(RunState::Evaluating);
        let report = metrics::evaluate(scope.get(predictions)?, scope.get(handles.test_labels)?)?;
        info!(
            "{}: test accuracy {:.2}%, macro F1 {:.4}, macro AUC {:.4}",
            self.id,
            report.accuracy * 100.0,
            report.macro_f1,
            report.macro_auc()
        );

        Ok(RunOutcome {
            run_id: self.id,
            report,
            history,
            model: learner.into_model(),
        })
    }

    /// Validate the acquired tensors against the architecture and decode the
    /// training labels.
    fn check_dataset(
        &self,
        scope: &ResourceScope,
        handles: &DatasetHandles,
        num_classes: usize,
    ) -> Result<Vec<usize>> {
        let train_inputs = scope.get(handles.train_inputs)?;
        let train_labels = scope.get(handles.train_labels)?;
        let test_inputs = scope.get(handles.test_inputs)?;
        let test_labels = scope.get(handles.test_labels)?;

        let shape = dataset_shape(train_inputs, train_labels, test_inputs, test_labels)?;
        let input = self.architecture.input;
        if (shape.height, shape.width, shape.channels) != (input.height, input.width, input.channels) {
            return Err(Error::ShapeMismatch(format!(
                "dataset images are {}x{}x{} but the model expects {}x{}x{}",
                shape.height, shape.width, shape.channels, input.height, input.width, input.channels
            )));
        }

        class_indices(test_labels, num_classes)
            .map_err(|e| Error::DataLoad(format!("test labels: {}", e)))?;
        class_indices(train_labels, num_classes)
            .map_err(|e| Error::DataLoad(format!("train labels: {}", e)))
    }
}

/// Number of leading rows used for training; the rest validate.
fn split_point(rows: usize) -> Result<usize> {
    let train_len = (rows as f64 * (1.0 - VALIDATION_SPLIT)).floor() as usize;
    if train_len == 0 || train_len == rows {
        return Err(Error::DataLoad(format!(
            "{} training rows cannot be split into non-empty training and validation sets",
            rows
        )));
    }
    Ok(train_len)
}

fn ensure_finite(epoch: usize, loss: f64) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(Error::TrainingDivergence { epoch, loss })
    }
}
