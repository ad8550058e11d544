//! Run lifecycle tests: state transitions, progress streaming and buffer release.

use burn::backend::{Autodiff, NdArray};
use xray_core::{DatasetTensors, Error, HostTensor, ProgressReporter, Result, TrainingConfig};
use xray_training::{
    ArchitectureSpec, BurnFactory, CancelToken, EpochData, EpochMetrics, InMemoryProvider,
    InputShape, Learner, LearnerFactory, RunState, SyntheticProvider, TrainingRun,
};

const INPUT: InputShape = InputShape {
    height: 22,
    width: 22,
    channels: 1,
};

fn dataset() -> DatasetTensors {
    SyntheticProvider::new(INPUT, 3, 10, 6).generate().unwrap()
}

fn config(epochs: usize) -> TrainingConfig {
    TrainingConfig::new("memory", epochs, 4, 0.001, "adam").unwrap()
}

/// Learner that replays a fixed loss per epoch and returns fixed predictions.
struct ScriptedLearner {
    losses: Vec<f64>,
    predictions: HostTensor,
}

impl Learner for ScriptedLearner {
    type Model = ();

    fn train_epoch(&mut self, epoch: usize, _data: &EpochData<'_>) -> Result<EpochMetrics> {
        Ok(EpochMetrics {
            loss: self.losses[epoch - 1],
            accuracy: 0.5,
        })
    }

    fn evaluate(&self, _data: &EpochData<'_>) -> Result<EpochMetrics> {
        Ok(EpochMetrics {
            loss: 0.7,
            accuracy: 0.6,
        })
    }

    fn predict(&self, inputs: &HostTensor) -> Result<HostTensor> {
        assert_eq!(inputs.rows(), self.predictions.rows());
        Ok(self.predictions.clone())
    }

    fn num_classes(&self) -> usize {
        3
    }

    fn into_model(self: Box<Self>) {}
}

struct ScriptedFactory {
    losses: Vec<f64>,
    predictions: HostTensor,
}

impl ScriptedFactory {
    /// Perfect predictions for the test split of `data`.
    fn new(losses: Vec<f64>, data: &DatasetTensors) -> Self {
        Self {
            losses,
            predictions: data.test_labels.clone(),
        }
    }

    fn with_predictions(mut self, predictions: HostTensor) -> Self {
        self.predictions = predictions;
        self
    }
}

impl LearnerFactory for ScriptedFactory {
    type Model = ();

    fn build(
        &self,
        _config: &TrainingConfig,
        _architecture: &ArchitectureSpec,
    ) -> Result<Box<dyn Learner<Model = ()>>> {
        Ok(Box::new(ScriptedLearner {
            losses: self.losses.clone(),
            predictions: self.predictions.clone(),
        }))
    }
}

fn architecture() -> ArchitectureSpec {
    ArchitectureSpec::standard_for(INPUT, 3)
}

#[tokio::test]
async fn test_successful_run_streams_every_epoch() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0, 0.8, 0.6, 0.4], &data);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(4), architecture()).unwrap();
    let mut stream = run.reporter().subscribe();

    let outcome = run.execute(&factory, &provider).await.unwrap();

    assert_eq!(run.state(), RunState::Completed);
    assert_eq!(outcome.run_id, run.id());
    let epochs: Vec<usize> = outcome.history.iter().map(|log| log.epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3, 4]);

    let mut streamed = Vec::new();
    while let Some(log) = stream.next().await {
        streamed.push(log);
    }
    assert_eq!(streamed, outcome.history);
    assert_eq!(run.reporter().snapshot().fraction(), 1.0);

    assert_eq!(outcome.report.accuracy, 1.0);
    assert_eq!(outcome.report.confusion_matrix.row_sums(), vec![2, 2, 2]);

    // Four dataset tensors plus the predictions.
    assert_eq!(run.ledger().acquired(), 5);
    assert!(run.ledger().is_balanced());
}

#[tokio::test]
async fn test_observer_handles_cannot_disturb_the_stream() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0, 0.8, 0.6], &data);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(3), architecture()).unwrap();
    let observer = run.reporter();
    let mut stream = observer.clone().subscribe();
    drop(observer.subscribe());

    let outcome = run.execute(&factory, &provider).await.unwrap();

    let mut streamed = Vec::new();
    while let Some(log) = stream.next().await {
        streamed.push(log.epoch);
    }
    assert_eq!(streamed, vec![1, 2, 3]);
    assert_eq!(observer.latest(), outcome.history.last().copied());
    let snapshot = observer.snapshot();
    assert_eq!(snapshot.current_epoch, 3);
    assert_eq!(snapshot.train_loss, 0.6);
    assert_eq!(snapshot.val_accuracy, 0.6);
}

#[tokio::test]
async fn test_fresh_reporter_streams_every_epoch() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0, 0.5], &data);
    let provider = InMemoryProvider::new(data);

    let reporter = ProgressReporter::default();
    let mut stream = reporter.handle().subscribe();
    let mut run = TrainingRun::new(config(2), architecture())
        .unwrap()
        .with_reporter(reporter)
        .unwrap();
    assert_eq!(run.reporter().snapshot().total_epochs, 2);

    run.execute(&factory, &provider).await.unwrap();

    let mut streamed = Vec::new();
    while let Some(log) = stream.next().await {
        streamed.push(log.epoch);
    }
    assert_eq!(streamed, vec![1, 2]);
}

#[test]
fn test_closed_reporter_rejected() {
    let reporter = ProgressReporter::new(3);
    reporter.close();

    let err = TrainingRun::new(config(3), architecture())
        .unwrap()
        .with_reporter(reporter)
        .unwrap_err();
    assert_eq!(err.state, RunState::Created);
    assert!(err.source.is_configuration());
}

#[test]
fn test_used_reporter_rejected() {
    let reporter = ProgressReporter::new(3);
    reporter.publish(xray_core::EpochLog {
        epoch: 7,
        train_loss: 0.1,
        train_accuracy: 1.0,
        val_loss: 0.1,
        val_accuracy: 1.0,
    });

    let err = TrainingRun::new(config(3), architecture())
        .unwrap()
        .with_reporter(reporter)
        .unwrap_err();
    assert!(err.source.is_configuration());
}

#[tokio::test]
async fn test_nan_loss_fails_before_predicting() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![0.9, f64::NAN, 0.5], &data);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(3), architecture()).unwrap();
    let err = run.execute(&factory, &provider).await.unwrap_err();

    assert_eq!(err.run_id, run.id());
    assert_eq!(err.state, RunState::Training);
    assert!(matches!(err.source, Error::TrainingDivergence { epoch: 2, .. }));
    assert_eq!(run.state(), RunState::Failed);

    assert_eq!(run.reporter().latest().map(|log| log.epoch), Some(1));
    assert_eq!(run.ledger().acquired(), 4);
    assert!(run.ledger().is_balanced());
}

#[test]
fn test_zero_epochs_rejected_before_loading() {
    let data = dataset();
    let provider = InMemoryProvider::new(data);

    let config = TrainingConfig {
        epochs: 0,
        ..config(1)
    };
    let err = TrainingRun::new(config, architecture()).unwrap_err();
    assert!(err.source.is_configuration());

    // The provider was never touched.
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert!(rt.block_on(xray_training::DatasetProvider::load(&provider, "memory")).is_ok());
}

#[tokio::test]
async fn test_data_load_failure() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0], &data);
    let provider = InMemoryProvider::new(data);
    provider_drain(&provider).await;

    let mut run = TrainingRun::new(config(1), architecture()).unwrap();
    let err = run.execute(&factory, &provider).await.unwrap_err();

    assert_eq!(err.state, RunState::Compiling);
    assert!(matches!(err.source, Error::DataLoad(_)));
    assert_eq!(run.ledger().acquired(), 0);
    assert!(run.reporter().is_closed());
}

async fn provider_drain(provider: &InMemoryProvider) {
    use xray_training::DatasetProvider;
    provider.load("memory").await.unwrap();
}

#[tokio::test]
async fn test_shape_mismatch_releases_dataset() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0], &data);
    let provider = InMemoryProvider::new(data);

    let wider = ArchitectureSpec::standard_for(
        InputShape {
            width: 24,
            ..INPUT
        },
        3,
    );
    let mut run = TrainingRun::new(config(1), wider).unwrap();
    let err = run.execute(&factory, &provider).await.unwrap_err();

    assert!(matches!(err.source, Error::ShapeMismatch(_)));
    assert_eq!(run.ledger().acquired(), 4);
    assert!(run.ledger().is_balanced());
}

#[tokio::test]
async fn test_metrics_failure_after_training_releases_buffers() {
    let data = dataset();
    let rows = data.test_labels.rows();
    // One class short of the labels.
    let narrow = HostTensor::from_rows(&vec![vec![0.5, 0.5]; rows]).unwrap();
    let factory = ScriptedFactory::new(vec![1.0, 0.9], &data).with_predictions(narrow);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(2), architecture()).unwrap();
    let err = run.execute(&factory, &provider).await.unwrap_err();

    assert_eq!(err.state, RunState::Evaluating);
    assert!(matches!(err.source, Error::MetricsComputation(_)));
    assert_eq!(run.state(), RunState::Failed);
    assert_eq!(run.reporter().latest().map(|log| log.epoch), Some(2));

    assert_eq!(run.ledger().acquired(), 5);
    assert!(run.ledger().is_balanced());
}

#[tokio::test]
async fn test_cancellation_at_epoch_boundary() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0; 5], &data);
    let provider = InMemoryProvider::new(data);

    let cancel = CancelToken::new();
    let mut run = TrainingRun::new(config(5), architecture())
        .unwrap()
        .with_cancel_token(cancel.clone());
    cancel.cancel();

    let err = run.execute(&factory, &provider).await.unwrap_err();
    assert!(matches!(err.source, Error::Cancelled { epoch: 1 }));
    assert_eq!(err.state, RunState::Training);
    assert_eq!(run.state(), RunState::Cancelled);
    assert!(run.ledger().is_balanced());
}

#[tokio::test]
async fn test_cancellation_ignored_on_final_epoch() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0], &data);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(1), architecture()).unwrap();
    run.cancel_token().cancel();

    assert!(run.execute(&factory, &provider).await.is_ok());
    assert_eq!(run.state(), RunState::Completed);
}

#[tokio::test]
async fn test_dropped_run_releases_buffers() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0; 3], &data);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(3), architecture()).unwrap();
    let ledger = run.ledger().clone();
    let mut stream = run.reporter().subscribe();

    tokio::select! {
        biased;
        _ = run.execute(&factory, &provider) => panic!("run finished before its first yield"),
        log = stream.next() => assert_eq!(log.map(|l| l.epoch), Some(1)),
    }

    assert_eq!(ledger.acquired(), 4);
    assert!(ledger.is_balanced());
}

#[tokio::test]
async fn test_run_executes_only_once() {
    let data = dataset();
    let factory = ScriptedFactory::new(vec![1.0], &data);
    let provider = InMemoryProvider::new(data);

    let mut run = TrainingRun::new(config(1), architecture()).unwrap();
    run.execute(&factory, &provider).await.unwrap();

    let err = run.execute(&factory, &provider).await.unwrap_err();
    assert_eq!(err.state, RunState::Completed);
    assert!(err.source.is_configuration());
}

#[tokio::test]
async fn test_end_to_end_burn_run() {
    let provider = SyntheticProvider::new(INPUT, 3, 10, 6).with_seed(3);
    let factory = BurnFactory::<Autodiff<NdArray>>::default();

    let mut run = TrainingRun::new(config(2), architecture()).unwrap();
    let outcome = run.execute(&factory, &provider).await.unwrap();

    assert_eq!(outcome.history.len(), 2);
    for log in &outcome.history {
        assert!(log.train_loss.is_finite());
        assert!((0.0..=1.0).contains(&log.val_accuracy));
    }

    let report = &outcome.report;
    assert_eq!(report.num_samples, 6);
    assert_eq!(report.confusion_matrix.row_sums(), vec![2, 2, 2]);
    assert_eq!(report.roc_curves.len(), 3);
    assert_eq!(outcome.model.num_classes(), 3);
    assert!(run.ledger().is_balanced());
}
