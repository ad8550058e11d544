//! Compiled model: optimizer, loss and accuracy tracking bound to a classifier.
//!
//! The training run drives any [`Learner`]; [`BurnLearner`] is the real one,
//! built by [`BurnFactory`] from the configured optimizer.

use burn::{
    module::AutodiffModule,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor, TensorData,
    },
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use xray_core::{Error, HostTensor, OptimizerType, Result, TrainingConfig};

use crate::model::{ArchitectureSpec, ConvClassifier};

/// A subset of rows of an `N x H x W x C` input tensor.
#[derive(Debug, Clone, Copy)]
pub struct EpochData<'a> {
    pub inputs: &'a HostTensor,
    /// Class index for every row of `inputs`
    pub targets: &'a [usize],
    /// Rows of `inputs` that belong to this subset
    pub rows: &'a [usize],
}

/// Mean loss and accuracy over one pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

impl EpochMetrics {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.accuracy.is_finite()
    }
}

/// Trainable model with its optimizer and loss bound.
pub trait Learner {
    type Model;

    /// One shuffled pass of mini-batch updates over `data`.
    ///
    /// A non-finite batch loss aborts with `TrainingDivergence` at `epoch`.
    fn train_epoch(&mut self, epoch: usize, data: &EpochData<'_>) -> Result<EpochMetrics>;

    /// Loss and accuracy without updating weights.
    fn evaluate(&self, data: &EpochData<'_>) -> Result<EpochMetrics>;

    /// Per-class probabilities (`N x K`) for every row of `inputs`.
    fn predict(&self, inputs: &HostTensor) -> Result<HostTensor>;

    fn num_classes(&self) -> usize;

    /// Give up the trained model.
    fn into_model(self: Box<Self>) -> Self::Model;
}

/// Builds (compiles) learners for a run.
pub trait LearnerFactory {
    type Model;

    fn build(
        &self,
        config: &TrainingConfig,
        architecture: &ArchitectureSpec,
    ) -> Result<Box<dyn Learner<Model = Self::Model>>>;
}

/// Builds [`BurnLearner`]s on a fixed device.
#[derive(Debug, Clone, Default)]
pub struct BurnFactory<B: AutodiffBackend> {
    pub device: B::Device,
}

impl<B: AutodiffBackend> BurnFactory<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: AutodiffBackend> LearnerFactory for BurnFactory<B> {
    type Model = ConvClassifier<B>;

    fn build(
        &self,
        config: &TrainingConfig,
        architecture: &ArchitectureSpec,
    ) -> Result<Box<dyn Learner<Model = ConvClassifier<B>>>> {
        config.validate()?;
        let model = architecture.init::<B>(&self.device)?;
        info!(
            "Compiled model: {} parameters, optimizer={}, lr={}",
            architecture.parameter_count()?,
            config.optimizer,
            config.learning_rate
        );

        let device = &self.device;
        let learner: Box<dyn Learner<Model = ConvClassifier<B>>> = match config.optimizer {
            OptimizerType::Adam => Box::new(BurnLearner::new(
                model,
                AdamConfig::new().init::<B, ConvClassifier<B>>(),
                config,
                device,
            )),
            OptimizerType::AdamW => Box::new(BurnLearner::new(
                model,
                AdamWConfig::new().init::<B, ConvClassifier<B>>(),
                config,
                device,
            )),
            OptimizerType::Sgd => Box::new(BurnLearner::new(
                model,
                SgdConfig::new().init::<B, ConvClassifier<B>>(),
                config,
                device,
            )),
            OptimizerType::RmsProp => Box::new(BurnLearner::new(
                model,
                RmsPropConfig::new().init::<B, ConvClassifier<B>>(),
                config,
                device,
            )),
        };
        Ok(learner)
    }
}

/// Custom burn training loop over host tensors.
pub struct BurnLearner<B: AutodiffBackend, O> {
    model: ConvClassifier<B>,
    optimizer: O,
    loss: CrossEntropyLoss<B>,
    valid_loss: CrossEntropyLoss<B::InnerBackend>,
    learning_rate: f64,
    batch_size: usize,
    rng: ChaCha8Rng,
    device: B::Device,
}

impl<B, O> BurnLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B>,
{
    pub fn new(model: ConvClassifier<B>, optimizer: O, config: &TrainingConfig, device: &B::Device) -> Self {
        Self {
            model,
            optimizer,
            loss: CrossEntropyLossConfig::new().init(device),
            valid_loss: CrossEntropyLossConfig::new().init(device),
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            device: device.clone(),
        }
    }
}

/// NHWC host rows to an NCHW batch tensor.
fn batch_inputs<B: Backend>(inputs: &HostTensor, rows: &[usize], device: &B::Device) -> Result<Tensor<B, 4>> {
    let dims = inputs.shape();
    if dims.len() != 4 {
        return Err(Error::ShapeMismatch(format!(
            "inputs must be N x H x W x C, got {:?}",
            dims
        )));
    }
    let data = TensorData::new(inputs.gather_rows(rows), [rows.len(), dims[1], dims[2], dims[3]]);
    Ok(Tensor::<B, 4>::from_data(data, device).permute([0, 3, 1, 2]))
}

fn batch_targets<B: Backend>(targets: &[usize], rows: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = rows.iter().map(|&row| targets[row] as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(values, [rows.len()]), device)
}

fn correct_count<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let correct: i64 = logits
        .argmax(1)
        .reshape([batch_size])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct.max(0) as usize
}

fn require_rows(data: &EpochData<'_>) -> Result<()> {
    if data.rows.is_empty() {
        return Err(Error::DataLoad("cannot run an epoch over zero rows".to_string()));
    }
    Ok(())
}

impl<B, O> Learner for BurnLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B>,
{
    type Model = ConvClassifier<B>;

    fn train_epoch(&mut self, epoch: usize, data: &EpochData<'_>) -> Result<EpochMetrics> {
        require_rows(data)?;
        let mut order = data.rows.to_vec();
        order.shuffle(&mut self.rng);

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let num_batches = order.len().div_ceil(self.batch_size);

        for (batch_idx, batch_rows) in order.chunks(self.batch_size).enumerate() {
            let images = batch_inputs::<B>(data.inputs, batch_rows, &self.device)?;
            let targets = batch_targets::<B>(data.targets, batch_rows, &self.device);

            let logits = self.model.forward(images);
            let loss = self.loss.forward(logits.clone(), targets.clone());

            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(Error::TrainingDivergence {
                    epoch,
                    loss: loss_value,
                });
            }
            loss_sum += loss_value * batch_rows.len() as f64;
            correct += correct_count(logits, targets);

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self
                .optimizer
                .step(self.learning_rate, self.model.clone(), grads);

            debug!(
                "Epoch {} batch {}/{}: loss = {:.4}",
                epoch,
                batch_idx + 1,
                num_batches,
                loss_value
            );
        }

        let rows = order.len() as f64;
        Ok(EpochMetrics {
            loss: loss_sum / rows,
            accuracy: correct as f64 / rows,
        })
    }

    fn evaluate(&self, data: &EpochData<'_>) -> Result<EpochMetrics> {
        require_rows(data)?;
        let model = self.model.valid();

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        for batch_rows in data.rows.chunks(self.batch_size) {
            let images = batch_inputs::<B::InnerBackend>(data.inputs, batch_rows, &self.device)?;
            let targets = batch_targets::<B::InnerBackend>(data.targets, batch_rows, &self.device);

            let logits = model.forward(images);
            let loss: f64 = self
                .valid_loss
                .forward(logits.clone(), targets.clone())
                .into_scalar()
                .elem();
            loss_sum += loss * batch_rows.len() as f64;
            correct += correct_count(logits, targets);
        }

        let rows = data.rows.len() as f64;
        Ok(EpochMetrics {
            loss: loss_sum / rows,
            accuracy: correct as f64 / rows,
        })
    }

    fn predict(&self, inputs: &HostTensor) -> Result<HostTensor> {
        let model = self.model.valid();
        let num_rows = inputs.rows();
        let num_classes = model.num_classes();
        let len = num_rows.checked_mul(num_classes).ok_or_else(|| {
            Error::ResourceExhaustion(format!("{} x {} predictions overflow", num_rows, num_classes))
        })?;

        let mut scores: Vec<f32> = Vec::new();
        scores.try_reserve_exact(len).map_err(|e| {
            Error::ResourceExhaustion(format!("cannot allocate {} prediction scores: {}", len, e))
        })?;

        let rows: Vec<usize> = (0..num_rows).collect();
        for batch_rows in rows.chunks(self.batch_size) {
            let images = batch_inputs::<B::InnerBackend>(inputs, batch_rows, &self.device)?;
            let probs = model.forward_softmax(images);
            let values = probs
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| Error::Model(format!("failed to read predictions: {:?}", e)))?;
            scores.extend(values);
        }

        HostTensor::new(vec![num_rows, num_classes], scores)
    }

    fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    fn into_model(self: Box<Self>) -> ConvClassifier<B> {
        self.model
    }
}
