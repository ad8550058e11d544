//! Dataset providers.
//!
//! Loading and decoding images is outside this crate; a [`DatasetProvider`]
//! hands over ready-made NHWC tensors for the train and test splits.

use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;
use xray_core::{DatasetTensors, Error, HostTensor, Result};

use crate::model::InputShape;

/// Source of the four dataset tensors for a run.
///
/// Runs are driven on a single-threaded executor, so the returned future
/// need not be `Send`.
#[allow(async_fn_in_trait)]
pub trait DatasetProvider {
    /// Load the dataset identified by `dataset_path`. Failures are `DataLoad` errors.
    async fn load(&self, dataset_path: &str) -> Result<DatasetTensors>;
}

/// Provider wrapping tensors that are already in memory.
///
/// Ownership moves to the run on the first load; loading twice is an error.
#[derive(Debug)]
pub struct InMemoryProvider {
    tensors: Mutex<Option<DatasetTensors>>,
}

impl InMemoryProvider {
    pub fn new(tensors: DatasetTensors) -> Self {
        Self {
            tensors: Mutex::new(Some(tensors)),
        }
    }
}

impl DatasetProvider for InMemoryProvider {
    async fn load(&self, dataset_path: &str) -> Result<DatasetTensors> {
        self.tensors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                Error::DataLoad(format!(
                    "in-memory dataset '{}' was already handed to a run",
                    dataset_path
                ))
            })
    }
}

/// Deterministic, class-separable images for smoke runs.
///
/// Class `k` lights up the `k`-th vertical band of the image on top of
/// uniform noise. Rows cycle through the classes so every split, including
/// the trailing validation rows, sees all of them. Labels are one-hot.
#[derive(Debug, Clone)]
pub struct SyntheticProvider {
    pub input: InputShape,
    pub num_classes: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub noise: f32,
    pub seed: u64,
}

impl SyntheticProvider {
    pub fn new(input: InputShape, num_classes: usize, train_rows: usize, test_rows: usize) -> Self {
        Self {
            input,
            num_classes,
            train_rows,
            test_rows,
            noise: 0.2,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    /// Generate the tensors without going through the async interface.
    pub fn generate(&self) -> Result<DatasetTensors> {
        if self.num_classes == 0 || self.train_rows == 0 || self.test_rows == 0 {
            return Err(Error::DataLoad(format!(
                "synthetic dataset needs classes and rows in both splits (classes={}, train={}, test={})",
                self.num_classes, self.train_rows, self.test_rows
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let (train_inputs, train_labels) = self.split(self.train_rows, &mut rng)?;
        let (test_inputs, test_labels) = self.split(self.test_rows, &mut rng)?;

        Ok(DatasetTensors {
            train_inputs,
            train_labels,
            test_inputs,
            test_labels,
        })
    }

    fn split(&self, rows: usize, rng: &mut ChaCha8Rng) -> Result<(HostTensor, HostTensor)> {
        let InputShape {
            height,
            width,
            channels,
        } = self.input;
        let band = (width / self.num_classes).max(1);

        let mut inputs = HostTensor::zeros(vec![rows, height, width, channels])?.into_data();
        let mut labels = HostTensor::zeros(vec![rows, self.num_classes])?.into_data();

        let row_len = height * width * channels;
        for (row, pixels) in inputs.chunks_mut(row_len.max(1)).enumerate() {
            let class = row % self.num_classes;
            labels[row * self.num_classes + class] = 1.0;

            for (idx, value) in pixels.iter_mut().enumerate() {
                let x = (idx / channels) % width;
                let signal = if x / band == class { 0.8 } else { 0.1 };
                *value = signal + self.noise * rng.gen::<f32>();
            }
        }

        Ok((
            HostTensor::new(vec![rows, height, width, channels], inputs)?,
            HostTensor::new(vec![rows, self.num_classes], labels)?,
        ))
    }
}

impl DatasetProvider for SyntheticProvider {
    async fn load(&self, dataset_path: &str) -> Result<DatasetTensors> {
        info!(
            "Generating synthetic dataset '{}': {} train / {} test rows of {}x{}x{}",
            dataset_path,
            self.train_rows,
            self.test_rows,
            self.input.height,
            self.input.width,
            self.input.channels
        );
        self.generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xray_core::{class_indices, dataset_shape};

    fn provider() -> SyntheticProvider {
        SyntheticProvider::new(
            InputShape {
                height: 6,
                width: 6,
                channels: 2,
            },
            3,
            10,
            4,
        )
    }

    #[tokio::test]
    async fn test_synthetic_dataset_shapes() {
        let tensors = provider().load("synthetic").await.unwrap();
        let shape = tensors.shape().unwrap();
        assert_eq!(shape.train_rows, 10);
        assert_eq!(shape.test_rows, 4);
        assert_eq!((shape.height, shape.width, shape.channels), (6, 6, 2));

        let classes = class_indices(&tensors.train_labels, 3).unwrap();
        assert_eq!(&classes[..4], &[0, 1, 2, 0]);
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = provider().generate().unwrap();
        let b = provider().generate().unwrap();
        assert_eq!(a.train_inputs, b.train_inputs);

        let c = provider().with_seed(7).generate().unwrap();
        assert_ne!(a.train_inputs, c.train_inputs);
    }

    #[test]
    fn test_synthetic_rejects_empty_split() {
        let mut empty = provider();
        empty.test_rows = 0;
        assert!(matches!(empty.generate(), Err(Error::DataLoad(_))));
    }

    #[tokio::test]
    async fn test_in_memory_provider_hands_over_once() {
        let tensors = provider().generate().unwrap();
        let memory = InMemoryProvider::new(tensors);

        let loaded = memory.load("mem").await.unwrap();
        assert!(dataset_shape(
            &loaded.train_inputs,
            &loaded.train_labels,
            &loaded.test_inputs,
            &loaded.test_labels
        )
        .is_ok());

        assert!(matches!(memory.load("mem").await, Err(Error::DataLoad(_))));
    }
}
