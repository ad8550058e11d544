//! Core data types: host-side tensors, dataset splits and epoch logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};

/// Dense row-major `f32` buffer with an explicit shape.
///
/// The first dimension is always the row (sample) axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| Error::ResourceExhaustion(format!("shape {:?} overflows usize", shape)))
}

impl HostTensor {
    /// Wrap `data` with `shape`, checking that the element counts agree.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(Error::ShapeMismatch(format!(
                "shape {:?} needs {} elements, buffer has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Allocate a zero-filled tensor, reporting allocation failure instead of aborting.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let len = element_count(&shape)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            Error::ResourceExhaustion(format!("cannot allocate {} f32 values: {}", len, e))
        })?;
        data.resize(len, 0.0);
        Ok(Self { shape, data })
    }

    /// Build a rank-2 tensor from equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let width = rows.first().map_or(0, Vec::len);
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(Error::ShapeMismatch(format!(
                "row {} has {} columns, expected {}",
                idx,
                row.len(),
                width
            )));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::new(vec![rows.len(), width], data)
    }

    /// Build a rank-1 tensor of class indices.
    pub fn from_class_indices(indices: &[usize]) -> Self {
        Self {
            shape: vec![indices.len()],
            data: indices.iter().map(|&i| i as f32).collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of rows (size of the first dimension).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of elements in one row.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Borrow one row.
    ///
    /// # Panics
    /// Panics if `index >= self.rows()`.
    pub fn row(&self, index: usize) -> &[f32] {
        let len = self.row_len();
        &self.data[index * len..(index + 1) * len]
    }

    /// Copy the given rows, in order, into a contiguous buffer.
    pub fn gather_rows(&self, indices: &[usize]) -> Vec<f32> {
        let mut out = Vec::with_capacity(indices.len() * self.row_len());
        for &idx in indices {
            out.extend_from_slice(self.row(idx));
        }
        out
    }
}

/// Index of the largest value in `values`; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Reasons a label tensor cannot be decoded into class indices.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabelError {
    #[error("labels must be rank 1 (class indices) or rank 2 (one-hot), got rank {0}")]
    Rank(usize),

    #[error("label matrix has {found} columns, expected {expected}")]
    Columns { found: usize, expected: usize },

    #[error("label row {row} has no single dominant value")]
    Ambiguous { row: usize },

    #[error("label row {row} holds {value}, which is not a class index below {num_classes}")]
    OutOfRange {
        row: usize,
        value: f32,
        num_classes: usize,
    },
}

/// Decode ground-truth labels into one class index per row.
///
/// Rank-2 labels (one-hot or soft) must have exactly one maximal value per
/// row. Rank-1 labels must hold integral class indices below `num_classes`.
pub fn class_indices(
    labels: &HostTensor,
    num_classes: usize,
) -> std::result::Result<Vec<usize>, LabelError> {
    match labels.rank() {
        1 => labels
            .data()
            .iter()
            .enumerate()
            .map(|(row, &value)| {
                let valid = value.is_finite()
                    && value >= 0.0
                    && value.fract() == 0.0
                    && (value as usize) < num_classes;
                if valid {
                    Ok(value as usize)
                } else {
                    Err(LabelError::OutOfRange { row, value, num_classes })
                }
            })
            .collect(),
        2 => {
            let found = labels.row_len();
            if found != num_classes {
                return Err(LabelError::Columns {
                    found,
                    expected: num_classes,
                });
            }
            (0..labels.rows())
                .map(|row| {
                    let values = labels.row(row);
                    if values.iter().any(|v| !v.is_finite()) {
                        return Err(LabelError::Ambiguous { row });
                    }
                    let idx = argmax(values).ok_or(LabelError::Ambiguous { row })?;
                    let top = values[idx];
                    if values.iter().filter(|&&v| v == top).count() != 1 {
                        return Err(LabelError::Ambiguous { row });
                    }
                    Ok(idx)
                })
                .collect()
        }
        rank => Err(LabelError::Rank(rank)),
    }
}

/// Geometry shared by the train and test splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetShape {
    pub train_rows: usize,
    pub test_rows: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

/// The four buffers a dataset provider hands to a run.
///
/// Inputs are `N x H x W x C`; labels are `N x K` one-hot or `N` class indices.
#[derive(Debug, Clone)]
pub struct DatasetTensors {
    pub train_inputs: HostTensor,
    pub train_labels: HostTensor,
    pub test_inputs: HostTensor,
    pub test_labels: HostTensor,
}

impl DatasetTensors {
    /// Validate the split geometry.
    pub fn shape(&self) -> Result<DatasetShape> {
        dataset_shape(
            &self.train_inputs,
            &self.train_labels,
            &self.test_inputs,
            &self.test_labels,
        )
    }
}

/// Validate four split buffers against each other and return their geometry.
pub fn dataset_shape(
    train_inputs: &HostTensor,
    train_labels: &HostTensor,
    test_inputs: &HostTensor,
    test_labels: &HostTensor,
) -> Result<DatasetShape> {
    for (name, tensor) in [("train inputs", train_inputs), ("test inputs", test_inputs)] {
        if tensor.rank() != 4 {
            return Err(Error::ShapeMismatch(format!(
                "{} must be N x H x W x C, got shape {:?}",
                name,
                tensor.shape()
            )));
        }
    }
    if train_inputs.shape()[1..] != test_inputs.shape()[1..] {
        return Err(Error::ShapeMismatch(format!(
            "train inputs {:?} and test inputs {:?} differ in H x W x C",
            train_inputs.shape(),
            test_inputs.shape()
        )));
    }
    if train_inputs.rows() == 0 || test_inputs.rows() == 0 {
        return Err(Error::ShapeMismatch(
            "train and test splits must both be non-empty".to_string(),
        ));
    }
    for (name, inputs, labels) in [
        ("train", train_inputs, train_labels),
        ("test", test_inputs, test_labels),
    ] {
        if labels.rows() != inputs.rows() {
            return Err(Error::ShapeMismatch(format!(
                "{} split has {} inputs but {} label rows",
                name,
                inputs.rows(),
                labels.rows()
            )));
        }
    }
    if train_labels.rank() != test_labels.rank() || train_labels.row_len() != test_labels.row_len()
    {
        return Err(Error::ShapeMismatch(format!(
            "train labels {:?} and test labels {:?} use different encodings",
            train_labels.shape(),
            test_labels.shape()
        )));
    }

    let dims = train_inputs.shape();
    Ok(DatasetShape {
        train_rows: dims[0],
        test_rows: test_inputs.rows(),
        height: dims[1],
        width: dims[2],
        channels: dims[3],
    })
}

/// Metrics for one completed epoch. Epochs are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tensor_shape_checked() {
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = HostTensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_zeros_overflow_is_resource_exhaustion() {
        let err = HostTensor::zeros(vec![usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion(_)));
    }

    #[test]
    fn test_rows_and_gather() {
        let t = HostTensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(t.rows(), 3);
        assert_eq!(t.row_len(), 2);
        assert_eq!(t.row(1), &[3.0, 4.0]);
        assert_eq!(t.gather_rows(&[2, 0]), vec![5.0, 6.0, 1.0, 2.0]);
    }

    #[test]
    fn test_argmax_ties_pick_first() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_class_indices_one_hot() {
        let labels = HostTensor::from_rows(&[
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.1, 0.2, 0.7],
        ])
        .unwrap();
        assert_eq!(class_indices(&labels, 3).unwrap(), vec![1, 0, 2]);
    }

    #[test]
    fn test_class_indices_rejects_ambiguous_rows() {
        let labels = HostTensor::from_rows(&[vec![0.5, 0.5, 0.0]]).unwrap();
        assert_eq!(
            class_indices(&labels, 3).unwrap_err(),
            LabelError::Ambiguous { row: 0 }
        );
    }

    #[test]
    fn test_class_indices_from_indices() {
        let labels = HostTensor::from_class_indices(&[2, 0, 1]);
        assert_eq!(class_indices(&labels, 3).unwrap(), vec![2, 0, 1]);

        let bad = HostTensor::new(vec![2], vec![1.0, 3.0]).unwrap();
        assert!(matches!(
            class_indices(&bad, 3),
            Err(LabelError::OutOfRange { row: 1, .. })
        ));

        let fractional = HostTensor::new(vec![1], vec![0.5]).unwrap();
        assert!(class_indices(&fractional, 3).is_err());
    }

    #[test]
    fn test_dataset_shape_validation() {
        let tensors = DatasetTensors {
            train_inputs: HostTensor::zeros(vec![4, 8, 8, 1]).unwrap(),
            train_labels: HostTensor::from_class_indices(&[0, 1, 0, 1]),
            test_inputs: HostTensor::zeros(vec![2, 8, 8, 1]).unwrap(),
            test_labels: HostTensor::from_class_indices(&[1, 0]),
        };
        let shape = tensors.shape().unwrap();
        assert_eq!(shape.train_rows, 4);
        assert_eq!(shape.test_rows, 2);
        assert_eq!((shape.height, shape.width, shape.channels), (8, 8, 1));

        let mismatched = DatasetTensors {
            test_inputs: HostTensor::zeros(vec![2, 8, 9, 1]).unwrap(),
            ..tensors
        };
        assert!(matches!(mismatched.shape(), Err(Error::ShapeMismatch(_))));
    }
}
