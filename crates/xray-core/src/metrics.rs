//! Metrics Engine
//!
//! Computes the evaluation report for a trained classifier from raw per-class
//! scores and ground-truth labels:
//! - Accuracy
//! - Per-class and macro-averaged precision, recall and F1
//! - Confusion matrix
//! - One-vs-rest ROC curves with trapezoidal AUC

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{argmax, class_indices, HostTensor};

/// Full evaluation report for one test split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Number of evaluated rows
    pub num_samples: usize,

    /// Number of classes (K)
    pub num_classes: usize,

    /// Correct predictions / total
    pub accuracy: f64,

    /// Per-class metrics, indexed by class
    pub per_class: Vec<ClassMetrics>,

    /// Unweighted mean of per-class precision
    pub macro_precision: f64,

    /// Unweighted mean of per-class recall
    pub macro_recall: f64,

    /// Unweighted mean of per-class F1
    pub macro_f1: f64,

    /// F1 weighted by class support
    pub weighted_f1: f64,

    /// Confusion matrix (row = actual, column = predicted)
    pub confusion_matrix: ConfusionMatrix,

    /// One-vs-rest ROC curve per class
    pub roc_curves: Vec<RocCurve>,
}

impl EvaluationReport {
    /// Per-class precision vector of length K.
    pub fn precision(&self) -> Vec<f64> {
        self.per_class.iter().map(|m| m.precision).collect()
    }

    /// Per-class recall vector of length K.
    pub fn recall(&self) -> Vec<f64> {
        self.per_class.iter().map(|m| m.recall).collect()
    }

    /// Per-class F1 vector of length K.
    pub fn f1(&self) -> Vec<f64> {
        self.per_class.iter().map(|m| m.f1).collect()
    }

    /// Mean one-vs-rest AUC across classes.
    pub fn macro_auc(&self) -> f64 {
        if self.roc_curves.is_empty() {
            return 0.0;
        }
        self.roc_curves.iter().map(|c| c.auc).sum::<f64>() / self.roc_curves.len() as f64
    }

    /// Pretty print the report, optionally with class names.
    pub fn display(&self, class_names: Option<&[&str]>) -> String {
        let name = |idx: usize| -> String {
            class_names
                .and_then(|names| names.get(idx))
                .map_or_else(|| idx.to_string(), |n| n.to_string())
        };

        let mut output = String::new();
        output.push_str(&format!(
            "Samples: {}  Accuracy: {:.2}%  Macro F1: {:.2}%  Macro AUC: {:.4}\n\n",
            self.num_samples,
            self.accuracy * 100.0,
            self.macro_f1 * 100.0,
            self.macro_auc()
        ));
        output.push_str(&format!(
            "{:<12} {:>10} {:>10} {:>10} {:>8} {:>8}\n",
            "Class", "Precision", "Recall", "F1", "AUC", "Support"
        ));
        output.push_str(&format!("{}\n", "-".repeat(63)));
        for (metrics, roc) in self.per_class.iter().zip(&self.roc_curves) {
            output.push_str(&format!(
                "{:<12} {:>10.4} {:>10.4} {:>10.4} {:>8.4} {:>8}\n",
                name(metrics.class_idx),
                metrics.precision,
                metrics.recall,
                metrics.f1,
                roc.auc,
                metrics.support
            ));
        }
        output.push_str(&format!(
            "{:<12} {:>10.4} {:>10.4} {:>10.4}\n",
            "macro", self.macro_precision, self.macro_recall, self.macro_f1
        ));
        output.push_str(&self.confusion_matrix.display(class_names));
        output
    }
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display(None))
    }
}

/// Compute the evaluation report from an `N x K` score matrix and ground-truth labels
/// (`N x K` one-hot/soft or `N` class indices).
pub fn evaluate(predictions: &HostTensor, labels: &HostTensor) -> Result<EvaluationReport> {
    if predictions.rank() != 2 {
        return Err(Error::MetricsComputation(format!(
            "predictions must be N x K, got shape {:?}",
            predictions.shape()
        )));
    }
    let num_samples = predictions.rows();
    let num_classes = predictions.row_len();

    if labels.rows() != num_samples {
        return Err(Error::MetricsComputation(format!(
            "predictions have {} rows but labels have {}",
            num_samples,
            labels.rows()
        )));
    }
    if labels.rank() == 2 && labels.row_len() != num_classes {
        return Err(Error::MetricsComputation(format!(
            "predictions have {} classes but labels have {}",
            num_classes,
            labels.row_len()
        )));
    }
    if num_samples == 0 || num_classes == 0 {
        return Err(Error::MetricsComputation(format!(
            "cannot evaluate an empty prediction set of shape {:?}",
            predictions.shape()
        )));
    }
    if let Some(pos) = predictions.data().iter().position(|v| !v.is_finite()) {
        return Err(Error::MetricsComputation(format!(
            "non-finite score at row {}, class {}",
            pos / num_classes,
            pos % num_classes
        )));
    }

    let ground_truth = class_indices(labels, num_classes)
        .map_err(|e| Error::MetricsComputation(e.to_string()))?;
    let predicted: Vec<usize> = (0..num_samples)
        .map(|row| argmax(predictions.row(row)).unwrap_or(0))
        .collect();

    let confusion_matrix = ConfusionMatrix::from_predictions(&predicted, &ground_truth, num_classes);
    let per_class: Vec<ClassMetrics> = (0..num_classes)
        .map(|class_idx| ClassMetrics::from_confusion_matrix(&confusion_matrix, class_idx))
        .collect();

    let k = num_classes as f64;
    let macro_precision = per_class.iter().map(|m| m.precision).sum::<f64>() / k;
    let macro_recall = per_class.iter().map(|m| m.recall).sum::<f64>() / k;
    let macro_f1 = per_class.iter().map(|m| m.f1).sum::<f64>() / k;
    let weighted_f1 = per_class
        .iter()
        .map(|m| m.f1 * m.support as f64)
        .sum::<f64>()
        / num_samples as f64;

    let roc_curves = (0..num_classes)
        .map(|class_idx| {
            let scores: Vec<f64> = (0..num_samples)
                .map(|row| f64::from(predictions.row(row)[class_idx]))
                .collect();
            let positives: Vec<bool> = ground_truth.iter().map(|&gt| gt == class_idx).collect();
            RocCurve::one_vs_rest(class_idx, &scores, &positives)
        })
        .collect();

    let report = EvaluationReport {
        num_samples,
        num_classes,
        accuracy: confusion_matrix.accuracy(),
        per_class,
        macro_precision,
        macro_recall,
        macro_f1,
        weighted_f1,
        confusion_matrix,
        roc_curves,
    };

    debug!(
        "Evaluated {} samples over {} classes: accuracy={:.4}, macro_f1={:.4}",
        num_samples, num_classes, report.accuracy, report.macro_f1
    );

    Ok(report)
}

/// Per-class metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Class index
    pub class_idx: usize,

    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,

    /// Precision = TP / (TP + FP), 0 when nothing was predicted as this class
    pub precision: f64,

    /// Recall = TP / (TP + FN), 0 when the class never occurs
    pub recall: f64,

    /// Harmonic mean of precision and recall, 0 when both are 0
    pub f1: f64,

    /// Number of actual samples of this class
    pub support: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);
        let support = cm.row_sum(class_idx);
        let false_positives = cm.col_sum(class_idx) - true_positives;
        let false_negatives = support - true_positives;
        let true_negatives = cm.total() - true_positives - false_positives - false_negatives;

        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            true_positives,
            false_positives,
            false_negatives,
            true_negatives,
            precision,
            recall,
            f1,
            support,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Matrix data (row = actual, column = predicted), row-major
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Create confusion matrix from predictions and ground truth
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Add a single prediction to the matrix
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    /// Get the count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    /// Number of samples whose true class is `actual`
    pub fn row_sum(&self, actual: usize) -> usize {
        (0..self.num_classes).map(|col| self.get(actual, col)).sum()
    }

    /// Number of samples predicted as `predicted`
    pub fn col_sum(&self, predicted: usize) -> usize {
        (0..self.num_classes).map(|row| self.get(row, predicted)).sum()
    }

    /// Get the row sums (actual class counts)
    pub fn row_sums(&self) -> Vec<usize> {
        (0..self.num_classes).map(|row| self.row_sum(row)).collect()
    }

    /// Rows as nested vectors, for serialization to UIs
    pub fn to_rows(&self) -> Vec<Vec<usize>> {
        self.matrix
            .chunks(self.num_classes.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Diagonal sum
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Pretty print the confusion matrix
    pub fn display(&self, class_names: Option<&[&str]>) -> String {
        let label = |idx: usize, width: usize| -> String {
            match class_names.and_then(|names| names.get(idx)) {
                Some(name) => name.chars().take(width).collect(),
                None => idx.to_string(),
            }
        };

        let mut output = String::new();
        output.push_str("\nConfusion Matrix (rows=actual, cols=predicted):\n\n");
        output.push_str("          ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>10}", label(col, 9)));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>9} ", label(row, 9)));
            for col in 0..self.num_classes {
                let count = self.get(row, col);
                if row == col {
                    output.push_str(&format!("    [{:>4}]", count));
                } else {
                    output.push_str(&format!("{:>10}", count));
                }
            }
            output.push('\n');
        }
        output
    }
}

/// One point on a ROC curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    /// False-positive rate
    pub fpr: f64,
    /// True-positive rate
    pub tpr: f64,
}

/// One-vs-rest ROC curve for a single class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub class_idx: usize,
    /// Points ordered by decreasing threshold, from (0,0) to (1,1)
    pub points: Vec<RocPoint>,
    /// Area under the curve (trapezoidal rule)
    pub auc: f64,
}

impl RocCurve {
    /// Sweep thresholds over `scores` for the binary problem "row is `positives[i]`".
    ///
    /// Thresholds are the distinct scores plus 0 and 1, visited in descending
    /// order; a row counts as positive when its score is at or above the threshold.
    pub fn one_vs_rest(class_idx: usize, scores: &[f64], positives: &[bool]) -> Self {
        let total_pos = positives.iter().filter(|&&p| p).count();
        let total_neg = positives.len() - total_pos;

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let mut thresholds: Vec<f64> = scores.iter().copied().chain([0.0, 1.0]).collect();
        thresholds.sort_by(|a, b| b.total_cmp(a));
        thresholds.dedup();

        let mut points = vec![RocPoint { fpr: 0.0, tpr: 0.0 }];
        let (mut tp, mut fp, mut cursor) = (0usize, 0usize, 0usize);
        for threshold in thresholds {
            while cursor < order.len() && scores[order[cursor]] >= threshold {
                if positives[order[cursor]] {
                    tp += 1;
                } else {
                    fp += 1;
                }
                cursor += 1;
            }
            points.push(RocPoint {
                fpr: ratio(fp, total_neg),
                tpr: ratio(tp, total_pos),
            });
        }
        points.push(RocPoint { fpr: 1.0, tpr: 1.0 });
        points.dedup();

        let auc = points
            .windows(2)
            .map(|w| (w[1].fpr - w[0].fpr) * (w[0].tpr + w[1].tpr) / 2.0)
            .sum();

        Self {
            class_idx,
            points,
            auc,
        }
    }
}
