//! Training configuration.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fraction of the training split held out for per-epoch validation.
pub const VALIDATION_SPLIT: f64 = 0.2;

/// Hyperparameters for one training run.
///
/// Fields missing from a config file take their [`Default`] values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Identifier handed opaquely to the dataset provider
    pub dataset_path: String,
    /// Number of training epochs
    pub epochs: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Optimizer learning rate
    pub learning_rate: f64,
    /// Optimizer selector
    pub optimizer: OptimizerType,
    /// Random seed for shuffling
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_path: "data".to_string(),
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            optimizer: OptimizerType::Adam,
            seed: default_seed(),
        }
    }
}

impl TrainingConfig {
    /// Build a validated configuration. The optimizer selector is parsed
    /// case-insensitively.
    pub fn new(
        dataset_path: impl Into<String>,
        epochs: usize,
        batch_size: usize,
        learning_rate: f64,
        optimizer: &str,
    ) -> Result<Self> {
        let config = Self {
            dataset_path: dataset_path.into(),
            epochs,
            batch_size,
            learning_rate,
            optimizer: optimizer.parse()?,
            seed: default_seed(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Override the shuffle seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check that every numeric field is strictly positive.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::Configuration("epochs must be greater than 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Configuration(format!(
                "learning_rate must be a positive finite number, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load and validate a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Supported optimizers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerType {
    /// Adam optimizer
    Adam,
    /// AdamW optimizer
    AdamW,
    /// Plain stochastic gradient descent
    Sgd,
    /// RMSprop optimizer
    RmsProp,
}

impl OptimizerType {
    /// All recognized selectors, in display form.
    pub const SUPPORTED: [&'static str; 4] = ["adam", "adamw", "sgd", "rmsprop"];
}

impl std::fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerType::Adam => write!(f, "adam"),
            OptimizerType::AdamW => write!(f, "adamw"),
            OptimizerType::Sgd => write!(f, "sgd"),
            OptimizerType::RmsProp => write!(f, "rmsprop"),
        }
    }
}

impl FromStr for OptimizerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "adam" => Ok(OptimizerType::Adam),
            "adamw" => Ok(OptimizerType::AdamW),
            "sgd" => Ok(OptimizerType::Sgd),
            "rmsprop" => Ok(OptimizerType::RmsProp),
            other => Err(Error::Configuration(format!(
                "unrecognized optimizer '{}'; expected one of: {}",
                other,
                Self::SUPPORTED.join(", ")
            ))),
        }
    }
}

impl TryFrom<String> for OptimizerType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OptimizerType> for String {
    fn from(value: OptimizerType) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_training_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 50);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.optimizer, OptimizerType::Adam);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_epochs_rejected() {
        let err = TrainingConfig::new("data", 0, 32, 0.001, "adam").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_non_positive_fields_rejected() {
        assert!(TrainingConfig::new("data", 5, 0, 0.001, "adam").is_err());
        assert!(TrainingConfig::new("data", 5, 8, 0.0, "adam").is_err());
        assert!(TrainingConfig::new("data", 5, 8, -1.0, "adam").is_err());
        assert!(TrainingConfig::new("data", 5, 8, f64::NAN, "adam").is_err());
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        let err = TrainingConfig::new("data", 5, 8, 0.01, "adagrad").unwrap_err();
        assert!(err.to_string().contains("adagrad"));
    }

    #[test]
    fn test_optimizer_parsing() {
        assert_eq!("ADAM".parse::<OptimizerType>().unwrap(), OptimizerType::Adam);
        assert_eq!("rmsprop".parse::<OptimizerType>().unwrap(), OptimizerType::RmsProp);
        assert_eq!(OptimizerType::Sgd.to_string(), "sgd");
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = TrainingConfig::new("xrays", 3, 4, 0.01, "sgd").unwrap().with_seed(7);
        config.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_unknown_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"dataset_path":"d","epochs":1,"batch_size":1,"learning_rate":0.1,"optimizer":"lion"}"#,
        )
        .unwrap();

        let err = TrainingConfig::load(&path).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"epochs":3,"optimizer":"sgd"}"#).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(
            loaded,
            TrainingConfig {
                epochs: 3,
                optimizer: OptimizerType::Sgd,
                ..TrainingConfig::default()
            }
        );
    }
}
