//! Logging Module
//!
//! Structured logging setup on top of `tracing`, plus a training logger that
//! reports epoch timing and ETA.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::types::EpochLog;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display (overridden by `RUST_LOG` when set)
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose logging for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::default()
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse a level name, falling back to `Info` for anything unknown.
    pub fn from_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a global
/// subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

/// Training progress logger
pub struct TrainingLogger {
    total_epochs: usize,
    epoch: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        let now = Instant::now();
        Self {
            total_epochs,
            epoch: 0,
            epoch_start: now,
            training_start: now,
        }
    }

    /// Log start of an epoch (1-based)
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();
        tracing::debug!("Epoch {}/{} started", epoch, self.total_epochs);
    }

    /// Estimated seconds left, from the mean epoch time so far.
    pub fn eta_secs(&self) -> f64 {
        if self.epoch == 0 {
            return 0.0;
        }
        let avg_epoch_time = self.training_start.elapsed().as_secs_f64() / self.epoch as f64;
        self.total_epochs.saturating_sub(self.epoch) as f64 * avg_epoch_time
    }

    /// Log end of an epoch with its metrics
    pub fn end_epoch(&self, log: &EpochLog) {
        tracing::info!(
            "Epoch {}/{} completed in {:.1}s | Loss: {:.4} | Acc: {:.2}% | Val Loss: {:.4} | Val Acc: {:.2}% | ETA: {:.0}s",
            log.epoch,
            self.total_epochs,
            self.epoch_start.elapsed().as_secs_f64(),
            log.train_loss,
            log.train_accuracy * 100.0,
            log.val_loss,
            log.val_accuracy * 100.0,
            self.eta_secs()
        );
    }

    /// Log training completion
    pub fn log_complete(&self, final_val_accuracy: f64) {
        tracing::info!(
            "Training complete! {} epochs in {:.1}s | Final val accuracy: {:.2}%",
            self.epoch,
            self.training_start.elapsed().as_secs_f64(),
            final_val_accuracy * 100.0
        );
    }
}
