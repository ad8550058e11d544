//! Core types and utilities for chest X-ray classifier training.
//!
//! This crate holds everything that does not depend on a tensor backend:
//! configuration, host-side tensors, the metrics engine, progress reporting
//! and logging setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use progress::*;
pub use types::*;

/// Default class names, in label-index order.
pub const CLASS_NAMES: [&str; 3] = ["COVID-19", "Normal", "Pneumonia"];

/// Default input height and width in pixels.
pub const DEFAULT_IMAGE_SIZE: usize = 224;

/// Default number of input channels.
pub const DEFAULT_CHANNELS: usize = 3;

/// Default number of classes.
pub const DEFAULT_NUM_CLASSES: usize = CLASS_NAMES.len();

pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::progress::*;
    pub use crate::types::*;
    pub use crate::{CLASS_NAMES, DEFAULT_CHANNELS, DEFAULT_IMAGE_SIZE, DEFAULT_NUM_CLASSES};
}
