//! Model construction, training and run lifecycle for the chest X-ray classifier.
//!
//! - [`model`]: architecture description and the burn CNN built from it
//! - [`learner`]: optimizer and loss bound to a model, one epoch at a time
//! - [`dataset`]: where the run gets its tensors from
//! - [`resources`]: scoped ownership of the run's buffers
//! - [`trainer`]: the run state machine tying it all together

pub mod dataset;
pub mod learner;
pub mod model;
pub mod resources;
pub mod trainer;

pub use dataset::{DatasetProvider, InMemoryProvider, SyntheticProvider};
pub use learner::{BurnFactory, BurnLearner, EpochData, EpochMetrics, Learner, LearnerFactory};
pub use model::{Activation, ArchitectureSpec, ConvClassifier, InputShape, LayerSpec};
pub use resources::{BufferId, ResourceLedger, ResourceScope};
pub use trainer::{CancelToken, RunError, RunId, RunOutcome, RunState, TrainingRun};

pub mod prelude {
    pub use crate::dataset::*;
    pub use crate::learner::*;
    pub use crate::model::*;
    pub use crate::trainer::*;
    pub use xray_core::prelude::*;
}
