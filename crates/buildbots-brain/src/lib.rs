//! Placement brain: the per-target feature vector and the online linear
//! classifier that decides whether a placement is attempted.

pub mod features;
pub mod perceptron;
pub mod store;

pub use features::{FEATURE_COUNT, PlacementFeatures, extract_features};
pub use perceptron::{
    DEFAULT_LEARNING_RATE, DEFAULT_THRESHOLD, DEFAULT_WEIGHTS, MODEL_FORMAT_VERSION, ModelError,
    PlacementModel,
};
pub use store::{MODEL_RECORD, ModelStore};
