//! Online linear admission gate trained with perceptron corrections.

use buildbots_core::{Properties, PropertyError, StoreError, parse_property};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::features::{FEATURE_COUNT, PlacementFeatures};

/// Weights in feature order: bias, replaceable, support, distance.
pub const DEFAULT_WEIGHTS: [f64; FEATURE_COUNT] = [0.20, 0.65, 0.35, -0.30];
pub const DEFAULT_THRESHOLD: f64 = 0.10;
pub const DEFAULT_LEARNING_RATE: f64 = 0.05;

/// Current on-disk layout version of persisted models.
pub const MODEL_FORMAT_VERSION: u32 = 1;

const WEIGHT_KEYS: [&str; FEATURE_COUNT] = [
    "model.weight.bias",
    "model.weight.replaceable",
    "model.weight.support",
    "model.weight.distance",
];

/// Errors raised when configuring or restoring a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("threshold {0} must be finite")]
    InvalidThreshold(f64),
    #[error("learning rate {0} must be finite and positive")]
    InvalidLearningRate(f64),
    #[error("unsupported model format version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("model record is not valid UTF-8")]
    NotUtf8,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Four-weight linear scorer with a fixed decision threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementModel {
    weights: [f64; FEATURE_COUNT],
    threshold: f64,
    learning_rate: f64,
    updates: u64,
}

impl Default for PlacementModel {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS,
            threshold: DEFAULT_THRESHOLD,
            learning_rate: DEFAULT_LEARNING_RATE,
            updates: 0,
        }
    }
}

impl PlacementModel {
    /// Identifier recorded next to persisted weights.
    pub const KIND: &'static str = "perceptron.linear4";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dot product of weights and features.
    #[must_use]
    pub fn score(&self, features: &PlacementFeatures) -> f64 {
        self.weights
            .iter()
            .zip(features.as_array())
            .map(|(weight, feature)| weight * feature)
            .sum()
    }

    #[must_use]
    pub fn should_place(&self, features: &PlacementFeatures) -> bool {
        self.score(features) >= self.threshold
    }

    /// Apply one perceptron correction. Returns whether any weight changed.
    pub fn train(&mut self, features: &PlacementFeatures, success: bool) -> bool {
        let label = if success { 1.0 } else { -1.0 };
        let predicted = if self.should_place(features) { 1.0 } else { -1.0 };
        if label == predicted {
            return false;
        }
        let step = self.learning_rate * (label - predicted);
        for (weight, feature) in self.weights.iter_mut().zip(features.as_array()) {
            *weight += step * feature;
        }
        self.updates += 1;
        debug!(success, updates = self.updates, weights = ?self.weights, "placement model corrected");
        true
    }

    /// Restore default weights and hyperparameters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Overwrite the decision threshold and learning rate only.
    pub fn configure(&mut self, threshold: f64, learning_rate: f64) -> Result<(), ModelError> {
        if !threshold.is_finite() {
            return Err(ModelError::InvalidThreshold(threshold));
        }
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(ModelError::InvalidLearningRate(learning_rate));
        }
        self.threshold = threshold;
        self.learning_rate = learning_rate;
        Ok(())
    }

    #[must_use]
    pub const fn weights(&self) -> [f64; FEATURE_COUNT] {
        self.weights
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    #[must_use]
    pub const fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Corrections applied since construction or the last reset.
    #[must_use]
    pub const fn updates(&self) -> u64 {
        self.updates
    }

    /// Flatten into persisted key/value pairs.
    #[must_use]
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert("model.version".into(), MODEL_FORMAT_VERSION.to_string());
        props.insert("model.kind".into(), Self::KIND.into());
        for (key, weight) in WEIGHT_KEYS.iter().zip(self.weights) {
            props.insert((*key).into(), weight.to_string());
        }
        props.insert("model.threshold".into(), self.threshold.to_string());
        props.insert("model.learning_rate".into(), self.learning_rate.to_string());
        props.insert("model.updates".into(), self.updates.to_string());
        props
    }

    /// Rebuild a model written by [`Self::to_properties`].
    pub fn from_properties(props: &Properties) -> Result<Self, ModelError> {
        let version: u32 = parse_property(props, "model.version")?;
        if version != MODEL_FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion(version));
        }
        let mut weights = [0.0; FEATURE_COUNT];
        for (slot, key) in weights.iter_mut().zip(WEIGHT_KEYS) {
            *slot = finite(props, key)?;
        }
        let mut model = Self {
            weights,
            updates: parse_property(props, "model.updates")?,
            ..Self::default()
        };
        model.configure(
            finite(props, "model.threshold")?,
            finite(props, "model.learning_rate")?,
        )?;
        Ok(model)
    }
}

fn finite(props: &Properties, key: &str) -> Result<f64, PropertyError> {
    let value: f64 = parse_property(props, key)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PropertyError::Invalid {
            key: key.to_owned(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn features(replaceable: f64, support: f64, distance: f64) -> PlacementFeatures {
        PlacementFeatures {
            bias: 1.0,
            replaceable,
            support,
            normalized_distance: distance,
        }
    }

    fn random_features(rng: &mut SmallRng) -> PlacementFeatures {
        features(
            f64::from(u8::from(rng.random_bool(0.7))),
            f64::from(u8::from(rng.random_bool(0.5))),
            rng.random_range(0.0..=1.0),
        )
    }

    #[test]
    fn default_model_scores_linearly() {
        let model = PlacementModel::new();
        let f = features(1.0, 1.0, 0.5);
        assert!((model.score(&f) - 1.05).abs() < 1e-12);
        assert!(model.should_place(&f));
        let weak = features(0.0, 0.0, 1.0);
        assert!((model.score(&weak) + 0.10).abs() < 1e-12);
        assert!(!model.should_place(&weak));
    }

    #[test]
    fn correct_predictions_leave_weights_alone() {
        let mut model = PlacementModel::new();
        assert!(!model.train(&features(1.0, 1.0, 0.2), true));
        assert_eq!(model.weights(), DEFAULT_WEIGHTS);
        assert_eq!(model.updates(), 0);
    }

    #[test]
    fn misprediction_nudges_every_weight() {
        let mut model = PlacementModel::new();
        let f = features(1.0, 0.0, 0.5);
        assert!(model.train(&f, false));
        let expected = [0.20 - 0.1, 0.65 - 0.1, 0.35, -0.30 - 0.05];
        for (weight, want) in model.weights().iter().zip(expected) {
            assert!((weight - want).abs() < 1e-12);
        }
        assert_eq!(model.updates(), 1);
    }

    #[test]
    fn repeated_training_stabilises() {
        let mut model = PlacementModel::new();
        let f = features(1.0, 1.0, 0.9);
        let mut corrections = 0;
        while model.train(&f, false) {
            corrections += 1;
            assert!(corrections < 100, "perceptron should converge on one example");
        }
        let settled = model.clone();
        for _ in 0..25 {
            assert!(!model.train(&f, false));
        }
        assert_eq!(model, settled);
        assert!(!model.should_place(&f));
    }

    #[test]
    fn configure_touches_only_hyperparameters() {
        let mut model = PlacementModel::new();
        model.train(&features(1.0, 0.0, 0.5), false);
        let weights = model.weights();
        model.configure(0.4, 0.2).expect("configure");
        assert_eq!(model.weights(), weights);
        assert_eq!(model.threshold(), 0.4);
        assert_eq!(model.learning_rate(), 0.2);
        assert!(matches!(
            model.configure(0.1, 0.0),
            Err(ModelError::InvalidLearningRate(rate)) if rate == 0.0
        ));
        model.reset();
        assert_eq!(model, PlacementModel::default());
    }

    #[test]
    fn trained_models_round_trip_through_properties() {
        let mut rng = SmallRng::seed_from_u64(0x5EED_1234);
        for _ in 0..20 {
            let mut model = PlacementModel::new();
            model
                .configure(rng.random_range(-0.5..0.5), rng.random_range(0.01..0.3))
                .expect("configure");
            for _ in 0..rng.random_range(1..200) {
                let f = random_features(&mut rng);
                model.train(&f, rng.random_bool(0.6));
            }
            let restored = PlacementModel::from_properties(&model.to_properties()).expect("restore");
            assert_eq!(restored, model);
            for (a, b) in restored.weights().iter().zip(model.weights()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn corrupt_properties_are_rejected() {
        let mut props = PlacementModel::new().to_properties();
        props.insert("model.weight.support".into(), "NaN".into());
        assert!(matches!(
            PlacementModel::from_properties(&props),
            Err(ModelError::Property(PropertyError::Invalid { .. }))
        ));
        props.insert("model.version".into(), "9".into());
        assert!(matches!(
            PlacementModel::from_properties(&props),
            Err(ModelError::UnsupportedVersion(9))
        ));
    }
}
