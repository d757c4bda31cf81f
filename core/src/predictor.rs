//! End-to-end prediction for a single record.
//!
//! The [`Predictor`] is built once at startup from whatever artifacts
//! loaded, then shared read-only by every request. Whether a model is
//! available is an explicit [`ModelState`], checked before any work.

use std::time::Instant;

use serde::Serialize;

use crate::align::{AlignError, ColumnEncoders, FeatureSchema, RawRecord, preprocess_input};
use crate::artifacts::LoadedArtifacts;
use crate::classifier::{Classifier, InferenceError};
use crate::encoding::{EncodingError, LabelEncoder};

/// Errors from [`Predictor::predict`].
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Model or target encoder not loaded")]
    ModelUnavailable,

    #[error("preprocessing failed: {0}")]
    Align(#[from] AlignError),

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("label lookup failed: {0}")]
    Label(#[from] EncodingError),

    #[error("classifier returned no probabilities")]
    EmptyProbabilities,
}

/// Whether the classifier and target encoder are usable.
#[derive(Debug)]
pub enum ModelState {
    Ready {
        classifier: Box<dyn Classifier>,
        target_encoder: LabelEncoder,
    },
    /// Serving without a model; every prediction is refused.
    Degraded { reason: String },
}

impl ModelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Predicted severity label and the probability of that label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub prediction: String,
    /// Winning class probability rounded to three decimals.
    pub confidence: f64,
}

#[derive(Debug)]
pub struct Predictor {
    state: ModelState,
    encoders: ColumnEncoders,
    schema: FeatureSchema,
}

impl Predictor {
    pub fn new(state: ModelState, encoders: ColumnEncoders, schema: FeatureSchema) -> Self {
        Self {
            state,
            encoders,
            schema,
        }
    }

    /// Build the predictor from the startup load, degrading when the
    /// classifier or the target encoder is missing.
    pub fn from_artifacts(artifacts: LoadedArtifacts) -> Self {
        let state = match (artifacts.classifier, artifacts.target_encoder) {
            (Some(classifier), Some(target_encoder)) => ModelState::Ready {
                classifier: Box::new(classifier),
                target_encoder,
            },
            (None, Some(_)) => ModelState::Degraded {
                reason: "classifier not loaded".to_string(),
            },
            (Some(_), None) => ModelState::Degraded {
                reason: "target encoder not loaded".to_string(),
            },
            (None, None) => ModelState::Degraded {
                reason: "classifier and target encoder not loaded".to_string(),
            },
        };
        Self::new(state, artifacts.encoders, artifacts.schema)
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn encoders(&self) -> &ColumnEncoders {
        &self.encoders
    }

    /// Fail fast when no model is available.
    pub fn ensure_ready(&self) -> Result<(), PredictError> {
        match &self.state {
            ModelState::Ready { .. } => Ok(()),
            ModelState::Degraded { .. } => Err(PredictError::ModelUnavailable),
        }
    }

    /// Align `record`, score it and map the most probable class to its label.
    pub fn predict(&self, record: &RawRecord) -> Result<Prediction, PredictError> {
        let ModelState::Ready {
            classifier,
            target_encoder,
        } = &self.state
        else {
            return Err(PredictError::ModelUnavailable);
        };

        let start = Instant::now();
        let row = preprocess_input(record, &self.encoders, &self.schema)?;
        let proba = classifier.predict_proba(row.values())?;
        let idx = argmax(&proba).ok_or(PredictError::EmptyProbabilities)?;
        let label = target_encoder.inverse_transform(idx)?;
        let confidence = proba[idx];

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prediction made: {label} with confidence {confidence:.3}"
        );

        Ok(Prediction {
            prediction: label.to_string(),
            confidence: round3(confidence),
        })
    }
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (idx, value)| match best {
            Some((_, top)) if value <= top => best,
            _ => Some((idx, value)),
        })
        .map(|(idx, _)| idx)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
