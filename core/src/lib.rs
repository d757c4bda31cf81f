//! `severity-core`: crash severity inference.
//!
//! Loads the offline-trained classifier and its preprocessing artifacts,
//! aligns incoming crash records onto the training-time feature schema and
//! produces a severity label with a confidence score.
//!
//! The HTTP surface lives in `severity-server`; everything here is plain
//! synchronous code that can be exercised without a runtime.

pub mod align;
pub mod artifacts;
pub mod classifier;
pub mod config_loader;
pub mod encoding;
pub mod predictor;

pub use align::{AlignError, FeatureRow, FeatureSchema, preprocess_input};
pub use artifacts::{LoadedArtifacts, load_artifacts};
pub use config_loader::{ConfigLoadError, ConfigLoader, ServiceConfig};
pub use encoding::{LabelEncoder, UnseenCategoryPolicy};
pub use predictor::{ModelState, PredictError, Prediction, Predictor};
