//! Tuberculosis chest X-ray classifier
//!
//! - `ml`: model, data pipeline, training loop and inference engine
//! - `model`: configuration and the trained model artifact
//! - `api`: HTTP prediction service

pub mod api;
pub mod logging;
pub mod ml;
pub mod model;
pub mod types;

pub use types::{Label, Prediction, DECISION_THRESHOLD};
