//! Model metadata
//!
//! Stored as `metadata.json` next to the weights inside the artifact.

use anyhow::{Context, Result};
use burn::optim::AdamConfig;
use serde::{Deserialize, Serialize};

use crate::ml::ml_model::{ModelConfig, IMAGE_SIZE};
use crate::ml::training::EpochMetrics;
use crate::types::{Label, DECISION_THRESHOLD};

/// Model metadata
///
/// Contents of the artifact:
/// - metadata.json: this struct
/// - model.bin: weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Architecture needed to rebuild the model before loading weights
    pub model_config: ModelConfig,

    /// Class labels by output index (0 = normal, 1 = tuberculosis)
    pub labels: Vec<Label>,

    /// Square input side in pixels
    pub image_size: usize,

    /// Probabilities strictly above this are "tuberculosis"
    pub threshold: f32,

    /// Optimizer configuration the head was trained with
    pub optimizer: AdamConfig,

    pub learning_rate: f64,
    pub num_epochs: usize,
    pub batch_size: usize,

    /// Per-epoch loss and accuracy
    #[serde(default)]
    pub history: Vec<EpochMetrics>,

    /// RFC 3339 timestamp
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn new(
        model_config: ModelConfig,
        optimizer: AdamConfig,
        learning_rate: f64,
        batch_size: usize,
        history: Vec<EpochMetrics>,
    ) -> Self {
        Self {
            model_config,
            labels: Label::ALL.to_vec(),
            image_size: IMAGE_SIZE,
            threshold: DECISION_THRESHOLD,
            optimizer,
            learning_rate,
            num_epochs: history.len(),
            batch_size,
            history,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Rejects artifacts the current code cannot serve
    pub fn validate(&self) -> Result<()> {
        if self.image_size != IMAGE_SIZE {
            anyhow::bail!(
                "artifact expects {}x{} input, this build uses {}x{}",
                self.image_size,
                self.image_size,
                IMAGE_SIZE,
                IMAGE_SIZE
            );
        }
        if self.labels != Label::ALL {
            anyhow::bail!("unexpected label order in artifact: {:?}", self.labels);
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }

    /// Logs the training summary
    pub fn log_summary(&self) {
        tracing::info!("[Model] trained at {}", self.trained_at);
        tracing::info!(
            "[Model] {} epochs, batch size {}, learning rate {}",
            self.num_epochs,
            self.batch_size,
            self.learning_rate
        );
        if let Some(last) = self.history.last() {
            tracing::info!(
                "[Model] final val_loss: {:.4}, val_accuracy: {:.4}",
                last.val_loss,
                last.val_accuracy
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata::new(
            ModelConfig::new().with_hidden_units(16),
            AdamConfig::new().with_epsilon(1e-7),
            1e-4,
            32,
            vec![EpochMetrics {
                epoch: 1,
                train_loss: 0.6,
                train_accuracy: 0.7,
                val_loss: 0.5,
                val_accuracy: 0.8,
            }],
        )
    }

    #[test]
    fn test_json_keeps_training_details() {
        let metadata = sample();
        let restored = ModelMetadata::from_json_string(&metadata.to_json_string().unwrap()).unwrap();

        assert_eq!(restored.model_config.hidden_units, 16);
        assert_eq!(restored.labels, vec![Label::Normal, Label::Tuberculosis]);
        assert_eq!(restored.num_epochs, 1);
        assert_eq!(restored.history, metadata.history);
        assert_eq!(restored.optimizer.epsilon, 1e-7);
        assert!(restored.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_other_input_size() {
        let mut metadata = sample();
        metadata.image_size = 128;
        assert!(metadata.validate().is_err());

        let mut metadata = sample();
        metadata.labels.reverse();
        assert!(metadata.validate().is_err());
    }
}
