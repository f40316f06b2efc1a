//! Model inference

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};

use crate::ml::ml_model::TuberculosisClassifier;
use crate::ml::preprocess::preprocess_to_tensor;
use crate::model::{load_model_with_metadata, ModelMetadata};
use crate::types::Prediction;

/// Inference engine
///
/// Holds one loaded classifier. Calls to [`InferenceEngine::predict_bytes`]
/// are serialized on the model.
pub struct InferenceEngine<B: Backend> {
    model: Mutex<TuberculosisClassifier<B>>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// Loads an artifact written by the trainer
    pub fn load(model_path: &Path, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path)?;
        metadata.validate()?;

        let model = metadata.model_config.init::<B>(&device);

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &device)
            .map_err(|e| anyhow::anyhow!("failed to load model weights: {:?}", e))?;
        let model = model.load_record(record);

        tracing::info!("Model loaded from {}", model_path.display());
        metadata.log_summary();

        Ok(Self {
            model: Mutex::new(model),
            metadata,
            device,
        })
    }

    /// Probability of tuberculosis for one encoded image
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let images = preprocess_to_tensor::<B>(bytes, &self.device)?;

        let output = {
            // the model is never mutated, a poisoned lock is still usable
            let model = self.model.lock().unwrap_or_else(|e| e.into_inner());
            model.forward(images)
        };

        let values = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read model output: {:?}", e))?;
        let probability = values
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("model returned no output"))?;

        Ok(Prediction::from_probability(probability))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;
    use crate::ml::preprocess::tests::encoded_image;
    use crate::model::save_model_with_metadata;
    use crate::types::Label;
    use burn::optim::AdamConfig;
    use burn_ndarray::NdArray;
    use image::ImageFormat;

    type TestBackend = NdArray<f32>;

    /// Writes an untrained tiny model to `path`
    pub(crate) fn write_tiny_artifact(path: &Path) -> TuberculosisClassifier<TestBackend> {
        let config = ModelConfig::new()
            .with_width_multiplier(0.35)
            .with_hidden_units(8);
        let model = config.init::<TestBackend>(&Default::default());
        let binary = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.clone().into_record(), ())
            .unwrap();
        let metadata = ModelMetadata::new(config, AdamConfig::new(), 1e-4, 2, Vec::new());
        save_model_with_metadata(path, &metadata, &binary).unwrap();
        model
    }

    #[test]
    fn test_loaded_model_matches_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        let model = write_tiny_artifact(&path);

        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();
        let bytes = encoded_image(320, 240, ImageFormat::Png);
        let prediction = engine.predict_bytes(&bytes).unwrap();

        let expected = model
            .forward(preprocess_to_tensor::<TestBackend>(&bytes, &Default::default()).unwrap())
            .into_data()
            .to_vec::<f32>()
            .unwrap()[0];
        assert!((prediction.probability_tuberculosis - expected).abs() < 1e-6);
        assert_eq!(
            prediction.class_name,
            Label::from_probability(prediction.probability_tuberculosis)
        );
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_tiny_artifact(&path);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        let bytes = encoded_image(64, 64, ImageFormat::Jpeg);
        let first = engine.predict_bytes(&bytes).unwrap();
        let second = engine.predict_bytes(&bytes).unwrap();
        assert_eq!(first, second);
        assert!((0.0..=1.0).contains(&first.probability_tuberculosis));
    }

    #[test]
    fn test_prediction_survives_poisoned_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_tiny_artifact(&path);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let _guard = engine.model.lock().unwrap();
                panic!("panic while holding the model");
            });
            assert!(handle.join().is_err());
        });
        assert!(engine.model.is_poisoned());

        let bytes = encoded_image(32, 32, ImageFormat::Png);
        assert!(engine.predict_bytes(&bytes).is_ok());
    }

    #[test]
    fn test_configured_path_without_gz_extension() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("detector.model");
        write_tiny_artifact(&configured);

        let engine = InferenceEngine::<TestBackend>::load(&configured, Default::default()).unwrap();
        let bytes = encoded_image(32, 32, ImageFormat::Png);
        assert!(engine.predict_bytes(&bytes).is_ok());
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_tiny_artifact(&path);
        let engine = InferenceEngine::<TestBackend>::load(&path, Default::default()).unwrap();

        assert!(engine.predict_bytes(b"\x89PNG broken").is_err());
        assert!(engine.predict_bytes(&[]).is_err());
    }

    #[test]
    fn test_missing_artifact_fails() {
        let result = InferenceEngine::<TestBackend>::load(Path::new("no/such/model.tar.gz"), Default::default());
        assert!(result.is_err());
    }
}
