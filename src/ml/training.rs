//! Model training
//!
//! Frozen-backbone fine-tuning: Adam on the head only, binary cross-entropy,
//! one training pass and one validation pass per epoch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    nn::loss::BinaryCrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        activation,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};

use crate::ml::augment::AugmentConfig;
use crate::ml::dataset::{XrayBatcher, XrayDataset};
use crate::ml::ml_model::{ModelConfig, TuberculosisClassifier};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata};
use crate::types::DECISION_THRESHOLD;

/// Everything a training run needs
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub train_dir: PathBuf,
    pub validation_dir: PathBuf,
    pub output_path: PathBuf,
    pub backbone_weights: Option<PathBuf>,
    pub model: ModelConfig,
    pub augmentation: AugmentConfig,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl TrainingOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            train_dir: PathBuf::from(&config.training.train_dir),
            validation_dir: PathBuf::from(&config.training.validation_dir),
            output_path: PathBuf::from(&config.model.artifact_path),
            backbone_weights: config.model.backbone_weights.as_ref().map(PathBuf::from),
            model: ModelConfig::new()
                .with_width_multiplier(config.model.width_multiplier)
                .with_hidden_units(config.model.hidden_units)
                .with_dropout(config.model.dropout),
            augmentation: AugmentConfig::from(&config.augmentation),
            num_epochs: config.training.num_epochs,
            batch_size: config.training.batch_size,
            num_workers: config.training.num_workers,
            learning_rate: config.training.learning_rate,
            seed: config.training.seed,
        }
    }

    /// Adam with Keras' default epsilon
    pub fn optimizer_config(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-7)
    }
}

/// Loss and accuracy of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub artifact_path: PathBuf,
    pub history: Vec<EpochMetrics>,
}

/// Sample-weighted running loss and accuracy
#[derive(Debug, Default, Clone, Copy)]
struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningMetrics {
    fn update<B: Backend>(&mut self, loss: Tensor<B, 1>, logits: Tensor<B, 1>, targets: Tensor<B, 1, Int>) {
        let batch_size = targets.dims()[0];
        let loss = loss.into_scalar().elem::<f64>();
        let correct = activation::sigmoid(logits)
            .greater_elem(DECISION_THRESHOLD)
            .int()
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct as usize;
        self.samples += batch_size;
    }

    fn loss(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.loss_sum / self.samples as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

/// Flattens [batch, 1] logits to [batch]
fn flatten_logits<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    logits.reshape([batch_size])
}

/// Trains the classifier and writes the artifact.
///
/// Both splits are validated before the model is built; any error aborts the
/// run without touching an existing artifact.
pub fn train_model<B: AutodiffBackend>(
    options: &TrainingOptions,
    device: B::Device,
) -> Result<TrainingReport> {
    if options.num_epochs == 0 {
        anyhow::bail!("num_epochs must be at least 1");
    }
    if options.batch_size == 0 {
        anyhow::bail!("batch_size must be at least 1");
    }

    tracing::info!("Validating training data...");
    let dataset_train = XrayDataset::from_directory(&options.train_dir)
        .with_context(|| format!("invalid training data in {}", options.train_dir.display()))?;
    let dataset_val = XrayDataset::from_directory(&options.validation_dir).with_context(|| {
        format!("invalid validation data in {}", options.validation_dir.display())
    })?;
    dataset_train.log_summary("train");
    dataset_val.log_summary("validation");

    let mut model = options
        .model
        .init_pretrained::<B>(options.backbone_weights.as_deref(), &device)?;
    model.log_summary(&options.model);

    let batcher_train =
        XrayBatcher::<B>::with_augmentation(device.clone(), options.augmentation.clone(), options.seed);
    let batcher_val = XrayBatcher::<B::InnerBackend>::new(device.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(options.batch_size)
        .shuffle(options.seed)
        .num_workers(options.num_workers)
        .build(dataset_train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(options.batch_size)
        .num_workers(options.num_workers)
        .build(dataset_val);

    let optimizer_config = options.optimizer_config();
    let mut optimizer = optimizer_config.init::<B, TuberculosisClassifier<B>>();
    let loss_train = BinaryCrossEntropyLossConfig::new().with_logits(true).init(&device);
    let loss_val = BinaryCrossEntropyLossConfig::new().with_logits(true).init(&device);

    tracing::info!(
        "Training: {} epochs, batch size {}, learning rate {}",
        options.num_epochs,
        options.batch_size,
        options.learning_rate
    );

    let mut history = Vec::with_capacity(options.num_epochs);
    for epoch in 1..=options.num_epochs {
        let mut train_metrics = RunningMetrics::default();
        for batch in dataloader_train.iter() {
            let batch = batch?;
            let logits = flatten_logits(model.forward_logits(batch.images));
            let loss = loss_train.forward(logits.clone(), batch.targets.clone());

            train_metrics.update(loss.clone().detach(), logits.detach(), batch.targets);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(options.learning_rate, model, grads);
        }

        let model_valid = model.valid();
        let mut val_metrics = RunningMetrics::default();
        for batch in dataloader_val.iter() {
            let batch = batch?;
            let logits = flatten_logits(model_valid.forward_logits(batch.images));
            let loss = loss_val.forward(logits.clone(), batch.targets.clone());
            val_metrics.update(loss, logits, batch.targets);
        }

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_metrics.loss(),
            train_accuracy: train_metrics.accuracy(),
            val_loss: val_metrics.loss(),
            val_accuracy: val_metrics.accuracy(),
        };
        tracing::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            epoch,
            options.num_epochs,
            metrics.train_loss,
            metrics.train_accuracy,
            metrics.val_loss,
            metrics.val_accuracy
        );
        history.push(metrics);
    }

    let artifact_path = save_trained_model(options, model.valid(), optimizer_config, &history)?;
    tracing::info!("Model trained and saved to {}", artifact_path.display());

    Ok(TrainingReport {
        artifact_path,
        history,
    })
}

fn save_trained_model<B: Backend>(
    options: &TrainingOptions,
    model: TuberculosisClassifier<B>,
    optimizer: AdamConfig,
    history: &[EpochMetrics],
) -> Result<PathBuf> {
    let model_binary = BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("failed to serialize model weights: {:?}", e))?;
    tracing::debug!(
        "Model weights: {} bytes ({:.2} MB)",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    let metadata = ModelMetadata::new(
        options.model.clone(),
        optimizer,
        options.learning_rate,
        options.batch_size,
        history.to_vec(),
    );
    save_model_with_metadata(&options.output_path, &metadata, &model_binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::write_split;
    use crate::ml::ml_model::ClassifierHead;
    use crate::ml::InferenceEngine;
    use std::path::Path;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_options(root: &Path, num_epochs: usize) -> TrainingOptions {
        let mut options = TrainingOptions::from_config(&AppConfig::default());
        options.train_dir = root.join("train");
        options.validation_dir = root.join("validation");
        options.output_path = root.join("models").join("detector.tar.gz");
        options.backbone_weights = None;
        options.model = ModelConfig::new()
            .with_width_multiplier(0.35)
            .with_hidden_units(8);
        options.num_epochs = num_epochs;
        options.batch_size = 2;
        options
    }

    #[test]
    fn test_training_run_writes_loadable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), 2, ["normal", "tuberculosis"]);
        write_split(&dir.path().join("validation"), 2, ["Normal", "Tuberculosis"]);
        let options = tiny_options(dir.path(), 2);

        let report = train_model::<TestBackend>(&options, Default::default()).unwrap();

        assert_eq!(report.history.len(), 2);
        assert_eq!(report.history.last().unwrap().epoch, 2);
        for metrics in &report.history {
            assert!(metrics.train_loss.is_finite());
            assert!((0.0..=1.0).contains(&metrics.val_accuracy));
        }
        assert_eq!(report.artifact_path, options.output_path);
        assert!(report.artifact_path.is_file());

        let engine = InferenceEngine::<NdArray<f32>>::load(&report.artifact_path, Default::default())
            .unwrap();
        assert_eq!(engine.metadata().history.len(), 2);
        assert_eq!(engine.metadata().model_config.hidden_units, 8);
    }

    #[test]
    fn test_missing_data_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), 1, ["normal", "tuberculosis"]);
        let options = tiny_options(dir.path(), 1);

        let err = train_model::<TestBackend>(&options, Default::default()).unwrap_err();
        assert!(format!("{err:#}").contains("validation"));
        assert!(!options.output_path.exists());
    }

    #[test]
    fn test_invalid_data_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), 1, ["normal", "tuberculosis"]);
        write_split(&dir.path().join("validation"), 1, ["normal", "tuberculosis"]);
        std::fs::create_dir_all(dir.path().join("train").join("empty")).unwrap();
        let options = tiny_options(dir.path(), 1);
        std::fs::create_dir_all(options.output_path.parent().unwrap()).unwrap();
        std::fs::write(&options.output_path, b"previous").unwrap();

        // "empty" is not a class directory
        assert!(train_model::<TestBackend>(&options, Default::default()).is_err());
        assert_eq!(std::fs::read(&options.output_path).unwrap(), b"previous");
    }

    #[test]
    fn test_training_step_leaves_backbone_unchanged() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_width_multiplier(0.35)
            .with_hidden_units(8);
        let model = config.init::<TestBackend>(&device);
        let stem_before = model.backbone.stem.conv.weight.val().into_data();
        let head_bytes = |head: ClassifierHead<TestBackend>| {
            BinBytesRecorder::<FullPrecisionSettings>::default()
                .record(head.into_record(), ())
                .unwrap()
        };
        let head_before = head_bytes(model.head.clone());

        let mut optimizer = AdamConfig::new().init::<TestBackend, TuberculosisClassifier<TestBackend>>();
        let images = Tensor::<TestBackend, 4>::ones([2, 224, 224, 3], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);
        let logits = flatten_logits(model.forward_logits(images));
        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device)
            .forward(logits, targets);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optimizer.step(1e-2, model, grads);

        assert_eq!(
            model.backbone.stem.conv.weight.val().into_data().to_vec::<f32>().unwrap(),
            stem_before.to_vec::<f32>().unwrap()
        );
        assert_ne!(head_bytes(model.head.clone()), head_before);
    }
}
