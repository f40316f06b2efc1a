pub mod augment;
pub mod backbone;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod preprocess;
pub mod training;

pub use augment::{AugmentConfig, Transform};
pub use dataset::{DatasetError, XrayBatch, XrayBatcher, XrayDataset, XrayItem};
pub use inference::InferenceEngine;
pub use ml_model::{ModelConfig, TuberculosisClassifier, CHANNELS, IMAGE_SIZE};
pub use preprocess::PreprocessError;
pub use training::{train_model, EpochMetrics, TrainingOptions, TrainingReport};
