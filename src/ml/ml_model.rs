//! Classifier definition
//!
//! Frozen MobileNetV2 feature extractor composed with a trainable binary head.

use std::path::Path;

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation, backend::Backend, Tensor},
};

use crate::ml::backbone::{MobileNetV2, MobileNetV2Config};

/// Input image side in pixels
pub const IMAGE_SIZE: usize = 224;

/// Color channels of the input
pub const CHANNELS: usize = 3;

/// Model configuration
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// MobileNetV2 width multiplier
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// Units of the hidden dense layer
    #[config(default = 1024)]
    pub hidden_units: usize,
    /// Dropout rate (only active on the training backend)
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    fn backbone_config(&self) -> MobileNetV2Config {
        MobileNetV2Config::new().with_width_multiplier(self.width_multiplier)
    }

    /// Initializes the model with a randomly initialized backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> TuberculosisClassifier<B> {
        let backbone_config = self.backbone_config();
        let features = backbone_config.out_channels();

        TuberculosisClassifier {
            backbone: backbone_config.init(device).no_grad(),
            head: ClassifierHead {
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                dense: LinearConfig::new(features, self.hidden_units).init(device),
                activation: Relu::new(),
                dropout: DropoutConfig::new(self.dropout).init(),
                output: LinearConfig::new(self.hidden_units, 1).init(device),
            },
        }
    }

    /// Initializes the model, loading ImageNet weights into the backbone when given
    pub fn init_pretrained<B: Backend>(
        &self,
        backbone_weights: Option<&Path>,
        device: &B::Device,
    ) -> Result<TuberculosisClassifier<B>> {
        let mut model = self.init(device);
        match backbone_weights {
            Some(path) => {
                if !path.is_file() {
                    anyhow::bail!("backbone weights not found: {}", path.display());
                }
                tracing::info!("Loading ImageNet backbone weights from {}", path.display());
                // Loaded parameters must be frozen as well.
                model.backbone = model.backbone.load_pretrained(path, device)?.no_grad();
            }
            None => {
                tracing::warn!("No backbone weights configured, backbone is randomly initialized");
            }
        }
        Ok(model)
    }
}

/// Global average pooling -> dense + ReLU -> dropout -> dense(1)
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    dense: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    /// `features`: [batch, channels, h, w] -> logits [batch, 1]
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();

        let x = self.pool.forward(features).reshape([batch_size, channels]);
        let x = self.activation.forward(self.dense.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }
}

/// Tuberculosis classifier
///
/// # Architecture
/// - MobileNetV2 feature extractor, all parameters frozen
/// - Global average pooling
/// - FC: features -> hidden + ReLU
/// - Dropout
/// - FC: hidden -> 1, sigmoid (probability of tuberculosis)
#[derive(Module, Debug)]
pub struct TuberculosisClassifier<B: Backend> {
    pub backbone: MobileNetV2<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> TuberculosisClassifier<B> {
    /// Pre-sigmoid output
    ///
    /// # Arguments
    /// - `images`: channel-last batch [batch_size, 224, 224, 3], values in [0, 1]
    ///
    /// # Returns
    /// - logits [batch_size, 1]
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let images = images.permute([0, 3, 1, 2]);
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// Probability of tuberculosis, [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        activation::sigmoid(self.forward_logits(images))
    }

    /// Trainable parameter count (head only)
    pub fn num_trainable_params(&self) -> usize {
        self.head.num_params()
    }

    /// Logs the layer sizes and parameter counts
    pub fn log_summary(&self, config: &ModelConfig) {
        let features = config.backbone_config().out_channels();
        tracing::info!(
            "[Model] input: {}x{}x{}, backbone blocks: {}, features: {}",
            IMAGE_SIZE,
            IMAGE_SIZE,
            CHANNELS,
            self.backbone.blocks.len(),
            features
        );
        tracing::info!(
            "[Model] head: GAP -> FC {} -> {} + ReLU -> Dropout({}) -> FC {} -> 1 + sigmoid",
            features,
            config.hidden_units,
            config.dropout,
            config.hidden_units
        );
        tracing::info!(
            "[Model] parameters: {} frozen, {} trainable",
            self.backbone.num_params(),
            self.num_trainable_params()
        );
    }
}
