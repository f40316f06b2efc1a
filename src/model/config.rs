//! Application configuration
//!
//! Compute device, model, training, augmentation and server settings stored as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Compute device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// WGPU (GPU) backend, requires the `gpu` feature
    Wgpu,
    /// NdArray (CPU) backend
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(format!("unknown device type: {other} (expected cpu or wgpu)")),
        }
    }
}

/// Model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Trained model artifact (written by the trainer, read by the server)
    pub artifact_path: String,
    /// torchvision MobileNetV2 ImageNet checkpoint; `None` starts from random weights
    pub backbone_weights: Option<String>,
    /// MobileNetV2 width multiplier
    pub width_multiplier: f64,
    /// Units in the hidden dense layer of the head
    pub hidden_units: usize,
    /// Dropout rate of the head
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            artifact_path: "tuberculosis_detector.tar.gz".to_string(),
            backbone_weights: Some("weights/mobilenet_v2-b0353104.pth".to_string()),
            width_multiplier: 1.0,
            hidden_units: 1024,
            dropout: 0.5,
        }
    }
}

/// Training settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Training split root (one subdirectory per class)
    pub train_dir: String,
    /// Validation split root (one subdirectory per class)
    pub validation_dir: String,
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Data loading workers (0 loads on the training thread)
    pub num_workers: usize,
    pub learning_rate: f64,
    /// Seed for shuffling and augmentation
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            train_dir: "dataset/train".to_string(),
            validation_dir: "dataset/validation".to_string(),
            num_epochs: 10,
            batch_size: 32,
            num_workers: 0,
            learning_rate: 1e-4,
            seed: 42,
        }
    }
}

/// Random augmentation applied to the training split only
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationSettings {
    /// Maximum rotation in degrees (both directions)
    pub rotation_range: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift_range: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            horizontal_flip: true,
        }
    }
}

/// Prediction server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device_type: DeviceType,
    pub model: ModelSettings,
    pub training: TrainingSettings,
    pub augmentation: AugmentationSettings,
    pub server: ServerSettings,
}

impl AppConfig {
    /// Default configuration file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// Loads the configuration
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when it is missing or unreadable
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {} ({}), using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Logs the effective configuration
    pub fn log_summary(&self) {
        tracing::info!(device = %self.device_type, "compute device");
        tracing::info!(
            artifact = %self.model.artifact_path,
            backbone_weights = ?self.model.backbone_weights,
            width_multiplier = self.model.width_multiplier,
            hidden_units = self.model.hidden_units,
            dropout = self.model.dropout,
            "model settings"
        );
        tracing::debug!(
            train_dir = %self.training.train_dir,
            validation_dir = %self.training.validation_dir,
            epochs = self.training.num_epochs,
            batch_size = self.training.batch_size,
            learning_rate = self.training.learning_rate,
            seed = self.training.seed,
            "training settings"
        );
    }
}
