//! Trains the classifier on `<train_dir>/{normal,tuberculosis}` and writes the artifact

use std::path::PathBuf;

use anyhow::Result;
use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use clap::Parser;

use tb_detector_lib::logging::init_logging;
use tb_detector_lib::ml::{train_model, TrainingOptions};
use tb_detector_lib::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "train_model", version, about = "Train the tuberculosis X-ray classifier")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, env = "TB_CONFIG", default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    /// Training split root
    #[arg(long)]
    train_dir: Option<String>,

    /// Validation split root
    #[arg(long)]
    validation_dir: Option<String>,

    /// Artifact to write
    #[arg(short, long)]
    output: Option<String>,

    /// ImageNet MobileNetV2 checkpoint (torchvision .pth)
    #[arg(long)]
    backbone_weights: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Compute device: cpu or wgpu
    #[arg(long, env = "TB_DEVICE")]
    device: Option<DeviceType>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(dir) = self.train_dir {
            config.training.train_dir = dir;
        }
        if let Some(dir) = self.validation_dir {
            config.training.validation_dir = dir;
        }
        if let Some(output) = self.output {
            config.model.artifact_path = output;
        }
        if let Some(weights) = self.backbone_weights {
            config.model.backbone_weights = Some(weights);
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
        if let Some(device) = self.device {
            config.device_type = device;
        }
    }
}

fn run<B: AutodiffBackend>(options: &TrainingOptions, device: B::Device) -> Result<()> {
    let report = train_model::<B>(options, device)?;
    if let Some(last) = report.history.last() {
        tracing::info!(
            "Finished: val_loss {:.4}, val_accuracy {:.4}, artifact {}",
            last.val_loss,
            last.val_accuracy,
            report.artifact_path.display()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config);
    args.apply(&mut config);
    config.log_summary();

    let options = TrainingOptions::from_config(&config);
    match config.device_type {
        DeviceType::Cpu => run::<Autodiff<burn_ndarray::NdArray<f32>>>(&options, Default::default()),
        #[cfg(feature = "gpu")]
        DeviceType::Wgpu => run::<Autodiff<burn_wgpu::Wgpu>>(&options, Default::default()),
        #[cfg(not(feature = "gpu"))]
        DeviceType::Wgpu => {
            anyhow::bail!("this build has no GPU support, rebuild with `--features gpu`")
        }
    }
}
