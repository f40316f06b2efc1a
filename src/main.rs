//! Prediction server
//!
//! Loads the trained artifact once and serves `POST /predict`. When the
//! artifact cannot be loaded the server still starts and answers every
//! prediction with an error.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use tb_detector_lib::api::{create_router, AppState};
use tb_detector_lib::logging::init_logging;
use tb_detector_lib::ml::InferenceEngine;
use tb_detector_lib::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "tb_detector", version, about = "Tuberculosis X-ray prediction server")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, env = "TB_CONFIG", default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    /// Bind address
    #[arg(long, env = "TB_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "TB_PORT")]
    port: Option<u16>,

    /// Trained model artifact
    #[arg(short, long, env = "TB_MODEL")]
    model: Option<String>,

    /// Compute device: cpu or wgpu
    #[arg(long, env = "TB_DEVICE")]
    device: Option<DeviceType>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(model) = self.model {
            config.model.artifact_path = model;
        }
        if let Some(device) = self.device {
            config.device_type = device;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config);
    args.apply(&mut config);
    config.log_summary();

    match config.device_type {
        DeviceType::Cpu => serve::<burn_ndarray::NdArray<f32>>(&config, Default::default()).await,
        #[cfg(feature = "gpu")]
        DeviceType::Wgpu => serve::<burn_wgpu::Wgpu>(&config, Default::default()).await,
        #[cfg(not(feature = "gpu"))]
        DeviceType::Wgpu => {
            anyhow::bail!("this build has no GPU support, rebuild with `--features gpu`")
        }
    }
}

async fn serve<B: Backend>(config: &AppConfig, device: B::Device) -> Result<()> {
    let artifact = PathBuf::from(&config.model.artifact_path);
    let engine = match InferenceEngine::<B>::load(&artifact, device) {
        Ok(engine) => Some(engine),
        Err(e) => {
            error!("Failed to load model from {}: {:#}", artifact.display(), e);
            warn!("Serving without a model, /predict will return errors");
            None
        }
    };

    let app = create_router(AppState::new(engine), config.server.max_upload_bytes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
