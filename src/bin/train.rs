#![recursion_limit = "256"]
use adversarial_ae::training::{train, TrainingConfig};
use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray, WebGpu};
use burn::config::Config;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train the adversarial autoencoder and classifier")]
struct Args {
    /// JSON training config; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<String>,
    #[arg(long)]
    epochs: Option<usize>,
    /// Run on the NdArray CPU backend instead of WebGpu.
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[cfg(feature = "cuda")]
    #[arg(long, default_value_t = false)]
    cuda: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrainingConfig::new(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }

    #[cfg(feature = "cuda")]
    if args.cuda {
        use burn_cuda::{Cuda, CudaDevice};
        train::<Autodiff<Cuda<f32, i32>>>(config, CudaDevice::default())?;
        return Ok(());
    }

    if args.cpu {
        train::<Autodiff<NdArray>>(config, Default::default())?;
    } else {
        let device = burn::backend::wgpu::WgpuDevice::default();
        train::<Autodiff<WebGpu<f32, i32>>>(config, device)?;
    }
    Ok(())
}
