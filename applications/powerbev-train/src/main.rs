use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use burn::backend::{
    ndarray::NdArrayDevice,
    wgpu::{Wgpu, WgpuDevice},
    Autodiff, NdArray,
};
use clap::Parser;
use powerbev::{config, train};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::device::Dispatch;

mod cli;
mod device;


fn main() -> anyhow::Result<()> {
    type CpuBackend = Autodiff<NdArray<f32>>;
    type GpuBackend = Autodiff<Wgpu>;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cmd = cli::Cli::parse();
    let config = config::load(&cmd.config_args())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, finishing the current step");
        flag.store(true, Ordering::SeqCst);
    })?;

    let dispatch =
        device::resolve_accelerator(config.accelerator, &config.gpus, device::wgpu_adapter_available);
    let summary = match dispatch {
        Dispatch::Cpu => train::<CpuBackend>(&config, vec![NdArrayDevice::Cpu], shutdown)?,
        Dispatch::Gpu(indices) => {
            let devices = indices.into_iter().map(WgpuDevice::DiscreteGpu).collect();
            train::<GpuBackend>(&config, devices, shutdown)?
        }
        Dispatch::BestAvailableGpu => {
            train::<GpuBackend>(&config, vec![WgpuDevice::BestAvailable], shutdown)?
        }
    };

    info!(
        run_dir = %summary.run_dir.display(),
        interrupted = summary.interrupted,
        "finished"
    );
    for (rank, kept) in summary.retained.iter().enumerate() {
        info!("#{} epoch {} {} = {:.4}", rank + 1, kept.epoch, config.checkpoint.monitor, kept.value);
    }

    Ok(())
}
