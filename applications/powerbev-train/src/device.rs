use powerbev::config::Accelerator;
use tracing::warn;

/// Backend and devices a run is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Cpu,
    /// Discrete GPU indices.
    Gpu(Vec<usize>),
    BestAvailableGpu,
}

/// Maps the configured accelerator to a dispatch. `auto` only picks the GPU
/// when an adapter exists, since the wgpu device panics otherwise.
pub fn resolve_accelerator(
    accelerator: Accelerator,
    gpus: &[usize],
    adapter_available: impl FnOnce() -> bool,
) -> Dispatch {
    match accelerator {
        Accelerator::Cpu => Dispatch::Cpu,
        Accelerator::Gpu => Dispatch::Gpu(gpus.to_vec()),
        Accelerator::Auto if adapter_available() => Dispatch::BestAvailableGpu,
        Accelerator::Auto => {
            warn!("no GPU adapter found, training on the CPU");
            Dispatch::Cpu
        }
    }
}

pub fn wgpu_adapter_available() -> bool {
    !wgpu::Instance::default()
        .enumerate_adapters(wgpu::Backends::all())
        .is_empty()
}
