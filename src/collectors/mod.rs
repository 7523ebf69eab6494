pub mod nvidia_gpu;
pub mod powermetrics;
pub mod rapl;
pub mod rocm_smi;

pub use nvidia_gpu::NvidiaGpu;
pub use powermetrics::Powermetrics;
pub use rapl::Rapl;
pub use rocm_smi::RocmSmi;
