pub mod utils {
    pub mod errors;
    pub mod logger;
    pub mod process;
}

// Metering backends
pub mod collectors;
pub mod config;
pub mod energy_meter;
pub mod integrator;
pub mod platform;
pub mod sampler;

pub use config::MeterConfig;
pub use energy_meter::{EnergyMeter, EnergyResult, MeasurementWindow, MeterKind};
pub use platform::{Platform, select_meter};
pub use utils::errors::{MeterError, SampleLoss};
