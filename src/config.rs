//! Meter configuration.
//!
//! Every backend is built from a [`MeterConfig`]. The sampling interval is
//! fixed at construction and must be positive; backends that have no
//! intermediate samples still carry it so results look the same everywhere.

use crate::utils::errors::MeterError;
use std::path::PathBuf;

pub const DEFAULT_SAMPLING_MS: u64 = 100;
pub const DEFAULT_POWERCAP_ROOT: &str = "/sys/class/powercap";

const SAMPLING_INTERVAL_ENV: &str = "SAMPLING_INTERVAL_MS";
const GPU_DEVICE_INDEX_ENV: &str = "GPU_DEVICE_INDEX";

#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Sampling interval in milliseconds (default: 100)
    pub sampling_ms: u64,
    /// GPU index used by the NVML and rocm-smi backends (default: 0)
    pub device_index: u32,
    /// Root of the powercap tree holding the RAPL zones
    pub powercap_root: PathBuf,
    /// powermetrics executable
    pub powermetrics_program: PathBuf,
    /// rocm-smi executable
    pub rocm_smi_program: PathBuf,
    /// Prefix powermetrics with `sudo -n` when not already root (default: true)
    pub escalate_privileges: bool,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            sampling_ms: DEFAULT_SAMPLING_MS,
            device_index: 0,
            powercap_root: PathBuf::from(DEFAULT_POWERCAP_ROOT),
            powermetrics_program: PathBuf::from("powermetrics"),
            rocm_smi_program: PathBuf::from("rocm-smi"),
            escalate_privileges: true,
        }
    }
}

impl MeterConfig {
    pub fn new(sampling_ms: u64) -> Result<Self, MeterError> {
        Self::default().with_sampling_ms(sampling_ms).validate()
    }

    /// Build a config from the environment, falling back to defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self, MeterError> {
        let mut config = Self::default();
        if let Some(ms) = parse_env_value::<u64>(SAMPLING_INTERVAL_ENV, std::env::var(SAMPLING_INTERVAL_ENV).ok())? {
            config.sampling_ms = ms;
        }
        if let Some(index) = parse_env_value::<u32>(GPU_DEVICE_INDEX_ENV, std::env::var(GPU_DEVICE_INDEX_ENV).ok())? {
            config.device_index = index;
        }
        config.validate()
    }

    pub fn validate(self) -> Result<Self, MeterError> {
        self.sampling_interval_ms()?;
        Ok(self)
    }

    /// Sampling interval for a backend being built from this config.
    pub fn sampling_interval_ms(&self) -> Result<u64, MeterError> {
        if self.sampling_ms == 0 {
            return Err(MeterError::InvalidConfig(
                "sampling interval must be a positive number of milliseconds".to_string(),
            ));
        }
        Ok(self.sampling_ms)
    }

    pub fn with_sampling_ms(mut self, sampling_ms: u64) -> Self {
        self.sampling_ms = sampling_ms;
        self
    }

    pub fn with_device_index(mut self, device_index: u32) -> Self {
        self.device_index = device_index;
        self
    }

    pub fn with_powercap_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.powercap_root = root.into();
        self
    }

    pub fn with_powermetrics_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.powermetrics_program = program.into();
        self
    }

    pub fn with_rocm_smi_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.rocm_smi_program = program.into();
        self
    }

    pub fn with_escalate_privileges(mut self, escalate: bool) -> Self {
        self.escalate_privileges = escalate;
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>, MeterError> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| MeterError::InvalidConfig(format!("{} has invalid value '{}'", name, value))),
    }
}
