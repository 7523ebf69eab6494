use crate::utils::errors::MeterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Instant;

/// The closed set of metering backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterKind {
    Powermetrics,
    NvidiaGpu,
    RocmSmi,
    Rapl,
}

impl MeterKind {
    pub const ALL: [MeterKind; 4] = [
        MeterKind::Powermetrics,
        MeterKind::NvidiaGpu,
        MeterKind::RocmSmi,
        MeterKind::Rapl,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            MeterKind::Powermetrics => "Apple powermetrics (macOS)",
            MeterKind::NvidiaGpu => "NVIDIA GPU (NVML)",
            MeterKind::RocmSmi => "AMD GPU (rocm-smi)",
            MeterKind::Rapl => "Intel/AMD CPU (RAPL)",
        }
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Energy consumed during one measurement window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyResult {
    /// Raw energy in watt-hours, never negative
    pub energy_wh_raw: f64,
    /// Window length in seconds
    pub duration_s: f64,
    /// Sampling interval the backend was built with
    pub sampling_ms: u64,
}

impl EnergyResult {
    pub fn new(energy_wh_raw: f64, duration_s: f64, sampling_ms: u64) -> Self {
        Self {
            energy_wh_raw: energy_wh_raw.max(0.0),
            duration_s: duration_s.max(0.0),
            sampling_ms,
        }
    }
}

/// Start of an open measurement window.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementWindow {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl MeasurementWindow {
    pub fn open() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Start/stop bookkeeping shared by every backend. An instance goes through
/// exactly one window; a failed start counts as finished.
#[derive(Debug, Default)]
pub(crate) enum Lifecycle {
    #[default]
    Idle,
    Measuring(MeasurementWindow),
    Finished,
}

impl Lifecycle {
    pub(crate) fn ensure_idle(&self, kind: MeterKind) -> Result<(), MeterError> {
        match self {
            Lifecycle::Idle => Ok(()),
            Lifecycle::Measuring(_) => Err(MeterError::InvalidState(format!(
                "{} meter is already measuring",
                kind
            ))),
            Lifecycle::Finished => Err(MeterError::InvalidState(format!(
                "{} meter has already completed its measurement window",
                kind
            ))),
        }
    }

    pub(crate) fn begin(&mut self, kind: MeterKind) -> Result<MeasurementWindow, MeterError> {
        self.ensure_idle(kind)?;
        let window = MeasurementWindow::open();
        *self = Lifecycle::Measuring(window);
        Ok(window)
    }

    /// Close the open window and hand it back.
    pub(crate) fn finish(&mut self, kind: MeterKind) -> Result<MeasurementWindow, MeterError> {
        match std::mem::replace(self, Lifecycle::Finished) {
            Lifecycle::Measuring(window) => Ok(window),
            previous => {
                *self = previous;
                Err(MeterError::InvalidState(format!(
                    "{} meter was stopped without being started",
                    kind
                )))
            }
        }
    }

    pub(crate) fn abort(&mut self) {
        *self = Lifecycle::Finished;
    }
}

#[async_trait]
pub trait EnergyMeter: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> MeterKind;

    /// Probe whether this backend can measure on the current host. Never fails.
    fn is_available(&self) -> bool;

    /// Open the measurement window
    async fn start(&mut self) -> Result<(), MeterError>;

    /// Close the window and report the energy consumed during it
    async fn stop(&mut self) -> Result<EnergyResult, MeterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_result_is_non_negative() {
        let result = EnergyResult::new(-0.5, -1.0, 100);
        assert_eq!(result.energy_wh_raw, 0.0);
        assert_eq!(result.duration_s, 0.0);
        assert_eq!(result.sampling_ms, 100);
    }

    #[test]
    fn test_lifecycle_single_window() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.begin(MeterKind::Rapl).is_ok());
        assert!(matches!(
            lifecycle.begin(MeterKind::Rapl),
            Err(MeterError::InvalidState(_))
        ));
        assert!(lifecycle.finish(MeterKind::Rapl).is_ok());
        assert!(matches!(
            lifecycle.finish(MeterKind::Rapl),
            Err(MeterError::InvalidState(_))
        ));
        assert!(matches!(
            lifecycle.begin(MeterKind::Rapl),
            Err(MeterError::InvalidState(_))
        ));
    }

    #[test]
    fn test_stop_before_start_keeps_idle() {
        let mut lifecycle = Lifecycle::default();
        assert!(matches!(
            lifecycle.finish(MeterKind::NvidiaGpu),
            Err(MeterError::InvalidState(_))
        ));
        assert!(lifecycle.begin(MeterKind::NvidiaGpu).is_ok());
    }

    #[test]
    fn test_window_elapsed_grows() {
        let window = MeasurementWindow::open();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(window.elapsed_s() >= 0.02);
        assert!(window.started_at() <= Utc::now());
    }

    #[test]
    fn test_kind_descriptions_are_distinct() {
        let mut names: Vec<&str> = MeterKind::ALL.iter().map(|k| k.description()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
    }
}
