use crate::config::MeterConfig;
use crate::energy_meter::{EnergyMeter, EnergyResult, Lifecycle, MeterKind};
use crate::integrator::{milliwatts_to_watts, trapezoidal_wh};
use crate::sampler::{BackgroundSampler, POLLING_JOIN_TIMEOUT, PowerReading, SampleBatch, run_polling_loop};
use crate::utils::errors::{MeterError, SampleLoss};
use async_trait::async_trait;
use log::{debug, info};
use nvml_wrapper::Nvml;
use std::sync::Arc;
use std::time::Duration;

/// NVIDIA GPU board power polled through NVML.
pub struct NvidiaGpu {
    device_index: u32,
    sampling_ms: u64,
    /// Live NVML session; the library shuts down when the last clone drops
    nvml: Option<Arc<Nvml>>,
    sampler: Option<BackgroundSampler<PowerReading>>,
    lost_samples: usize,
    lifecycle: Lifecycle,
}

impl NvidiaGpu {
    pub fn new(config: &MeterConfig) -> Result<Self, MeterError> {
        Ok(Self {
            device_index: config.device_index,
            sampling_ms: config.sampling_interval_ms()?,
            nvml: None,
            sampler: None,
            lost_samples: 0,
            lifecycle: Lifecycle::default(),
        })
    }

    /// Poll iterations of the last window that produced no reading
    pub fn lost_samples(&self) -> usize {
        self.lost_samples
    }

    fn open_session(&self) -> Result<Arc<Nvml>, MeterError> {
        let nvml = Nvml::init()
            .map_err(|e| MeterError::AcquisitionFailure(format!("Failed to initialize NVML: {}", e)))?;
        nvml.device_by_index(self.device_index).map_err(|e| {
            MeterError::AcquisitionFailure(format!(
                "Failed to acquire NVIDIA GPU {}: {}",
                self.device_index, e
            ))
        })?;
        Ok(Arc::new(nvml))
    }
}

/// Instantaneous board power of one device, in milliwatts.
fn read_power_mw(nvml: &Nvml, device_index: u32) -> PowerReading {
    nvml.device_by_index(device_index)
        .and_then(|device| device.power_usage())
        .map(f64::from)
        .map_err(|e| SampleLoss(format!("NVML power read failed: {}", e)))
}

/// Energy of a milliwatt trace; no single-sample estimate for this backend.
pub fn energy_from_milliwatts(samples_mw: &[f64], sampling_ms: u64) -> f64 {
    if samples_mw.len() < 2 {
        return 0.0;
    }
    trapezoidal_wh(&milliwatts_to_watts(samples_mw), sampling_ms)
}

#[async_trait]
impl EnergyMeter for NvidiaGpu {
    fn kind(&self) -> MeterKind {
        MeterKind::NvidiaGpu
    }

    fn is_available(&self) -> bool {
        // The probe session shuts NVML down again when dropped.
        match Nvml::init() {
            Ok(nvml) => match nvml.device_count() {
                Ok(count) => count > 0,
                Err(e) => {
                    debug!("NVML device count failed: {}", e);
                    false
                }
            },
            Err(e) => {
                debug!("NVML not available: {}", e);
                false
            }
        }
    }

    async fn start(&mut self) -> Result<(), MeterError> {
        self.lifecycle.ensure_idle(self.kind())?;

        let nvml = match self.open_session() {
            Ok(nvml) => nvml,
            Err(e) => {
                self.lifecycle.abort();
                return Err(e);
            }
        };

        self.lifecycle.begin(self.kind())?;
        self.lost_samples = 0;

        let device_index = self.device_index;
        let interval = Duration::from_millis(self.sampling_ms);
        let poll_nvml = Arc::clone(&nvml);
        self.sampler = Some(BackgroundSampler::commence(move |tx, is_running| {
            run_polling_loop(
                move || {
                    let reading = read_power_mw(&poll_nvml, device_index);
                    async move { reading }
                },
                tx,
                is_running,
                interval,
            )
        }));
        self.nvml = Some(nvml);

        info!(
            "NVML measurement started on GPU {} at {} ms",
            self.device_index, self.sampling_ms
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<EnergyResult, MeterError> {
        let window = self.lifecycle.finish(self.kind())?;
        let duration_s = window.elapsed_s();

        let readings = match self.sampler.take() {
            Some(mut sampler) => sampler.shutdown(POLLING_JOIN_TIMEOUT).await,
            None => Vec::new(),
        };
        // Last reference; dropping it shuts NVML down.
        self.nvml = None;

        let batch = SampleBatch::from_readings(readings);
        self.lost_samples = batch.lost;
        let energy_wh = energy_from_milliwatts(&batch.samples, self.sampling_ms);

        info!(
            "NVML measurement stopped: {:.6} Wh over {:.3} s from {} ({} samples, {} lost)",
            energy_wh,
            duration_s,
            window.started_at(),
            batch.samples.len(),
            batch.lost
        );
        Ok(EnergyResult::new(energy_wh, duration_s, self.sampling_ms))
    }
}
