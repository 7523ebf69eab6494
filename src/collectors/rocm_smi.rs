use crate::config::MeterConfig;
use crate::energy_meter::{EnergyMeter, EnergyResult, Lifecycle, MeterKind};
use crate::integrator::trapezoidal_wh;
use crate::sampler::{BackgroundSampler, POLLING_JOIN_TIMEOUT, PowerReading, SampleBatch, run_polling_loop};
use crate::utils::errors::{MeterError, SampleLoss};
use crate::utils::process::{program_exists, run_with_timeout};
use async_trait::async_trait;
use log::info;
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Tried in order against the whole rocm-smi output.
static POWER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Average Graphics Package Power:\s+([\d.]+)\s*W",
        r"Power:\s+([\d.]+)\s*W",
        r"GPU Power:\s+([\d.]+)\s*W",
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("Invalid regex pattern")
    })
    .collect()
});

/// AMD GPU power polled by running `rocm-smi` once per sample.
pub struct RocmSmi {
    program: PathBuf,
    device_index: u32,
    sampling_ms: u64,
    sampler: Option<BackgroundSampler<PowerReading>>,
    lost_samples: usize,
    lifecycle: Lifecycle,
}

impl RocmSmi {
    pub fn new(config: &MeterConfig) -> Result<Self, MeterError> {
        Ok(Self {
            program: config.rocm_smi_program.clone(),
            device_index: config.device_index,
            sampling_ms: config.sampling_interval_ms()?,
            sampler: None,
            lost_samples: 0,
            lifecycle: Lifecycle::default(),
        })
    }

    /// Poll iterations of the last window that produced no reading
    pub fn lost_samples(&self) -> usize {
        self.lost_samples
    }

    fn query_args(&self) -> Vec<String> {
        vec!["-d".to_string(), self.device_index.to_string(), "-p".to_string()]
    }
}

/// Extract a power figure in watts from rocm-smi output.
pub fn parse_power_watts(output: &str) -> Option<f64> {
    POWER_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}

async fn query_power(program: &Path, args: &[String]) -> PowerReading {
    let stdout = run_with_timeout(program, args, QUERY_TIMEOUT).await.map_err(SampleLoss)?;
    parse_power_watts(&stdout).ok_or_else(|| SampleLoss("no power figure in rocm-smi output".to_string()))
}

#[async_trait]
impl EnergyMeter for RocmSmi {
    fn kind(&self) -> MeterKind {
        MeterKind::RocmSmi
    }

    fn is_available(&self) -> bool {
        program_exists(&self.program)
    }

    async fn start(&mut self) -> Result<(), MeterError> {
        self.lifecycle.ensure_idle(self.kind())?;

        if !self.is_available() {
            self.lifecycle.abort();
            return Err(MeterError::Unavailable(format!(
                "{} command not found. Please install ROCm tools.",
                self.program.display()
            )));
        }

        self.lifecycle.begin(self.kind())?;
        self.lost_samples = 0;

        let program = Arc::new(self.program.clone());
        let args = Arc::new(self.query_args());
        let interval = Duration::from_millis(self.sampling_ms);
        self.sampler = Some(BackgroundSampler::commence(move |tx, is_running| {
            run_polling_loop(
                move || {
                    let program = Arc::clone(&program);
                    let args = Arc::clone(&args);
                    async move { query_power(&program, &args).await }
                },
                tx,
                is_running,
                interval,
            )
        }));

        info!(
            "rocm-smi measurement started on GPU {} at {} ms",
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
        let batch = SampleBatch::from_readings(readings);
        self.lost_samples = batch.lost;

        // Values are already in watts.
        let energy_wh = if batch.samples.len() < 2 {
            0.0
        } else {
            trapezoidal_wh(&batch.samples, self.sampling_ms)
        };

        info!(
            "rocm-smi measurement stopped: {:.6} Wh over {:.3} s from {} ({} samples, {} lost)",
            energy_wh,
            duration_s,
            window.started_at(),
            batch.samples.len(),
            batch.lost
        );
        Ok(EnergyResult::new(energy_wh, duration_s, self.sampling_ms))
    }
}
