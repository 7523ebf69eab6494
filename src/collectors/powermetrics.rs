use crate::config::MeterConfig;
use crate::energy_meter::{EnergyMeter, EnergyResult, Lifecycle, MeterKind};
use crate::integrator::{milliwatts_to_watts, trapezoidal_wh};
use crate::sampler::BackgroundSampler;
use crate::utils::errors::MeterError;
use crate::utils::process::terminate_gracefully;
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;

/// Time given to powermetrics to emit its first sample after spawning.
const WARMUP: Duration = Duration::from_millis(300);
/// Lower bound on the pause before stopping, so a trailing sample lands.
const MIN_TRAILING_PAUSE: Duration = Duration::from_millis(150);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

static COMBINED_POWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Combined Power \(CPU \+ GPU \+ ANE\):\s+([\d.]+)\s+mW").expect("Invalid regex pattern")
});

/// Partial figures, used only when a line has no combined figure.
static FRAGMENT_POWER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"CPU Power:\s+([\d.]+)\s+mW",
        r"GPU Power:\s+([\d.]+)\s+mW",
        r"Package Power:\s+([\d.]+)\s+mW",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("Invalid regex pattern"))
    .collect()
});

/// System power on macOS from a long-running `powermetrics` process.
pub struct Powermetrics {
    program: PathBuf,
    sampling_ms: u64,
    escalate_privileges: bool,
    child: Option<Child>,
    reader: Option<BackgroundSampler<String>>,
    lifecycle: Lifecycle,
}

impl Powermetrics {
    pub fn new(config: &MeterConfig) -> Result<Self, MeterError> {
        Ok(Self {
            program: config.powermetrics_program.clone(),
            sampling_ms: config.sampling_interval_ms()?,
            escalate_privileges: config.escalate_privileges,
            child: None,
            reader: None,
            lifecycle: Lifecycle::default(),
        })
    }

    /// A path rather than a bare command name was configured.
    fn has_explicit_program(&self) -> bool {
        self.program.components().count() > 1
    }

    /// powermetrics needs root; go through `sudo -n` unless we already are.
    fn needs_sudo(&self) -> bool {
        self.escalate_privileges && users::get_effective_uid() != 0
    }

    fn command(&self) -> Command {
        let args = [
            "-i".to_string(),
            self.sampling_ms.to_string(),
            "--samplers".to_string(),
            "cpu_power".to_string(),
        ];
        let mut command = if self.needs_sudo() {
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg(&self.program);
            sudo
        } else {
            Command::new(&self.program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: std::io::Error) -> MeterError {
        match err.kind() {
            ErrorKind::NotFound => MeterError::AcquisitionFailure(format!(
                "{} command not found. Is this macOS?",
                self.program.display()
            )),
            ErrorKind::PermissionDenied => MeterError::PermissionDenied(format!(
                "Not allowed to run {}: {}",
                self.program.display(),
                err
            )),
            _ => MeterError::AcquisitionFailure(format!("Failed to start powermetrics: {}", err)),
        }
    }

    /// Reap the child after spawning if it already exited, classifying why.
    async fn check_early_exit(child: &mut Child) -> Result<(), MeterError> {
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return Ok(()),
            Err(e) => return Err(MeterError::AcquisitionFailure(format!("Failed to poll powermetrics: {}", e))),
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        Err(classify_exit(&format!("powermetrics exited with {}", status), &stderr))
    }

    async fn teardown(&mut self) -> Vec<String> {
        if let Some(mut child) = self.child.take() {
            terminate_gracefully(&mut child, TERMINATE_GRACE).await;
        }
        match self.reader.take() {
            Some(mut reader) => reader.shutdown(READER_JOIN_TIMEOUT).await,
            None => Vec::new(),
        }
    }
}

fn classify_exit(context: &str, stderr: &str) -> MeterError {
    let lowered = stderr.to_lowercase();
    let detail = stderr.trim();
    if lowered.contains("superuser") || lowered.contains("password") || lowered.contains("not permitted") {
        MeterError::PermissionDenied(format!("{}: {}. Please run with sudo.", context, detail))
    } else {
        MeterError::AcquisitionFailure(format!("{}: {}", context, detail))
    }
}

/// Forward stdout lines until EOF or until the stop flag clears.
async fn read_lines(stdout: ChildStdout, tx: mpsc::UnboundedSender<String>, is_running: Arc<AtomicBool>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut count = 0usize;
    while is_running.load(Ordering::Relaxed) {
        match lines.next_line().await {
            Ok(Some(line)) => {
                count += 1;
                if tx.send(line.trim().to_string()).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading powermetrics output: {}", e);
                break;
            }
        }
    }
    debug!("powermetrics reader stopped after {} lines", count);
}

/// Power figure of one line in milliwatts. A combined CPU+GPU+ANE figure wins
/// over any partial figure on the same line.
pub fn parse_line_mw(line: &str) -> Option<f64> {
    let capture = |pattern: &Regex| {
        pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };
    capture(&*COMBINED_POWER).or_else(|| FRAGMENT_POWER.iter().find_map(capture))
}

pub fn parse_power_samples(lines: &[String]) -> Vec<f64> {
    lines.iter().filter_map(|line| parse_line_mw(line)).collect()
}

/// Energy of a milliwatt trace. A single sample is taken as the average power
/// over the whole window; no samples means no energy.
pub fn energy_from_samples(samples_mw: &[f64], duration_s: f64, sampling_ms: u64) -> f64 {
    match samples_mw {
        [] => 0.0,
        [only_mw] => only_mw / 1000.0 * (duration_s / 3600.0),
        _ => trapezoidal_wh(&milliwatts_to_watts(samples_mw), sampling_ms),
    }
}

#[async_trait]
impl EnergyMeter for Powermetrics {
    fn kind(&self) -> MeterKind {
        MeterKind::Powermetrics
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "macos")
    }

    async fn start(&mut self) -> Result<(), MeterError> {
        self.lifecycle.ensure_idle(self.kind())?;

        if !self.is_available() && !self.has_explicit_program() {
            self.lifecycle.abort();
            return Err(MeterError::Unavailable(format!(
                "{} is only available on macOS",
                self.program.display()
            )));
        }

        self.lifecycle.begin(self.kind())?;

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle.abort();
                return Err(self.spawn_error(e));
            }
        };
        let Some(stdout) = child.stdout.take() else {
            self.lifecycle.abort();
            return Err(MeterError::AcquisitionFailure("powermetrics stdout was not captured".to_string()));
        };

        self.reader = Some(BackgroundSampler::commence(move |tx, is_running| {
            read_lines(stdout, tx, is_running)
        }));
        self.child = Some(child);

        tokio::time::sleep(WARMUP).await;

        let early_exit = match self.child.as_mut() {
            Some(child) => Self::check_early_exit(child).await,
            None => Ok(()),
        };
        if let Err(e) = early_exit {
            self.teardown().await;
            self.lifecycle.abort();
            return Err(e);
        }

        info!(
            "powermetrics measurement started at {} ms{}",
            self.sampling_ms,
            if self.needs_sudo() { " via sudo" } else { "" }
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<EnergyResult, MeterError> {
        if !matches!(self.lifecycle, Lifecycle::Measuring(_)) {
            return Err(MeterError::InvalidState(format!(
                "{} meter was stopped without being started",
                self.kind()
            )));
        }

        tokio::time::sleep(MIN_TRAILING_PAUSE.max(Duration::from_millis(self.sampling_ms))).await;

        let window = self.lifecycle.finish(self.kind())?;
        let duration_s = window.elapsed_s();
        if let Some(reader) = self.reader.as_ref() {
            reader.signal_stop();
        }
        let lines = self.teardown().await;

        let samples_mw = parse_power_samples(&lines);
        let energy_wh = energy_from_samples(&samples_mw, duration_s, self.sampling_ms);
        if samples_mw.len() < 2 {
            warn!(
                "powermetrics produced {} sample(s) in {:.3} s, energy is an estimate",
                samples_mw.len(),
                duration_s
            );
        }

        info!(
            "powermetrics measurement stopped: {:.6} Wh over {:.3} s from {} ({} samples from {} lines)",
            energy_wh,
            duration_s,
            window.started_at(),
            samples_mw.len(),
            lines.len()
        );
        Ok(EnergyResult::new(energy_wh, duration_s, self.sampling_ms))
    }
}
