use crate::config::MeterConfig;
use crate::energy_meter::{EnergyMeter, EnergyResult, Lifecycle, MeterKind};
use crate::utils::errors::MeterError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const ZONE_PREFIX: &str = "intel-rapl:";
const ENERGY_COUNTER: &str = "energy_uj";
/// Counter period assumed when a stop reading is below the start reading.
const COUNTER_WRAP_UJ: i64 = 1 << 32;
const UJ_PER_WH: f64 = 3_600_000_000.0;

/// CPU package energy from the RAPL cumulative counter.
///
/// No background work: the counter is read once at start and once at stop.
pub struct Rapl {
    powercap_root: PathBuf,
    sampling_ms: u64,
    /// First zone found exposing an energy counter
    zone: OnceLock<PathBuf>,
    start_energy_uj: i64,
    lifecycle: Lifecycle,
}

impl Rapl {
    pub fn new(config: &MeterConfig) -> Result<Self, MeterError> {
        Ok(Self {
            powercap_root: config.powercap_root.clone(),
            sampling_ms: config.sampling_interval_ms()?,
            zone: OnceLock::new(),
            start_energy_uj: 0,
            lifecycle: Lifecycle::default(),
        })
    }

    pub fn zone(&self) -> Option<&Path> {
        self.zone.get().map(PathBuf::as_path)
    }

    fn counter_path(&self) -> Option<PathBuf> {
        self.zone().map(|zone| zone.join(ENERGY_COUNTER))
    }

    fn read_energy_uj(&self) -> Result<i64, MeterError> {
        let path = self
            .counter_path()
            .ok_or_else(|| MeterError::InvalidState("RAPL zone not initialized".to_string()))?;
        let raw = std::fs::read_to_string(&path).map_err(|e| counter_error(&path, e))?;
        raw.trim().parse::<i64>().map_err(|e| {
            MeterError::AcquisitionFailure(format!(
                "Failed to parse RAPL energy counter {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Scan the powercap root for the first `intel-rapl:*` zone that has an
/// energy counter. Zones are visited in name order.
fn find_zone(powercap_root: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(powercap_root).ok()?;
    let mut zones: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(ZONE_PREFIX))
        .map(|entry| entry.path())
        .collect();
    zones.sort();
    zones.into_iter().find(|zone| zone.join(ENERGY_COUNTER).exists())
}

fn counter_error(path: &Path, err: std::io::Error) -> MeterError {
    if err.kind() == ErrorKind::PermissionDenied {
        MeterError::PermissionDenied(format!(
            "Permission denied reading {}. Please run with sudo or check permissions.",
            path.display()
        ))
    } else {
        MeterError::AcquisitionFailure(format!(
            "Failed to read RAPL energy counter {}: {}",
            path.display(),
            err
        ))
    }
}

/// Energy between two counter readings, correcting a single wraparound.
pub fn counter_delta_wh(start_uj: i64, stop_uj: i64) -> f64 {
    let mut diff_uj = stop_uj - start_uj;
    if diff_uj < 0 {
        warn!(
            "RAPL counter wrapped ({} -> {} uJ), assuming a single wrap",
            start_uj, stop_uj
        );
        diff_uj += COUNTER_WRAP_UJ;
    }
    diff_uj as f64 / UJ_PER_WH
}

#[async_trait]
impl EnergyMeter for Rapl {
    fn kind(&self) -> MeterKind {
        MeterKind::Rapl
    }

    fn is_available(&self) -> bool {
        if self.zone.get().is_some() {
            return true;
        }
        match find_zone(&self.powercap_root) {
            Some(zone) => {
                debug!("RAPL zone found at {}", zone.display());
                let _ = self.zone.set(zone);
                true
            }
            None => false,
        }
    }

    async fn start(&mut self) -> Result<(), MeterError> {
        self.lifecycle.ensure_idle(self.kind())?;

        if !self.is_available() {
            self.lifecycle.abort();
            return Err(MeterError::Unavailable(format!(
                "RAPL interface not found under {}. Ensure you're on a Linux system with an Intel/AMD CPU.",
                self.powercap_root.display()
            )));
        }

        // Unreadable counters must surface as a permission problem.
        if let Some(path) = self.counter_path() {
            if let Err(e) = std::fs::File::open(&path).and_then(|mut f| f.read(&mut [0u8; 1])) {
                self.lifecycle.abort();
                return Err(counter_error(&path, e));
            }
        }

        self.lifecycle.begin(self.kind())?;
        match self.read_energy_uj() {
            Ok(energy_uj) => self.start_energy_uj = energy_uj,
            Err(e) => {
                self.lifecycle.abort();
                return Err(e);
            }
        }

        info!(
            "RAPL measurement started from {} at {} uJ",
            self.zone().map(|z| z.display().to_string()).unwrap_or_default(),
            self.start_energy_uj
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<EnergyResult, MeterError> {
        let window = self.lifecycle.finish(self.kind())?;
        let duration_s = window.elapsed_s();
        let stop_energy_uj = self.read_energy_uj()?;

        let energy_wh = counter_delta_wh(self.start_energy_uj, stop_energy_uj);
        info!(
            "RAPL measurement stopped: {:.6} Wh over {:.3} s from {}",
            energy_wh,
            duration_s,
            window.started_at()
        );

        Ok(EnergyResult::new(energy_wh, duration_s, self.sampling_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_powercap(zones: &[(&str, Option<&str>)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, counter) in zones {
            let zone = dir.path().join(name);
            fs::create_dir_all(&zone).unwrap();
            if let Some(value) = counter {
                fs::write(zone.join(ENERGY_COUNTER), value).unwrap();
            }
        }
        dir
    }

    fn meter_for(dir: &TempDir) -> Rapl {
        Rapl::new(&MeterConfig::default().with_powercap_root(dir.path())).unwrap()
    }

    #[test]
    fn test_wraparound_single_wrap() {
        let energy = counter_delta_wh(4_000_000_000, 1_000_000_000);
        assert!((energy - 1_294_967_296.0 / 3.6e9).abs() < 1e-12);
        assert!((energy - 0.359713).abs() < 1e-6);
    }

    #[test]
    fn test_plain_delta() {
        assert!((counter_delta_wh(1_000, 3_600_001_000) - 1.0).abs() < 1e-12);
        assert_eq!(counter_delta_wh(5, 5), 0.0);
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let rapl = Rapl::new(&MeterConfig::default().with_powercap_root("/nonexistent/powercap")).unwrap();
        assert!(!rapl.is_available());
    }

    #[test]
    fn test_zone_without_counter_is_skipped() {
        let dir = fake_powercap(&[("intel-rapl:0", None), ("intel-rapl:1", Some("10")), ("other:0", Some("1"))]);
        let rapl = meter_for(&dir);
        assert!(rapl.is_available());
        assert_eq!(rapl.zone().unwrap(), dir.path().join("intel-rapl:1"));
    }

    #[tokio::test]
    async fn test_measure_with_wraparound() {
        let dir = fake_powercap(&[("intel-rapl:0", Some("4000000000\n"))]);
        let mut rapl = meter_for(&dir);
        assert!(rapl.is_available());

        rapl.start().await.unwrap();
        fs::write(dir.path().join("intel-rapl:0").join(ENERGY_COUNTER), "1000000000\n").unwrap();
        let result = rapl.stop().await.unwrap();

        assert!((result.energy_wh_raw - 0.359713).abs() < 1e-6);
        assert!(result.duration_s >= 0.0);
        assert_eq!(result.sampling_ms, 100);
    }

    #[test]
    fn test_zero_interval_rejected_at_construction() {
        let dir = fake_powercap(&[("intel-rapl:0", Some("1"))]);
        let config = MeterConfig::default()
            .with_powercap_root(dir.path())
            .with_sampling_ms(0);
        assert!(matches!(Rapl::new(&config), Err(MeterError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_without_zone_is_unavailable() {
        let dir = fake_powercap(&[]);
        let mut rapl = meter_for(&dir);
        assert!(matches!(rapl.start().await, Err(MeterError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let dir = fake_powercap(&[("intel-rapl:0", Some("1"))]);
        let mut rapl = meter_for(&dir);
        assert!(matches!(rapl.stop().await, Err(MeterError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = fake_powercap(&[("intel-rapl:0", Some("1"))]);
        let mut rapl = meter_for(&dir);
        rapl.start().await.unwrap();
        assert!(matches!(rapl.start().await, Err(MeterError::InvalidState(_))));
        assert!(rapl.stop().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_counter_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        // root bypasses file modes, so the check cannot be provoked
        if users::get_effective_uid() == 0 {
            return;
        }

        let dir = fake_powercap(&[("intel-rapl:0", Some("12345"))]);
        let counter = dir.path().join("intel-rapl:0").join(ENERGY_COUNTER);
        fs::set_permissions(&counter, fs::Permissions::from_mode(0o000)).unwrap();

        let mut rapl = meter_for(&dir);
        assert!(rapl.is_available());
        match rapl.start().await {
            Err(MeterError::PermissionDenied(msg)) => assert!(msg.contains("energy_uj")),
            other => panic!("Expected PermissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_permission_error_mapping() {
        let path = Path::new("/sys/class/powercap/intel-rapl:0/energy_uj");
        let denied = counter_error(path, std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(matches!(denied, MeterError::PermissionDenied(_)));
        let missing = counter_error(path, std::io::Error::from(ErrorKind::NotFound));
        assert!(matches!(missing, MeterError::AcquisitionFailure(_)));
    }
}
