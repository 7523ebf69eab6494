//! Picks the meter for the current host.
//!
//! macOS only ever gets powermetrics. Linux tries NVML, then rocm-smi, then
//! RAPL and takes the first backend whose probe succeeds. Anything else is
//! refused up front.

use crate::collectors::{NvidiaGpu, Powermetrics, Rapl, RocmSmi};
use crate::config::MeterConfig;
use crate::energy_meter::{EnergyMeter, MeterKind};
use crate::utils::errors::MeterError;
use itertools::Itertools;
use log::{debug, info};
use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
    Other(String),
}

impl Platform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            other => Platform::Other(other.to_string()),
        }
    }
}

/// Backends to probe on `platform`, highest priority first.
pub fn candidates(platform: &Platform, config: &MeterConfig) -> Result<Vec<Box<dyn EnergyMeter>>, MeterError> {
    let meters: Vec<Box<dyn EnergyMeter>> = match platform {
        Platform::MacOs => vec![Box::new(Powermetrics::new(config)?)],
        Platform::Linux => vec![
            Box::new(NvidiaGpu::new(config)?),
            Box::new(RocmSmi::new(config)?),
            Box::new(Rapl::new(config)?),
        ],
        Platform::Other(_) => Vec::new(),
    };
    Ok(meters)
}

/// Return the first available meter among `candidates`, in order.
pub fn select_from(
    platform: &Platform,
    candidates: Vec<Box<dyn EnergyMeter>>,
) -> Result<Box<dyn EnergyMeter>, MeterError> {
    if let Platform::Other(os) = platform {
        return Err(MeterError::Unavailable(format!(
            "No energy meter available for platform: {} ({}). Supported backends: {}. \
             Supported platforms: macOS, Linux.",
            os,
            host_description(),
            MeterKind::ALL.iter().join(", ")
        )));
    }

    let attempted = candidates.iter().map(|meter| meter.kind()).collect::<Vec<_>>();
    for meter in candidates {
        if meter.is_available() {
            info!("Selected energy meter: {}", meter.kind());
            return Ok(meter);
        }
        debug!("Energy meter not available: {}", meter.kind());
    }

    Err(MeterError::Unavailable(format!(
        "No energy meter available on this {} system. Tried: {}. \
         Please check that appropriate drivers and tools are installed.",
        match platform {
            Platform::MacOs => "macOS",
            _ => "Linux",
        },
        attempted.iter().join(", ")
    )))
}

/// Probe the backends for the current host and return the first usable one.
pub fn select_meter(config: &MeterConfig) -> Result<Box<dyn EnergyMeter>, MeterError> {
    let platform = Platform::current();
    debug!("Selecting energy meter on {:?} ({})", platform, host_description());
    select_from(&platform, candidates(&platform, config)?)
}

fn host_description() -> String {
    System::long_os_version()
        .or_else(System::name)
        .unwrap_or_else(|| "unknown OS".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy_meter::EnergyResult;
    use async_trait::async_trait;

    /// Stand-in backend with a fixed probe result.
    struct StubMeter {
        kind: MeterKind,
        available: bool,
    }

    fn stub(kind: MeterKind, available: bool) -> Box<dyn EnergyMeter> {
        Box::new(StubMeter { kind, available })
    }

    #[async_trait]
    impl EnergyMeter for StubMeter {
        fn kind(&self) -> MeterKind {
            self.kind
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn start(&mut self) -> Result<(), MeterError> {
            Ok(())
        }

        async fn stop(&mut self) -> Result<EnergyResult, MeterError> {
            Ok(EnergyResult::new(0.0, 0.0, 100))
        }
    }

    #[test]
    fn test_platform_from_os() {
        assert_eq!(Platform::from_os("macos"), Platform::MacOs);
        assert_eq!(Platform::from_os("linux"), Platform::Linux);
        assert_eq!(Platform::from_os("windows"), Platform::Other("windows".to_string()));
    }

    #[test]
    fn test_library_beats_cli_on_linux() {
        let selected = select_from(
            &Platform::Linux,
            vec![
                stub(MeterKind::NvidiaGpu, true),
                stub(MeterKind::RocmSmi, true),
                stub(MeterKind::Rapl, true),
            ],
        )
        .unwrap();
        assert_eq!(selected.kind(), MeterKind::NvidiaGpu);
    }

    #[test]
    fn test_falls_through_to_counter() {
        let selected = select_from(
            &Platform::Linux,
            vec![
                stub(MeterKind::NvidiaGpu, false),
                stub(MeterKind::RocmSmi, false),
                stub(MeterKind::Rapl, true),
            ],
        )
        .unwrap();
        assert_eq!(selected.kind(), MeterKind::Rapl);
    }

    #[test]
    fn test_linux_none_available_names_all_three() {
        let result = select_from(
            &Platform::Linux,
            vec![
                stub(MeterKind::NvidiaGpu, false),
                stub(MeterKind::RocmSmi, false),
                stub(MeterKind::Rapl, false),
            ],
        );
        match result {
            Err(MeterError::Unavailable(msg)) => {
                assert!(msg.contains("NVML"));
                assert!(msg.contains("rocm-smi"));
                assert!(msg.contains("RAPL"));
                assert!(msg.contains("drivers"));
            }
            _ => panic!("Expected Unavailable"),
        }
    }

    #[test]
    fn test_other_platform_is_refused() {
        let result = select_from(
            &Platform::Other("windows".to_string()),
            vec![stub(MeterKind::Rapl, true)],
        );
        match result {
            Err(MeterError::Unavailable(msg)) => {
                assert!(msg.contains("windows"));
                assert!(msg.contains("powermetrics"));
                assert!(msg.contains("RAPL"));
            }
            _ => panic!("Expected Unavailable"),
        }
    }

    #[test]
    fn test_candidate_order() {
        let config = MeterConfig::default();
        let linux: Vec<MeterKind> = candidates(&Platform::Linux, &config)
            .unwrap()
            .iter()
            .map(|m| m.kind())
            .collect();
        assert_eq!(linux, vec![MeterKind::NvidiaGpu, MeterKind::RocmSmi, MeterKind::Rapl]);

        let macos: Vec<MeterKind> = candidates(&Platform::MacOs, &config)
            .unwrap()
            .iter()
            .map(|m| m.kind())
            .collect();
        assert_eq!(macos, vec![MeterKind::Powermetrics]);

        assert!(candidates(&Platform::Other("freebsd".into()), &config).unwrap().is_empty());
    }

    #[test]
    fn test_zero_interval_builds_no_candidates() {
        let config = MeterConfig::default().with_sampling_ms(0);
        for platform in [Platform::Linux, Platform::MacOs] {
            assert!(matches!(candidates(&platform, &config), Err(MeterError::InvalidConfig(_))));
        }
        if matches!(Platform::current(), Platform::Linux | Platform::MacOs) {
            assert!(matches!(select_meter(&config), Err(MeterError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_probing_real_backends_never_panics() {
        let config = MeterConfig::default()
            .with_powercap_root("/nonexistent/powercap")
            .with_rocm_smi_program("/nonexistent/rocm-smi");
        for meter in candidates(&Platform::Linux, &config).unwrap() {
            let _ = meter.is_available();
        }
        let _ = select_meter(&config);
    }
}
