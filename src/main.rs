use emt_meter::utils::logger::setup_logger;
use emt_meter::{EnergyMeter, MeterConfig, select_meter};
use log::{error, info};

#[tokio::main]
async fn main() {
    setup_logger();
    info!("Application started");

    let config = match MeterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let mut meter = match select_meter(&config) {
        Ok(meter) => meter,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Using {} at {} ms", meter.kind(), config.sampling_ms);

    if let Err(e) = meter.start().await {
        error!("Failed to start measurement: {}", e);
        std::process::exit(1);
    }

    // Measure a fixed window to see the meter working
    info!("Measuring for 10 seconds...");
    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;

    match meter.stop().await {
        Ok(result) => info!(
            "Energy: {:.6} Wh over {:.2} s (sampling {} ms)",
            result.energy_wh_raw, result.duration_s, result.sampling_ms
        ),
        Err(e) => {
            error!("Failed to stop measurement: {}", e);
            std::process::exit(1);
        }
    }

    info!("Program ended successfully.");
}
