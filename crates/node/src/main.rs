mod calibration;
mod clock;
mod config;
mod controller;
mod display;
mod payload;
mod reading;
mod retry;
mod sensors;
mod transport;
mod validate;

use std::{env, time::Duration};

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Config, SensorDriver};
use controller::{Context, Controller};
use display::Display;
use retry::retry;
use sensors::{Acquisition, Adc, AirProbe};
use transport::{HttpTransport, LinkSession};

type SensorPair = (Box<dyn Adc + Send>, Box<dyn AirProbe + Send>);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        sensor_id = %cfg.sensor_id,
        interval_sec = cfg.sample_interval_sec,
        sleep_mode = ?cfg.sleep_mode,
        "config loaded"
    );

    // ── Sensors (fail-stop) ─────────────────────────────────────────
    let (adc, air) = {
        let cfg = &cfg;
        retry("sensor init", &cfg.sensors.init_retry, || async move {
            open_sensors(cfg)
        })
        .await?
    };
    let sensors = Acquisition::new(adc, air, cfg.channels(), cfg.calibration()?);

    // ── HTTP client (fail-stop) ─────────────────────────────────────
    let tls = cfg.tls_mode()?;
    let timeout = Duration::from_millis(cfg.transport.timeout_ms);
    let transport = {
        let tls = &tls;
        retry("http client init", &cfg.transport.init_retry, || async move {
            HttpTransport::new(tls, timeout)
        })
        .await?
    };

    let session = LinkSession::new(
        cfg.network.probe.clone(),
        Duration::from_millis(cfg.network.probe_timeout_ms),
    );
    let endpoints = cfg.endpoints()?;
    info!(
        backends = ?endpoints.iter().map(|e| e.destination.to_string()).collect::<Vec<_>>(),
        display = ?cfg.display.kind,
        "node ready"
    );

    let ctx = Context {
        sensors,
        session,
        clock: cfg.time_source(),
        transport,
        display: Display::new(cfg.display.kind),
        endpoints,
    };
    Controller::new(ctx, cfg.settings()).run().await
}

fn open_sensors(cfg: &Config) -> Result<SensorPair> {
    match cfg.sensors.driver {
        SensorDriver::Sim => open_sim(cfg),
        SensorDriver::Hw => open_hw(cfg),
    }
}

#[cfg(feature = "sim")]
fn open_sim(cfg: &Config) -> Result<SensorPair> {
    use sensors::sim::SimBoard;

    let scenario = cfg.sensors.sim_scenario;
    let c = &cfg.sensors.calibration;
    let board = SimBoard::new(
        scenario,
        cfg.channels(),
        c.air_value as f64,
        c.water_value as f64,
        cfg.sensors.sim_day_length_samples,
    );
    info!(?scenario, "using simulated sensors");
    let (adc, air) = board.split();
    let adc: Box<dyn Adc + Send> = Box::new(adc);
    let air: Box<dyn AirProbe + Send> = Box::new(air);
    Ok((adc, air))
}

#[cfg(not(feature = "sim"))]
fn open_sim(_cfg: &Config) -> Result<SensorPair> {
    anyhow::bail!("sensors.driver is \"sim\" but this build lacks the `sim` feature");
}

#[cfg(feature = "hw")]
fn open_hw(cfg: &Config) -> Result<SensorPair> {
    use anyhow::Context as _;
    use sensors::{ads1115::Ads1115, sht20::Sht20};

    let adc: Box<dyn Adc + Send> =
        Box::new(Ads1115::open(cfg.sensors.adc_address).context("ads1115 init")?);
    let air: Box<dyn AirProbe + Send> = Box::new(Sht20::open().context("sht20 init")?);
    Ok((adc, air))
}

#[cfg(not(feature = "hw"))]
fn open_hw(_cfg: &Config) -> Result<SensorPair> {
    anyhow::bail!("sensors.driver is \"hw\" but this build lacks the `hw` feature");
}
