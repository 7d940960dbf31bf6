//! The duty cycle: connect, stamp, acquire, validate, build, send, show,
//! sleep.
//!
//! Every wake starts from the top with no state carried over from the
//! previous one.  Nothing inside a wake is fatal: each failure maps to a
//! [`CycleOutcome`] and the node goes back to sleep.

use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::clock::TimeSource;
use crate::display::Display;
use crate::payload::{build_log_stream, build_metrics, Payload};
use crate::reading::{CycleReading, DeliveryOutcome, Destination};
use crate::retry::{retry_on, Attempt, RetryPolicy};
use crate::sensors::Acquisition;
use crate::transport::{Deliver, Endpoint, NetworkSession};
use crate::validate::is_plausible;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SleepMode {
    /// Stay resident and sleep in-process between wakes.
    #[default]
    Idle,
    /// Return after one wake; an external timer restarts the process.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Payloads went out; see the per-destination outcomes for success.
    Delivered,
    /// Reading failed the plausibility gate, nothing sent.
    Rejected,
    /// Link could not be brought up.
    Offline,
    /// No wall clock available.
    NoTime,
    /// A sensor bus read failed.
    SensorFault,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub reading: Option<CycleReading>,
    pub deliveries: Vec<DeliveryOutcome>,
}

impl CycleReport {
    fn skipped(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            reading: None,
            deliveries: Vec::new(),
        }
    }
}

/// Hardware and network handles owned for the life of the process.
pub struct Context<S, D> {
    pub sensors: Acquisition,
    pub session: S,
    pub clock: TimeSource,
    pub transport: D,
    pub display: Display,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub sensor_id: String,
    pub interval_sec: u32,
    pub max_air_value: f32,
    pub connect_retry: RetryPolicy,
    pub sleep_mode: SleepMode,
}

/// Borrows the session for the reconnect loop.
struct Connect<'a, S>(&'a mut S);

impl<S: NetworkSession> Attempt for Connect<'_, S> {
    type Output = ();

    async fn attempt(&mut self, n: u32) -> Result<()> {
        info!(attempt = n, "connecting");
        self.0.connect().await
    }
}

pub struct Controller<S, D> {
    ctx: Context<S, D>,
    settings: Settings,
}

impl<S: NetworkSession, D: Deliver> Controller<S, D> {
    pub fn new(ctx: Context<S, D>, settings: Settings) -> Self {
        Self { ctx, settings }
    }

    /// Wake until told to stop (Ctrl-C) or, in exit mode, once.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let report = self.wake().await;
            info!(
                outcome = ?report.outcome,
                ts = report.reading.map(|r| r.ts),
                delivered = report.deliveries.iter().filter(|d| d.success).count(),
                "cycle finished"
            );

            if self.settings.sleep_mode == SleepMode::Exit {
                return Ok(());
            }

            let secs = self.settings.interval_sec;
            info!(seconds = secs, "sleeping");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs as u64)) => {}
                res = tokio::signal::ctrl_c() => {
                    res.context("failed to listen for ctrl-c")?;
                    info!("interrupted, shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// One pass of the duty cycle.
    pub async fn wake(&mut self) -> CycleReport {
        // -- Connecting -------------------------------------------------------
        if let Err(e) = self.ensure_connected().await {
            warn!("network unavailable, skipping cycle: {e:#}");
            return CycleReport::skipped(CycleOutcome::Offline);
        }

        // -- Cycle ------------------------------------------------------------
        let ts = match self.ctx.clock.now(&self.ctx.session).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!("no wall clock, skipping cycle: {e:#}");
                return CycleReport::skipped(CycleOutcome::NoTime);
            }
        };
        info!(ts, "time synced");

        let reading = match self.acquire(ts) {
            Ok(r) => r,
            Err(e) => {
                error!("sensor read failed, skipping cycle: {e:#}");
                return CycleReport::skipped(CycleOutcome::SensorFault);
            }
        };
        info!(
            temperature = reading.air.temperature,
            humidity = reading.air.humidity,
            dew_point = reading.air.dew_point,
            soil_raw = reading.soil.raw,
            soil_percent = reading.soil.percent,
            battery_volts = reading.power.volts,
            battery_percent = reading.power.percent,
            solar_volts = ?reading.solar_volts,
            "reading acquired"
        );

        if !is_plausible(&reading.air, self.settings.max_air_value) {
            warn!(
                max = self.settings.max_air_value,
                "implausible air sample, nothing sent"
            );
            self.show(&reading, "rejected");
            return CycleReport {
                outcome: CycleOutcome::Rejected,
                reading: Some(reading),
                deliveries: Vec::new(),
            };
        }

        let deliveries = self.deliver(&reading).await;
        let sent = deliveries.iter().filter(|d| d.success).count();
        self.show(&reading, &format!("sent {sent}/{}", deliveries.len()));

        CycleReport {
            outcome: CycleOutcome::Delivered,
            reading: Some(reading),
            deliveries,
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.ctx.session.is_connected().await {
            return Ok(());
        }
        let mut link = Connect(&mut self.ctx.session);
        retry_on("connect", &self.settings.connect_retry, &mut link).await?;
        info!("network up");
        Ok(())
    }

    fn acquire(&mut self, ts: i64) -> Result<CycleReading> {
        let sensors = &mut self.ctx.sensors;
        Ok(CycleReading {
            ts,
            air: sensors.read_air()?,
            soil: sensors.read_soil()?,
            power: sensors.read_power()?,
            solar_volts: sensors.read_solar_voltage()?,
        })
    }

    fn payload_for(&self, destination: Destination, reading: &CycleReading) -> Payload {
        let id = &self.settings.sensor_id;
        match destination {
            Destination::LogStream => build_log_stream(reading, id),
            Destination::Metrics => build_metrics(reading, id, self.settings.interval_sec),
        }
    }

    /// One send per endpoint, in order.  A failure is recorded and the next
    /// endpoint is still attempted.
    async fn deliver(&self, reading: &CycleReading) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(self.ctx.endpoints.len());
        for ep in &self.ctx.endpoints {
            let payload = self.payload_for(ep.destination, reading);
            let outcome = self.ctx.transport.send(ep, &payload).await;
            if outcome.success {
                info!(destination = %outcome.destination, status = %outcome.message, "delivered");
            } else {
                warn!(destination = %outcome.destination, error = %outcome.message, "delivery failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    fn show(&mut self, r: &CycleReading, status: &str) {
        let id = self.settings.sensor_id.as_str();
        let display = &mut self.ctx.display;
        if !display.is_present() {
            return;
        }
        display.clear();
        display.print_at(0, 0, id);
        display.print_at(0, 1, &format!("T {:.1}C H {:.0}%", r.air.temperature, r.air.humidity));
        display.print_at(0, 2, &format!("Dew {:.1}C", r.air.dew_point));
        display.print_at(0, 3, &format!("Soil {}%", r.soil.percent));
        display.print_at(0, 4, &format!("Batt {:.2}V {:.0}%", r.power.volts, r.power.percent));
        if let Some(v) = r.solar_volts {
            display.print_at(0, 5, &format!("Sun {v:.2}V"));
        }
        display.print_at(0, 6, status);
        display.print_at(0, 7, &clock_label(r.ts));
        display.render();
        display.sleep();
    }
}

/// `HH:MM UTC` for the status panel.
fn clock_label(ts: i64) -> String {
    let fmt = format_description!("[hour]:[minute] UTC");
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&fmt).ok())
        .unwrap_or_else(|| "--:-- UTC".to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::DisplayKind;
    use crate::reading::AirSample;
    use crate::sensors::tests::{test_air, test_calibration, FixedAdc, FixedAir};
    use crate::sensors::Channels;
    use crate::transport::tests::FakeSession;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const T0_MS: i64 = 1_700_000_000_000;

    /// Records every payload; answers with a failure for the listed
    /// destinations.
    #[derive(Default)]
    struct RecordingTransport {
        failing: HashSet<Destination>,
        sent: Mutex<Vec<Payload>>,
    }

    impl Deliver for RecordingTransport {
        async fn send(&self, endpoint: &Endpoint, payload: &Payload) -> DeliveryOutcome {
            self.sent.lock().unwrap().push(payload.clone());
            if self.failing.contains(&endpoint.destination) {
                DeliveryOutcome::failed(endpoint.destination, "HTTP 500: boom")
            } else {
                DeliveryOutcome::ok(endpoint.destination, "HTTP 204")
            }
        }
    }

    fn sensors(counts: &[(u8, i16)], air: AirSample) -> Acquisition {
        Acquisition::new(
            Box::new(FixedAdc(counts.iter().copied().collect())),
            Box::new(FixedAir(air)),
            Channels {
                soil: 3,
                battery: 0,
                solar: None,
            },
            test_calibration(),
        )
    }

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::log_stream("https://u:p@logs.example.net/loki/api/v1/push").unwrap(),
            Endpoint::metrics("https://metrics.example.net/metrics", "u", "p").unwrap(),
        ]
    }

    fn settings() -> Settings {
        Settings {
            sensor_id: "basil".to_string(),
            interval_sec: 300,
            max_air_value: 100.0,
            connect_retry: RetryPolicy::backoff(3, 1000, 4000),
            sleep_mode: SleepMode::Exit,
        }
    }

    fn controller(
        session: FakeSession,
        transport: RecordingTransport,
        air: AirSample,
    ) -> Controller<FakeSession, RecordingTransport> {
        Controller::new(
            Context {
                sensors: sensors(&[(3, 11390), (0, 19733)], air),
                session,
                clock: TimeSource::Session,
                transport,
                display: Display::new(DisplayKind::None),
                endpoints: endpoints(),
            },
            settings(),
        )
    }

    fn sent(c: &Controller<FakeSession, RecordingTransport>) -> Vec<Payload> {
        c.ctx.transport.sent.lock().unwrap().clone()
    }

    /// JSON of a payload with every timestamp blanked out.
    fn without_timestamps(p: &Payload) -> Value {
        let mut doc: Value = serde_json::from_slice(&p.to_json().unwrap()).unwrap();
        match p {
            Payload::LogStream(_) => doc["streams"][0]["values"][0][0] = Value::Null,
            Payload::Metrics(_) => {
                for m in doc.as_array_mut().unwrap() {
                    m["time"] = Value::Null;
                }
            }
        }
        doc
    }

    // -- Happy path -----------------------------------------------------------

    #[tokio::test]
    async fn delivers_to_both_destinations() {
        let mut c = controller(
            FakeSession::up().with_clock(T0_MS),
            RecordingTransport::default(),
            test_air(),
        );
        let report = c.wake().await;

        assert_eq!(report.outcome, CycleOutcome::Delivered);
        let reading = report.reading.unwrap();
        assert_eq!(reading.ts, 1_700_000_000);
        assert_eq!(reading.soil.percent, 50);
        assert_eq!(report.deliveries.len(), 2);
        assert!(report.deliveries.iter().all(|d| d.success));

        let dests: Vec<_> = sent(&c).iter().map(Payload::destination).collect();
        assert_eq!(dests, [Destination::LogStream, Destination::Metrics]);
    }

    #[tokio::test]
    async fn metrics_only_backend_sends_one_payload() {
        let mut c = controller(
            FakeSession::up().with_clock(T0_MS),
            RecordingTransport::default(),
            test_air(),
        );
        c.ctx.endpoints.retain(|e| e.destination == Destination::Metrics);
        let report = c.wake().await;
        assert_eq!(report.deliveries.len(), 1);
        assert_eq!(sent(&c)[0].destination(), Destination::Metrics);
    }

    // -- Delivery isolation ---------------------------------------------------

    #[tokio::test]
    async fn log_failure_does_not_block_metrics() {
        let transport = RecordingTransport {
            failing: HashSet::from([Destination::LogStream]),
            ..Default::default()
        };
        let mut c = controller(FakeSession::up().with_clock(T0_MS), transport, test_air());
        let report = c.wake().await;

        assert_eq!(report.outcome, CycleOutcome::Delivered);
        let log = &report.deliveries[0];
        let metrics = &report.deliveries[1];
        assert_eq!(log.destination, Destination::LogStream);
        assert!(!log.success);
        assert_eq!(log.message, "HTTP 500: boom");
        assert_eq!(metrics.destination, Destination::Metrics);
        assert!(metrics.success);
        assert_eq!(sent(&c).len(), 2);
    }

    #[tokio::test]
    async fn run_in_exit_mode_returns_after_failed_delivery() {
        let transport = RecordingTransport {
            failing: HashSet::from([Destination::LogStream, Destination::Metrics]),
            ..Default::default()
        };
        let c = controller(FakeSession::up().with_clock(T0_MS), transport, test_air());
        c.run().await.unwrap();
    }

    // -- Skipped cycles -------------------------------------------------------

    #[tokio::test]
    async fn implausible_reading_is_not_sent() {
        let air = AirSample {
            temperature: 150.0,
            ..test_air()
        };
        let mut c = controller(
            FakeSession::up().with_clock(T0_MS),
            RecordingTransport::default(),
            air,
        );
        let report = c.wake().await;
        assert_eq!(report.outcome, CycleOutcome::Rejected);
        assert!(report.deliveries.is_empty());
        assert!(sent(&c).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_after_connect_attempts_run_out() {
        let mut c = controller(
            FakeSession::down(10).with_clock(T0_MS),
            RecordingTransport::default(),
            test_air(),
        );
        let report = c.wake().await;
        assert_eq!(report.outcome, CycleOutcome::Offline);
        assert_eq!(c.ctx.session.connect_calls, 3);
        assert!(sent(&c).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_is_reconnected_before_the_cycle() {
        let mut c = controller(
            FakeSession::down(2).with_clock(T0_MS),
            RecordingTransport::default(),
            test_air(),
        );
        let report = c.wake().await;
        assert_eq!(report.outcome, CycleOutcome::Delivered);
        assert_eq!(c.ctx.session.connect_calls, 3);
    }

    #[tokio::test]
    async fn missing_clock_skips_cycle() {
        let mut c = controller(FakeSession::up(), RecordingTransport::default(), test_air());
        assert_eq!(c.wake().await.outcome, CycleOutcome::NoTime);
        assert!(sent(&c).is_empty());
    }

    #[tokio::test]
    async fn sensor_fault_skips_cycle() {
        let mut c = controller(
            FakeSession::up().with_clock(T0_MS),
            RecordingTransport::default(),
            test_air(),
        );
        // battery channel only; soil read on channel 3 fails
        c.ctx.sensors = sensors(&[(0, 19733)], test_air());
        let report = c.wake().await;
        assert_eq!(report.outcome, CycleOutcome::SensorFault);
        assert!(report.reading.is_none());
        assert!(sent(&c).is_empty());
    }

    // -- Idempotence ----------------------------------------------------------

    #[tokio::test]
    async fn repeated_cycles_differ_only_by_timestamp() {
        let mut c = controller(
            FakeSession::up().with_clock(T0_MS),
            RecordingTransport::default(),
            test_air(),
        );
        for i in 0..4 {
            c.ctx.session.clock_ms = Some(T0_MS + i * 300_000);
            assert_eq!(c.wake().await.outcome, CycleOutcome::Delivered);
        }

        let payloads = sent(&c);
        assert_eq!(payloads.len(), 8);
        let (logs, metrics): (Vec<_>, Vec<_>) = payloads
            .iter()
            .partition(|p| p.destination() == Destination::LogStream);

        for group in [logs, metrics] {
            assert_ne!(group[0], group[1], "timestamps should differ");
            let first = without_timestamps(group[0]);
            for p in &group[1..] {
                assert_eq!(without_timestamps(p), first);
            }
        }
    }

    // -- Display --------------------------------------------------------------

    #[tokio::test]
    async fn status_panel_shows_reading_and_send_count() {
        let transport = RecordingTransport {
            failing: HashSet::from([Destination::Metrics]),
            ..Default::default()
        };
        let mut c = controller(FakeSession::up().with_clock(T0_MS), transport, test_air());
        c.ctx.display = Display::new(DisplayKind::Bitmap);
        c.wake().await;

        match &c.ctx.display {
            Display::Bitmap { panel, on } => {
                let frame = panel.frame();
                assert!(frame.starts_with("basil\nT 22.5C H 55%\nDew 12.3C\nSoil 50%\n"), "{frame}");
                assert!(frame.contains("sent 1/2"), "{frame}");
                assert!(frame.ends_with("22:13 UTC"), "{frame}");
                assert!(!on);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn clock_label_formats_utc() {
        assert_eq!(clock_label(0), "00:00 UTC");
        assert_eq!(clock_label(1_700_000_000), "22:13 UTC");
    }
}
