//! Poll worker.
//!
//! One task drives the whole pipeline: a high pass over all devices, then, if
//! enough of the cycle is left, the fleet totals and a low pass. Cycles are
//! aligned to wall-clock multiples of the interval and never overlap.

pub mod watchdog;

pub use watchdog::{CycleReport, Verdict, Watchdog};

use crate::aggregate::{Aggregator, midnight_rollover};
use crate::cache::ValueCache;
use crate::device::Device;
use crate::engine::{HealthReport, RegisterEngine};
use crate::pacing::Calibration;
use crate::registers::{Meta, RefreshTier, Value};
use crate::session::ModbusSession;
use crate::store::Store;
use crate::transport::Transport;
use chrono::{DateTime, Local, TimeZone};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval granted to each device at minimum.
pub const MIN_INTERVAL_PER_DEVICE: Duration = Duration::from_secs(10);
/// Time that must be left after the high pass to run the low pass.
pub const LOW_PASS_BUDGET: Duration = Duration::from_secs(5);
/// Time that must be left after the low pass to run the low-tier totals.
pub const LOW_TOTALS_BUDGET: Duration = Duration::from_secs(2);

const CALIBRATION_KEYS: [&str; 3] = [
    "info.modbus.delay",
    "info.modbus.timeout",
    "info.modbus.connectDelay",
];

const BASELINE_KEYS: [&str; 3] = [
    "collected.gridExportStart",
    "collected.gridImportStart",
    "collected.consumptionStart",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub interval: Duration,
    /// Minimum age before a low-tier block is read again.
    pub low_interval: Duration,
    /// Age after which a block counts as stale in the health report.
    pub stale_after: Duration,
    pub watchdog_period: Duration,
    /// Staleness, in intervals, after which the watchdog asks for a restart.
    pub restart_after_intervals: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            low_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
            watchdog_period: Duration::from_secs(30),
            restart_after_intervals: watchdog::RESTART_AFTER_INTERVALS,
        }
    }
}

impl Settings {
    /// Raise the interval so every device gets its share of the link.
    #[must_use]
    pub fn for_devices(mut self, count: usize) -> Self {
        let floor = MIN_INTERVAL_PER_DEVICE * count.max(1) as u32;
        if self.interval < floor {
            tracing::info!(
                "Update interval raised from {} s to {} s for {} device(s)",
                self.interval.as_secs(),
                floor.as_secs(),
                count
            );
            self.interval = floor;
        }
        self
    }
}

/// Cycle deadlines on wall-clock multiples of the interval.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    interval: Duration,
    deadline: Instant,
}

impl Schedule {
    /// First deadline: the next multiple of `interval` after `wall`.
    pub fn aligned(interval: Duration, wall: SystemTime, now: Instant) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let since_epoch = wall
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let left = interval_ms - since_epoch % interval_ms;
        Self {
            interval,
            deadline: now + Duration::from_millis(left as u64),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Move to the next deadline, `previous + interval`, skipping slots
    /// that already passed.
    pub fn advance(&mut self, now: Instant) -> Instant {
        self.deadline += self.interval;
        let mut skipped = 0;
        while self.deadline <= now {
            self.deadline += self.interval;
            skipped += 1;
        }
        if skipped > 0 {
            tracing::warn!("Skipped {} poll cycle(s)", skipped);
        }
        self.deadline
    }
}

/// Time until the next local midnight.
pub fn until_next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let local = now.with_timezone(&Local);
    let next = local
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest());
    match next {
        Some(next) => (next - local).to_std().unwrap_or_default(),
        None => Duration::from_secs(24 * 3600),
    }
}

/// Previous calibration result kept in the store, if complete.
pub async fn stored_calibration<S: Store>(store: &S) -> Option<Calibration> {
    let mut values = [0u64; 3];
    for (slot, key) in values.iter_mut().zip(CALIBRATION_KEYS) {
        match store.get(key).await {
            Ok(Some(stored)) => *slot = stored.value.as_f64()?.max(0.0) as u64,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Cannot load {}: {}", key, e);
                return None;
            }
        }
    }
    Some(Calibration {
        delay_ms: values[0],
        timeout_ms: values[1],
        connect_delay_ms: values[2],
    })
}

pub struct Collector<T, S> {
    session: ModbusSession<T>,
    engine: RegisterEngine,
    aggregator: Aggregator,
    devices: Vec<Device>,
    cache: ValueCache,
    store: S,
    settings: Settings,
    status: watch::Sender<CycleReport>,
    cycles: u64,
}

impl<T: Transport, S: Store> Collector<T, S> {
    pub fn new(
        session: ModbusSession<T>,
        engine: RegisterEngine,
        devices: Vec<Device>,
        store: S,
        settings: Settings,
    ) -> Self {
        let (status, _) = watch::channel(CycleReport::default());
        Self {
            session,
            engine,
            aggregator: Aggregator::new(),
            devices,
            cache: ValueCache::new(),
            store,
            settings,
            status,
            cycles: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &ModbusSession<T> {
        &self.session
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Cycle progress, for the watchdog.
    pub fn subscribe(&self) -> watch::Receiver<CycleReport> {
        self.status.subscribe()
    }

    pub fn health_report(&self) -> HealthReport {
        self.engine
            .health(&self.devices, Instant::now(), self.settings.stale_after)
            .with_connection(self.session.info())
    }

    /// Load the daily baselines and continue today's solar integrals.
    pub async fn restore(&mut self) {
        for key in BASELINE_KEYS {
            match self.store.get(key).await {
                Ok(Some(stored)) => self.cache.restore(key, stored.value),
                Ok(None) => {}
                Err(e) => tracing::warn!("Cannot load {}: {}", key, e),
            }
        }

        let now = Local::now();
        for device in &mut self.devices {
            let key = device.inverter_key("derived.dailySolarYield");
            let stored = match self.store.get(&key).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Cannot load {}: {}", key, e);
                    continue;
                }
            };
            if let Some(sum) = stored.value.as_f64().filter(|s| *s > 0.0) {
                if device.integrator.set_start(sum, stored.updated, now) {
                    tracing::info!("Continue solar yield of {} at {} kWh", device.path, sum);
                }
            }
        }
    }

    /// Write the startup information states.
    pub async fn publish_settings(&mut self, address: &str, port: u16) {
        let ids = self
            .devices
            .iter()
            .map(|d| d.unit.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let entries = [
            ("info.ip", Meta::text("IP address", "info.ip"), Value::from(address)),
            ("info.port", Meta::number("Port", "", "info.port"), Value::Number(f64::from(port))),
            ("info.modbusIds", Meta::text("Modbus IDs", "info"), Value::Text(ids)),
            (
                "info.modbusUpdateInterval",
                Meta::number("Update interval", "s", "value.interval"),
                Value::Number(self.settings.interval.as_secs_f64()),
            ),
            (
                "info.connection",
                Meta::boolean("Device or service connected", "indicator.connected"),
                Value::Bool(false),
            ),
        ];
        for (key, meta, value) in entries {
            self.cache.declare(key, meta);
            self.cache.set(key, value);
        }
        self.cache.flush(&mut self.store).await;
    }

    fn record_calibration(&mut self, calibration: Calibration) {
        tracing::info!(
            "Storing Modbus calibration: delay {} ms, timeout {} ms, connect delay {} ms",
            calibration.delay_ms,
            calibration.timeout_ms,
            calibration.connect_delay_ms
        );
        let values = [
            calibration.delay_ms,
            calibration.timeout_ms,
            calibration.connect_delay_ms,
        ];
        for (key, value) in CALIBRATION_KEYS.into_iter().zip(values) {
            self.cache
                .declare(key, Meta::number("Modbus calibration", "ms", "value.interval"));
            self.cache.set(key, value as f64);
        }
    }

    fn record_health(&mut self) {
        let report = self.health_report();
        self.cache
            .declare("info.health.errno", Meta::number("Health code", "", "value"));
        self.cache
            .declare("info.health.message", Meta::text("Health message", "text"));
        self.cache.set("info.health.errno", f64::from(report.errno));
        self.cache.set("info.health.message", report.message);
    }

    /// Run one poll cycle that should be over by `deadline`. Returns the
    /// number of blocks read.
    pub async fn run_cycle(&mut self, deadline: Instant) -> usize {
        let start = Instant::now();
        let previous = self.status.borrow().started;
        if let Some(previous) = previous {
            let gap = start.saturating_duration_since(previous);
            if gap > self.settings.interval + Duration::from_secs(1) {
                tracing::warn!("time interval {} sec", gap.as_secs_f64());
            }
        }
        tracing::debug!("### DataPolling START ###");

        let left = |deadline: Instant| deadline.saturating_duration_since(Instant::now());
        let mut read = self
            .engine
            .poll(
                &mut self.session,
                &mut self.store,
                &mut self.devices,
                &mut self.cache,
                RefreshTier::High,
                deadline,
            )
            .await;

        if left(deadline) > LOW_PASS_BUDGET {
            self.aggregator
                .run(RefreshTier::High, &self.devices, &mut self.cache);
            self.cache.flush(&mut self.store).await;

            read += self
                .engine
                .poll(
                    &mut self.session,
                    &mut self.store,
                    &mut self.devices,
                    &mut self.cache,
                    RefreshTier::Low,
                    deadline,
                )
                .await;
            if left(deadline) > LOW_TOTALS_BUDGET {
                self.aggregator
                    .run(RefreshTier::Low, &self.devices, &mut self.cache);
            }
        }

        if let Some(calibration) = self.session.take_calibration() {
            self.record_calibration(calibration);
        }
        self.record_health();
        self.cache.flush(&mut self.store).await;

        self.cycles += 1;
        self.status.send_replace(CycleReport {
            started: Some(start),
            registers_read: read,
            cycles: self.cycles,
        });
        tracing::debug!("### DataPolling STOP ({} blocks) ###", read);
        read
    }

    /// Daily housekeeping at local midnight.
    pub async fn midnight(&mut self) {
        tracing::info!("Midnight: storing daily baselines");
        midnight_rollover(&mut self.cache);
        self.cache.flush(&mut self.store).await;
    }

    async fn set_connected(&mut self, connected: bool) {
        self.cache.set("info.connection", connected);
        self.cache.flush(&mut self.store).await;
    }

    /// Poll until `cancel` fires, then close the link and flush.
    pub async fn run(&mut self, cancel: CancellationToken, mut connected: watch::Receiver<bool>) {
        let mut schedule =
            Schedule::aligned(self.settings.interval, SystemTime::now(), Instant::now());

        'cycles: loop {
            self.run_cycle(schedule.deadline()).await;

            loop {
                let midnight = tokio::time::sleep(until_next_midnight(Local::now()));
                tokio::select! {
                    _ = cancel.cancelled() => break 'cycles,
                    _ = tokio::time::sleep_until(schedule.deadline()) => break,
                    _ = midnight => self.midnight().await,
                    Ok(()) = connected.changed() => {
                        let value = *connected.borrow_and_update();
                        self.set_connected(value).await;
                    }
                }
            }
            schedule.advance(Instant::now());
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.session.close().await;
        self.set_connected(false).await;
        tracing::info!("cleaned everything up...");
    }
}
