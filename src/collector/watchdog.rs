use super::Settings;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default staleness, in intervals, after which the process is restarted.
pub const RESTART_AFTER_INTERVALS: u32 = 10;
/// Staleness, in intervals, after which the link counts as disconnected.
pub const CONNECTED_WITHIN_INTERVALS: u32 = 2;

/// Published by the collector after every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub started: Option<Instant>,
    pub registers_read: usize,
    pub cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub connected: bool,
    pub restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Shutdown,
    Restart,
}

/// Judge the poll loop from its last report. `None` before the first cycle.
pub fn assess(
    report: &CycleReport,
    now: Instant,
    interval: Duration,
    restart_after: u32,
) -> Option<Assessment> {
    let started = report.started?;
    let since = now.saturating_duration_since(started);
    Some(Assessment {
        connected: report.registers_read > 0 && since < interval * CONNECTED_WITHIN_INTERVALS,
        restart: since > interval * restart_after.max(CONNECTED_WITHIN_INTERVALS),
    })
}

/// Independent task watching the poll loop's progress.
///
/// It only reads the collector's reports; its outputs are the connection
/// indicator and, when polling has stalled for too long, a restart request.
pub struct Watchdog {
    interval: Duration,
    period: Duration,
    restart_after: u32,
    status: watch::Receiver<CycleReport>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn new(
        settings: &Settings,
        status: watch::Receiver<CycleReport>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<bool>) {
        let (connected, connected_rx) = watch::channel(false);
        let watchdog = Self {
            interval: settings.interval,
            period: settings.watchdog_period,
            restart_after: settings.restart_after_intervals,
            status,
            connected,
            cancel,
        };
        (watchdog, connected_rx)
    }

    pub async fn run(self) -> Verdict {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Verdict::Shutdown,
                _ = ticker.tick() => {}
            }

            let report = *self.status.borrow();
            let now = Instant::now();
            let Some(assessment) = assess(&report, now, self.interval, self.restart_after) else {
                continue;
            };
            if let Some(started) = report.started {
                tracing::debug!(
                    "Watchdog: time to last update {} sec",
                    now.saturating_duration_since(started).as_secs_f64()
                );
            }

            self.connected.send_if_modified(|connected| {
                let changed = *connected != assessment.connected;
                *connected = assessment.connected;
                changed
            });

            if assessment.restart {
                tracing::warn!("watchdog: restart...");
                self.cancel.cancel();
                return Verdict::Restart;
            }
        }
    }
}
