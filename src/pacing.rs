//! Adaptive request pacing.
//!
//! The SUN2000 answers only a limited number of requests per second and the
//! limit differs between firmware versions and dongles. `DelayController`
//! searches for the smallest inter-request delay the device tolerates: every
//! window of five clean transactions lowers the delay by a shrinking step,
//! every failure raises it again, and after ten clean windows the delay is
//! frozen and reported as a [`Calibration`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lowest response timeout the controller relaxes back to.
pub const TIMEOUT_FLOOR_MS: u64 = 10_000;
/// Lowest post-connect settle delay the controller relaxes back to.
pub const CONNECT_DELAY_FLOOR_MS: u64 = 2_000;
/// Consecutive successes that make up one calibration window.
pub const WINDOW: u32 = 5;
/// Number of clean windows after which calibration is complete.
pub const CALIBRATION_LEVELS: u32 = 10;

// Register count at which the full configured delay is paid.
const REFERENCE_LENGTH: f64 = 75.0;
// Residual delay below which the controller snaps to the minimum.
const SNAP_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    pub timeout_ms: u64,
    pub delay_ms: u64,
    pub connect_delay_ms: u64,
    pub auto_adjust: bool,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            delay_ms: 0,
            connect_delay_ms: 5_000,
            auto_adjust: false,
            delay_min_ms: 0,
            delay_max_ms: 6_000,
        }
    }
}

impl ConnectionOptions {
    /// Starting point of a calibration run: shortest delay, default timeouts.
    #[must_use]
    pub fn calibrating(mut self) -> Self {
        self.auto_adjust = true;
        self.timeout_ms = TIMEOUT_FLOOR_MS;
        self.connect_delay_ms = CONNECT_DELAY_FLOOR_MS;
        self.delay_ms = self.delay_min_ms;
        self.normalized()
    }

    /// Use the result of an earlier calibration and skip auto-adjustment.
    #[must_use]
    pub fn with_calibration(mut self, calibration: &Calibration) -> Self {
        self.auto_adjust = false;
        self.delay_ms = calibration.delay_ms;
        self.timeout_ms = calibration.timeout_ms;
        self.connect_delay_ms = calibration.connect_delay_ms;
        self.normalized()
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.delay_max_ms = self.delay_max_ms.max(self.delay_min_ms);
        self.delay_ms = self.delay_ms.clamp(self.delay_min_ms, self.delay_max_ms);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub success_level: u32,
    pub success_streak: u32,
    pub success_lifetime: u64,
    pub error_streak: u32,
    pub error_lifetime: u64,
    pub last_transaction_length: u16,
    pub calibrated_delay_ms: u64,
}

/// Final pacing parameters, emitted once when calibration completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    pub delay_ms: u64,
    pub timeout_ms: u64,
    pub connect_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DelayController {
    options: ConnectionOptions,
    stats: ConnectionStats,
}

impl DelayController {
    pub fn new(options: ConnectionOptions) -> Self {
        let options = options.normalized();
        if options.auto_adjust {
            tracing::info!("The adjustment of the Modbus connection starts...");
        }
        Self {
            options,
            stats: ConnectionStats::default(),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_calibrating(&self) -> bool {
        self.options.auto_adjust
    }

    /// Gradient step; shrinks as calibration progresses.
    fn step(&self) -> u64 {
        let divider = 10 + 2 * self.stats.success_level;
        (self.options.delay_max_ms as f64 / f64::from(divider)).round() as u64
    }

    pub fn record_transaction(&mut self, length: u16) {
        self.stats.last_transaction_length = length;
    }

    /// Forget the previous transaction size, e.g. after a fresh connect.
    pub fn reset_transaction(&mut self) {
        self.stats.last_transaction_length = 0;
    }

    /// Wait before the next request: 40 % of the delay is always paid, the
    /// remaining 60 % scales with the size of the previous transaction.
    pub fn pacing_delay(&self) -> Duration {
        if self.options.delay_ms == 0 {
            return Duration::ZERO;
        }
        let weight =
            0.40 + 0.60 * f64::from(self.stats.last_transaction_length) / REFERENCE_LENGTH;
        Duration::from_millis((self.options.delay_ms as f64 * weight).round() as u64)
    }

    pub fn on_success(&mut self) -> Option<Calibration> {
        self.stats.error_streak = 0;
        self.stats.success_streak += 1;
        self.stats.success_lifetime = self.stats.success_lifetime.saturating_add(1);

        if self.stats.success_streak < WINDOW {
            return None;
        }
        self.stats.success_streak = 0;
        self.stats.calibrated_delay_ms = self.options.delay_ms;

        if !self.options.auto_adjust {
            return None;
        }
        self.stats.success_level = (self.stats.success_level + 1).min(CALIBRATION_LEVELS);

        if self.stats.success_level >= CALIBRATION_LEVELS {
            if self.options.delay_ms < self.options.delay_max_ms {
                self.options.auto_adjust = false;
                self.options.delay_ms = self.stats.calibrated_delay_ms;
                tracing::info!(
                    "The adjustment was completed successfully with delay value {}",
                    self.options.delay_ms
                );
                return Some(self.calibration());
            }
            return None;
        }

        tracing::info!(
            "The adjustment of the modbus has reached the step {} of {}",
            self.stats.success_level,
            CALIBRATION_LEVELS
        );
        let min = self.options.delay_min_ms;
        let step = self.step();
        self.options.delay_ms = self.options.delay_ms.saturating_sub(step).max(min);
        if self.options.delay_ms < min + SNAP_MS {
            self.options.delay_ms = min;
        }

        let delay = self.options.delay_ms;
        if self.options.timeout_ms > TIMEOUT_FLOOR_MS && delay * 3 < self.options.timeout_ms {
            self.options.timeout_ms = (delay * 3).max(TIMEOUT_FLOOR_MS);
        }
        if self.options.connect_delay_ms > CONNECT_DELAY_FLOOR_MS
            && delay < self.options.connect_delay_ms
        {
            self.options.connect_delay_ms = delay.max(CONNECT_DELAY_FLOOR_MS);
        }
        None
    }

    pub fn on_failure(&mut self) {
        self.stats.success_streak = 0;
        self.stats.error_streak += 1;
        self.stats.error_lifetime = self.stats.error_lifetime.saturating_add(1);

        if !self.options.auto_adjust {
            return;
        }
        if self.stats.error_streak % WINDOW == 0 {
            tracing::warn!(
                "The adjustment has difficulty calibrating. The current step is {}",
                self.stats.success_level
            );
        }

        let step = self.step();
        self.options.delay_ms = (self.options.delay_ms + step).min(self.options.delay_max_ms);
        let delay = self.options.delay_ms;
        self.options.timeout_ms = self.options.timeout_ms.max(delay * 3);
        self.options.connect_delay_ms = self.options.connect_delay_ms.max(delay);
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            delay_ms: self.options.delay_ms,
            timeout_ms: self.options.timeout_ms,
            connect_delay_ms: self.options.connect_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn with_delay(delay_ms: u64, last_length: u16) -> DelayController {
        let mut controller = DelayController::new(ConnectionOptions {
            delay_ms,
            ..ConnectionOptions::default()
        });
        controller.record_transaction(last_length);
        controller
    }

    #[test]
    fn pacing_pays_full_delay_for_a_reference_sized_transaction() {
        assert_eq!(with_delay(1000, 75).pacing_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn pacing_pays_forty_percent_after_an_empty_transaction() {
        assert_eq!(with_delay(1000, 0).pacing_delay(), Duration::from_millis(400));
    }

    #[test]
    fn pacing_is_zero_without_delay() {
        assert_eq!(with_delay(0, 116).pacing_delay(), Duration::ZERO);
    }

    #[test]
    fn calibration_completes_after_ten_clean_windows() {
        let mut controller = DelayController::new(ConnectionOptions::default().calibrating());
        let mut events = Vec::new();

        for i in 1..=(WINDOW * CALIBRATION_LEVELS) {
            if let Some(calibration) = controller.on_success() {
                events.push((i, calibration));
            }
            assert_eq!(controller.stats().success_level, i / WINDOW);
        }

        assert!(!controller.is_calibrating());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, WINDOW * CALIBRATION_LEVELS);
        assert_eq!(events[0].1.delay_ms, 0);

        let frozen = *controller.options();
        for _ in 0..100 {
            assert_eq!(controller.on_success(), None);
        }
        assert_eq!(controller.options().delay_ms, frozen.delay_ms);
        assert_eq!(controller.stats().success_level, CALIBRATION_LEVELS);
    }

    #[test]
    fn failures_raise_delay_and_keep_timeouts_ahead() {
        let mut controller = DelayController::new(ConnectionOptions::default().calibrating());
        for _ in 0..6 {
            controller.on_failure();
        }
        let options = controller.options();
        assert_eq!(options.delay_ms, 3600);
        assert_eq!(options.timeout_ms, 10_800);
        assert_eq!(options.connect_delay_ms, 3600);
        assert_eq!(controller.stats().error_streak, 6);
        assert_eq!(controller.stats().error_lifetime, 6);
    }

    #[test]
    fn clean_window_lowers_delay_and_relaxes_timeouts() {
        let mut controller = DelayController::new(ConnectionOptions::default().calibrating());
        for _ in 0..6 {
            controller.on_failure();
        }
        for _ in 0..WINDOW {
            controller.on_success();
        }
        let options = controller.options();
        assert_eq!(controller.stats().success_level, 1);
        assert_eq!(controller.stats().error_streak, 0);
        // step at level 1 is round(6000 / 12)
        assert_eq!(options.delay_ms, 3100);
        assert_eq!(options.timeout_ms, TIMEOUT_FLOOR_MS);
        assert_eq!(options.connect_delay_ms, 3100);
    }

    #[test]
    fn fixed_delay_is_left_alone_without_auto_adjust() {
        let mut controller = DelayController::new(ConnectionOptions {
            delay_ms: 1500,
            ..ConnectionOptions::default()
        });
        for _ in 0..20 {
            controller.on_failure();
        }
        for _ in 0..60 {
            assert_eq!(controller.on_success(), None);
        }
        assert_eq!(controller.options().delay_ms, 1500);
        assert_eq!(controller.stats().success_level, 0);
        assert_eq!(controller.stats().calibrated_delay_ms, 1500);
    }

    #[test]
    fn stored_calibration_disables_adjustment() {
        let options = ConnectionOptions::default().with_calibration(&Calibration {
            delay_ms: 900,
            timeout_ms: 10_000,
            connect_delay_ms: 2_000,
        });
        assert!(!options.auto_adjust);
        assert_eq!(options.delay(), Duration::from_millis(900));
    }

    proptest! {
        #[test]
        fn delay_stays_within_bounds(
            outcomes in proptest::collection::vec(any::<bool>(), 0..400),
            min in 0u64..3000,
            span in 0u64..8000,
        ) {
            let options = ConnectionOptions {
                delay_min_ms: min,
                delay_max_ms: min + span,
                ..ConnectionOptions::default()
            }
            .calibrating();
            let mut controller = DelayController::new(options);
            for ok in outcomes {
                if ok {
                    controller.on_success();
                } else {
                    controller.on_failure();
                }
                let o = controller.options();
                prop_assert!(o.delay_min_ms <= o.delay_ms && o.delay_ms <= o.delay_max_ms);
                prop_assert!(controller.stats().success_level <= CALIBRATION_LEVELS);
            }
        }
    }
}
