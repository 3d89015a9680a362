use chrono::{DateTime, Local, TimeZone};

/// Trapezoidal Riemann sum turning power samples (kW) into energy (kWh).
///
/// The sum belongs to one local calendar day: the first sample taken on a
/// new day starts again from zero.
#[derive(Debug, Clone, Default)]
pub struct Integrator {
    sum: f64,
    last: Option<(f64, DateTime<Local>)>,
}

impl Integrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Energy accumulated today, in kWh.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn add_at(&mut self, power: f64, at: DateTime<Local>) {
        if let Some((previous, since)) = self.last {
            if since.date_naive() != at.date_naive() {
                self.sum = 0.0;
            } else if at > since {
                let hours = (at - since).num_milliseconds() as f64 / 3_600_000.0;
                self.sum += (previous + power) / 2.0 * hours;
            }
        }
        self.last = Some((power, at));
    }

    pub fn add(&mut self, power: f64) {
        self.add_at(power, Local::now());
    }

    /// Continue from a previously stored sum, provided it was stored on the
    /// same local day as `now`.
    pub fn set_start<Tz: TimeZone>(&mut self, value: f64, stored: DateTime<Tz>, now: DateTime<Local>) -> bool {
        if stored.with_timezone(&Local).date_naive() != now.date_naive() {
            return false;
        }
        self.sum = value;
        self.last = None;
        true
    }
}
