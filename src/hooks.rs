//! Per-device derived values.

use crate::cache::ValueCache;
use crate::device::Device;
use crate::registers::{DeviceClass, Field, Meta, PostHook, RefreshTier};
use crate::table::MAX_PV_STRINGS;
use chrono::{DateTime, Local, Timelike};

/// Hook run once per device after a polling pass of a covering tier.
#[derive(Debug, Clone)]
pub struct DeviceHook {
    pub tier: RefreshTier,
    pub field: Field,
    pub run: PostHook,
}

pub fn device_hooks() -> Vec<DeviceHook> {
    vec![DeviceHook {
        tier: RefreshTier::Low,
        field: Field::derived(
            "derived.dailyInputYield",
            Meta::number("Portal Yield Today", "kWh", "value.power.consumption"),
        ),
        run: daily_input_yield,
    }]
}

/// Conversion efficiency of the inverter at `input` kW: poor at low load.
pub fn efficiency_factor(input: f64, rated: Option<f64>) -> f64 {
    match rated {
        Some(rated) if input < rated * 0.1 => 0.90,
        Some(rated) if input < rated * 0.2 => 0.95,
        _ => 0.98,
    }
}

/// Input power corrected for conversion loss, integrated into the daily
/// solar yield.
pub fn input_power(device: &mut Device, cache: &mut ValueCache, now: DateTime<Local>) {
    let Some(input) = cache.number(&device.inverter_key("inputPower")) else {
        return;
    };
    let rated = cache.number(&device.inverter_key("info.ratedPower"));
    let effective = input * efficiency_factor(input, rated);
    cache.set(device.inverter_key("derived.inputPowerWithEfficiencyLoss"), effective);

    device.integrator.add_at(effective, now);
    cache.set(device.inverter_key("derived.dailySolarYield"), device.integrator.sum());
}

pub fn pv_string_power(device: &mut Device, cache: &mut ValueCache, _now: DateTime<Local>) {
    let count = cache
        .number(&device.inverter_key("info.numberPVStrings"))
        .unwrap_or(0.0) as usize;
    for n in 1..=count.min(MAX_PV_STRINGS) {
        let voltage = cache.number(&device.inverter_key(&format!("string.PV{n}Voltage")));
        let current = cache.number(&device.inverter_key(&format!("string.PV{n}Current")));
        if let (Some(voltage), Some(current)) = (voltage, current) {
            cache.set(
                device.inverter_key(&format!("string.PV{n}Power")),
                (voltage * current).round(),
            );
        }
    }
}

/// Approximation of the yield shown by the vendor portal.
pub fn daily_input_yield(device: &mut Device, cache: &mut ValueCache, now: DateTime<Local>) {
    let Some(energy) = cache.number(&device.inverter_key("dailyEnergyYield")) else {
        return;
    };
    let charge = cache
        .number(&device.key(DeviceClass::Battery, "battery.currentDayChargeCapacity"))
        .unwrap_or(0.0);
    let discharge = cache
        .number(&device.key(DeviceClass::Battery, "battery.currentDayDischargeCapacity"))
        .unwrap_or(0.0);

    let mut value = ((energy + charge - discharge) * 100.0).round() / 100.0;
    value -= f64::from(now.hour()) * device.energy_loss_per_hour;
    cache.set(device.inverter_key("derived.dailyInputYield"), value.max(0.0));
}
