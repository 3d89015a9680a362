//! Fleet totals across all inverters and the daily baselines.

use crate::cache::ValueCache;
use crate::device::Device;
use crate::registers::{DeviceClass, Meta, RefreshTier};
use std::collections::HashSet;

pub type FleetFn = fn(&[Device], &mut ValueCache);

#[derive(Debug, Clone)]
pub struct FleetHook {
    pub tier: RefreshTier,
    pub fields: Vec<(&'static str, Meta)>,
    pub run: FleetFn,
}

fn kw(name: &'static str, role: &'static str) -> Meta {
    Meta::number(name, "kW", role)
}

fn kwh(name: &'static str) -> Meta {
    Meta::number(name, "kWh", "value.power.consumption")
}

pub fn fleet_hooks() -> Vec<FleetHook> {
    vec![
        FleetHook {
            tier: RefreshTier::High,
            fields: vec![
                ("collected.houseConsumption", kw("House Consumption", "value.power")),
                ("collected.activePower", kw("Active power", "value.power.active")),
                ("collected.inputPower", kw("Input power", "value.power")),
                (
                    "collected.inputPowerWithEfficiencyLoss",
                    kw("input power with efficiency loss", "value.power"),
                ),
                (
                    "collected.chargeDischargePower",
                    kw("Charge/Discharge power", "value.power"),
                ),
            ],
            run: collect_power,
        },
        FleetHook {
            tier: RefreshTier::Low,
            fields: vec![
                ("collected.dailyEnergyYield", kwh("Daily Energy Yield")),
                ("collected.dailyInputYield", kwh("Daily Portal Yield")),
                ("collected.dailySolarYield", kwh("Daily Solar Yield")),
                ("collected.accumulatedEnergyYield", kwh("Accumulated Energy Yield")),
                ("collected.consumptionSum", kwh("Consumption Sum")),
                ("collected.gridExportStart", kwh("Grid Export Start Today")),
                ("collected.gridImportStart", kwh("Grid Import Start Today")),
                ("collected.consumptionStart", kwh("Consumption Start Today")),
                ("collected.gridExportToday", kwh("Grid Export Today")),
                ("collected.gridImportToday", kwh("Grid Import Today")),
                ("collected.consumptionToday", kwh("Consumption Today")),
                ("collected.totalCharge", kwh("Total Charge of Battery")),
                ("collected.totalDischarge", kwh("Total Discharge of Battery")),
                (
                    "collected.currentDayChargeCapacity",
                    kwh("Current Day Charge Capacity of Battery"),
                ),
                (
                    "collected.currentDayDischargeCapacity",
                    kwh("Current Day Discharge Capacity of Battery"),
                ),
                (
                    "collected.SOC",
                    Meta::number("State of battery capacity", "%", "value.battery"),
                ),
                (
                    "collected.ratedCapacity",
                    Meta::number("Rated of battery Capacity", "Wh", "value.capacity"),
                ),
            ],
            run: collect_energy,
        },
    ]
}

/// Runs the fleet hooks covered by a pass tier.
#[derive(Debug)]
pub struct Aggregator {
    hooks: Vec<FleetHook>,
    declared: HashSet<usize>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            hooks: fleet_hooks(),
            declared: HashSet::new(),
        }
    }

    pub fn run(&mut self, tier: RefreshTier, devices: &[Device], cache: &mut ValueCache) {
        for (index, hook) in self.hooks.iter().enumerate() {
            if !tier.covers(Some(hook.tier)) {
                continue;
            }
            if self.declared.insert(index) {
                for (key, meta) in &hook.fields {
                    cache.declare(*key, *meta);
                }
            }
            (hook.run)(devices, cache);
        }
    }
}

fn sum(devices: &[Device], cache: &ValueCache, class: DeviceClass, field: &str) -> f64 {
    devices
        .iter()
        .filter_map(|d| cache.number(&d.key(class, field)))
        .sum()
}

pub fn collect_power(devices: &[Device], cache: &mut ValueCache) {
    let active = sum(devices, cache, DeviceClass::Inverter, "activePower");
    let input = sum(devices, cache, DeviceClass::Inverter, "inputPower");
    let effective = sum(
        devices,
        cache,
        DeviceClass::Inverter,
        "derived.inputPowerWithEfficiencyLoss",
    );
    let charge = sum(devices, cache, DeviceClass::Battery, "battery.chargeDischargePower");

    cache.renew("collected.inputPower", input);
    cache.set("collected.inputPowerWithEfficiencyLoss", effective);
    cache.renew("collected.activePower", active);
    if let Some(grid) = cache.number("meter.activePower") {
        cache.set("collected.houseConsumption", active - grid);
    }
    cache.set("collected.chargeDischargePower", charge);
}

pub fn collect_energy(devices: &[Device], cache: &mut ValueCache) {
    let inverter = |cache: &ValueCache, field| sum(devices, cache, DeviceClass::Inverter, field);
    let battery = |cache: &ValueCache, field| sum(devices, cache, DeviceClass::Battery, field);

    let output_yield = inverter(cache, "dailyEnergyYield");
    let input_yield = inverter(cache, "derived.dailyInputYield");
    let solar_yield = inverter(cache, "derived.dailySolarYield");
    let energy_yield = inverter(cache, "accumulatedEnergyYield");
    let day_charge = battery(cache, "battery.currentDayChargeCapacity");
    let day_discharge = battery(cache, "battery.currentDayDischargeCapacity");
    let total_charge = battery(cache, "battery.totalCharge");
    let total_discharge = battery(cache, "battery.totalDischarge");

    let mut rated = 0.0;
    let mut load = 0.0;
    for device in devices {
        let capacity = cache.number(&device.key(DeviceClass::Battery, "battery.ratedCapacity"));
        if let Some(capacity) = capacity.filter(|c| *c > 0.0) {
            let soc = cache
                .number(&device.key(DeviceClass::Battery, "battery.SOC"))
                .unwrap_or(0.0);
            load += capacity * soc;
            rated += capacity;
        }
    }

    cache.set("collected.dailyEnergyYield", output_yield);
    cache.set("collected.dailyInputYield", input_yield);
    cache.set("collected.dailySolarYield", solar_yield);
    cache.set("collected.accumulatedEnergyYield", energy_yield);

    let exported = cache.number("meter.positiveActiveEnergy");
    let imported = cache.number("meter.reverseActiveEnergy");
    if let (Some(exported), Some(imported)) = (exported, imported) {
        cache.set("collected.consumptionSum", energy_yield + imported - exported);
    }
    if let (Some(now), Some(start)) = (exported, cache.number("collected.gridExportStart")) {
        cache.set("collected.gridExportToday", now - start);
    }
    if let (Some(now), Some(start)) = (imported, cache.number("collected.gridImportStart")) {
        cache.set("collected.gridImportToday", now - start);
    }
    if let (Some(now), Some(start)) = (
        cache.number("collected.consumptionSum"),
        cache.number("collected.consumptionStart"),
    ) {
        cache.set("collected.consumptionToday", now - start);
    }

    cache.set("collected.totalCharge", total_charge);
    cache.set("collected.totalDischarge", total_discharge);
    cache.set("collected.currentDayChargeCapacity", day_charge);
    cache.set("collected.currentDayDischargeCapacity", day_discharge);
    cache.set("collected.ratedCapacity", rated);
    if rated > 0.0 {
        cache.set("collected.SOC", (load / rated).round());
    }
}

/// Take today's counters as the baselines of the next day.
pub fn midnight_rollover(cache: &mut ValueCache) {
    for (baseline, counter) in [
        ("collected.gridExportStart", "meter.positiveActiveEnergy"),
        ("collected.gridImportStart", "meter.reverseActiveEnergy"),
        ("collected.consumptionStart", "collected.consumptionSum"),
    ] {
        if let Some(value) = cache.number(counter) {
            cache.set(baseline, value);
        }
    }
}
