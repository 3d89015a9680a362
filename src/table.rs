//! SUN2000 register map.
//!
//! Block order matters: the engine walks the table top to bottom, so the
//! high-tier power registers come first and static information precedes the
//! blocks whose decoding depends on it.

use crate::hooks;
use crate::registers::{DataType, DeviceClass, Field, Meta, RefreshTier, RegisterBlock, Value};

/// String inputs reserved in the 32016.. status range.
pub const MAX_PV_STRINGS: usize = 24;

const HIGH: Option<RefreshTier> = Some(RefreshTier::High);
const LOW: Option<RefreshTier> = Some(RefreshTier::Low);
const STATIC: Option<RefreshTier> = None;

fn num(name: &'static str, unit: &'static str, role: &'static str) -> Meta {
    Meta::number(name, unit, role)
}

pub fn battery_running_state(code: f64) -> Value {
    let label = match code as i64 {
        0 => "offline",
        1 => "standby",
        2 => "running",
        3 => "fault",
        4 => "sleep mode",
        _ => "unknown",
    };
    Value::Text(label.to_string())
}

/// Voltage, current and power fields of the first `count` PV strings.
pub fn pv_strings(count: usize) -> Vec<Field> {
    (0..count.min(MAX_PV_STRINGS))
        .flat_map(|i| {
            let n = i + 1;
            let address = 32016 + 2 * i as u16;
            [
                Field::register(
                    format!("string.PV{n}Voltage"),
                    num("string voltage", "V", "value.voltage"),
                    address,
                    DataType::Int16,
                )
                .gain(10),
                Field::register(
                    format!("string.PV{n}Current"),
                    num("string current", "A", "value.current"),
                    address + 1,
                    DataType::Int16,
                )
                .gain(100),
                Field::derived(
                    format!("string.PV{n}Power"),
                    num("string power", "W", "value.power"),
                ),
            ]
        })
        .collect()
}

pub fn sun2000() -> Vec<RegisterBlock> {
    vec![
        RegisterBlock::new(37765, 2, "Battery Charge And Discharge Power", HIGH, DeviceClass::Battery)
            .fields(vec![
                Field::register(
                    "battery.chargeDischargePower",
                    num("Charge/Discharge power", "kW", "value.power"),
                    37765,
                    DataType::Int32,
                )
                .gain(1000)
                .force_persist(),
            ]),
        RegisterBlock::new(32080, 2, "Inverter Active Power", HIGH, DeviceClass::Inverter).fields(vec![
            Field::register(
                "activePower",
                num("Active power", "kW", "value.power.active"),
                32080,
                DataType::Int32,
            )
            .gain(1000)
            .force_persist(),
        ]),
        RegisterBlock::new(32064, 2, "Input Power", HIGH, DeviceClass::Inverter)
            .fields(vec![
                Field::register(
                    "inputPower",
                    num("Input power", "kW", "value.power.produced"),
                    32064,
                    DataType::Int32,
                )
                .gain(1000)
                .force_persist(),
                Field::derived(
                    "derived.inputPowerWithEfficiencyLoss",
                    num("input power with efficiency loss", "kW", "value.power"),
                ),
                Field::derived(
                    "derived.dailySolarYield",
                    num("Solar Yield Today", "kWh", "value.power.consumption"),
                ),
            ])
            .post_hook(hooks::input_power),
        RegisterBlock::new(37113, 2, "meter active power", HIGH, DeviceClass::Meter).fields(vec![
            Field::register(
                "meter.activePower",
                num("ActivePower", "kW", "value.power.active"),
                37113,
                DataType::Int32,
            )
            .gain(1000),
        ]),
        RegisterBlock::new(37000, 68, "battery information", LOW, DeviceClass::Battery).fields(vec![
            Field::register(
                "battery.maximumChargePower",
                num("MaximumChargePower", "W", "value.power"),
                37046,
                DataType::Uint32,
            ),
            Field::register(
                "battery.maximumDischargePower",
                num("MaximumDischargePower", "W", "value.power"),
                37048,
                DataType::Uint32,
            ),
        ]),
        RegisterBlock::new(30000, 81, "model info, SN, max Power (static info)", STATIC, DeviceClass::Inverter)
            .fields(vec![
                Field::register("info.model", Meta::text("Model", "info.name"), 30000, DataType::String(15)),
                Field::register(
                    "info.modelID",
                    num("Model ID", "", "info.hardware"),
                    30070,
                    DataType::Uint16,
                ),
                Field::register(
                    "info.serialNumber",
                    Meta::text("Serial number", "info.serial"),
                    30015,
                    DataType::String(10),
                ),
                Field::register(
                    "info.ratedPower",
                    num("Rated power", "kW", "value.power"),
                    30073,
                    DataType::Int32,
                )
                .gain(1000),
                Field::register(
                    "info.numberPVStrings",
                    num("Number of PV Strings", "", "value"),
                    30071,
                    DataType::Uint16,
                ),
                Field::register(
                    "info.numberMPPTrackers",
                    num("Number of MPP trackers", "", "value"),
                    30072,
                    DataType::Uint16,
                ),
            ]),
        RegisterBlock::new(47081, 8, "battery settings", LOW, DeviceClass::Battery).fields(vec![
            Field::register(
                "battery.chargingCutoffCapacity",
                num("Charging Cutoff Capacity", "%", "value"),
                47081,
                DataType::Uint16,
            )
            .gain(10),
            Field::register(
                "battery.dischargeCutoffCapacity",
                num("Discharge Cutoff Capacity", "%", "value"),
                47082,
                DataType::Uint16,
            )
            .gain(10),
            Field::register(
                "battery.forcedChargeDischargePeriod",
                num("Forced Charge Discharge Period", "mins", "value"),
                47083,
                DataType::Uint16,
            ),
            Field::register(
                "battery.workingModeSettings",
                num("Working Mode Settings", "", "value"),
                47086,
                DataType::Uint16,
            ),
            Field::register(
                "battery.chargeFromGridFunction",
                num("Charge From Grid Function", "", "value"),
                47087,
                DataType::Uint16,
            ),
            Field::register(
                "battery.gridChargeCutoffSOC",
                num("Grid Charge Cutoff SOC", "%", "value"),
                47088,
                DataType::Uint16,
            )
            .gain(10),
        ]),
        inverter_status(),
        meter_info(),
        RegisterBlock::new(37200, 3, "optimizer info (static info)", STATIC, DeviceClass::Inverter).fields(vec![
            Field::register(
                "optimizer.optimizerTotalNumber",
                num("Optimizer Total Number", "", "value"),
                37200,
                DataType::Int16,
            ),
            Field::register(
                "optimizer.optimizerOnlineNumber",
                num("Optimizer Online Number", "", "value"),
                37201,
                DataType::Int16,
            ),
            Field::register(
                "optimizer.optimizerFeatureData",
                num("Optimizer Feature Data", "", "value"),
                37202,
                DataType::Int16,
            ),
        ]),
        battery_status(),
    ]
}

fn inverter_status() -> RegisterBlock {
    let u16_field = |key: &'static str, name: &'static str, address: u16| {
        Field::register(key, num(name, "", "value"), address, DataType::Uint16)
    };
    let grid_voltage = |key: &'static str, name: &'static str, address: u16| {
        Field::register(key, num(name, "V", "value.voltage"), address, DataType::Uint16).gain(10)
    };
    let grid_current = |key: &'static str, name: &'static str, address: u16| {
        Field::register(key, num(name, "A", "value.current"), address, DataType::Int32).gain(1000)
    };

    RegisterBlock::new(32000, 116, "inverter status", LOW, DeviceClass::Inverter)
        .fields(vec![
            u16_field("state1", "State 1", 32000),
            u16_field("state2", "State 2", 32001),
            u16_field("state3", "State 3", 32002),
            u16_field("alarm1", "Alarm 1", 32008),
            u16_field("alarm2", "Alarm 2", 32009),
            u16_field("alarm3", "Alarm 3", 32010),
            grid_voltage("grid.voltageL1-L2", "Voltage L1-L2", 32066),
            grid_voltage("grid.voltageL2-L3", "Voltage L2-L3", 32067),
            grid_voltage("grid.voltageL3-L1", "Voltage L3-L1", 32068),
            grid_voltage("grid.voltageL1", "Voltage L1", 32069),
            grid_voltage("grid.voltageL2", "Voltage L2", 32070),
            grid_voltage("grid.voltageL3", "Voltage L3", 32071),
            grid_current("grid.currentL1", "Current L1", 32072),
            grid_current("grid.currentL2", "Current L2", 32074),
            grid_current("grid.currentL3", "Current L3", 32076),
            Field::register(
                "peakActivePowerCurrentDay",
                num("Peak active power of current day", "kW", "value.power.max"),
                32078,
                DataType::Int32,
            )
            .gain(1000),
            Field::register(
                "reactivePower",
                num("Reactive Power", "kVar", "value.power.reactive"),
                32082,
                DataType::Int32,
            )
            .gain(1000),
            Field::register("powerFactor", num("Power Factor", "", "value"), 32084, DataType::Int16)
                .gain(1000),
            Field::register(
                "grid.frequency",
                num("Grid Frequency", "Hz", "value.frequency"),
                32085,
                DataType::Uint16,
            )
            .gain(100),
            Field::register("efficiency", num("Efficiency", "%", "value"), 32086, DataType::Uint16)
                .gain(100),
            Field::register(
                "internalTemperature",
                num("Internal temperature", "°C", "value.temperature"),
                32087,
                DataType::Int16,
            )
            .gain(10),
            Field::register(
                "insulationResistance",
                num("Insulation Resistance", "MOhm", "value"),
                32088,
                DataType::Uint16,
            )
            .gain(1000),
            u16_field("deviceStatus", "Device Status", 32089),
            u16_field("faultCode", "Fault Code", 32090),
            Field::register("startupTime", num("Startup Time", "", "value.time"), 32091, DataType::Uint32),
            Field::register("shutdownTime", num("Shutdown Time", "", "value.time"), 32093, DataType::Uint32),
            Field::register(
                "accumulatedEnergyYield",
                num("Accumulated Energy Yield", "kWh", "value.power.produced"),
                32106,
                DataType::Uint32,
            )
            .gain(100),
            Field::register(
                "dailyEnergyYield",
                num("Daily Energy Yield", "kWh", "value.power.produced"),
                32114,
                DataType::Uint32,
            )
            .gain(100),
        ])
        .expansion("info.numberPVStrings", pv_strings)
        .post_hook(hooks::pv_string_power)
}

fn meter_info() -> RegisterBlock {
    let int32 = |key: &'static str, meta: Meta, address: u16, gain: u32| {
        Field::register(key, meta, address, DataType::Int32).gain(gain)
    };

    // activePowerL3 ends at 37138
    RegisterBlock::new(37100, 38, "meter info", LOW, DeviceClass::Meter).fields(vec![
        Field::register("meter.status", num("Meter Status", "", "value"), 37100, DataType::Uint16),
        int32("meter.voltageL1", num("Phase 1 voltage", "V", "value.voltage"), 37101, 10),
        int32("meter.voltageL2", num("Phase 2 voltage", "V", "value.voltage"), 37103, 10),
        int32("meter.voltageL3", num("Phase 3 voltage", "V", "value.voltage"), 37105, 10),
        int32("meter.currentL1", num("Phase 1 Current", "A", "value.current"), 37107, 100),
        int32("meter.currentL2", num("Phase 2 Current", "A", "value.current"), 37109, 100),
        int32("meter.currentL3", num("Phase 3 Current", "A", "value.current"), 37111, 100),
        int32("meter.reactivePower", num("Reactive Power", "VAr", "value.power.reactive"), 37115, 1),
        Field::register("meter.powerFactor", num("Power Factor", "", "value"), 37117, DataType::Int16)
            .gain(1000),
        Field::register(
            "meter.gridFrequency",
            num("Grid Frequency", "Hz", "value.frequency"),
            37118,
            DataType::Int16,
        )
        .gain(100),
        int32(
            "meter.positiveActiveEnergy",
            num("Positive Active Energy", "kWh", "value.power.consumption"),
            37119,
            100,
        ),
        int32(
            "meter.reverseActiveEnergy",
            num("Reverse Active Energy", "kWh", "value.power.consumption"),
            37121,
            100,
        ),
        int32(
            "meter.accumulatedReactivePower",
            num("Accumulated Reactive Power", "kVarh", "value.power.reactive.consumption"),
            37123,
            100,
        ),
        int32("meter.voltageL1-L2", num("Voltage L1-L2", "V", "value.voltage"), 37126, 10),
        int32("meter.voltageL2-L3", num("Voltage L2-L3", "V", "value.voltage"), 37128, 10),
        int32("meter.voltageL3-L1", num("Voltage L3-L1", "V", "value.voltage"), 37130, 10),
        int32("meter.activePowerL1", num("Active Power L1", "W", "value.power"), 37132, 1),
        int32("meter.activePowerL2", num("Active Power L2", "W", "value.power"), 37134, 1),
        int32("meter.activePowerL3", num("Active Power L3", "W", "value.power"), 37136, 1),
    ])
}

fn battery_status() -> RegisterBlock {
    let energy = |key: &'static str, name: &'static str, address: u16| {
        Field::register(key, num(name, "kWh", "value.power.consumption"), address, DataType::Uint32)
            .gain(100)
    };

    RegisterBlock::new(37700, 100, "battery information", LOW, DeviceClass::Battery).fields(vec![
        Field::register(
            "battery.ratedCapacity",
            num("Rated Capacity", "Wh", "value.capacity"),
            37758,
            DataType::Uint32,
        ),
        Field::register(
            "battery.SOC",
            num("State of capacity", "%", "value.battery"),
            37760,
            DataType::Uint16,
        )
        .gain(10),
        Field::register(
            "battery.runningState",
            Meta::text("Running state", "value"),
            37762,
            DataType::Uint16,
        )
        .mapper(battery_running_state),
        Field::register(
            "battery.busVoltage",
            num("Bus Voltage", "V", "value.voltage"),
            37763,
            DataType::Uint16,
        )
        .gain(10),
        Field::register(
            "battery.busCurrent",
            num("Bus Current", "A", "value.current"),
            37764,
            DataType::Uint16,
        )
        .gain(10),
        energy("battery.totalCharge", "Total Charge", 37780),
        energy("battery.totalDischarge", "Total Discharge", 37782),
        energy("battery.currentDayChargeCapacity", "Current Day Charge Capacity", 37784),
        energy("battery.currentDayDischargeCapacity", "Current Day Discharge Capacity", 37786),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_block_is_consistent() {
        for block in sun2000() {
            block.validate().unwrap();
        }
    }

    #[test]
    fn all_strings_fit_the_status_block() {
        let status = inverter_status();
        let strings = pv_strings(MAX_PV_STRINGS);
        assert_eq!(strings.len(), 3 * MAX_PV_STRINGS);
        status.check_fields(&strings).unwrap();
    }

    #[test]
    fn string_expansion_follows_register_pairs() {
        let strings = pv_strings(2);
        let addresses: Vec<_> = strings
            .iter()
            .filter_map(|f| f.source.map(|s| (f.key.to_string(), s.address)))
            .collect();
        assert_eq!(
            addresses,
            vec![
                ("string.PV1Voltage".to_string(), 32016),
                ("string.PV1Current".to_string(), 32017),
                ("string.PV2Voltage".to_string(), 32018),
                ("string.PV2Current".to_string(), 32019),
            ]
        );
        assert_eq!(pv_strings(1000).len(), 3 * MAX_PV_STRINGS);
    }

    #[test]
    fn keys_are_unique() {
        let mut keys = std::collections::HashSet::new();
        for block in sun2000() {
            for field in &block.fields {
                assert!(keys.insert(field.key.to_string()), "duplicate {}", field.key);
            }
        }
    }

    #[test]
    fn running_state_labels() {
        assert_eq!(battery_running_state(2.0), Value::Text("running".to_string()));
        assert_eq!(battery_running_state(9.0), Value::Text("unknown".to_string()));
    }
}
