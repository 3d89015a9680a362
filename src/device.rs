use crate::integrator::Integrator;
use crate::registers::DeviceClass;
use serde::Serialize;

/// One inverter (with its battery) behind the shared Modbus link.
#[derive(Debug, Clone)]
pub struct Device {
    pub index: usize,
    pub unit: u8,
    /// The grid meter is wired to the first inverter only.
    pub has_meter: bool,
    pub path: String,
    pub integrator: Integrator,
    /// Self-consumption subtracted per elapsed hour from the input yield.
    pub energy_loss_per_hour: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub index: usize,
    pub modbus_id: u8,
    pub meter: bool,
    pub path: String,
}

impl Device {
    pub fn new(index: usize, unit: u8) -> Self {
        Self {
            index,
            unit,
            has_meter: index == 0,
            path: format!("inverter.{index}"),
            integrator: Integrator::new(),
            energy_loss_per_hour: 0.0,
        }
    }

    /// One device per unit id, in the given order.
    pub fn from_units(units: &[u8]) -> Vec<Device> {
        units
            .iter()
            .enumerate()
            .map(|(index, unit)| Device::new(index, *unit))
            .collect()
    }

    /// Set the standby consumption subtracted per hour from the input yield.
    #[must_use]
    pub fn with_energy_loss(mut self, kwh_per_hour: f64) -> Self {
        self.energy_loss_per_hour = kwh_per_hour.max(0.0);
        self
    }

    /// Store key of a device-relative field. Meter values are shared and
    /// live at the root.
    pub fn key(&self, class: DeviceClass, field: &str) -> String {
        match class {
            DeviceClass::Meter => field.to_string(),
            DeviceClass::Inverter | DeviceClass::Battery => format!("{}.{}", self.path, field),
        }
    }

    pub fn inverter_key(&self, field: &str) -> String {
        self.key(DeviceClass::Inverter, field)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            modbus_id: self.unit,
            meter: self.has_meter,
            path: self.path.clone(),
        }
    }
}
