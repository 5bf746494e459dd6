//! # SDM630 Register Catalog
//!
//! Static description of every quantity the poller can read, grouped into
//! three selectable tiers:
//!
//! | Tier | Quantities | Content |
//! |------|------------|---------|
//! | `basic` | 14 | per-phase voltage, current, power; totals, frequency, energy |
//! | `basic_plus` | 24 | + apparent power, power factor, line voltages, neutral current |
//! | `full` | 79 | + reactive power, phase angles, demands, THD, per-phase energy |
//!
//! All SDM630 measurements are 32-bit floats, so every address is even.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bytes::WordOrder;
use crate::error::{ModbusError, ModbusResult};

/// Physical quantity of a register, as understood by display layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Voltage,
    Current,
    Power,
    ApparentPower,
    ReactivePower,
    PowerFactor,
    Frequency,
    Energy,
}

/// How consumers should aggregate a value over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    #[default]
    Measurement,
    Total,
    TotalIncreasing,
}

fn default_precision() -> u8 {
    2
}

/// One measurable quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub key: String,
    /// FC04 register offset of the high (AB) or low (BA) word.
    pub address: u16,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub device_class: Option<DeviceClass>,
    #[serde(default)]
    pub state_class: StateClass,
    /// Decimal places kept after decoding.
    #[serde(default = "default_precision")]
    pub precision: u8,
    #[serde(default)]
    pub word_order: WordOrder,
}

/// Named, ordered set of descriptors polled by one meter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSet {
    name: String,
    registers: Vec<RegisterDescriptor>,
    index: HashMap<String, usize>,
}

impl RegisterSet {
    /// Build a set, rejecting duplicate keys and odd addresses.
    pub fn new(name: impl Into<String>, registers: Vec<RegisterDescriptor>) -> ModbusResult<Self> {
        let name = name.into();
        let mut index = HashMap::with_capacity(registers.len());

        for (position, descriptor) in registers.iter().enumerate() {
            if descriptor.key.is_empty() {
                return Err(ModbusError::configuration(format!(
                    "Register set '{name}': descriptor at address {} has an empty key",
                    descriptor.address
                )));
            }
            if descriptor.address % 2 != 0 {
                return Err(ModbusError::configuration(format!(
                    "Register set '{name}': '{}' has odd address {} (floats occupy register pairs)",
                    descriptor.key, descriptor.address
                )));
            }
            if index.insert(descriptor.key.clone(), position).is_some() {
                return Err(ModbusError::configuration(format!(
                    "Register set '{name}': duplicate key '{}'",
                    descriptor.key
                )));
            }
        }

        let mut seen_addresses = HashMap::with_capacity(registers.len());
        for descriptor in &registers {
            if let Some(other) = seen_addresses.insert(descriptor.address, descriptor.key.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "Register set '{name}': '{}' and '{other}' share address {}",
                    descriptor.key, descriptor.address
                )));
            }
        }

        Ok(Self {
            name,
            registers,
            index,
        })
    }

    /// One of the built-in SDM630 tiers.
    pub fn tier(tier: RegisterTier) -> Self {
        let registers = match tier {
            RegisterTier::Basic => basic_registers(),
            RegisterTier::BasicPlus => basic_plus_registers(),
            RegisterTier::Full => full_registers(),
        };
        Self::from_static(tier.as_str(), registers)
    }

    // Built-in tables are covered by tests; a failure here is a programming error.
    fn from_static(name: &str, registers: Vec<RegisterDescriptor>) -> Self {
        let index = registers
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key.clone(), i))
            .collect();
        Self {
            name: name.to_string(),
            registers,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&RegisterDescriptor> {
        self.index.get(key).map(|&i| &self.registers[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Descriptors in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.registers.iter().map(|d| d.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// Built-in tier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTier {
    #[default]
    Basic,
    BasicPlus,
    Full,
}

impl RegisterTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::BasicPlus => "basic_plus",
            Self::Full => "full",
        }
    }
}

impl FromStr for RegisterTier {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "basic_plus" => Ok(Self::BasicPlus),
            "full" => Ok(Self::Full),
            other => Err(ModbusError::configuration(format!(
                "Unknown register set '{other}' (expected basic, basic_plus or full)"
            ))),
        }
    }
}

impl fmt::Display for RegisterTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Register Tables
// ============================================================================

fn reg(
    key: &str,
    address: u16,
    name: &str,
    unit: Option<&str>,
    device_class: Option<DeviceClass>,
    state_class: StateClass,
    precision: u8,
) -> RegisterDescriptor {
    RegisterDescriptor {
        key: key.to_string(),
        address,
        name: name.to_string(),
        unit: unit.map(str::to_string),
        device_class,
        state_class,
        precision,
        word_order: WordOrder::AB,
    }
}

use DeviceClass::*;
use StateClass::{Measurement, Total, TotalIncreasing};

fn basic_registers() -> Vec<RegisterDescriptor> {
    vec![
        reg("phase_1_l_n_volts", 0, "Phase 1 L/N Volts", Some("V"), Some(Voltage), Measurement, 2),
        reg("phase_2_l_n_volts", 2, "Phase 2 L/N Volts", Some("V"), Some(Voltage), Measurement, 2),
        reg("phase_3_l_n_volts", 4, "Phase 3 L/N Volts", Some("V"), Some(Voltage), Measurement, 2),
        reg("phase_1_current", 6, "Phase 1 Current", Some("A"), Some(Current), Measurement, 2),
        reg("phase_2_current", 8, "Phase 2 Current", Some("A"), Some(Current), Measurement, 2),
        reg("phase_3_current", 10, "Phase 3 Current", Some("A"), Some(Current), Measurement, 2),
        reg("phase_1_power", 12, "Phase 1 Power", Some("W"), Some(Power), Measurement, 2),
        reg("phase_2_power", 14, "Phase 2 Power", Some("W"), Some(Power), Measurement, 2),
        reg("phase_3_power", 16, "Phase 3 Power", Some("W"), Some(Power), Measurement, 2),
        reg("total_system_power", 52, "Total Power", Some("W"), Some(Power), Measurement, 2),
        reg("frequency", 70, "Frequency", Some("Hz"), Some(Frequency), Measurement, 2),
        reg("import_energy", 72, "Import Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("export_energy", 74, "Export Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("total_kwh", 342, "Total kWh", Some("kWh"), Some(Energy), Total, 2),
    ]
}

fn basic_plus_registers() -> Vec<RegisterDescriptor> {
    let mut registers = basic_registers();
    registers.extend([
        reg("phase_1_volt_amps", 18, "Phase 1 VA", Some("VA"), Some(ApparentPower), Measurement, 2),
        reg("phase_2_volt_amps", 20, "Phase 2 VA", Some("VA"), Some(ApparentPower), Measurement, 2),
        reg("phase_3_volt_amps", 22, "Phase 3 VA", Some("VA"), Some(ApparentPower), Measurement, 2),
        reg("phase_1_power_factor", 30, "Phase 1 Power Factor", None, Some(PowerFactor), Measurement, 3),
        reg("phase_2_power_factor", 32, "Phase 2 Power Factor", None, Some(PowerFactor), Measurement, 3),
        reg("phase_3_power_factor", 34, "Phase 3 Power Factor", None, Some(PowerFactor), Measurement, 3),
        reg("neutral_current", 224, "Neutral Current", Some("A"), Some(Current), Measurement, 2),
        reg("line_1_to_line_2_volts", 200, "Line 1 to Line 2 Volts", Some("V"), Some(Voltage), Measurement, 2),
        reg("line_2_to_line_3_volts", 202, "Line 2 to Line 3 Volts", Some("V"), Some(Voltage), Measurement, 2),
        reg("line_3_to_line_1_volts", 204, "Line 3 to Line 1 Volts", Some("V"), Some(Voltage), Measurement, 2),
    ]);
    registers
}

#[rustfmt::skip]
fn full_registers() -> Vec<RegisterDescriptor> {
    let mut registers = basic_plus_registers();
    registers.extend([
        reg("phase_1_volt_amps_reactive", 24, "Phase 1 Volt Amps Reactive", Some("VAr"), Some(ReactivePower), Measurement, 2),
        reg("phase_2_volt_amps_reactive", 26, "Phase 2 Volt Amps Reactive", Some("VAr"), Some(ReactivePower), Measurement, 2),
        reg("phase_3_volt_amps_reactive", 28, "Phase 3 Volt Amps Reactive", Some("VAr"), Some(ReactivePower), Measurement, 2),
        reg("phase_1_phase_angle", 36, "Phase 1 Phase Angle", Some("deg"), None, Measurement, 2),
        reg("phase_2_phase_angle", 38, "Phase 2 Phase Angle", Some("deg"), None, Measurement, 2),
        reg("phase_3_phase_angle", 40, "Phase 3 Phase Angle", Some("deg"), None, Measurement, 2),
        reg("average_line_to_neutral_volts", 42, "Average Line to Neutral Volts", Some("V"), Some(Voltage), Measurement, 2),
        reg("average_line_current", 46, "Average Line Current", Some("A"), Some(Current), Measurement, 2),
        reg("sum_of_line_currents", 48, "Sum of Line Currents", Some("A"), Some(Current), Measurement, 2),
        reg("total_system_volt_amps", 56, "Total System Volt Amps", Some("VA"), Some(ApparentPower), Measurement, 2),
        reg("total_system_var", 60, "Total System VAr", Some("VAr"), Some(ReactivePower), Measurement, 2),
        reg("total_system_power_factor", 62, "Total System Power Factor", None, Some(PowerFactor), Measurement, 3),
        reg("total_system_phase_angle", 66, "Total System Phase Angle", Some("deg"), None, Measurement, 2),
        reg("import_varh_since_last_reset", 76, "Import VArh Since Last Reset", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("export_varh_since_last_reset", 78, "Export VArh Since Last Reset", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("vah_since_last_reset", 80, "VAh Since Last Reset", Some("kVAh"), Some(Energy), TotalIncreasing, 2),
        reg("ah_since_last_reset", 82, "Ah Since Last Reset", Some("Ah"), None, TotalIncreasing, 2),
        reg("total_system_power_demand", 84, "Total System Power Demand", Some("W"), Some(Power), Measurement, 2),
        reg("maximum_total_system_power_demand", 86, "Maximum Total System Power Demand", Some("W"), Some(Power), Measurement, 2),
        reg("total_system_va_demand", 100, "Total System VA Demand", Some("VA"), Some(ApparentPower), Measurement, 2),
        reg("maximum_total_system_va_demand", 102, "Maximum Total System VA Demand", Some("VA"), Some(ApparentPower), Measurement, 2),
        reg("neutral_current_demand", 104, "Neutral Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("maximum_neutral_current_demand", 106, "Maximum Neutral Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("phase_1_l_n_volts_thd", 234, "Phase 1 L/N Volts THD", Some("%"), None, Measurement, 2),
        reg("phase_2_l_n_volts_thd", 236, "Phase 2 L/N Volts THD", Some("%"), None, Measurement, 2),
        reg("phase_3_l_n_volts_thd", 238, "Phase 3 L/N Volts THD", Some("%"), None, Measurement, 2),
        reg("phase_1_current_thd", 240, "Phase 1 Current THD", Some("%"), None, Measurement, 2),
        reg("phase_2_current_thd", 242, "Phase 2 Current THD", Some("%"), None, Measurement, 2),
        reg("phase_3_current_thd", 244, "Phase 3 Current THD", Some("%"), None, Measurement, 2),
        reg("average_line_to_neutral_volts_thd", 248, "Average Line to Neutral Volts THD", Some("%"), None, Measurement, 2),
        reg("average_line_current_thd", 250, "Average Line Current THD", Some("%"), None, Measurement, 2),
        reg("total_system_power_factor_5", 254, "Total System Power Factor (5)", Some("deg"), None, Measurement, 2),
        reg("phase_1_current_demand", 258, "Phase 1 Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("phase_2_current_demand", 260, "Phase 2 Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("phase_3_current_demand", 262, "Phase 3 Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("maximum_phase_1_current_demand", 264, "Maximum Phase 1 Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("maximum_phase_2_current_demand", 266, "Maximum Phase 2 Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("maximum_phase_3_current_demand", 268, "Maximum Phase 3 Current Demand", Some("A"), Some(Current), Measurement, 2),
        reg("line_1_to_line_2_volts_thd", 334, "Line 1 to Line 2 Volts THD", Some("%"), None, Measurement, 2),
        reg("line_2_to_line_3_volts_thd", 336, "Line 2 to Line 3 Volts THD", Some("%"), None, Measurement, 2),
        reg("line_3_to_line_1_volts_thd", 338, "Line 3 to Line 1 Volts THD", Some("%"), None, Measurement, 2),
        reg("average_line_to_line_volts_thd", 340, "Average Line to Line Volts THD", Some("%"), None, Measurement, 2),
        reg("total_kvarh", 344, "Total kVArh", Some("kVArh"), Some(Energy), Total, 2),
        reg("l1_import_active_energy", 346, "L1 Import Active Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("l2_import_active_energy", 348, "L2 Import Active Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("l3_import_active_energy", 350, "L3 Import Active Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("l1_export_active_energy", 352, "L1 Export Active Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("l2_export_active_energy", 354, "L2 Export Active Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("l3_export_active_energy", 356, "L3 Export Active Energy", Some("kWh"), Some(Energy), TotalIncreasing, 2),
        reg("l1_total_active_energy", 358, "L1 Total Active Energy", Some("kWh"), Some(Energy), Total, 2),
        reg("l2_total_active_energy", 360, "L2 Total Active Energy", Some("kWh"), Some(Energy), Total, 2),
        reg("l3_total_active_energy", 362, "L3 Total Active Energy", Some("kWh"), Some(Energy), Total, 2),
        reg("l1_import_reactive_energy", 364, "L1 Import Reactive Energy", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("l2_import_reactive_energy", 366, "L2 Import Reactive Energy", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("l3_import_reactive_energy", 368, "L3 Import Reactive Energy", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("l1_export_reactive_energy", 370, "L1 Export Reactive Energy", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("l2_export_reactive_energy", 372, "L2 Export Reactive Energy", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("l3_export_reactive_energy", 374, "L3 Export Reactive Energy", Some("kVArh"), Some(Energy), TotalIncreasing, 2),
        reg("l1_total_reactive_energy", 376, "L1 Total Reactive Energy", Some("kVArh"), Some(Energy), Total, 2),
        reg("l2_total_reactive_energy", 378, "L2 Total Reactive Energy", Some("kVArh"), Some(Energy), Total, 2),
        reg("l3_total_reactive_energy", 380, "L3 Total Reactive Energy", Some("kVArh"), Some(Energy), Total, 2),
    ]);
    registers
}
