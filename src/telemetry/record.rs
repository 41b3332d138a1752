use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

// --------------------------------------------------------------------------------------------------------------
// Standardized field names. These used to live as a module-level dispatch
// table in the source tool; here they are just string constants used by
// adapters to populate `Telemetry` and by register maps via `standard_id`.
// --------------------------------------------------------------------------------------------------------------

pub mod fields {
    pub const TS: &str = "ts";

    pub const PV_POWER_W: &str = "pv_power_w";
    pub const PV1_POWER_W: &str = "pv1_power_w";
    pub const PV2_POWER_W: &str = "pv2_power_w";
    pub const PV3_POWER_W: &str = "pv3_power_w";
    pub const PV4_POWER_W: &str = "pv4_power_w";
    pub const LOAD_POWER_W: &str = "load_power_w";
    pub const GRID_POWER_W: &str = "grid_power_w";
    pub const BATT_POWER_W: &str = "batt_power_w";

    pub const LOAD_L1_POWER_W: &str = "load_l1_power_w";
    pub const LOAD_L2_POWER_W: &str = "load_l2_power_w";
    pub const LOAD_L3_POWER_W: &str = "load_l3_power_w";
    pub const LOAD_L1_VOLTAGE_V: &str = "load_l1_voltage_v";
    pub const LOAD_L2_VOLTAGE_V: &str = "load_l2_voltage_v";
    pub const LOAD_L3_VOLTAGE_V: &str = "load_l3_voltage_v";
    pub const LOAD_L1_CURRENT_A: &str = "load_l1_current_a";
    pub const LOAD_L2_CURRENT_A: &str = "load_l2_current_a";
    pub const LOAD_L3_CURRENT_A: &str = "load_l3_current_a";
    pub const LOAD_FREQUENCY_HZ: &str = "load_frequency_hz";

    pub const GRID_L1_POWER_W: &str = "grid_l1_power_w";
    pub const GRID_L2_POWER_W: &str = "grid_l2_power_w";
    pub const GRID_L3_POWER_W: &str = "grid_l3_power_w";
    pub const GRID_L1_VOLTAGE_V: &str = "grid_l1_voltage_v";
    pub const GRID_L2_VOLTAGE_V: &str = "grid_l2_voltage_v";
    pub const GRID_L3_VOLTAGE_V: &str = "grid_l3_voltage_v";
    pub const GRID_L1_CURRENT_A: &str = "grid_l1_current_a";
    pub const GRID_L2_CURRENT_A: &str = "grid_l2_current_a";
    pub const GRID_L3_CURRENT_A: &str = "grid_l3_current_a";
    pub const GRID_FREQUENCY_HZ: &str = "grid_frequency_hz";
    pub const GRID_LINE_VOLTAGE_AB_V: &str = "grid_line_voltage_ab_v";
    pub const GRID_LINE_VOLTAGE_BC_V: &str = "grid_line_voltage_bc_v";
    pub const GRID_LINE_VOLTAGE_CA_V: &str = "grid_line_voltage_ca_v";

    pub const BATT_SOC_PCT: &str = "batt_soc_pct";
    pub const BATT_VOLTAGE_V: &str = "batt_voltage_v";
    pub const BATT_CURRENT_A: &str = "batt_current_a";
    pub const BATT_TEMP_C: &str = "batt_temp_c";

    pub const INVERTER_MODE: &str = "inverter_mode";
    pub const INVERTER_TEMP_C: &str = "inverter_temp_c";
    pub const ERROR_CODE: &str = "error_code";

    pub const DEVICE_MODEL: &str = "device_model";
    pub const DEVICE_SERIAL_NUMBER: &str = "device_serial_number";
    pub const RATED_POWER_W: &str = "rated_power_w";

    pub const TODAY_ENERGY: &str = "today_energy";
    pub const TOTAL_ENERGY: &str = "total_energy";
    pub const TODAY_LOAD_ENERGY: &str = "today_load_energy";
    pub const TODAY_IMPORT_ENERGY: &str = "today_import_energy";
    pub const TODAY_EXPORT_ENERGY: &str = "today_export_energy";
    pub const TODAY_BATTERY_CHARGE_ENERGY: &str = "today_battery_charge_energy";
    pub const TODAY_BATTERY_DISCHARGE_ENERGY: &str = "today_battery_discharge_energy";
    pub const TODAY_PEAK_POWER: &str = "today_peak_power";

    pub const OFF_GRID_MODE: &str = "off_grid_mode";

    pub fn all() -> HashSet<&'static str> {
        [
            TS, PV_POWER_W, PV1_POWER_W, PV2_POWER_W, PV3_POWER_W, PV4_POWER_W, LOAD_POWER_W, GRID_POWER_W,
            BATT_POWER_W, LOAD_L1_POWER_W, LOAD_L2_POWER_W, LOAD_L3_POWER_W, LOAD_L1_VOLTAGE_V, LOAD_L2_VOLTAGE_V,
            LOAD_L3_VOLTAGE_V, LOAD_L1_CURRENT_A, LOAD_L2_CURRENT_A, LOAD_L3_CURRENT_A, LOAD_FREQUENCY_HZ,
            GRID_L1_POWER_W, GRID_L2_POWER_W, GRID_L3_POWER_W, GRID_L1_VOLTAGE_V, GRID_L2_VOLTAGE_V,
            GRID_L3_VOLTAGE_V, GRID_L1_CURRENT_A, GRID_L2_CURRENT_A, GRID_L3_CURRENT_A, GRID_FREQUENCY_HZ,
            GRID_LINE_VOLTAGE_AB_V, GRID_LINE_VOLTAGE_BC_V, GRID_LINE_VOLTAGE_CA_V, BATT_SOC_PCT, BATT_VOLTAGE_V,
            BATT_CURRENT_A, BATT_TEMP_C, INVERTER_MODE, INVERTER_TEMP_C, ERROR_CODE, DEVICE_MODEL,
            DEVICE_SERIAL_NUMBER, RATED_POWER_W, TODAY_ENERGY, TOTAL_ENERGY, TODAY_LOAD_ENERGY,
            TODAY_IMPORT_ENERGY, TODAY_EXPORT_ENERGY, TODAY_BATTERY_CHARGE_ENERGY, TODAY_BATTERY_DISCHARGE_ENERGY,
            TODAY_PEAK_POWER, OFF_GRID_MODE,
        ]
        .into_iter()
        .collect()
    }
}

/// One inverter/meter telemetry snapshot. Every standard field is optional:
/// absence means "unknown", never zero. `extra` always carries the full
/// device-local dict the adapter decoded this cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Telemetry {
    pub ts: Option<DateTime<Utc>>,

    pub pv_power_w: Option<f64>,
    pub pv1_power_w: Option<f64>,
    pub pv2_power_w: Option<f64>,
    pub pv3_power_w: Option<f64>,
    pub pv4_power_w: Option<f64>,
    pub load_power_w: Option<f64>,
    pub grid_power_w: Option<f64>,
    pub batt_power_w: Option<f64>,

    pub batt_soc_pct: Option<f64>,
    pub batt_voltage_v: Option<f64>,
    pub batt_current_a: Option<f64>,
    pub batt_temp_c: Option<f64>,

    pub inverter_temp_c: Option<f64>,
    pub inverter_mode: Option<String>,
    pub error_code: Option<String>,

    pub today_energy: Option<f64>,
    pub total_energy: Option<f64>,
    pub today_load_energy: Option<f64>,
    pub today_import_energy: Option<f64>,
    pub today_export_energy: Option<f64>,
    pub today_battery_charge_energy: Option<f64>,
    pub today_battery_discharge_energy: Option<f64>,

    pub off_grid_mode: Option<bool>,
    pub device_serial_number: Option<String>,

    // Populated only for three-phase adapters.
    pub phases: Option<ThreePhaseTelemetry>,

    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Telemetry {
    pub fn unreachable(error: impl Into<String>) -> Self {
        let mut t = Telemetry { ts: Some(Utc::now()), ..Default::default() };
        t.extra.insert("error".to_string(), Value::String(error.into()));
        t
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThreePhaseTelemetry {
    pub load_l1_power_w: Option<f64>,
    pub load_l2_power_w: Option<f64>,
    pub load_l3_power_w: Option<f64>,
    pub load_l1_voltage_v: Option<f64>,
    pub load_l2_voltage_v: Option<f64>,
    pub load_l3_voltage_v: Option<f64>,
    pub load_l1_current_a: Option<f64>,
    pub load_l2_current_a: Option<f64>,
    pub load_l3_current_a: Option<f64>,
    pub load_frequency_hz: Option<f64>,

    pub grid_l1_power_w: Option<f64>,
    pub grid_l2_power_w: Option<f64>,
    pub grid_l3_power_w: Option<f64>,
    pub grid_l1_voltage_v: Option<f64>,
    pub grid_l2_voltage_v: Option<f64>,
    pub grid_l3_voltage_v: Option<f64>,
    pub grid_l1_current_a: Option<f64>,
    pub grid_l2_current_a: Option<f64>,
    pub grid_l3_current_a: Option<f64>,
    pub grid_frequency_hz: Option<f64>,
    pub grid_line_voltage_ab_v: Option<f64>,
    pub grid_line_voltage_bc_v: Option<f64>,
    pub grid_line_voltage_ca_v: Option<f64>,
}

/// Per-cell reading inside a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellReading {
    pub power: u32, // 1-based pack/unit index
    pub cell: u32,  // 1-based cell index
    pub voltage_v: Option<f64>,
    pub temp_c: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CellStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub delta: Option<f64>,
}

/// One physical battery unit (pack) inside a bank.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnitTelemetry {
    pub power: u32,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub temp_c: Option<f64>,
    pub soc_pct: Option<f64>,
    pub soh_pct: Option<f64>,
    pub cycles: Option<u32>,
    pub voltage_stats: CellStats,
    pub temp_stats: CellStats,
}

/// Aggregate telemetry for a multi-pack battery bank.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatteryBankTelemetry {
    pub ts: Option<DateTime<Utc>>,
    pub batteries_count: u32,
    pub cells_per_battery: u32,
    pub avg_voltage_v: Option<f64>,
    pub total_current_a: Option<f64>,
    pub avg_temp_c: Option<f64>,
    pub avg_soc_pct: Option<f64>,
    pub power_w: Option<f64>,
    pub units: Vec<UnitTelemetry>,
    pub cells: Vec<CellReading>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl BatteryBankTelemetry {
    /// Recomputes bank-level aggregates from `units`. Called after every poll
    /// cycle so partial packs (a reconnect failure) still produce a sane bank summary.
    pub fn recompute_aggregates(&mut self) {
        self.batteries_count = self.units.len() as u32;
        let voltages: Vec<f64> = self.units.iter().filter_map(|u| u.voltage_v).collect();
        let temps: Vec<f64> = self.units.iter().filter_map(|u| u.temp_c).collect();
        let socs: Vec<f64> = self.units.iter().filter_map(|u| u.soc_pct).collect();
        let currents: Vec<f64> = self.units.iter().filter_map(|u| u.current_a).collect();

        self.avg_voltage_v = avg(&voltages);
        self.avg_temp_c = avg(&temps);
        self.avg_soc_pct = avg(&socs);
        self.total_current_a = if currents.is_empty() { None } else { Some(currents.iter().sum()) };
        self.power_w = match (self.avg_voltage_v, self.total_current_a) {
            (Some(v), Some(i)) => Some(v * i),
            _ => None,
        };
    }
}

fn avg(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Telemetry shape returned by pure energy-meter adapters (IAMMeter family).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeterTelemetry {
    pub ts: Option<DateTime<Utc>>,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub power_w: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub power_factor: Option<f64>,
    pub l1_voltage_v: Option<f64>,
    pub l2_voltage_v: Option<f64>,
    pub l3_voltage_v: Option<f64>,
    pub l1_current_a: Option<f64>,
    pub l2_current_a: Option<f64>,
    pub l3_current_a: Option<f64>,
    pub l1_power_w: Option<f64>,
    pub l2_power_w: Option<f64>,
    pub l3_power_w: Option<f64>,
    pub today_import_energy: Option<f64>,
    pub today_export_energy: Option<f64>,
    pub total_import_energy: Option<f64>,
    pub total_export_energy: Option<f64>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}
