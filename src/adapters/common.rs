use serde_json::{Map, Value};

use crate::telemetry::{fields, Telemetry};

// --------------------------------------------------------------------------------------------------------------
// Small helpers shared by the register-driven inverter adapters. Nothing
// here talks to a transport - it only shuffles already-decoded values
// around, which is why it is plain functions rather than another trait.
// --------------------------------------------------------------------------------------------------------------

pub fn as_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64)
}

pub fn as_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str).map(str::to_string)
}

pub fn as_bool(v: Option<&Value>) -> Option<bool> {
    v.and_then(Value::as_bool)
}

/// Builds the scalar/common portion of a `Telemetry` record from an
/// already-standardized device dict. Per-phase and adapter-specific derived
/// fields are layered on by the caller afterwards.
pub fn base_telemetry_from_standard(standard: &Map<String, Value>) -> Telemetry {
    let mut t = Telemetry { ts: Some(chrono::Utc::now()), ..Default::default() };

    t.pv_power_w = as_f64(standard.get(fields::PV_POWER_W));
    t.pv1_power_w = as_f64(standard.get(fields::PV1_POWER_W));
    t.pv2_power_w = as_f64(standard.get(fields::PV2_POWER_W));
    t.pv3_power_w = as_f64(standard.get(fields::PV3_POWER_W));
    t.pv4_power_w = as_f64(standard.get(fields::PV4_POWER_W));
    t.load_power_w = as_f64(standard.get(fields::LOAD_POWER_W));
    t.grid_power_w = as_f64(standard.get(fields::GRID_POWER_W));
    t.batt_power_w = as_f64(standard.get(fields::BATT_POWER_W));

    t.batt_soc_pct = as_f64(standard.get(fields::BATT_SOC_PCT));
    t.batt_voltage_v = as_f64(standard.get(fields::BATT_VOLTAGE_V));
    t.batt_current_a = as_f64(standard.get(fields::BATT_CURRENT_A));
    t.batt_temp_c = as_f64(standard.get(fields::BATT_TEMP_C));

    t.inverter_temp_c = as_f64(standard.get(fields::INVERTER_TEMP_C));
    t.inverter_mode = as_str(standard.get(fields::INVERTER_MODE));
    t.error_code = as_str(standard.get(fields::ERROR_CODE));

    t.today_energy = as_f64(standard.get(fields::TODAY_ENERGY));
    t.total_energy = as_f64(standard.get(fields::TOTAL_ENERGY));
    t.today_load_energy = as_f64(standard.get(fields::TODAY_LOAD_ENERGY));
    t.today_import_energy = as_f64(standard.get(fields::TODAY_IMPORT_ENERGY));
    t.today_export_energy = as_f64(standard.get(fields::TODAY_EXPORT_ENERGY));
    t.today_battery_charge_energy = as_f64(standard.get(fields::TODAY_BATTERY_CHARGE_ENERGY));
    t.today_battery_discharge_energy = as_f64(standard.get(fields::TODAY_BATTERY_DISCHARGE_ENERGY));

    t.off_grid_mode = as_bool(standard.get(fields::OFF_GRID_MODE));
    t.device_serial_number = as_str(standard.get(fields::DEVICE_SERIAL_NUMBER));

    if let Some(Value::Object(extra)) = standard.get("extra") {
        t.extra = extra.clone();
    }

    t
}

/// Sums whichever per-MPPT power fields are present, when the device has no
/// single combined PV power register.
pub fn sum_mppt_power(standard: &Map<String, Value>) -> Option<f64> {
    let parts: Vec<f64> = [fields::PV1_POWER_W, fields::PV2_POWER_W, fields::PV3_POWER_W, fields::PV4_POWER_W]
        .iter()
        .filter_map(|k| as_f64(standard.get(*k)))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.iter().sum())
    }
}

/// Bit 2 of a raw grid-status word indicates the grid relay is open
/// (off-grid / islanded operation).
pub fn off_grid_from_status_bit(raw: i64) -> bool {
    raw & 0b0100 != 0
}

/// First nonzero of up to four raw fault words becomes `"F<i>:<hex>"`
/// (1-based word index). Returns `None` if every word is zero.
pub fn decode_fault_words(words: &[i64]) -> Option<String> {
    words
        .iter()
        .enumerate()
        .find(|(_, w)| **w != 0)
        .map(|(i, w)| format!("F{}:{:X}", i + 1, w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_word_decode_picks_first_nonzero() {
        assert_eq!(decode_fault_words(&[0, 0, 0x12, 0]), Some("F3:12".to_string()));
        assert_eq!(decode_fault_words(&[0, 0, 0, 0]), None);
    }

    #[test]
    fn off_grid_bit_detection() {
        assert!(off_grid_from_status_bit(0b0100));
        assert!(!off_grid_from_status_bit(0b1011));
    }
}
