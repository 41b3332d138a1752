use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::registers::RegisterMap;

// --------------------------------------------------------------------------------------------------------------
// Maps device-local register ids to standardized field names using each
// register's optional `standard_id`. Built once from a register map and
// reused for every poll; `map_to_standard` is a pure, idempotent function of
// its input.
// --------------------------------------------------------------------------------------------------------------

pub struct TelemetryMapper {
    device_to_standard: HashMap<String, String>,
    standard_to_device: HashMap<String, Vec<String>>,
}

impl TelemetryMapper {
    pub fn from_register_map(map: &RegisterMap) -> Self {
        let mut device_to_standard = HashMap::new();
        let mut standard_to_device: HashMap<String, Vec<String>> = HashMap::new();

        for reg in map.all() {
            let standard = reg.standard_field().to_string();
            device_to_standard.insert(reg.id.clone(), standard.clone());
            let devices = standard_to_device.entry(standard).or_default();
            if !devices.contains(&reg.id) {
                devices.push(reg.id.clone());
            }
        }

        log::debug!(
            "built telemetry mappings: {} device fields -> {} standard fields",
            device_to_standard.len(),
            standard_to_device.len()
        );

        Self { device_to_standard, standard_to_device }
    }

    pub fn get_standard_field(&self, device_field: &str) -> &str {
        self.device_to_standard.get(device_field).map(String::as_str).unwrap_or(device_field)
    }

    pub fn get_device_fields(&self, standard_field: &str) -> &[String] {
        self.standard_to_device.get(standard_field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Converts a device-specific dict to standardized field names. The
    /// original dict is always preserved under `extra`, even for keys that
    /// already matched a standard name - downstream specializations rely on
    /// being able to reach raw device keys.
    pub fn map_to_standard(&self, device_data: &Map<String, Value>) -> Map<String, Value> {
        let mut standardized = Map::new();
        for (device_key, value) in device_data {
            let standard_key = self.get_standard_field(device_key).to_string();
            standardized.insert(standard_key, value.clone());
        }

        let extra = standardized.entry("extra".to_string()).or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(extra_map) = extra {
            for (k, v) in device_data {
                extra_map.insert(k.clone(), v.clone());
            }
        }

        standardized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{ReadWrite, RegisterDescriptor, RegisterKind, RegisterType};

    fn reg(id: &str, standard_id: Option<&str>) -> RegisterDescriptor {
        RegisterDescriptor {
            id: id.to_string(),
            standard_id: standard_id.map(str::to_string),
            addr: 0,
            size: 1,
            kind: RegisterKind::Holding,
            value_type: RegisterType::U16,
            scale: None,
            unit: None,
            encoder: None,
            enum_map: None,
            bit_enum: None,
            bitmask: None,
            higher_bits: None,
            rw: ReadWrite::RO,
            min: None,
            max: None,
        }
    }

    // Invariant 5: mapper preservation - every original key survives in `extra`.
    #[test]
    fn mapper_preserves_original_keys() {
        let map = RegisterMap::from_registers(vec![reg("vbat", Some("batt_voltage_v")), reg("soc", None)]).unwrap();
        let mapper = TelemetryMapper::from_register_map(&map);

        let mut device_data = Map::new();
        device_data.insert("vbat".to_string(), Value::from(51.2));
        device_data.insert("soc".to_string(), Value::from(80));

        let out = mapper.map_to_standard(&device_data);
        assert_eq!(out.get("batt_voltage_v").unwrap().as_f64().unwrap(), 51.2);
        assert_eq!(out.get("soc").unwrap().as_i64().unwrap(), 80);

        let extra = out.get("extra").unwrap().as_object().unwrap();
        for (k, v) in &device_data {
            assert_eq!(extra.get(k).unwrap(), v);
        }
    }
}
