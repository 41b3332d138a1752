use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::capability::TouWindowCapability;
use crate::error::DeviceResult;
use crate::modbus_session::{ExecutorContext, ModbusRegisterTransport, ModbusSession};
use crate::registers::{read_all_registers_chunked, RegisterMap};
use crate::telemetry::MeterTelemetry;
use crate::transport::TcpConnector;

use super::command::{Command, CommandResponse};
use super::traits::{Adapter, MeterAdapter};

// --------------------------------------------------------------------------------------------------------------
// IAMMeter Wi-Fi energy meter over Modbus/TCP, read-only. These devices
// expose the same readings under two overlapping register families: a
// small "legacy" set near the start of the map, and a richer "extended"
// set further up. Both can be present on the same device at once, and on
// some firmware the extended registers read back as a valid-looking zero
// when the feature isn't actually supported - so "prefer extended" still
// needs a legacy fallback whenever extended comes back zero, not just missing.
// --------------------------------------------------------------------------------------------------------------

pub struct IamMeterAdapter {
    map: RegisterMap,
    session: Arc<ModbusSession>,
    ctx: ExecutorContext,
    prefer_legacy_registers: bool,
    energy: Mutex<DailyEnergyState>,
}

#[derive(Default)]
struct DailyEnergyState {
    last_day: Option<DateTime<Utc>>,
    last_forward_kwh: Option<f64>,
    last_reverse_kwh: Option<f64>,
    daily_forward_wh: f64,
    daily_reverse_wh: f64,
}

impl IamMeterAdapter {
    pub fn new(register_map_file: &str, addr: SocketAddr, unit_id: u8, prefer_legacy_registers: bool) -> DeviceResult<Self> {
        let map = RegisterMap::load(register_map_file)?;
        let connector = Arc::new(TcpConnector { addr, unit_id });
        let session = Arc::new(ModbusSession::new(connector));
        Ok(Self { map, session, ctx: ExecutorContext::new(), prefer_legacy_registers, energy: Mutex::new(DailyEnergyState::default()) })
    }

    fn transport(&self) -> ModbusRegisterTransport {
        ModbusRegisterTransport { session: self.session.clone(), ctx: self.ctx }
    }

    /// Looks up `ids` in priority order and returns the first value passing
    /// `accept` (non-zero for fields where extended registers silently read
    /// back zero when unsupported; any numeric value otherwise).
    fn pick_first(device_dict: &serde_json::Map<String, Value>, ids: &[&str], accept_zero: bool) -> Option<f64> {
        for id in ids {
            if let Some(v) = device_dict.get(*id).and_then(Value::as_f64) {
                if accept_zero || v != 0.0 {
                    return Some(v);
                }
            }
        }
        None
    }

    fn priority<'a>(&self, legacy_first: &'a [&'a str], extended_first: &'a [&'a str]) -> &'a [&'a str] {
        if self.prefer_legacy_registers {
            legacy_first
        } else {
            extended_first
        }
    }

    fn phase_voltage(device_dict: &serde_json::Map<String, Value>, phase: char) -> Option<f64> {
        let id = format!("voltage_phase_{}_legacy", phase.to_ascii_lowercase());
        device_dict.get(&id).and_then(Value::as_f64).filter(|v| *v > 0.0)
    }

    fn phase_current(device_dict: &serde_json::Map<String, Value>, phase: char) -> Option<f64> {
        let id = format!("current_phase_{}_legacy", phase.to_ascii_lowercase());
        device_dict.get(&id).and_then(Value::as_f64).filter(|v| *v > 0.0)
    }

    fn phase_power(device_dict: &serde_json::Map<String, Value>, phase: char) -> Option<f64> {
        let id = format!("active_power_phase_{}_legacy", phase.to_ascii_lowercase());
        device_dict.get(&id).and_then(Value::as_f64).filter(|v| *v != 0.0)
    }

    async fn update_daily_energy(&self, forward_kwh: f64, reverse_kwh: f64) -> (f64, f64) {
        let mut state = self.energy.lock().await;
        let now = Utc::now();

        if let Some(last_day) = state.last_day {
            if now.date_naive() != last_day.date_naive() {
                state.daily_forward_wh = 0.0;
                state.daily_reverse_wh = 0.0;
            }
        }
        state.last_day = Some(now);

        if forward_kwh > 0.0 {
            state.daily_forward_wh = match state.last_forward_kwh {
                Some(last) if forward_kwh - last >= 0.0 => state.daily_forward_wh + (forward_kwh - last) * 1000.0,
                _ => forward_kwh * 1000.0,
            };
            state.last_forward_kwh = Some(forward_kwh);
        }

        if reverse_kwh > 0.0 {
            state.daily_reverse_wh = match state.last_reverse_kwh {
                Some(last) if reverse_kwh - last >= 0.0 => state.daily_reverse_wh + (reverse_kwh - last) * 1000.0,
                _ => reverse_kwh * 1000.0,
            };
            state.last_reverse_kwh = Some(reverse_kwh);
        }

        (state.daily_forward_wh, state.daily_reverse_wh)
    }
}

#[async_trait]
impl Adapter for IamMeterAdapter {
    async fn connect(&self) -> DeviceResult<()> {
        self.session.ensure_connected(self.ctx).await
    }

    async fn close(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        self.session.ensure_connected(self.ctx).await.is_ok()
    }

    async fn read_serial_number(&self) -> Option<String> {
        let transport = self.transport();
        let device_dict = read_all_registers_chunked(&self.map, &transport).await;
        device_dict.get("serial_number").and_then(Value::as_str).map(str::to_string)
    }

    fn get_tou_window_capability(&self) -> TouWindowCapability {
        TouWindowCapability::none()
    }

    async fn handle_command(&self, command: Command) -> CommandResponse {
        let _ = command;
        CommandResponse::ok()
    }
}

#[async_trait]
impl MeterAdapter for IamMeterAdapter {
    async fn poll(&self) -> MeterTelemetry {
        if let Err(e) = self.session.ensure_connected(self.ctx).await {
            let mut telemetry = MeterTelemetry::default();
            telemetry.ts = Some(Utc::now());
            telemetry.extra.insert("error".to_string(), Value::String(e.to_string()));
            return telemetry;
        }

        let transport = self.transport();
        let device_dict = read_all_registers_chunked(&self.map, &transport).await;

        let voltage_v = Self::pick_first(
            &device_dict,
            self.priority(
                &["voltage_phase_a_legacy", "voltage_phase_a"],
                &["voltage_phase_a", "voltage_phase_a_legacy"],
            ),
            true,
        );
        let current_a = Self::pick_first(
            &device_dict,
            self.priority(
                &["current_phase_a_legacy", "current_phase_a"],
                &["current_phase_a", "current_phase_a_legacy"],
            ),
            false,
        );
        let power_w = Self::pick_first(
            &device_dict,
            self.priority(
                &["sum_power_legacy", "active_power_phase_a_legacy", "total_power", "active_power_phase_a"],
                &["total_power", "active_power_phase_a", "sum_power_legacy", "active_power_phase_a_legacy"],
            ),
            false,
        );
        let frequency_hz = Self::pick_first(
            &device_dict,
            self.priority(&["frequency_legacy", "frequency"], &["frequency", "frequency_legacy"]),
            true,
        );
        let power_factor = Self::pick_first(
            &device_dict,
            self.priority(
                &["power_factor_phase_a_legacy", "power_factor_phase_a"],
                &["power_factor_phase_a", "power_factor_phase_a_legacy"],
            ),
            true,
        );

        let forward_kwh = Self::pick_first(
            &device_dict,
            self.priority(
                &["sum_forward_energy_pulses", "forward_energy_phase_a_pulses", "total_active_energy_forward"],
                &["total_active_energy_forward", "sum_forward_energy_pulses", "forward_energy_phase_a_pulses"],
            ),
            false,
        )
        .unwrap_or(0.0);
        let reverse_kwh = Self::pick_first(
            &device_dict,
            &["sum_reverse_energy_pulses", "reverse_energy_phase_a_pulses", "total_active_energy_reverse"],
            false,
        )
        .unwrap_or(0.0);

        let (today_import_energy, today_export_energy) = self.update_daily_energy(forward_kwh, reverse_kwh).await;

        let voltage_phase_a = Self::phase_voltage(&device_dict, 'a');
        let voltage_phase_b = Self::phase_voltage(&device_dict, 'b');
        let voltage_phase_c = Self::phase_voltage(&device_dict, 'c');
        let current_phase_a = Self::phase_current(&device_dict, 'a');
        let current_phase_b = Self::phase_current(&device_dict, 'b');
        let current_phase_c = Self::phase_current(&device_dict, 'c');
        let power_phase_a = Self::phase_power(&device_dict, 'a');
        let power_phase_b = Self::phase_power(&device_dict, 'b');
        let power_phase_c = Self::phase_power(&device_dict, 'c');

        let voltage_v = voltage_v.or_else(|| {
            let phases: Vec<f64> = [voltage_phase_a, voltage_phase_b, voltage_phase_c].into_iter().flatten().collect();
            (!phases.is_empty()).then(|| phases.iter().sum::<f64>() / phases.len() as f64)
        });
        let current_a = current_a.or_else(|| {
            let phases: Vec<f64> = [current_phase_a, current_phase_b, current_phase_c].into_iter().flatten().collect();
            (!phases.is_empty()).then(|| phases.iter().sum())
        });

        let mut extra = serde_json::Map::new();
        extra.insert("energy_kwh".to_string(), Value::from(forward_kwh));
        extra.insert("registers".to_string(), Value::Object(device_dict));

        MeterTelemetry {
            ts: Some(Utc::now()),
            voltage_v,
            current_a,
            power_w,
            frequency_hz,
            power_factor,
            l1_voltage_v: voltage_phase_a,
            l2_voltage_v: voltage_phase_b,
            l3_voltage_v: voltage_phase_c,
            l1_current_a: current_phase_a,
            l2_current_a: current_phase_b,
            l3_current_a: current_phase_c,
            l1_power_w: power_phase_a,
            l2_power_w: power_phase_b,
            l3_power_w: power_phase_c,
            today_import_energy: Some(today_import_energy),
            today_export_energy: Some(today_export_energy),
            total_import_energy: Some(forward_kwh),
            total_export_energy: Some(reverse_kwh),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict(pairs: &[(&str, f64)]) -> serde_json::Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    #[test]
    fn pick_first_skips_zero_unless_accepted() {
        let d = dict(&[("total_power", 0.0), ("sum_power_legacy", 450.0)]);
        let picked = IamMeterAdapter::pick_first(&d, &["total_power", "sum_power_legacy"], false);
        assert_eq!(picked, Some(450.0));
    }

    #[test]
    fn pick_first_accepts_zero_when_allowed() {
        let d = dict(&[("frequency", 0.0)]);
        let picked = IamMeterAdapter::pick_first(&d, &["frequency"], true);
        assert_eq!(picked, Some(0.0));
    }

    #[test]
    fn phase_voltage_requires_legacy_suffix_and_positive_value() {
        let d = dict(&[("voltage_phase_a_legacy", 230.0)]);
        assert_eq!(IamMeterAdapter::phase_voltage(&d, 'a'), Some(230.0));
        assert_eq!(IamMeterAdapter::phase_voltage(&d, 'b'), None);
    }
}
