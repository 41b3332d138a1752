use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::capability::TouWindowCapability;
use crate::error::DeviceResult;
use crate::modbus_session::{ExecutorContext, ModbusConnector, ModbusRegisterTransport, ModbusSession};
use crate::registers::{read_all_registers_chunked, read_by_ident, write_by_ident, RegisterMap};
use crate::telemetry::{Telemetry, TelemetryMapper};
use crate::tou::{Target, TouWindow, WindowType};
use crate::transport::{RtuConnector, TcpConnector};

use super::command::{actions, Command, CommandResponse};
use super::common::{base_telemetry_from_standard, decode_fault_words, off_grid_from_status_bit, sum_mppt_power};
use super::traits::{Adapter, InverterAdapter};

// --------------------------------------------------------------------------------------------------------------
// Second TOU vendor family: three charge windows and three discharge windows
// with independently addressed registers, instead of one bidirectional set.
// Direction is never inferred here - a charge-window command only ever
// touches `charge_*` registers and a discharge-window command only ever
// touches `discharge_*` registers. Otherwise this reads exactly like
// `HybridInverterAdapter` - same poll path, same register map engine.
// --------------------------------------------------------------------------------------------------------------

pub enum InverterTransportConfig {
    Rtu { device_path: String, baud_rate: u32, unit_id: u8 },
    Tcp { addr: SocketAddr, unit_id: u8 },
}

fn connector_from_config(cfg: &InverterTransportConfig) -> Arc<dyn ModbusConnector> {
    match cfg {
        InverterTransportConfig::Rtu { device_path, baud_rate, unit_id } => {
            Arc::new(RtuConnector { device_path: device_path.clone(), baud_rate: *baud_rate, unit_id: *unit_id })
        }
        InverterTransportConfig::Tcp { addr, unit_id } => Arc::new(TcpConnector { addr: *addr, unit_id: *unit_id }),
    }
}

const SPLIT_TOU_WINDOWS: u8 = 3;

pub struct SplitTouInverterAdapter {
    map: RegisterMap,
    mapper: TelemetryMapper,
    session: Arc<ModbusSession>,
    ctx: ExecutorContext,
    serial_cache: Mutex<Option<String>>,
}

impl SplitTouInverterAdapter {
    pub fn new(register_map_file: &str, transport: InverterTransportConfig) -> DeviceResult<Self> {
        let map = RegisterMap::load(register_map_file)?;
        let mapper = TelemetryMapper::from_register_map(&map);
        let connector = connector_from_config(&transport);
        let session = Arc::new(ModbusSession::new(connector));
        Ok(Self { map, mapper, session, ctx: ExecutorContext::new(), serial_cache: Mutex::new(None) })
    }

    fn transport(&self) -> ModbusRegisterTransport {
        ModbusRegisterTransport { session: self.session.clone(), ctx: self.ctx }
    }

    fn fault_word(device_dict: &serde_json::Map<String, Value>, id: &str) -> i64 {
        device_dict.get(id).and_then(Value::as_i64).unwrap_or(0)
    }

    fn parse_window(command: &Command) -> Option<TouWindow> {
        let params = &command.params;
        let start = params.get("start_time").or_else(|| params.get("chg_start")).or_else(|| params.get("dch_start"))?.as_str()?;
        let end = params.get("end_time").or_else(|| params.get("chg_end")).or_else(|| params.get("dch_end"))?.as_str()?;
        let power_w = params
            .get("power_w")
            .or_else(|| params.get("charge_power_w"))
            .or_else(|| params.get("discharge_power_w"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as u32;
        let end_soc = params
            .get("end_soc")
            .or_else(|| params.get("charge_end_soc"))
            .or_else(|| params.get("discharge_end_soc"))
            .and_then(Value::as_f64)
            .unwrap_or(100.0);
        Some(TouWindow {
            start_time: start.to_string(),
            end_time: end.to_string(),
            power_w,
            target: Target::SocPct(end_soc),
            window_type: WindowType::Auto, // direction comes from which family the caller chose, not this field
        })
    }

    /// `prefix` is `"charge"` or `"discharge"`. `idx` is 1-based, 1..=3.
    async fn apply_split_window(&self, prefix: &str, idx: u8, window: &TouWindow, frequency: Option<&str>) -> DeviceResult<()> {
        window.validate()?;
        let transport = self.transport();

        write_by_ident(&self.map, &transport, &format!("{prefix}_start_time_{idx}"), &Value::String(window.start_time.clone())).await?;
        write_by_ident(&self.map, &transport, &format!("{prefix}_end_time_{idx}"), &Value::String(window.end_time.clone())).await?;

        if let Some(freq) = frequency {
            write_by_ident(&self.map, &transport, &format!("{prefix}_frequency_{idx}"), &Value::String(freq.to_string())).await?;
        }

        if window.power_w > 0 {
            write_by_ident(&self.map, &transport, &format!("{prefix}_power_{idx}"), &Value::from(window.power_w)).await?;
        }

        if let Target::SocPct(soc) = window.target {
            let end_soc_id = if prefix == "charge" { format!("charger_end_soc_{idx}") } else { format!("{prefix}_end_soc_{idx}") };
            write_by_ident(&self.map, &transport, &end_soc_id, &Value::from(soc)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Adapter for SplitTouInverterAdapter {
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
        if let Some(cached) = self.serial_cache.lock().await.clone() {
            return Some(cached);
        }
        let transport = self.transport();
        let value = read_by_ident(&self.map, &transport, "serial_number").await.ok()?;
        let serial = value.as_str()?.to_string();
        *self.serial_cache.lock().await = Some(serial.clone());
        Some(serial)
    }

    fn get_tou_window_capability(&self) -> TouWindowCapability {
        TouWindowCapability::split(SPLIT_TOU_WINDOWS, SPLIT_TOU_WINDOWS)
    }

    async fn handle_command(&self, command: Command) -> CommandResponse {
        if command.action.starts_with("set_tou_window") && !command.action.starts_with("set_tou_discharge_window") {
            let idx: u8 = match command.action.strip_prefix("set_tou_window").and_then(|n| n.parse().ok()) {
                Some(idx) if (1..=SPLIT_TOU_WINDOWS).contains(&idx) => idx,
                _ => return CommandResponse::fail("bad window index"),
            };
            let window = match Self::parse_window(&command) {
                Some(w) => w,
                None => return CommandResponse::fail("missing start_time/end_time"),
            };
            let frequency = command.params.get("frequency").and_then(Value::as_str);
            return match self.apply_split_window("charge", idx, &window, frequency).await {
                Ok(()) => CommandResponse::ok(),
                Err(e) => CommandResponse::fail(e.to_string()),
            };
        }

        if command.action.starts_with("set_tou_discharge_window") {
            let idx: u8 = match command.action.strip_prefix("set_tou_discharge_window").and_then(|n| n.parse().ok()) {
                Some(idx) if (1..=SPLIT_TOU_WINDOWS).contains(&idx) => idx,
                _ => return CommandResponse::fail("bad discharge window index"),
            };
            let window = match Self::parse_window(&command) {
                Some(w) => w,
                None => return CommandResponse::fail("missing start_time/end_time"),
            };
            let frequency = command.params.get("frequency").and_then(Value::as_str);
            return match self.apply_split_window("discharge", idx, &window, frequency).await {
                Ok(()) => CommandResponse::ok(),
                Err(e) => CommandResponse::fail(e.to_string()),
            };
        }

        if command.action == actions::WRITE {
            let id = command.params.get("id").and_then(Value::as_str);
            let value = command.params.get("value");
            return match (id, value) {
                (Some(id), Some(value)) => match self.write_by_ident(id, value.clone()).await {
                    Ok(()) => CommandResponse::ok(),
                    Err(e) => CommandResponse::fail(e.to_string()),
                },
                _ => CommandResponse::fail("write requires 'id' and 'value'"),
            };
        }

        CommandResponse::ok()
    }
}

#[async_trait]
impl InverterAdapter for SplitTouInverterAdapter {
    async fn poll(&self) -> Telemetry {
        if let Err(e) = self.session.ensure_connected(self.ctx).await {
            return Telemetry::unreachable(e.to_string());
        }

        let transport = self.transport();
        let device_dict = read_all_registers_chunked(&self.map, &transport).await;
        let standard = self.mapper.map_to_standard(&device_dict);
        let mut telemetry = base_telemetry_from_standard(&standard);

        if telemetry.pv_power_w.is_none() {
            telemetry.pv_power_w = sum_mppt_power(&standard);
        }

        if telemetry.batt_power_w.is_none() {
            if let (Some(v), Some(i)) = (telemetry.batt_voltage_v, telemetry.batt_current_a) {
                telemetry.batt_power_w = Some(v * i);
            }
        }

        let grid_status = Self::fault_word(&device_dict, "grid_status_raw");
        if device_dict.contains_key("grid_status_raw") {
            telemetry.off_grid_mode = Some(off_grid_from_status_bit(grid_status));
        }

        let fault_words: Vec<i64> = (1..=4).map(|i| Self::fault_word(&device_dict, &format!("fault_word_{i}"))).collect();
        if let Some(code) = decode_fault_words(&fault_words) {
            telemetry.error_code = Some(code);
        }

        telemetry
    }

    async fn read_by_ident(&self, id: &str) -> DeviceResult<Value> {
        let transport = self.transport();
        read_by_ident(&self.map, &transport, id).await
    }

    async fn write_by_ident(&self, id: &str, value: Value) -> DeviceResult<()> {
        let transport = self.transport();
        write_by_ident(&self.map, &transport, id, &value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_window_parse_accepts_charge_and_discharge_aliases() {
        let charge_cmd = Command {
            action: "set_tou_window1".to_string(),
            params: serde_json::json!({"chg_start": "02:00", "chg_end": "05:00", "charge_power_w": 3000.0, "charge_end_soc": 90.0}),
        };
        let window = SplitTouInverterAdapter::parse_window(&charge_cmd).unwrap();
        assert_eq!(window.start_time, "02:00");
        assert_eq!(window.power_w, 3000);

        let discharge_cmd = Command {
            action: "set_tou_discharge_window1".to_string(),
            params: serde_json::json!({"dch_start": "18:00", "dch_end": "21:00", "discharge_power_w": 2000.0, "discharge_end_soc": 30.0}),
        };
        let window = SplitTouInverterAdapter::parse_window(&discharge_cmd).unwrap();
        assert_eq!(window.end_time, "21:00");
    }

    #[test]
    fn split_capability_reports_three_and_three() {
        let cap = TouWindowCapability::split(SPLIT_TOU_WINDOWS, SPLIT_TOU_WINDOWS);
        assert!(cap.separate_charge_discharge);
        assert!(!cap.bidirectional);
        assert_eq!(cap.max_charge_windows, 3);
        assert_eq!(cap.max_discharge_windows, 3);
    }
}
