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
use crate::transport::{RtuConnector, TcpConnector};

use super::command::{Command, CommandResponse};
use super::common::{base_telemetry_from_standard, decode_fault_words, off_grid_from_status_bit, sum_mppt_power};
use super::traits::{Adapter, InverterAdapter};

// --------------------------------------------------------------------------------------------------------------
// Generic register-driven single-phase hybrid inverter. Everything
// device-specific lives in the register map JSON; this adapter only adds
// the handful of derived computations the map can't express (MPPT sum,
// fault-word decode, off-grid bit, the one known vendor's inverted battery
// current sign).
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

pub struct HybridInverterAdapter {
    map: RegisterMap,
    mapper: TelemetryMapper,
    session: Arc<ModbusSession>,
    ctx: ExecutorContext,
    /// One vendor's battery current/power register reports the opposite of
    /// the universal "positive = charging" convention.
    invert_battery_power: bool,
    serial_cache: Mutex<Option<String>>,
}

impl HybridInverterAdapter {
    pub fn new(register_map_file: &str, transport: InverterTransportConfig, invert_battery_power: bool) -> DeviceResult<Self> {
        let map = RegisterMap::load(register_map_file)?;
        let mapper = TelemetryMapper::from_register_map(&map);
        let connector = connector_from_config(&transport);
        let session = Arc::new(ModbusSession::new(connector).with_multi_write_threshold(60));
        Ok(Self { map, mapper, session, ctx: ExecutorContext::new(), invert_battery_power, serial_cache: Mutex::new(None) })
    }

    fn transport(&self) -> ModbusRegisterTransport {
        ModbusRegisterTransport { session: self.session.clone(), ctx: self.ctx }
    }

    fn fault_word(device_dict: &serde_json::Map<String, Value>, id: &str) -> i64 {
        device_dict.get(id).and_then(Value::as_i64).unwrap_or(0)
    }
}

#[async_trait]
impl Adapter for HybridInverterAdapter {
    async fn connect(&self) -> DeviceResult<()> {
        self.session.ensure_connected(self.ctx).await
    }

    async fn close(&self) -> DeviceResult<()> {
        // ModbusSession has no explicit public close - dropping the
        // adapter (and its Arc<ModbusSession>) releases the transport.
        // A future poll will reconnect lazily.
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
        TouWindowCapability::none()
    }

    async fn handle_command(&self, command: Command) -> CommandResponse {
        match command.action.as_str() {
            super::command::actions::WRITE => {
                let id = command.params.get("id").and_then(Value::as_str);
                let value = command.params.get("value");
                match (id, value) {
                    (Some(id), Some(value)) => match self.write_by_ident(id, value.clone()).await {
                        Ok(()) => CommandResponse::ok(),
                        Err(e) => CommandResponse::fail(e.to_string()),
                    },
                    _ => CommandResponse::fail("write requires 'id' and 'value'"),
                }
            }
            _ => CommandResponse::ok(),
        }
    }
}

#[async_trait]
impl InverterAdapter for HybridInverterAdapter {
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

        if self.invert_battery_power {
            telemetry.batt_power_w = telemetry.batt_power_w.map(|p| -p);
            telemetry.batt_current_a = telemetry.batt_current_a.map(|i| -i);
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
