use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::capability::TouWindowCapability;
use crate::error::{DeviceError, DeviceResult};
use crate::modbus_session::{ExecutorContext, ModbusConnector, ModbusRegisterTransport, ModbusSession};
use crate::registers::{read_all_registers_chunked, read_by_ident, write_by_ident, RegisterMap};
use crate::telemetry::{fields, Telemetry, TelemetryMapper, ThreePhaseTelemetry};
use crate::tou::window::{Target, TouWindow, WindowType};
use crate::transport::{RtuConnector, TcpConnector};

use super::command::{actions, Command, CommandResponse};
use super::common::{as_f64, base_telemetry_from_standard, decode_fault_words, off_grid_from_status_bit, sum_mppt_power};
use super::phase_detect::{PhaseDetectionInput, PhaseDetector, PhaseType};
use super::traits::{Adapter, InverterAdapter};

// --------------------------------------------------------------------------------------------------------------
// Three-phase hybrid inverter: the same register-driven read path as the
// single-phase adapter, plus the bidirectional six-window TOU family and
// per-phase telemetry aggregation.
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

const TOU_WINDOWS: u8 = 6;
const INTER_WRITE_DELAY: Duration = Duration::from_millis(200);

pub struct HybridThreePhaseAdapter {
    map: RegisterMap,
    mapper: TelemetryMapper,
    session: Arc<ModbusSession>,
    ctx: ExecutorContext,
    configured_phase: Option<PhaseType>,
    phase_detector: PhaseDetector,
    serial_cache: Mutex<Option<String>>,
}

impl HybridThreePhaseAdapter {
    pub fn new(register_map_file: &str, transport: InverterTransportConfig, configured_phase: Option<PhaseType>) -> DeviceResult<Self> {
        let map = RegisterMap::load(register_map_file)?;
        let mapper = TelemetryMapper::from_register_map(&map);
        let connector = connector_from_config(&transport);
        let session = Arc::new(ModbusSession::new(connector).with_multi_write_threshold(60));
        Ok(Self {
            map,
            mapper,
            session,
            ctx: ExecutorContext::new(),
            configured_phase,
            phase_detector: PhaseDetector::new(),
            serial_cache: Mutex::new(None),
        })
    }

    fn transport(&self) -> ModbusRegisterTransport {
        ModbusRegisterTransport { session: self.session.clone(), ctx: self.ctx }
    }

    fn fault_word(standard: &serde_json::Map<String, Value>, id: &str) -> i64 {
        standard.get(id).and_then(Value::as_i64).unwrap_or(0)
    }

    fn phases_from_standard(standard: &serde_json::Map<String, Value>) -> ThreePhaseTelemetry {
        ThreePhaseTelemetry {
            load_l1_power_w: as_f64(standard.get(fields::LOAD_L1_POWER_W)),
            load_l2_power_w: as_f64(standard.get(fields::LOAD_L2_POWER_W)),
            load_l3_power_w: as_f64(standard.get(fields::LOAD_L3_POWER_W)),
            load_l1_voltage_v: as_f64(standard.get(fields::LOAD_L1_VOLTAGE_V)),
            load_l2_voltage_v: as_f64(standard.get(fields::LOAD_L2_VOLTAGE_V)),
            load_l3_voltage_v: as_f64(standard.get(fields::LOAD_L3_VOLTAGE_V)),
            load_l1_current_a: as_f64(standard.get(fields::LOAD_L1_CURRENT_A)),
            load_l2_current_a: as_f64(standard.get(fields::LOAD_L2_CURRENT_A)),
            load_l3_current_a: as_f64(standard.get(fields::LOAD_L3_CURRENT_A)),
            load_frequency_hz: as_f64(standard.get(fields::LOAD_FREQUENCY_HZ)),
            grid_l1_power_w: as_f64(standard.get(fields::GRID_L1_POWER_W)),
            grid_l2_power_w: as_f64(standard.get(fields::GRID_L2_POWER_W)),
            grid_l3_power_w: as_f64(standard.get(fields::GRID_L3_POWER_W)),
            grid_l1_voltage_v: as_f64(standard.get(fields::GRID_L1_VOLTAGE_V)),
            grid_l2_voltage_v: as_f64(standard.get(fields::GRID_L2_VOLTAGE_V)),
            grid_l3_voltage_v: as_f64(standard.get(fields::GRID_L3_VOLTAGE_V)),
            grid_l1_current_a: as_f64(standard.get(fields::GRID_L1_CURRENT_A)),
            grid_l2_current_a: as_f64(standard.get(fields::GRID_L2_CURRENT_A)),
            grid_l3_current_a: as_f64(standard.get(fields::GRID_L3_CURRENT_A)),
            grid_frequency_hz: as_f64(standard.get(fields::GRID_FREQUENCY_HZ)),
            grid_line_voltage_ab_v: as_f64(standard.get(fields::GRID_LINE_VOLTAGE_AB_V)),
            grid_line_voltage_bc_v: as_f64(standard.get(fields::GRID_LINE_VOLTAGE_BC_V)),
            grid_line_voltage_ca_v: as_f64(standard.get(fields::GRID_LINE_VOLTAGE_CA_V)),
        }
    }

    fn has_any_per_phase_field(standard: &serde_json::Map<String, Value>) -> bool {
        [
            fields::LOAD_L1_POWER_W,
            fields::LOAD_L2_POWER_W,
            fields::LOAD_L3_POWER_W,
            fields::GRID_L1_POWER_W,
            fields::GRID_L2_POWER_W,
            fields::GRID_L3_POWER_W,
        ]
        .iter()
        .any(|k| standard.contains_key(*k))
    }

    fn detect_phase(&self, standard: &serde_json::Map<String, Value>) -> PhaseType {
        let inverter_type_label = standard.get("inverter_type").and_then(Value::as_str);
        let grid_type_setting = standard.get("grid_type_setting").and_then(Value::as_str);
        let input = PhaseDetectionInput {
            configured: self.configured_phase,
            telemetry_has_per_phase: Self::has_any_per_phase_field(standard),
            inverter_type_label,
            grid_type_setting,
        };
        self.phase_detector.detect(&input)
    }

    /// Reads the mode-source register: `0` means windows target voltage, `1` means SOC.
    async fn mode_source(&self, transport: &ModbusRegisterTransport) -> DeviceResult<i64> {
        let v = read_by_ident(&self.map, transport, "tou_mode_source").await?;
        Ok(v.as_i64().unwrap_or(1))
    }

    /// Ensures the master-enable register has bit 0 (schedule enabled) and
    /// bits 1..7 (all seven days) set. Read-modify-write only on a mismatch,
    /// retried up to three times on transient failure.
    async fn ensure_master_enable(&self, transport: &ModbusRegisterTransport) -> DeviceResult<()> {
        const WANT: i64 = 0b1111_1111;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: DeviceResult<()> = async {
                let current = read_by_ident(&self.map, transport, "tou_master_enable").await?;
                let raw = current.as_i64().unwrap_or(0);
                if raw & WANT != WANT {
                    let updated = raw | WANT;
                    write_by_ident(&self.map, transport, "tou_master_enable", &Value::from(updated)).await?;
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= 3 => return Err(e),
                Err(e) => {
                    log::warn!("tou master-enable write attempt {attempt} failed: {e}, retrying");
                    sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    /// Applies the write protocol for window `i` (1-based, 1..=6).
    pub async fn apply_tou_window(&self, i: u8, window: &TouWindow) -> DeviceResult<()> {
        if !(1..=TOU_WINDOWS).contains(&i) {
            return Err(DeviceError::RegisterError(format!("tou window index {i} out of range 1..{TOU_WINDOWS}")));
        }
        window.validate()?;

        let transport = self.transport();
        self.ensure_master_enable(&transport).await?;

        write_by_ident(&self.map, &transport, &format!("start_time_{i}"), &Value::String(window.start_time.clone())).await?;
        sleep(INTER_WRITE_DELAY).await;

        write_by_ident(&self.map, &transport, &format!("power_{i}"), &Value::from(window.power_w)).await?;
        sleep(INTER_WRITE_DELAY).await;

        if window.power_w == 0 {
            // Window clear: disable all mode bits, skip the target write.
            write_by_ident(&self.map, &transport, &format!("charge_mode_{i}"), &Value::from(0)).await?;
            return Ok(());
        }

        let mode_source = self.mode_source(&transport).await.unwrap_or(1);
        let (current_soc, current_voltage) = {
            let device_dict = read_all_registers_chunked(&self.map, &transport).await;
            let standard = self.mapper.map_to_standard(&device_dict);
            (as_f64(standard.get(fields::BATT_SOC_PCT)), as_f64(standard.get(fields::BATT_VOLTAGE_V)))
        };

        if mode_source == 0 {
            let target_v = match window.target {
                Target::VoltageV(v) => v,
                Target::SocPct(v) => v,
            };
            write_by_ident(&self.map, &transport, &format!("target_voltage_{i}"), &Value::from(target_v)).await?;
        } else {
            let target_soc = match window.target {
                Target::SocPct(v) => v,
                Target::VoltageV(v) => v,
            };
            write_by_ident(&self.map, &transport, &format!("target_soc_{i}"), &Value::from(target_soc as i64)).await?;
        }
        sleep(INTER_WRITE_DELAY).await;

        let direction = window.resolve_direction(current_soc, current_voltage);
        let charge_mode = crate::tou::window::charge_mode_bit(direction);
        write_by_ident(&self.map, &transport, &format!("charge_mode_{i}"), &Value::from(charge_mode)).await?;

        Ok(())
    }

    fn parse_window_command(params: &Value) -> DeviceResult<TouWindow> {
        let start_time = params.get("start_time").and_then(Value::as_str).ok_or_else(|| {
            DeviceError::RegisterError("tou window command missing 'start_time'".to_string())
        })?;
        let end_time = params.get("end_time").and_then(Value::as_str).unwrap_or("00:00");
        let power_w = params.get("power_w").and_then(Value::as_u64).ok_or_else(|| {
            DeviceError::RegisterError("tou window command missing 'power_w'".to_string())
        })? as u32;
        let window_type = match params.get("type").and_then(Value::as_str).unwrap_or("auto") {
            "charge" => WindowType::Charge,
            "discharge" => WindowType::Discharge,
            _ => WindowType::Auto,
        };
        let target = if let Some(soc) = params.get("target_soc_pct").and_then(Value::as_f64) {
            Target::SocPct(soc)
        } else if let Some(v) = params.get("target_voltage_v").and_then(Value::as_f64) {
            Target::VoltageV(v)
        } else {
            return Err(DeviceError::RegisterError(
                "tou window command needs 'target_soc_pct' or 'target_voltage_v'".to_string(),
            ));
        };

        Ok(TouWindow { start_time: start_time.to_string(), end_time: end_time.to_string(), power_w, target, window_type })
    }
}

#[async_trait]
impl Adapter for HybridThreePhaseAdapter {
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
        TouWindowCapability::bidirectional(TOU_WINDOWS)
    }

    async fn handle_command(&self, command: Command) -> CommandResponse {
        for n in 1..=TOU_WINDOWS {
            if command.action == actions::tou_window(n) {
                return match Self::parse_window_command(&command.params) {
                    Ok(window) => match self.apply_tou_window(n, &window).await {
                        Ok(()) => CommandResponse::ok(),
                        Err(e) => CommandResponse::fail(e.to_string()),
                    },
                    Err(e) => CommandResponse::fail(e.to_string()),
                };
            }
        }

        match command.action.as_str() {
            actions::WRITE => {
                let id = command.params.get("id").and_then(Value::as_str);
                let value = command.params.get("value");
                match (id, value) {
                    (Some(id), Some(value)) => {
                        let transport = self.transport();
                        match write_by_ident(&self.map, &transport, id, value).await {
                            Ok(()) => CommandResponse::ok(),
                            Err(e) => CommandResponse::fail(e.to_string()),
                        }
                    }
                    _ => CommandResponse::fail("write requires 'id' and 'value'"),
                }
            }
            _ => CommandResponse::ok(),
        }
    }
}

#[async_trait]
impl InverterAdapter for HybridThreePhaseAdapter {
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

        if let Some(raw) = standard.get("grid_status_raw").and_then(Value::as_i64) {
            telemetry.off_grid_mode = Some(off_grid_from_status_bit(raw));
        }

        let fault_words: Vec<i64> = (1..=4).map(|i| Self::fault_word(&standard, &format!("fault_word_{i}"))).collect();
        if let Some(code) = decode_fault_words(&fault_words) {
            telemetry.error_code = Some(code);
        }

        if self.detect_phase(&standard) == PhaseType::Three {
            telemetry.phases = Some(Self::phases_from_standard(&standard));
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
