use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter as BleAdapter, Manager, Peripheral};
use futures::StreamExt;
use serde_json::Value;
use tokio::process::Command as ProcessCommand;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::capability::TouWindowCapability;
use crate::crc::sum_checksum;
use crate::error::{DeviceError, DeviceResult};
use crate::telemetry::{BatteryBankTelemetry, CellReading, CellStats, UnitTelemetry};
use crate::transport::BleLink;

use super::battery_decode::{read_f32_scaled_signed, read_f32_scaled_unsigned, read_i16, read_u32, temp_from_decidegrees};
use super::command::{Command, CommandResponse};
use super::traits::{Adapter, BatteryAdapter};

// --------------------------------------------------------------------------------------------------------------
// JK02 protocol over BLE. One `JkBmsBlePack` per MAC address, serialized
// connect/poll at the bank level because BlueZ cannot run more than one
// scan/connect operation at a time.
// --------------------------------------------------------------------------------------------------------------

const HEADER_RESPONSE: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
const MIN_RESPONSE_SIZE: usize = 300;
const CMD_DEVICE_INFO: u8 = 0x97;
const CMD_DEVICE_STATE: u8 = 0x96;
const RESP_SETTINGS: u8 = 0x01;
const RESP_STATUS: u8 = 0x02;
const RESP_INFO: u8 = 0x03;
const BLE_TIMEOUT: Duration = Duration::from_secs(8);
const CONNECT_SPACING: Duration = Duration::from_secs(2);

fn jk_command(address: u8) -> Vec<u8> {
    let mut frame = vec![0xAA, 0x55, 0x90, 0xEB, address, 0];
    frame.extend(std::iter::repeat(0u8).take(13));
    let crc = sum_checksum(&frame);
    frame.push(crc);
    frame
}

fn read_null_terminated(buf: &[u8], offset: usize) -> String {
    if offset >= buf.len() {
        return String::new();
    }
    let end = buf[offset..].iter().position(|b| *b == 0).map(|p| offset + p).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[offset..end]).to_string()
}

#[derive(Debug, Clone, Default)]
struct PackSample {
    voltage_v: Option<f64>,
    current_a: Option<f64>,
    soc_pct: Option<f64>,
    cycles: Option<u32>,
    temps_c: Vec<Option<f64>>,
    cell_voltages_v: Vec<Option<f64>>,
}

fn decode_sample(status: &[u8], wide_protocol: bool, num_cells: usize) -> PackSample {
    let offset = if wide_protocol { 32 } else { 0 };

    let mut temps_c = vec![temp_from_decidegrees(read_i16(status, 130 + offset)), temp_from_decidegrees(read_i16(status, 132 + offset))];
    if wide_protocol {
        temps_c.push(temp_from_decidegrees(read_i16(status, 224 + offset)));
        temps_c.push(temp_from_decidegrees(read_i16(status, 226 + offset)));
    }

    let mut cell_voltages_v = Vec::with_capacity(num_cells);
    for i in 0..num_cells {
        let cell_offset = 6 + i * 2;
        let v = read_f32_scaled_unsigned(status, cell_offset, 2, 1e-3);
        cell_voltages_v.push(v.filter(|v| (2.0..=4.5).contains(v)));
    }

    PackSample {
        voltage_v: read_f32_scaled_unsigned(status, 118 + offset, 4, 1e-3),
        current_a: read_f32_scaled_signed(status, 126 + offset, 4, 1e-3),
        soc_pct: status.get(141 + offset).map(|b| *b as f64),
        cycles: read_u32(status, 150 + offset),
        temps_c,
        cell_voltages_v,
    }
}

struct PackState {
    link: Option<BleLink>,
    num_cells: usize,
    wide_protocol: Option<bool>,
}

pub struct JkBmsBlePack {
    pub address: String,
    pub battery_id: u32,
    adapter_name: Option<String>,
    state: Mutex<PackState>,
}

impl JkBmsBlePack {
    pub fn new(address: impl Into<String>, battery_id: u32, adapter_name: Option<String>) -> Self {
        Self {
            address: address.into(),
            battery_id,
            adapter_name,
            state: Mutex::new(PackState { link: None, num_cells: 16, wide_protocol: None }),
        }
    }

    async fn find_peripheral(&self) -> DeviceResult<Peripheral> {
        let manager = Manager::new().await.map_err(|e| DeviceError::TransportUnavailable(format!("BLE manager: {e}")))?;
        let adapters = manager.adapters().await.map_err(|e| DeviceError::TransportUnavailable(format!("BLE adapters: {e}")))?;
        let adapter: &BleAdapter = adapters.first().ok_or_else(|| DeviceError::TransportUnavailable("no BLE adapter present".to_string()))?;

        adapter.start_scan(ScanFilter::default()).await.map_err(|e| DeviceError::TransportUnavailable(format!("BLE scan: {e}")))?;
        sleep(Duration::from_secs(2)).await;

        let peripherals = adapter.peripherals().await.map_err(|e| DeviceError::TransportUnavailable(format!("BLE peripherals: {e}")))?;
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(&self.address) {
                    return Ok(peripheral);
                }
            }
        }
        Err(DeviceError::TransportUnavailable(format!("device {} not found in scan results", self.address)))
    }

    async fn connect(&self) -> DeviceResult<()> {
        let peripheral = self.find_peripheral().await?;
        let link = BleLink::connect(peripheral, BLE_TIMEOUT).await?;

        let mut state = self.state.lock().await;
        state.link = Some(link);
        drop(state);

        // Device info first (firmware version -> 24s vs 32s offsets), then
        // settings (cell count). Both are cached on the pack for the life of
        // the connection.
        let info = self.query(CMD_DEVICE_INFO, &[RESP_INFO]).await;
        if let Ok(buf) = info {
            let fw = read_null_terminated(&buf, 6 + 16 + 8);
            let wide = fw.split('.').next().and_then(|s| s.parse::<u32>().ok()).map(|major| major >= 11).unwrap_or(true);
            self.state.lock().await.wide_protocol = Some(wide);
        }

        if let Ok(buf) = self.query(CMD_DEVICE_STATE, &[RESP_STATUS, RESP_SETTINGS]).await {
            // Settings response (0x01) carries the cell count at byte 114;
            // a 0x02 first response on some firmware means we fetch settings separately.
            let num_cells = buf.get(114).copied().filter(|n| (1..=24).contains(n)).unwrap_or(16) as usize;
            self.state.lock().await.num_cells = num_cells;
        }

        Ok(())
    }

    async fn query(&self, cmd: u8, accept: &[u8]) -> DeviceResult<Vec<u8>> {
        let frame = jk_command(cmd);
        let mut stream = {
            let state = self.state.lock().await;
            let link = state.link.as_ref().ok_or_else(|| DeviceError::TransportUnavailable("not connected".to_string()))?;
            link.write_command(&frame).await?;
            link.notifications().await?
        };

        let mut buffer: Vec<u8> = Vec::new();
        let deadline = tokio::time::Instant::now() + BLE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(DeviceError::Timeout(BLE_TIMEOUT));
            }
            let chunk = match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Err(DeviceError::TransportUnavailable("notification stream closed".to_string())),
                Err(_) => return Err(DeviceError::Timeout(BLE_TIMEOUT)),
            };

            if chunk.starts_with(&HEADER_RESPONSE) {
                buffer.clear();
            }
            buffer.extend_from_slice(&chunk);

            if buffer.len() >= MIN_RESPONSE_SIZE {
                let mut frame_crc_ok = false;
                if sum_checksum(&buffer[0..MIN_RESPONSE_SIZE - 1]) == buffer[MIN_RESPONSE_SIZE - 1] {
                    frame_crc_ok = true;
                } else if let Some(idx) = find_subslice(&buffer, &HEADER_RESPONSE) {
                    buffer.drain(0..idx);
                    if buffer.len() >= MIN_RESPONSE_SIZE && sum_checksum(&buffer[0..MIN_RESPONSE_SIZE - 1]) == buffer[MIN_RESPONSE_SIZE - 1] {
                        frame_crc_ok = true;
                    }
                }

                if frame_crc_ok {
                    let resp_type = buffer[4];
                    if accept.contains(&resp_type) {
                        return Ok(buffer);
                    }
                }
                buffer.clear();
            }
        }
    }

    async fn poll_sample(&self) -> DeviceResult<(PackSample, u32)> {
        let status = self.query(CMD_DEVICE_STATE, &[RESP_STATUS]).await?;
        let (num_cells, wide) = {
            let state = self.state.lock().await;
            (state.num_cells, state.wide_protocol.unwrap_or(true))
        };
        let sample = decode_sample(&status, wide, num_cells);
        let cycles = sample.cycles.unwrap_or(0);
        Ok((sample, cycles))
    }

    async fn close(&self) {
        if let Some(link) = self.state.lock().await.link.take() {
            link.disconnect().await;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub struct JkBmsBleAdapter {
    packs: Vec<Arc<JkBmsBlePack>>,
    bt_adapter_name: String,
}

impl JkBmsBleAdapter {
    pub fn new(addresses: Vec<String>, bt_adapter_name: Option<String>) -> Self {
        let bt_adapter_name = bt_adapter_name.unwrap_or_else(|| "hci0".to_string());
        let packs = addresses
            .into_iter()
            .enumerate()
            .map(|(idx, addr)| Arc::new(JkBmsBlePack::new(addr, idx as u32, Some(bt_adapter_name.clone()))))
            .collect();
        Self { packs, bt_adapter_name }
    }

    /// Power-cycles the host Bluetooth adapter by invoking `bluetoothctl`,
    /// mirroring the fallback used when every pack in the bank reports "not
    /// found" (as opposed to a transient BlueZ "operation in progress").
    async fn power_cycle_bluetooth(&self) -> bool {
        log::warn!("all packs not found, power-cycling Bluetooth adapter {}", self.bt_adapter_name);
        let power_off = ProcessCommand::new("bluetoothctl")
            .args(["power", "off"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        sleep(Duration::from_secs(1)).await;
        let power_on = ProcessCommand::new("bluetoothctl")
            .args(["power", "on"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(power_off, Ok(s) if s.success()) && matches!(power_on, Ok(s) if s.success())
    }

    fn build_unit(&self, pack: &JkBmsBlePack, sample: PackSample, cycles: u32) -> (UnitTelemetry, Vec<CellReading>) {
        let unit_index = pack.battery_id + 1;
        let valid_cells: Vec<f64> = sample.cell_voltages_v.iter().filter_map(|v| *v).collect();
        let voltage_v = sample.voltage_v.or_else(|| (!valid_cells.is_empty()).then(|| valid_cells.iter().sum()));
        let valid_temps: Vec<f64> = sample.temps_c.iter().filter_map(|t| *t).collect();
        let avg_temp = (!valid_temps.is_empty()).then(|| valid_temps.iter().sum::<f64>() / valid_temps.len() as f64);

        let voltage_stats = cell_stats(&valid_cells);
        let unit = UnitTelemetry {
            power: unit_index,
            voltage_v,
            current_a: sample.current_a,
            temp_c: avg_temp,
            soc_pct: sample.soc_pct,
            soh_pct: None,
            cycles: Some(cycles),
            voltage_stats,
            temp_stats: CellStats::default(),
        };

        let cells = sample
            .cell_voltages_v
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                v.map(|voltage| {
                    let temp = if valid_temps.len() == 1 {
                        valid_temps.first().copied()
                    } else if !valid_temps.is_empty() {
                        valid_temps.get(i % valid_temps.len()).copied()
                    } else {
                        None
                    };
                    CellReading { power: unit_index, cell: (i + 1) as u32, voltage_v: Some(voltage), temp_c: temp }
                })
            })
            .collect();

        (unit, cells)
    }
}

fn cell_stats(values: &[f64]) -> CellStats {
    if values.is_empty() {
        return CellStats::default();
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    CellStats { min: Some(min), max: Some(max), delta: Some(max - min) }
}

#[async_trait]
impl Adapter for JkBmsBleAdapter {
    async fn connect(&self) -> DeviceResult<()> {
        let mut connected = 0usize;
        let mut not_found = Vec::new();

        for (i, pack) in self.packs.iter().enumerate() {
            if i > 0 {
                sleep(CONNECT_SPACING).await;
            }
            match pack.connect().await {
                Ok(()) => connected += 1,
                Err(e) => {
                    let msg = e.to_string();
                    if msg.to_ascii_lowercase().contains("in progress") {
                        log::warn!("pack {} BlueZ operation in progress, will retry later", pack.battery_id);
                    } else {
                        log::warn!("pack {} failed to connect: {msg}", pack.battery_id);
                        if msg.to_ascii_lowercase().contains("not found") {
                            not_found.push(pack.clone());
                        }
                    }
                }
            }
        }

        if connected == 0 && !not_found.is_empty() && not_found.len() == self.packs.len() {
            if self.power_cycle_bluetooth().await {
                sleep(Duration::from_secs(3)).await;
                for (i, pack) in self.packs.iter().enumerate() {
                    if i > 0 {
                        sleep(CONNECT_SPACING).await;
                    }
                    if pack.connect().await.is_ok() {
                        connected += 1;
                    }
                }
            }
        }

        if connected == 0 {
            return Err(DeviceError::TransportUnavailable("failed to connect to any battery in the BLE bank".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        for pack in &self.packs {
            pack.close().await;
        }
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        for pack in &self.packs {
            if pack.query(CMD_DEVICE_STATE, &[RESP_STATUS]).await.is_ok() {
                return true;
            }
        }
        false
    }

    async fn read_serial_number(&self) -> Option<String> {
        None
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
impl BatteryAdapter for JkBmsBleAdapter {
    async fn poll(&self) -> BatteryBankTelemetry {
        let mut bank = BatteryBankTelemetry { ts: Some(chrono::Utc::now()), ..Default::default() };
        let mut cells_per_battery = 0u32;

        for (i, pack) in self.packs.iter().enumerate() {
            if i > 0 {
                sleep(Duration::from_millis(300)).await;
            }

            let result = match pack.poll_sample().await {
                Ok(sample) => Ok(sample),
                Err(e) => {
                    let msg = e.to_string();
                    if msg.to_ascii_lowercase().contains("not connected") || msg.to_ascii_lowercase().contains("not found") {
                        log::info!("pack {} connection issue, attempting reconnect", pack.battery_id);
                        sleep(Duration::from_secs(1)).await;
                        if pack.connect().await.is_ok() {
                            pack.poll_sample().await
                        } else {
                            Err(e)
                        }
                    } else {
                        Err(e)
                    }
                }
            };

            match result {
                Ok((sample, cycles)) => {
                    cells_per_battery = cells_per_battery.max(sample.cell_voltages_v.len() as u32);
                    let (unit, cells) = self.build_unit(pack, sample, cycles);
                    bank.units.push(unit);
                    bank.cells.extend(cells);
                }
                Err(e) => log::warn!("pack {} poll failed: {e}", pack.battery_id),
            }
        }

        bank.cells_per_battery = cells_per_battery;
        bank.recompute_aggregates();
        bank
    }
}
