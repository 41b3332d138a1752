use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::capability::TouWindowCapability;
use crate::crc::modbus_crc16;
use crate::error::{DeviceError, DeviceResult};
use crate::telemetry::{BatteryBankTelemetry, CellReading, CellStats, UnitTelemetry};
use crate::transport::RawBusConnection;

use super::battery_decode::{read_i16, read_u16, read_u32};
use super::command::{Command, CommandResponse};
use super::traits::{Adapter, BatteryAdapter};

// --------------------------------------------------------------------------------------------------------------
// Passive RS-485 sniffer: never transmits, just watches the bus the real
// master (a JK-BMS RS485-2 hub) and its batteries talk on. Frame boundaries
// aren't given by a wire protocol addressed to us - we have to recognize
// them inline in a byte stream that mixes Modbus request/response frames
// with JK's own `55 AA EB 90` data frames.
// --------------------------------------------------------------------------------------------------------------

const MODBUS_PATTERN: [u8; 2] = [0x10, 0x16];
const DATA_FRAME_START: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
const FRAME_TYPE_CONFIG: u8 = 0x01;
const FRAME_TYPE_STATUS: u8 = 0x02;
const MODBUS_REQUEST: u8 = 0x20;
const MAX_MODBUS_FRAME_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Modbus,
    Data,
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start >= haystack.len() {
        return None;
    }
    haystack[start..].windows(needle.len()).position(|w| w == needle).map(|p| p + start)
}

/// Scans for either frame marker starting at `start` and returns whichever
/// comes first in the buffer.
fn find_next_frame_start(data: &[u8], start: usize) -> Option<(usize, FrameKind)> {
    let data_pos = find_subslice(data, &DATA_FRAME_START, start);

    let mut modbus_pos = None;
    for i in start..data.len().saturating_sub(2) {
        if data[i + 1..i + 3] == MODBUS_PATTERN {
            modbus_pos = Some(i);
            break;
        }
    }

    match (data_pos, modbus_pos) {
        (Some(d), Some(m)) if d < m => Some((d, FrameKind::Data)),
        (Some(d), None) => Some((d, FrameKind::Data)),
        (_, Some(m)) => Some((m, FrameKind::Modbus)),
        _ => None,
    }
}

/// Tries to parse a Modbus frame at the start of `data`, scanning forward for
/// a trailing CRC-16 that validates everything before it (frame length isn't
/// known up front on a passively-sniffed bus).
fn parse_modbus_frame(data: &[u8]) -> Option<(u8, u8, usize)> {
    if data.len() < 6 {
        return None;
    }
    let battery_id = data[0];
    if data[1..3] != MODBUS_PATTERN {
        return None;
    }
    let frame_type = data[3];
    let max_check = data.len().min(MAX_MODBUS_FRAME_LENGTH);

    for end_pos in 6..=max_check {
        let frame_without_crc = &data[..end_pos - 2];
        let received_crc = ((data[end_pos - 1] as u16) << 8) | data[end_pos - 2] as u16;
        if modbus_crc16(frame_without_crc) == received_crc {
            return Some((battery_id, frame_type, end_pos));
        }
    }
    None
}

#[derive(Debug, Clone, Default)]
struct StatusFrame {
    cell_voltages_v: Vec<Option<f64>>,
    pack_voltage_v: Option<f64>,
    current_a: Option<f64>,
    soc_pct: Option<f64>,
    soh_pct: Option<f64>,
    cycle_count: Option<u32>,
    temps_c: Vec<Option<f64>>,
}

fn parse_status_frame(frame: &[u8], cells_per_battery: usize) -> StatusFrame {
    let mut out = StatusFrame::default();

    for cell in 0..cells_per_battery {
        let offset = 6 + cell * 2;
        out.cell_voltages_v.push(read_u16(frame, offset).map(|v| v as f64 / 1000.0));
    }

    if frame.len() < 236 {
        return out;
    }

    let temp = |raw: Option<i16>| raw.map(|v| v as f64 / 10.0);
    out.temps_c = vec![
        temp(read_i16(frame, 144)), // mos_temp
        temp(read_i16(frame, 162)), // temp1
        temp(read_i16(frame, 164)), // temp2
        temp(read_i16(frame, 254)), // temp3
        temp(read_i16(frame, 258)), // temp4
    ];

    out.current_a = read_i32_scaled(frame, 158, 1000.0);
    out.soc_pct = frame.get(173).map(|b| *b as f64);
    out.soh_pct = frame.get(190).map(|b| *b as f64);
    out.cycle_count = read_u32(frame, 182);
    out.pack_voltage_v = read_u16(frame, 234).map(|v| v as f64 / 100.0);

    out
}

fn read_i32_scaled(buf: &[u8], offset: usize, scale: f64) -> Option<f64> {
    buf.get(offset..offset + 4).map(|s| i32::from_le_bytes(s.try_into().unwrap()) as f64 / scale)
}

#[derive(Debug, Clone, Default)]
struct BatteryEntry {
    status: Option<StatusFrame>,
}

struct SnifferState {
    batteries: HashMap<u8, BatteryEntry>,
    current_battery_id: Option<u8>,
}

pub enum Rs485TransportConfig {
    TcpGateway { addr: SocketAddr },
    Serial { device_path: String, baud_rate: u32 },
}

pub struct JkBmsRs485Adapter {
    transport: Rs485TransportConfig,
    batteries_expected: u8,
    cells_per_battery: usize,
    state: Arc<Mutex<SnifferState>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl JkBmsRs485Adapter {
    pub fn new(transport: Rs485TransportConfig, batteries_expected: u8, cells_per_battery: usize) -> Self {
        Self {
            transport,
            batteries_expected,
            cells_per_battery,
            state: Arc::new(Mutex::new(SnifferState { batteries: HashMap::new(), current_battery_id: None })),
            listener: Mutex::new(None),
        }
    }

    async fn open_connection(&self) -> DeviceResult<RawBusConnection> {
        match &self.transport {
            Rs485TransportConfig::TcpGateway { addr } => RawBusConnection::connect_tcp(*addr).await,
            Rs485TransportConfig::Serial { device_path, baud_rate } => RawBusConnection::open_serial(device_path, *baud_rate),
        }
    }

    fn spawn_listener(&self, mut conn: RawBusConnection) -> JoinHandle<()> {
        let state = self.state.clone();
        let batteries_expected = self.batteries_expected;
        let cells_per_battery = self.cells_per_battery;

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = match conn.read_chunk().await {
                    Ok(chunk) if !chunk.is_empty() => chunk,
                    Ok(_) => {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(e) => {
                        log::warn!("RS-485 sniffer: read error, stopping listener: {e}");
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                let mut pos = 0usize;
                while pos < buffer.len() {
                    let Some((next_pos, kind)) = find_next_frame_start(&buffer, pos) else { break };

                    match kind {
                        FrameKind::Modbus => {
                            let slice = &buffer[next_pos..];
                            match parse_modbus_frame(slice) {
                                Some((mut battery_id, frame_type, frame_len)) => {
                                    if battery_id == 15 {
                                        battery_id = 0;
                                    }
                                    if battery_id < batteries_expected && frame_type == MODBUS_REQUEST {
                                        state.lock().await.current_battery_id = Some(battery_id);
                                    }
                                    pos = next_pos + frame_len;
                                }
                                None => pos = next_pos + 1,
                            }
                        }
                        FrameKind::Data => {
                            let slice = &buffer[next_pos..];
                            let end_pos = find_next_frame_start(slice, 1).map(|(p, _)| p).unwrap_or(slice.len());
                            let frame = &slice[..end_pos];

                            if frame.len() >= 5 {
                                let frame_type = frame[4];
                                let mut guard = state.lock().await;
                                let battery_id = guard.current_battery_id.unwrap_or(0);
                                if battery_id < batteries_expected {
                                    let entry = guard.batteries.entry(battery_id).or_default();
                                    if frame_type == FRAME_TYPE_STATUS {
                                        entry.status = Some(parse_status_frame(frame, cells_per_battery));
                                    } else if frame_type == FRAME_TYPE_CONFIG {
                                        // Configuration frame carries protection thresholds, not
                                        // live telemetry - not surfaced on BatteryBankTelemetry.
                                    }
                                }
                            }
                            pos = next_pos + end_pos;
                        }
                    }
                }
                buffer.drain(0..pos);
            }
        })
    }
}

#[async_trait]
impl Adapter for JkBmsRs485Adapter {
    async fn connect(&self) -> DeviceResult<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let conn = self.open_connection().await?;
        *listener = Some(self.spawn_listener(conn));
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        !self.state.lock().await.batteries.is_empty()
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
impl BatteryAdapter for JkBmsRs485Adapter {
    /// Never blocks: returns whatever the background listener has
    /// accumulated so far, which may be empty right after `connect`.
    async fn poll(&self) -> BatteryBankTelemetry {
        let state = self.state.lock().await;
        let mut bank = BatteryBankTelemetry { ts: Some(chrono::Utc::now()), ..Default::default() };

        let mut battery_ids: Vec<&u8> = state.batteries.keys().collect();
        battery_ids.sort();

        for &battery_id in &battery_ids {
            if *battery_id >= self.batteries_expected {
                continue;
            }
            let Some(status) = state.batteries[battery_id].status.as_ref() else { continue };

            let unit_index = (*battery_id as u32) + 1;
            let valid_cells: Vec<f64> = status.cell_voltages_v.iter().filter_map(|v| *v).collect();
            let voltage_v = status.pack_voltage_v.or_else(|| (!valid_cells.is_empty()).then(|| valid_cells.iter().sum()));
            let valid_temps: Vec<f64> = status.temps_c.iter().filter_map(|t| *t).collect();
            let avg_temp = (!valid_temps.is_empty()).then(|| valid_temps.iter().sum::<f64>() / valid_temps.len() as f64);

            let voltage_stats = cell_stats(&valid_cells);
            bank.units.push(UnitTelemetry {
                power: unit_index,
                voltage_v,
                current_a: status.current_a,
                temp_c: avg_temp,
                soc_pct: status.soc_pct,
                soh_pct: status.soh_pct,
                cycles: status.cycle_count,
                voltage_stats,
                temp_stats: CellStats::default(),
            });

            bank.cells.extend(status.cell_voltages_v.iter().enumerate().filter_map(|(i, v)| {
                v.map(|voltage| CellReading { power: unit_index, cell: (i + 1) as u32, voltage_v: Some(voltage), temp_c: avg_temp })
            }));
            bank.cells_per_battery = bank.cells_per_battery.max(status.cell_voltages_v.len() as u32);
        }

        bank.recompute_aggregates();
        bank
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

#[cfg(test)]
mod tests {
    use super::*;

    // Invariant 9: Modbus request frame battery-id attribution, including the
    // firmware's 15 -> 0 wrap quirk.
    #[test]
    fn frame_kind_detection_prefers_earliest_marker() {
        let mut data = vec![0u8; 10];
        data[8] = 0x55;
        data[9] = 0xAA;
        let (pos, kind) = find_next_frame_start(&data, 0).unwrap();
        assert_eq!(pos, 8);
        assert_eq!(kind, FrameKind::Data);
    }

    #[test]
    fn modbus_frame_requires_valid_trailing_crc() {
        let mut frame = vec![0x00, 0x10, 0x16, MODBUS_REQUEST, 0xAA, 0xBB];
        let crc = modbus_crc16(&frame[..4]);
        frame[4] = (crc & 0xFF) as u8;
        frame[5] = (crc >> 8) as u8;
        let parsed = parse_modbus_frame(&frame).unwrap();
        assert_eq!(parsed, (0, MODBUS_REQUEST, 6));
    }

    #[test]
    fn battery_id_fifteen_wraps_to_zero() {
        // The adapter applies this normalization inline in the listener loop;
        // this just documents the constant the spec calls out.
        let raw_id: u8 = 15;
        let normalized = if raw_id == 15 { 0 } else { raw_id };
        assert_eq!(normalized, 0);
    }
}
