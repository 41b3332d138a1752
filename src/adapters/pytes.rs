use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::capability::TouWindowCapability;
use crate::error::DeviceResult;
use crate::telemetry::{BatteryBankTelemetry, CellReading, CellStats, UnitTelemetry};
use crate::transport::SerialConsole;

use super::command::{Command, CommandResponse};
use super::traits::{Adapter, BatteryAdapter};

// --------------------------------------------------------------------------------------------------------------
// Pytes/Pylontech console battery bank. One serial console is shared by every
// pack in the bank (it's wired to the master unit); commands are line-based
// ASCII and every poll cycle issues a handful of them at different cadences:
// `info` once at startup, `stat` every 5 minutes, `pwr N`/`bat N` every cycle
// per pack, `soh N` once per pack per day. Anything not due this cycle falls
// back to whatever the last poll produced.
// --------------------------------------------------------------------------------------------------------------

const STAT_INTERVAL: Duration = Duration::from_secs(300);
const SOH_INTERVAL: Duration = Duration::from_secs(86_400);
const INTER_COMMAND_DELAY: Duration = Duration::from_millis(500);
const INTER_BATTERY_DELAY: Duration = Duration::from_millis(300);

struct PollState {
    info_called: bool,
    last_stat_at: Option<Instant>,
    last_soh_at: HashMap<u8, Instant>,
    cached_soh: HashMap<u8, f64>,
    cached_cycles: HashMap<u8, u32>,
    cached_stat_soh: Option<f64>,
    cached_stat_cycles: Option<u32>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            info_called: false,
            last_stat_at: None,
            last_soh_at: HashMap::new(),
            cached_soh: HashMap::new(),
            cached_cycles: HashMap::new(),
            cached_stat_soh: None,
            cached_stat_cycles: None,
        }
    }
}

pub struct PytesBatteryAdapter {
    console: SerialConsole,
    batteries: u8,
    state: Mutex<PollState>,
}

impl PytesBatteryAdapter {
    pub fn new(device_path: impl Into<String>, baud_rate: u32, batteries: u8) -> Self {
        Self { console: SerialConsole::new(device_path, baud_rate), batteries, state: Mutex::new(PollState::default()) }
    }

    /// `Voltage         :   12345678` style fixed-column row: label ends at
    /// column 19, an 8-digit numeric field runs through column 27.
    fn fixed_field(line: &str) -> Option<&str> {
        line.get(19..27).map(|s| s.trim())
    }

    fn parse_pwr_response(lines: &[String]) -> HashMap<&'static str, String> {
        let mut parsed = HashMap::new();
        for line in lines {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            let key = if trimmed.starts_with("Voltage         :") {
                Some("voltage")
            } else if trimmed.starts_with("Current         :") {
                Some("current")
            } else if trimmed.starts_with("Temperature     :") {
                Some("temperature")
            } else if trimmed.starts_with("Coulomb         :") {
                Some("soc")
            } else {
                None
            };
            if let (Some(key), Some(value)) = (key, Self::fixed_field(trimmed)) {
                parsed.insert(key, value.to_string());
            }
        }
        parsed
    }

    /// `bat N` response: a whitespace(2+)-delimited column table. Some
    /// firmware drops the `SOC` header entirely; when that happens the
    /// Coulomb column (present) sits one position before where SOC would
    /// have been, so the fallback reuses that slot.
    fn parse_cell_table(power: u8, lines: &[String]) -> (Vec<CellReading>, Option<f64>, Option<f64>) {
        let header_idx = lines.iter().position(|l| l.contains("Battery") && l.contains("Volt"));
        let Some(header_idx) = header_idx else {
            return (Vec::new(), None, None);
        };

        let header: Vec<&str> = split_columns(&lines[header_idx]);
        let mut cell_idx = None;
        let mut volt_idx = None;
        let mut temp_idx = None;
        let mut soc_idx = None;
        let mut coulomb_idx = None;
        for (j, col) in header.iter().enumerate() {
            match *col {
                "Battery" => cell_idx = Some(j),
                "Volt" => volt_idx = Some(j),
                "Tempr" => temp_idx = Some(j),
                "SOC" => soc_idx = Some(j),
                "Coulomb" => coulomb_idx = Some(j),
                _ => {}
            }
        }
        if soc_idx.is_none() {
            if let Some(coulomb) = coulomb_idx {
                soc_idx = Some(coulomb);
                coulomb_idx = Some(coulomb + 1);
            }
        }
        let _ = coulomb_idx;

        let mut cells = Vec::new();
        let mut soc_total = 0.0;
        let mut soc_count = 0u32;
        for line in &lines[header_idx + 1..] {
            if line.contains("Command completed") {
                break;
            }
            let cols = split_columns(line);
            if cols.is_empty() {
                continue;
            }
            let cell = cell_idx.and_then(|i| cols.get(i)).and_then(|v| v.parse::<u32>().ok()).map(|v| v + 1);
            let voltage_v = volt_idx.and_then(|i| cols.get(i)).and_then(|v| v.parse::<f64>().ok()).map(|v| v / 1000.0);
            let temp_c = temp_idx.and_then(|i| cols.get(i)).and_then(|v| v.parse::<f64>().ok()).map(|v| v / 1000.0);
            if let Some(soc) = soc_idx.and_then(|i| cols.get(i)).and_then(|v| v.parse::<f64>().ok()) {
                soc_total += soc;
                soc_count += 1;
            }
            if let Some(cell) = cell {
                cells.push(CellReading { power: power as u32, cell, voltage_v, temp_c });
            }
        }

        let soc_pct = (soc_count > 0).then(|| soc_total / soc_count as f64);
        let avg_temp = {
            let temps: Vec<f64> = cells.iter().filter_map(|c| c.temp_c).collect();
            (!temps.is_empty()).then(|| temps.iter().sum::<f64>() / temps.len() as f64)
        };
        (cells, soc_pct, avg_temp)
    }

    /// `soh N` response is a per-cell table of cycle counts and a status
    /// string per cell. There's no single SOH percentage field: it's derived
    /// from the fraction of cells reporting `Normal`.
    async fn send_soh_command(&self, unit: u8) -> DeviceResult<Option<(f64, u32)>> {
        let lines = self.console.query(&format!("soh {unit}"), Duration::from_secs(2)).await?;
        let mut soh_counts = Vec::new();
        let mut soh_statuses = Vec::new();
        let mut in_table = false;
        for line in &lines {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.contains("Battery") && trimmed.contains("Voltage") && trimmed.contains("SOHCount") {
                in_table = true;
                continue;
            }
            if trimmed.starts_with("soh ")
                || trimmed.starts_with("Power")
                || trimmed.starts_with("pylon>")
                || trimmed.starts_with('@')
                || trimmed.contains("Command completed")
            {
                continue;
            }
            if in_table {
                let parts: Vec<&str> = trimmed.split_whitespace().collect();
                if parts.len() >= 4 {
                    if let Ok(count) = parts[2].parse::<u32>() {
                        soh_counts.push(count);
                        soh_statuses.push(parts[3]);
                    }
                }
            }
        }
        if soh_counts.is_empty() {
            return Ok(None);
        }
        let max_cycles = *soh_counts.iter().max().unwrap();
        let normal_count = soh_statuses.iter().filter(|s| s.eq_ignore_ascii_case("normal")).count();
        let soh_pct = if normal_count == soh_statuses.len() { 100.0 } else { (normal_count as f64 / soh_statuses.len() as f64) * 100.0 };
        Ok(Some((soh_pct, max_cycles)))
    }

    async fn send_stat_command(&self) -> DeviceResult<(Option<f64>, Option<u32>)> {
        for cmd in ["stat", "status"] {
            let lines = match self.console.query(cmd, Duration::from_secs(2)).await {
                Ok(lines) if !lines.is_empty() => lines,
                _ => continue,
            };
            let mut soh = None;
            let mut cycle_count = None;
            for line in &lines {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                let Some((key, value)) = trimmed.split_once(':') else { continue };
                let key_lower = key.trim().to_lowercase();
                let value = value.trim();
                if key_lower.contains("soh") && !key_lower.contains("state of health") {
                    if let Ok(v) = value.trim_end_matches('%').parse::<f64>() {
                        soh = Some(v);
                    }
                } else if key_lower.contains("cycle") && key_lower.contains("times") {
                    if let Ok(v) = value.parse::<u32>() {
                        cycle_count = Some(v);
                    }
                }
            }
            if soh.is_some() || cycle_count.is_some() {
                return Ok((soh, cycle_count));
            }
        }
        Ok((None, None))
    }
}

/// Splits a header or data row on runs of 2+ whitespace characters, the
/// delimiter the console uses between table columns.
fn split_columns(line: &str) -> Vec<&str> {
    line.trim().split("  ").map(str::trim).filter(|s| !s.is_empty()).collect()
}

#[async_trait]
impl Adapter for PytesBatteryAdapter {
    async fn connect(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        self.console.close().await;
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        self.console.query("info", Duration::from_secs(2)).await.is_ok()
    }

    async fn read_serial_number(&self) -> Option<String> {
        let lines = self.console.query("info", Duration::from_secs(2)).await.ok()?;
        for line in &lines {
            if let Some((key, value)) = line.split_once(':') {
                if key.trim().eq_ignore_ascii_case("Barcode") {
                    return Some(value.trim().to_string());
                }
            }
        }
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
impl BatteryAdapter for PytesBatteryAdapter {
    async fn poll(&self) -> BatteryBankTelemetry {
        let mut state = self.state.lock().await;
        let mut bank = BatteryBankTelemetry { ts: Some(chrono::Utc::now()), ..Default::default() };

        if !state.info_called {
            if self.console.query("info", Duration::from_secs(2)).await.is_ok() {
                state.info_called = true;
            }
        }

        let stat_due = state.last_stat_at.map(|t| t.elapsed() >= STAT_INTERVAL).unwrap_or(true);
        if stat_due {
            if let Ok((soh, cycles)) = self.send_stat_command().await {
                state.cached_stat_soh = soh;
                state.cached_stat_cycles = cycles;
                state.last_stat_at = Some(Instant::now());
            }
        }
        let stat_soh = state.cached_stat_soh;
        let stat_cycles = state.cached_stat_cycles;

        for power in 1..=self.batteries {
            let pwr_lines = match self.console.query(&format!("pwr {power}"), Duration::from_secs(2)).await {
                Ok(lines) => lines,
                Err(_) => Vec::new(),
            };
            tokio::time::sleep(INTER_COMMAND_DELAY).await;

            let fields = Self::parse_pwr_response(&pwr_lines);
            let voltage_v = fields.get("voltage").and_then(|v| v.parse::<f64>().ok()).map(|v| v / 1000.0);
            let current_a = fields.get("current").and_then(|v| v.parse::<f64>().ok()).map(|v| v / 1000.0);
            let temp_c = fields.get("temperature").and_then(|v| v.parse::<f64>().ok()).map(|v| v / 1000.0);
            let mut soc_pct = fields.get("soc").and_then(|v| v.parse::<f64>().ok());

            let soh_due = state.last_soh_at.get(&power).map(|t| t.elapsed() >= SOH_INTERVAL).unwrap_or(true);
            let mut soh_pct = None;
            let mut cycles = None;
            if soh_due {
                if let Ok(Some((pct, count))) = self.send_soh_command(power).await {
                    soh_pct = Some(pct);
                    cycles = Some(count);
                    state.cached_cycles.insert(power, count);
                    state.last_soh_at.insert(power, Instant::now());
                    tokio::time::sleep(INTER_COMMAND_DELAY).await;
                }
            } else {
                soh_pct = state.cached_soh.get(&power).copied();
                cycles = state.cached_cycles.get(&power).copied();
            }
            if soh_pct.is_none() {
                soh_pct = stat_soh;
            }
            if cycles.is_none() {
                cycles = stat_cycles;
            }
            if let Some(soh) = soh_pct {
                state.cached_soh.insert(power, soh);
            }

            let bat_lines = match self.console.query(&format!("bat {power}"), Duration::from_secs(2)).await {
                Ok(lines) => lines,
                Err(_) => Vec::new(),
            };
            tokio::time::sleep(INTER_COMMAND_DELAY).await;
            let (cells, table_soc, table_temp) = Self::parse_cell_table(power, &bat_lines);
            if soc_pct.is_none() {
                soc_pct = table_soc;
            }
            let temp_c = temp_c.or(table_temp);

            let valid_voltages: Vec<f64> = cells.iter().filter_map(|c| c.voltage_v).collect();
            let voltage_stats = cell_stats(&valid_voltages);
            let valid_temps: Vec<f64> = cells.iter().filter_map(|c| c.temp_c).collect();
            let temp_stats = cell_stats(&valid_temps);
            let this_unit_cells = cells.len() as u32;

            bank.units.push(UnitTelemetry { power: power as u32, voltage_v, current_a, temp_c, soc_pct, soh_pct, cycles, voltage_stats, temp_stats });
            bank.cells.extend(cells);
            bank.cells_per_battery = bank.cells_per_battery.max(this_unit_cells);

            if power < self.batteries {
                tokio::time::sleep(INTER_BATTERY_DELAY).await;
            }
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

    #[test]
    fn fixed_field_reads_column_19_through_27() {
        let line = "Voltage         :   53200 ";
        let value = PytesBatteryAdapter::fixed_field(line).unwrap();
        assert_eq!(value.trim(), "53200");
    }

    #[test]
    fn pwr_response_parses_known_fields() {
        let lines = vec!["Voltage         :   53200  ".to_string(), "Current         :    1500  ".to_string()];
        let parsed = PytesBatteryAdapter::parse_pwr_response(&lines);
        assert_eq!(parsed.get("voltage").unwrap().trim(), "53200");
        assert_eq!(parsed.get("current").unwrap().trim(), "1500");
    }

    #[test]
    fn cell_table_falls_back_to_coulomb_when_soc_header_missing() {
        let lines = vec![
            "Battery  Volt  Tempr  Coulomb".to_string(),
            "0  3300  2500  87".to_string(),
            "Command completed".to_string(),
        ];
        let (cells, soc, _) = PytesBatteryAdapter::parse_cell_table(1, &lines);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].cell, 1);
        assert_eq!(soc, Some(87.0));
    }
}
