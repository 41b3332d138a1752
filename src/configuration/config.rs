use serde::Deserialize;
use std::fs;

// --------------------------------------------------------------------------------------------------------------
// Adapter-oriented configuration: one entry per physical device, each
// carrying whatever its transport needs plus a register map file where
// applicable. `load_config` stays a flat "read config.json" call like the
// original tool; only the shape of what it reads has changed.
// --------------------------------------------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InverterConfig {
    HybridSinglePhase {
        id: String,
        register_map_file: String,
        transport: ModbusTransportConfig,
        #[serde(default)]
        invert_battery_power: bool,
    },
    HybridThreePhase {
        id: String,
        register_map_file: String,
        transport: ModbusTransportConfig,
        /// Fixed phase assignment when the device can't be probed for it;
        /// `None` lets the adapter's phase detector latch onto whatever it observes.
        #[serde(default)]
        configured_phase: Option<String>,
    },
    SplitTouInverter {
        id: String,
        register_map_file: String,
        transport: ModbusTransportConfig,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModbusTransportConfig {
    Rtu { device_path: String, baud_rate: u32, unit_id: u8 },
    Tcp { host: String, port: u16, unit_id: u8 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatteryConfig {
    JkBmsBle {
        id: String,
        /// One BLE address per physical pack; packs are connected and polled
        /// sequentially with inter-pack spacing (the host BLE stack rejects
        /// concurrent scan/connect operations).
        addresses: Vec<String>,
        bt_adapter_name: Option<String>,
    },
    JkBmsRs485Tcp {
        id: String,
        host: String,
        port: u16,
        batteries_expected: u8,
        cells_per_battery: usize,
    },
    JkBmsRs485Serial {
        id: String,
        device_path: String,
        baud_rate: u32,
        batteries_expected: u8,
        cells_per_battery: usize,
    },
    Pytes {
        id: String,
        device_path: String,
        baud_rate: u32,
        batteries: u8,
    },
}

#[derive(Deserialize, Debug, Clone)]
pub struct MeterConfig {
    pub id: String,
    pub register_map_file: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    #[serde(default)]
    pub prefer_legacy_registers: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub inverters: Vec<InverterConfig>,
    #[serde(default)]
    pub batteries: Vec<BatteryConfig>,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,

    /// Single polling cadence shared by every configured device this cycle.
    /// The RS-485 sniffer ignores it (it never blocks on poll).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "Info".to_string()
}

pub fn load_config() -> Config {
    let config_file = "config.json";
    let config_data = fs::read_to_string(config_file).expect("Failed to read configuration file");
    serde_json::from_str(&config_data).expect("Failed to parse configuration file")
}
