use std::net::SocketAddr;
use std::time::Instant;

use log::LevelFilter;
use tokio::time::{sleep, Duration};

// --------------------------------------------------------------------------------------------------------------

mod adapters;
mod capability;
mod configuration;
mod crc;
mod error;
mod modbus_session;
mod registers;
mod telemetry;
mod tou;
mod transport;

use adapters::{Adapter, BatteryAdapter, InverterAdapter, MeterAdapter};
use configuration::config::{load_config, BatteryConfig, Config, InverterConfig, ModbusTransportConfig};

// --------------------------------------------------------------------------------------------------------------

fn resolve_modbus_addr(host: &str, port: u16) -> SocketAddr {
    format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| panic!("invalid meter/inverter address {host}:{port}"))
}

fn build_inverter(cfg: &InverterConfig) -> Box<dyn InverterAdapter> {
    match cfg {
        InverterConfig::HybridSinglePhase { register_map_file, transport, invert_battery_power, .. } => {
            let transport = match transport {
                ModbusTransportConfig::Rtu { device_path, baud_rate, unit_id } => {
                    adapters::hybrid_inverter::InverterTransportConfig::Rtu {
                        device_path: device_path.clone(),
                        baud_rate: *baud_rate,
                        unit_id: *unit_id,
                    }
                }
                ModbusTransportConfig::Tcp { host, port, unit_id } => {
                    adapters::hybrid_inverter::InverterTransportConfig::Tcp { addr: resolve_modbus_addr(host, *port), unit_id: *unit_id }
                }
            };
            Box::new(
                adapters::HybridInverterAdapter::new(register_map_file, transport, *invert_battery_power)
                    .expect("loading hybrid inverter register map"),
            )
        }
        InverterConfig::HybridThreePhase { register_map_file, transport, configured_phase, .. } => {
            let transport = match transport {
                ModbusTransportConfig::Rtu { device_path, baud_rate, unit_id } => {
                    adapters::hybrid_three_phase::InverterTransportConfig::Rtu {
                        device_path: device_path.clone(),
                        baud_rate: *baud_rate,
                        unit_id: *unit_id,
                    }
                }
                ModbusTransportConfig::Tcp { host, port, unit_id } => {
                    adapters::hybrid_three_phase::InverterTransportConfig::Tcp { addr: resolve_modbus_addr(host, *port), unit_id: *unit_id }
                }
            };
            let phase = configured_phase.as_deref().and_then(|p| match p.to_ascii_lowercase().as_str() {
                "single" => Some(adapters::phase_detect::PhaseType::Single),
                "three" => Some(adapters::phase_detect::PhaseType::Three),
                _ => None,
            });
            Box::new(
                adapters::HybridThreePhaseAdapter::new(register_map_file, transport, phase)
                    .expect("loading three-phase hybrid inverter register map"),
            )
        }
        InverterConfig::SplitTouInverter { register_map_file, transport, .. } => {
            let transport = match transport {
                ModbusTransportConfig::Rtu { device_path, baud_rate, unit_id } => {
                    adapters::split_tou_inverter::InverterTransportConfig::Rtu {
                        device_path: device_path.clone(),
                        baud_rate: *baud_rate,
                        unit_id: *unit_id,
                    }
                }
                ModbusTransportConfig::Tcp { host, port, unit_id } => {
                    adapters::split_tou_inverter::InverterTransportConfig::Tcp { addr: resolve_modbus_addr(host, *port), unit_id: *unit_id }
                }
            };
            Box::new(
                adapters::SplitTouInverterAdapter::new(register_map_file, transport)
                    .expect("loading split-TOU inverter register map"),
            )
        }
    }
}

fn build_battery(cfg: &BatteryConfig) -> Box<dyn BatteryAdapter> {
    match cfg {
        BatteryConfig::JkBmsBle { addresses, bt_adapter_name, .. } => {
            Box::new(adapters::JkBmsBleAdapter::new(addresses.clone(), bt_adapter_name.clone()))
        }
        BatteryConfig::JkBmsRs485Tcp { host, port, batteries_expected, cells_per_battery, .. } => {
            let transport = adapters::jkbms_rs485::Rs485TransportConfig::TcpGateway { addr: resolve_modbus_addr(host, *port) };
            Box::new(adapters::JkBmsRs485Adapter::new(transport, *batteries_expected, *cells_per_battery))
        }
        BatteryConfig::JkBmsRs485Serial { device_path, baud_rate, batteries_expected, cells_per_battery, .. } => {
            let transport = adapters::jkbms_rs485::Rs485TransportConfig::Serial { device_path: device_path.clone(), baud_rate: *baud_rate };
            Box::new(adapters::JkBmsRs485Adapter::new(transport, *batteries_expected, *cells_per_battery))
        }
        BatteryConfig::Pytes { device_path, baud_rate, batteries, .. } => {
            Box::new(adapters::PytesBatteryAdapter::new(device_path.clone(), *baud_rate, *batteries))
        }
    }
}

fn build_meter(cfg: &configuration::config::MeterConfig) -> Box<dyn MeterAdapter> {
    let addr = resolve_modbus_addr(&cfg.host, cfg.port);
    Box::new(
        adapters::IamMeterAdapter::new(&cfg.register_map_file, addr, cfg.unit_id, cfg.prefer_legacy_registers)
            .expect("loading IAMMeter register map"),
    )
}

fn log_config_summary(config: &Config) {
    log::info!(
        "=== Energy Management System starting: {} inverter(s), {} battery bank(s), {} meter(s) ===",
        config.inverters.len(),
        config.batteries.len(),
        config.meters.len(),
    );
    log::info!("Poll interval: {}s", config.poll_interval_seconds);
}

#[tokio::main]
async fn main() {
    let config = load_config();

    if let Err(e) =
        env_logger::Builder::new().filter_level(config.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)).try_init()
    {
        eprintln!("Failed to initialise logger: {}", e);
        panic!("Cannot start without logging");
    }

    log_config_summary(&config);

    let inverters: Vec<Box<dyn InverterAdapter>> = config.inverters.iter().map(build_inverter).collect();
    let batteries: Vec<Box<dyn BatteryAdapter>> = config.batteries.iter().map(build_battery).collect();
    let meters: Vec<Box<dyn MeterAdapter>> = config.meters.iter().map(build_meter).collect();

    for inverter in &inverters {
        if let Err(e) = inverter.connect().await {
            log::warn!("[inverter] initial connect failed: {e}");
        }
    }
    for battery in &batteries {
        if let Err(e) = battery.connect().await {
            log::warn!("[battery] initial connect failed: {e}");
        }
    }
    for meter in &meters {
        if let Err(e) = meter.connect().await {
            log::warn!("[meter] initial connect failed: {e}");
        }
    }

    let interval = Duration::from_secs(config.poll_interval_seconds);

    // ----------------------------------------------------------------------------------------------------------
    // Single control loop: poll every configured device, log the normalized
    // telemetry, sleep for whatever remains of the interval. Command issuing
    // and plant-wide optimization are external collaborators against the
    // `handle_command`/`read_by_ident`/`write_by_ident` surface, not this loop.
    // ----------------------------------------------------------------------------------------------------------
    loop {
        let cycle_start = Instant::now();

        for inverter in &inverters {
            let telemetry = inverter.poll().await;
            log::info!(
                "[inverter] pv={:?}W load={:?}W grid={:?}W batt={:?}W soc={:?}% mode={:?}",
                telemetry.pv_power_w,
                telemetry.load_power_w,
                telemetry.grid_power_w,
                telemetry.batt_power_w,
                telemetry.batt_soc_pct,
                telemetry.inverter_mode,
            );
        }

        for battery in &batteries {
            let bank = battery.poll().await;
            log::info!(
                "[battery] units={} avg_voltage={:?}V total_current={:?}A avg_soc={:?}%",
                bank.units.len(),
                bank.avg_voltage_v,
                bank.total_current_a,
                bank.avg_soc_pct,
            );
        }

        for meter in &meters {
            let reading = meter.poll().await;
            log::info!(
                "[meter] power={:?}W voltage={:?}V today_import={:?}Wh today_export={:?}Wh",
                reading.power_w,
                reading.voltage_v,
                reading.today_import_energy,
                reading.today_export_energy,
            );
        }

        let elapsed = cycle_start.elapsed();
        if elapsed < interval {
            let remaining = interval - elapsed;
            log::debug!("[EMS] Cycle done in {:?}. Sleeping {:?}.", elapsed, remaining);
            sleep(remaining).await;
        } else {
            log::warn!("[EMS] Cycle took {:?}, overran interval {:?} - skipping sleep.", elapsed, interval);
        }
    }
}
