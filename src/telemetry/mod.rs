pub mod mapper;
pub mod record;

pub use mapper::TelemetryMapper;
pub use record::{fields, BatteryBankTelemetry, CellReading, CellStats, MeterTelemetry, Telemetry, ThreePhaseTelemetry, UnitTelemetry};
