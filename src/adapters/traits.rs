use async_trait::async_trait;
use serde_json::Value;

use crate::capability::TouWindowCapability;
use crate::error::DeviceResult;
use crate::telemetry::{BatteryBankTelemetry, MeterTelemetry, Telemetry};

use super::command::{Command, CommandResponse};

// --------------------------------------------------------------------------------------------------------------
// Capability set every adapter implements. Split by telemetry shape into
// three poll traits (inverter / battery bank / meter) rather than one trait
// with an enum return, mirroring the source tool's three adapter base classes.
// --------------------------------------------------------------------------------------------------------------

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Idempotent - calling `connect` on an already-connected adapter is a no-op.
    async fn connect(&self) -> DeviceResult<()>;

    /// Idempotent - calling `close` on an already-closed adapter is a no-op.
    async fn close(&self) -> DeviceResult<()>;

    async fn check_connectivity(&self) -> bool;

    async fn read_serial_number(&self) -> Option<String>;

    fn get_tou_window_capability(&self) -> TouWindowCapability {
        TouWindowCapability::none()
    }

    /// Adapters that don't implement a given action return `ok()`, not an error.
    async fn handle_command(&self, command: Command) -> CommandResponse {
        let _ = command;
        CommandResponse::ok()
    }
}

#[async_trait]
pub trait InverterAdapter: Adapter {
    async fn poll(&self) -> Telemetry;

    async fn read_by_ident(&self, id: &str) -> DeviceResult<Value>;
    async fn write_by_ident(&self, id: &str, value: Value) -> DeviceResult<()>;
}

#[async_trait]
pub trait BatteryAdapter: Adapter {
    async fn poll(&self) -> BatteryBankTelemetry;
}

#[async_trait]
pub trait MeterAdapter: Adapter {
    async fn poll(&self) -> MeterTelemetry;
}
