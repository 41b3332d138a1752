use serde::{Deserialize, Serialize};
use serde_json::Value;

// --------------------------------------------------------------------------------------------------------------
// Uniform command surface. Adapters that don't implement a given action
// return `ok()` rather than an error, so upstream generic actions (e.g. a
// scheduler issuing `set_max_grid_charge_power_w` to every adapter in a
// fleet) remain portable across device families.
// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self { ok: true, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { ok: false, reason: Some(reason.into()) }
    }
}

pub mod actions {
    pub const SET_WORK_MODE: &str = "set_work_mode";
    pub const SET_GRID_CHARGE: &str = "set_grid_charge";
    pub const SET_DISCHARGE_LIMITS: &str = "set_discharge_limits";
    pub const SET_MAX_GRID_CHARGE_POWER_W: &str = "set_max_grid_charge_power_w";
    pub const SET_MAX_CHARGE_POWER_W: &str = "set_max_charge_power_w";
    pub const SET_MAX_DISCHARGE_POWER_W: &str = "set_max_discharge_power_w";
    pub const WRITE: &str = "write";
    pub const WRITE_MANY: &str = "write_many";

    pub fn tou_window(n: u8) -> String {
        format!("set_tou_window{n}")
    }

    pub fn tou_discharge_window(n: u8) -> String {
        format!("set_tou_discharge_window{n}")
    }
}
