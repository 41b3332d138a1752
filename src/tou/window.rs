use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// TOU window normalizer. Reconciles two vendor conventions:
//
//  - bidirectional: one set of windows, direction inferred at apply time from
//    target vs. current battery state (`WindowType::Auto`).
//  - split: separate charge/discharge window families, direction is always
//    explicit (`WindowType::Charge` / `WindowType::Discharge`).
//
// `TouWindow` is the single model both families normalize to and from.
// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Charge,
    Discharge,
    Auto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    SocPct(f64),
    VoltageV(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouWindow {
    pub start_time: String,
    pub end_time: String,
    pub power_w: u32,
    pub target: Target,
    #[serde(rename = "type")]
    pub window_type: WindowType,
}

/// Resolved direction for a single window, given the battery's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Charge,
    Discharge,
}

impl TouWindow {
    /// Resolves `Auto` windows by comparing the window's target against the
    /// battery's current SOC or voltage (whichever the target is expressed
    /// in). `Charge`/`Discharge` windows resolve to themselves unconditionally.
    pub fn resolve_direction(&self, current_soc_pct: Option<f64>, current_voltage_v: Option<f64>) -> Direction {
        match self.window_type {
            WindowType::Charge => Direction::Charge,
            WindowType::Discharge => Direction::Discharge,
            WindowType::Auto => {
                let (target, current) = match (self.target, current_soc_pct, current_voltage_v) {
                    (Target::SocPct(t), Some(c), _) => (t, c),
                    (Target::VoltageV(t), _, Some(c)) => (t, c),
                    (Target::SocPct(t), None, _) => (t, t - 1.0),
                    (Target::VoltageV(t), _, None) => (t, t - 1.0),
                };
                if target > current {
                    Direction::Charge
                } else {
                    Direction::Discharge
                }
            }
        }
    }

    pub fn validate(&self) -> DeviceResult<()> {
        if !self.start_time.contains(':') || !self.end_time.contains(':') {
            return Err(DeviceError::RegisterError(format!(
                "TOU window has malformed time: {} - {}",
                self.start_time, self.end_time
            )));
        }
        Ok(())
    }
}

/// Sign convention for a charge-mode bitfield used by bidirectional adapters:
/// bit 0 set iff the window charges. Other bits are adapter-specific and are
/// left untouched by the normalizer.
pub fn charge_mode_bit(direction: Direction) -> u16 {
    match direction {
        Direction::Charge => 0x0001,
        Direction::Discharge => 0x0000,
    }
}

/// Battery power/current sign normalization: positive = charging. Some
/// vendors report the opposite polarity on the wire; adapters pass `invert =
/// true` for those registers.
pub fn normalize_battery_power(raw_w: f64, invert: bool) -> f64 {
    if invert {
        -raw_w
    } else {
        raw_w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S5 - bidirectional charge window direction resolution.
    #[test]
    fn s5_auto_window_resolves_to_charge() {
        let window = TouWindow {
            start_time: "02:00".to_string(),
            end_time: "05:00".to_string(),
            power_w: 3000,
            target: Target::SocPct(80.0),
            window_type: WindowType::Auto,
        };
        let direction = window.resolve_direction(Some(40.0), None);
        assert_eq!(direction, Direction::Charge);
        assert_eq!(charge_mode_bit(direction), 0x0001);
    }

    #[test]
    fn auto_window_resolves_to_discharge_when_target_below_current() {
        let window = TouWindow {
            start_time: "18:00".to_string(),
            end_time: "21:00".to_string(),
            power_w: 2000,
            target: Target::SocPct(30.0),
            window_type: WindowType::Auto,
        };
        assert_eq!(window.resolve_direction(Some(80.0), None), Direction::Discharge);
    }

    #[test]
    fn battery_power_sign_invert() {
        assert_eq!(normalize_battery_power(500.0, false), 500.0);
        assert_eq!(normalize_battery_power(500.0, true), -500.0);
    }
}
