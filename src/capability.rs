use serde::Serialize;

// --------------------------------------------------------------------------------------------------------------
// Each adapter advertises its Time-of-Use scheduling capacity so an upstream
// planner can target it with a compatible request shape instead of probing
// at runtime. Plain data, no behaviour.
// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TouWindowCapability {
    pub max_windows: u8,
    pub bidirectional: bool,
    pub separate_charge_discharge: bool,
    pub max_charge_windows: u8,
    pub max_discharge_windows: u8,
}

impl TouWindowCapability {
    pub const fn bidirectional(max_windows: u8) -> Self {
        Self {
            max_windows,
            bidirectional: true,
            separate_charge_discharge: false,
            max_charge_windows: max_windows,
            max_discharge_windows: max_windows,
        }
    }

    pub const fn split(max_charge_windows: u8, max_discharge_windows: u8) -> Self {
        let max_windows = if max_charge_windows > max_discharge_windows { max_charge_windows } else { max_discharge_windows };
        Self {
            max_windows,
            bidirectional: false,
            separate_charge_discharge: true,
            max_charge_windows,
            max_discharge_windows,
        }
    }

    pub const fn none() -> Self {
        Self { max_windows: 0, bidirectional: false, separate_charge_discharge: false, max_charge_windows: 0, max_discharge_windows: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Invariant 7: TOU capacity consistency.
    #[test]
    fn bidirectional_capacity_is_symmetric() {
        let cap = TouWindowCapability::bidirectional(6);
        assert_eq!(cap.max_charge_windows, cap.max_discharge_windows);
        assert_eq!(cap.max_charge_windows, cap.max_windows);
        assert!(cap.max_windows >= cap.max_charge_windows && cap.max_windows >= cap.max_discharge_windows);
    }

    #[test]
    fn split_capacity_bounds_hold() {
        let cap = TouWindowCapability::split(3, 3);
        assert!(cap.max_windows >= cap.max_charge_windows);
        assert!(cap.max_windows >= cap.max_discharge_windows);
    }
}
