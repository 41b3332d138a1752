use std::sync::Mutex;

// --------------------------------------------------------------------------------------------------------------
// Three-phase vs. single-phase detection for the hybrid inverter family.
// Priority order per device metadata: explicit config wins, then presence of
// any per-phase telemetry field, then the `inverter_type` enum label, then
// the `grid_type_setting` register. Once a device is seen to be three-phase
// it never gets reclassified as single-phase on a later, incomplete poll.
// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseType {
    Single,
    Three,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseDetectionInput<'a> {
    pub configured: Option<PhaseType>,
    pub telemetry_has_per_phase: bool,
    pub inverter_type_label: Option<&'a str>,
    pub grid_type_setting: Option<&'a str>,
}

fn detect_once(input: &PhaseDetectionInput) -> PhaseType {
    if let Some(configured) = input.configured {
        return configured;
    }
    if input.telemetry_has_per_phase {
        return PhaseType::Three;
    }
    if let Some(label) = input.inverter_type_label {
        if label.eq_ignore_ascii_case("3 phase hybrid inverter") {
            return PhaseType::Three;
        }
    }
    if let Some(grid_type) = input.grid_type_setting {
        let lowered = grid_type.to_ascii_lowercase();
        if lowered.contains("three") || lowered.contains('3') {
            return PhaseType::Three;
        }
    }
    PhaseType::Single
}

/// Sticky detector: latches onto `Three` permanently once observed, so a
/// poll cycle that happens to omit per-phase fields never demotes a known
/// three-phase inverter back to single-phase.
pub struct PhaseDetector {
    latched: Mutex<Option<PhaseType>>,
}

impl PhaseDetector {
    pub fn new() -> Self {
        Self { latched: Mutex::new(None) }
    }

    pub fn detect(&self, input: &PhaseDetectionInput) -> PhaseType {
        let mut latch = self.latched.lock().unwrap();
        let result = match *latch {
            Some(PhaseType::Three) => PhaseType::Three,
            _ => detect_once(input),
        };
        *latch = Some(result);
        result
    }
}

impl Default for PhaseDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Invariant 6: phase detection never escalates from three back to single.
    #[test]
    fn sticky_three_phase_latch() {
        let detector = PhaseDetector::new();
        let three_phase_input = PhaseDetectionInput { telemetry_has_per_phase: true, ..Default::default() };
        assert_eq!(detector.detect(&three_phase_input), PhaseType::Three);

        let ambiguous_input = PhaseDetectionInput::default();
        assert_eq!(detector.detect(&ambiguous_input), PhaseType::Three);
    }

    #[test]
    fn config_wins_over_everything() {
        let detector = PhaseDetector::new();
        let input = PhaseDetectionInput {
            configured: Some(PhaseType::Single),
            telemetry_has_per_phase: true,
            ..Default::default()
        };
        assert_eq!(detector.detect(&input), PhaseType::Single);
    }

    #[test]
    fn inverter_type_label_detection() {
        let input = PhaseDetectionInput { inverter_type_label: Some("3 Phase Hybrid Inverter"), ..Default::default() };
        assert_eq!(detect_once(&input), PhaseType::Three);
    }
}
