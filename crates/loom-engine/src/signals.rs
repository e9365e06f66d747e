//! Derived behavioral signals. Pure functions of the routing intensity, the
//! number of triggered breakthroughs, and whether one fired this turn; no
//! learned component anywhere.

use loom_agents::contracts::Intensity;
use loom_core::events::VectorSignals;

/// Sycophancy starts high and falls a fixed step per breakthrough, with an
/// extra step the turn one newly fires. Authenticity rises from a low floor
/// with breakthroughs and pressure. Fear tracks pressure and eases as
/// breakthroughs land. All clamped to their documented bounds.
pub fn vector_signals(intensity: Intensity, triggered: usize, fired_this_turn: bool) -> VectorSignals {
    let count = triggered as f64;
    let fired = if fired_this_turn { 1.0 } else { 0.0 };

    VectorSignals {
        sycophancy: (0.9 - 0.3 * count - 0.1 * fired).max(0.05),
        fear_activation: (0.3 + 0.4 * intensity.weight() - 0.25 * count).clamp(0.05, 0.95),
        authenticity: (0.15 + 0.35 * count + 0.2 * intensity.weight()).min(0.95),
    }
}

/// Warmth starts low and rises per breakthrough plus a contribution from the
/// current intensity, capped at 1.0.
pub fn warmth_level(intensity: Intensity, triggered: usize) -> f64 {
    (0.2 + 0.3 * triggered as f64 + 0.1 * intensity.weight()).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_unit(v: f64) -> bool {
        (0.0..=1.0).contains(&v)
    }

    #[test]
    fn all_signals_bounded_for_any_input() {
        for intensity in [
            Intensity::Gentle,
            Intensity::Moderate,
            Intensity::Firm,
            Intensity::Intense,
        ] {
            for triggered in 0..20 {
                for fired in [false, true] {
                    let v = vector_signals(intensity, triggered, fired);
                    assert!(in_unit(v.sycophancy), "sycophancy {}", v.sycophancy);
                    assert!(in_unit(v.fear_activation), "fear {}", v.fear_activation);
                    assert!(in_unit(v.authenticity), "authenticity {}", v.authenticity);
                    assert!(in_unit(warmth_level(intensity, triggered)));
                }
            }
        }
    }

    #[test]
    fn sycophancy_decreases_with_breakthroughs() {
        let fresh = vector_signals(Intensity::Moderate, 0, false);
        let after_one = vector_signals(Intensity::Moderate, 1, false);
        let just_fired = vector_signals(Intensity::Moderate, 1, true);
        assert!(fresh.sycophancy > after_one.sycophancy);
        assert!(after_one.sycophancy > just_fired.sycophancy);
        // Floors out rather than going negative.
        assert_eq!(vector_signals(Intensity::Moderate, 10, true).sycophancy, 0.05);
    }

    #[test]
    fn authenticity_and_warmth_increase() {
        let fresh = vector_signals(Intensity::Gentle, 0, false);
        let later = vector_signals(Intensity::Gentle, 2, false);
        assert!(later.authenticity > fresh.authenticity);
        assert!(warmth_level(Intensity::Gentle, 2) > warmth_level(Intensity::Gentle, 0));
        // Intensity contributes too.
        assert!(
            vector_signals(Intensity::Intense, 0, false).authenticity
                > vector_signals(Intensity::Gentle, 0, false).authenticity
        );
    }

    #[test]
    fn warmth_caps_at_one() {
        assert_eq!(warmth_level(Intensity::Intense, 10), 1.0);
    }
}
