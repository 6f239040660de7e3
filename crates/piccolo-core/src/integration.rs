//! The integration-time table: current value plus source per
//! (shutter, spectrometer) cell, and the clamp/round policy applied on write.

use std::collections::HashMap;

use crate::spectrum::Direction;

/// How an integration time was arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationSource {
    Manual,
    Autointegrated,
    AutointegrationFailed,
}

use serde::{Deserialize, Serialize};

/// One cell of the integration-time table: current value plus its source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntegrationCell {
    pub ms: u32,
    pub source: IntegrationSource,
}

/// Outcome of [`IntegrationTimes::set`]: whether the stored value actually
/// changed, and the clamped value that was stored.
#[derive(Debug, Clone, Copy)]
pub struct SetOutcome {
    pub ms: u32,
    pub changed: bool,
    /// Raised whenever the effective integration time changes — the next
    /// cycle's dark spectrum, recorded at the old time, is no longer valid.
    pub need_dark: bool,
}

/// Round `ms` up to two significant figures.
///
/// e.g. 1234 -> 1300, 57 -> 57 (already 2 sig figs... actually rounds to 58
/// only if not exact), 9 -> 9, 999 -> 1000.
pub fn round_to_two_sig_figs(ms: u32) -> u32 {
    if ms == 0 {
        return 0;
    }
    let digits = (ms as f64).log10().floor() as i32 + 1;
    let drop = (digits - 2).max(0);
    let scale = 10u32.pow(drop as u32);
    let rounded_down = (ms / scale) * scale;
    if rounded_down == ms {
        ms
    } else {
        (rounded_down / scale + 1) * scale
    }
}

/// Two-level table keyed by (shutter direction, spectrometer name), holding
/// a current integration time plus its source.
#[derive(Debug, Default)]
pub struct IntegrationTimes {
    cells: HashMap<(Direction, String), IntegrationCell>,
    limits: HashMap<String, (u32, u32)>,
}

impl IntegrationTimes {
    pub fn new() -> Self {
        IntegrationTimes::default()
    }

    /// Register (or update) the `[min, max]` hardware limits for a
    /// spectrometer. Existing cells for that spectrometer are re-clamped.
    pub fn set_limits(&mut self, spectrometer: &str, min_ms: u32, max_ms: u32) {
        self.limits.insert(spectrometer.to_string(), (min_ms, max_ms));
        for ((_, name), cell) in self.cells.iter_mut() {
            if name == spectrometer {
                cell.ms = cell.ms.clamp(min_ms, max_ms);
            }
        }
    }

    pub fn limits(&self, spectrometer: &str) -> Option<(u32, u32)> {
        self.limits.get(spectrometer).copied()
    }

    /// Set the integration time for `(shutter, spectrometer)`: optionally
    /// round to two significant figures, then clamp to `[min, max]`.
    /// Returns whether the effective value changed (and therefore whether
    /// `need_dark` should be raised).
    pub fn set(
        &mut self,
        shutter: Direction,
        spectrometer: &str,
        ms: u32,
        source: IntegrationSource,
        round: bool,
    ) -> SetOutcome {
        let (min, max) = self
            .limits
            .get(spectrometer)
            .copied()
            .unwrap_or((0, u32::MAX));
        let candidate = if round { round_to_two_sig_figs(ms) } else { ms };
        let clamped = candidate.clamp(min, max);

        let key = (shutter, spectrometer.to_string());
        let previous = self.cells.get(&key).copied();
        let changed = previous.map(|c| c.ms) != Some(clamped);

        self.cells.insert(
            key,
            IntegrationCell {
                ms: clamped,
                source,
            },
        );

        SetOutcome {
            ms: clamped,
            changed,
            need_dark: changed,
        }
    }

    pub fn get(&self, shutter: Direction, spectrometer: &str) -> Option<IntegrationCell> {
        self.cells.get(&(shutter, spectrometer.to_string())).copied()
    }

    pub fn mark_failed(&mut self, shutter: Direction, spectrometer: &str) {
        if let Some(cell) = self.cells.get_mut(&(shutter, spectrometer.to_string())) {
            cell.source = IntegrationSource::AutointegrationFailed;
        }
    }

    /// Iterate all (shutter, spectrometer) pairs with a stored time, in an
    /// unspecified but stable-per-call order — callers that need a
    /// deterministic iteration order for acquisition should sort the result.
    pub fn entries(&self) -> impl Iterator<Item = (Direction, &str, IntegrationCell)> {
        self.cells
            .iter()
            .map(|((d, n), c)| (*d, n.as_str(), *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_sig_fig_rounding() {
        assert_eq!(round_to_two_sig_figs(1234), 1300);
        assert_eq!(round_to_two_sig_figs(57), 57);
        assert_eq!(round_to_two_sig_figs(999), 1000);
        assert_eq!(round_to_two_sig_figs(9), 9);
        assert_eq!(round_to_two_sig_figs(0), 0);
    }

    #[test]
    fn set_clamps_to_limits() {
        let mut it = IntegrationTimes::new();
        it.set_limits("S_A", 10, 2000);
        let outcome = it.set(Direction::Upwelling, "S_A", 5, IntegrationSource::Manual, false);
        assert_eq!(outcome.ms, 10);
        let outcome = it.set(Direction::Upwelling, "S_A", 5000, IntegrationSource::Manual, false);
        assert_eq!(outcome.ms, 2000);
    }

    #[test]
    fn set_reports_change_only_when_effective_value_differs() {
        let mut it = IntegrationTimes::new();
        it.set_limits("S_A", 10, 2000);
        let first = it.set(Direction::Upwelling, "S_A", 1000, IntegrationSource::Manual, false);
        assert!(first.changed);
        assert!(first.need_dark);
        let second = it.set(Direction::Upwelling, "S_A", 1000, IntegrationSource::Manual, false);
        assert!(!second.changed);
        assert!(!second.need_dark);
    }

    #[test]
    fn limits_update_reclamps_existing_cells() {
        let mut it = IntegrationTimes::new();
        it.set_limits("S_A", 10, 2000);
        it.set(Direction::Upwelling, "S_A", 1500, IntegrationSource::Manual, false);
        it.set_limits("S_A", 10, 1000);
        assert_eq!(it.get(Direction::Upwelling, "S_A").unwrap().ms, 1000);
    }
}
