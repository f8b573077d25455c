/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Speed-unit conversions (§6 "Numeric semantics"). The canonical unit
//! throughout the core is meters per second; mph/kmph conversions live
//! here as pure functions so that callers formatting a report don't need
//! to hand-roll the constants.

const MPS_PER_MPH: f64 = 1.0 / 2.2369362920544;
const MPS_PER_KMPH: f64 = 1.0 / 3.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedUnit {
    Mps,
    Mph,
    Kmph,
}

/// Converts a speed in m/s to `unit`.
pub fn convert_speed(mps: f64, unit: SpeedUnit) -> f64 {
    match unit {
        SpeedUnit::Mps => mps,
        SpeedUnit::Mph => mps * 2.2369362920544,
        SpeedUnit::Kmph => mps * 3.6,
    }
}

/// Converts a speed expressed in `unit` back to m/s.
pub fn convert_to_mps(value: f64, unit: SpeedUnit) -> f64 {
    match unit {
        SpeedUnit::Mps => value,
        SpeedUnit::Mph => value * MPS_PER_MPH,
        SpeedUnit::Kmph => value * MPS_PER_KMPH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_units() {
        for &unit in &[SpeedUnit::Mps, SpeedUnit::Mph, SpeedUnit::Kmph] {
            let x = 13.37;
            let converted = convert_speed(x, unit);
            let back = convert_to_mps(converted, unit);
            assert!((back - x).abs() < 1e-10, "unit {:?} didn't round-trip", unit);
        }
    }

    #[test]
    fn known_constants() {
        assert!((convert_speed(1.0, SpeedUnit::Mph) - 2.2369362920544).abs() < 1e-10);
        assert!((convert_speed(1.0, SpeedUnit::Kmph) - 3.6).abs() < 1e-10);
    }
}
