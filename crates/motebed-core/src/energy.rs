//! Conversion of energy-meter readings into energy, power and current.
//!
//! The meter on each node reports an instruction count accumulated over an
//! elapsed time. The count rate identifies the operating point on the
//! node's calibration curve, which in turn gives the energy per count.

use crate::calibration::CalibrationTable;

/// Supply voltage of the instrumented nodes, in volts.
pub const SUPPLY_VOLTAGE: f64 = 3.3;

/// Anything that can turn (instruction count, elapsed seconds) into energy.
pub trait EnergyModel {
    /// Energy consumed while the meter advanced `icount` ticks in `elapsed`
    /// seconds.
    ///
    /// Returns `None` if the model is not calibrated. A non-positive
    /// `elapsed` yields zero energy.
    fn energy(&self, icount: u64, elapsed: f64) -> Option<f64>;

    /// Average power over the interval. Zero for a non-positive `elapsed`.
    fn power(&self, icount: u64, elapsed: f64) -> Option<f64> {
        if elapsed <= 0.0 {
            return Some(0.0);
        }
        self.energy(icount, elapsed).map(|e| e / elapsed)
    }

    /// Average current over the interval at [`SUPPLY_VOLTAGE`].
    fn current(&self, icount: u64, elapsed: f64) -> Option<f64> {
        self.power(icount, elapsed).map(|p| p / SUPPLY_VOLTAGE)
    }
}

impl EnergyModel for CalibrationTable {
    fn energy(&self, icount: u64, elapsed: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        if elapsed <= 0.0 {
            return Some(0.0);
        }
        let frequency = icount as f64 / elapsed;
        self.quantum_at(frequency).map(|q| icount as f64 * q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationEntry;

    fn table() -> CalibrationTable {
        CalibrationTable::from_entries([
            CalibrationEntry {
                resistor: 1,
                frequency: 2000.0,
                energy_quantum: 4.0,
            },
            CalibrationEntry {
                resistor: 2,
                frequency: 1000.0,
                energy_quantum: 2.0,
            },
        ])
    }

    #[test]
    fn test_uncalibrated_is_none() {
        let t = CalibrationTable::new();
        assert_eq!(t.energy(100, 1.0), None);
        assert_eq!(t.current(100, 1.0), None);
    }

    #[test]
    fn test_zero_duration_is_zero_energy() {
        assert_eq!(table().energy(100, 0.0), Some(0.0));
        assert_eq!(table().energy(100, -1.0), Some(0.0));
        assert_eq!(table().power(100, 0.0), Some(0.0));
    }

    #[test]
    fn test_energy_scales_clamped_quantum() {
        // 5000 ticks/s is above the highest calibrated frequency
        assert_eq!(table().energy(5000, 1.0), Some(20_000.0));
        // 10 ticks/s is below the lowest calibrated frequency
        assert_eq!(table().energy(10, 1.0), Some(20.0));
    }

    #[test]
    fn test_energy_interpolated() {
        // 1500 ticks/s sits half way: quantum 3.0
        let e = table().energy(3000, 2.0).unwrap();
        assert!((e - 9000.0).abs() < 1e-9);
    }

    #[test]
    fn test_power_and_current() {
        let p = table().power(3000, 2.0).unwrap();
        assert!((p - 4500.0).abs() < 1e-9);
        let i = table().current(3000, 2.0).unwrap();
        assert!((i - 4500.0 / SUPPLY_VOLTAGE).abs() < 1e-9);
    }
}
