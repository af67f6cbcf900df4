use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub pressure_hpa: f32,
    pub humidity_pct: f32,
}

impl ClimateReading {
    /// Builds a reading from driver units (Pa for pressure).
    pub fn from_si(temperature_c: f32, pressure_pa: f32, humidity_pct: f32) -> Self {
        Self {
            temperature_c,
            pressure_hpa: pressure_pa / 100.0,
            humidity_pct,
        }
    }

    pub fn is_plausible(&self) -> bool {
        self.temperature_c.is_finite()
            && self.pressure_hpa.is_finite()
            && self.humidity_pct.is_finite()
            && (-40.0..=85.0).contains(&self.temperature_c)
            && (300.0..=1100.0).contains(&self.pressure_hpa)
            && (0.0..=100.0).contains(&self.humidity_pct)
    }
}

/// 64-bit onewire ROM code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProbeAddress(pub u64);

impl fmt::Display for ProbeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading {
    pub address: ProbeAddress,
    pub temperature_c: f32,
}

/// Everything read during one cycle. A `None` slot is a sensor that failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReadings {
    pub climate: Vec<Option<ClimateReading>>,
    pub probes: Vec<ProbeReading>,
}

impl CycleReadings {
    pub fn failed_sensors(&self) -> usize {
        self.climate.iter().filter(|slot| slot.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.climate.iter().all(Option::is_none) && self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_pascal_to_hectopascal() {
        let reading = ClimateReading::from_si(21.5, 101_325.0, 40.0);

        assert_eq!(reading.pressure_hpa, 1013.25);
        assert!(reading.is_plausible());
    }

    #[test]
    fn rejects_out_of_range_and_nan() {
        assert!(!ClimateReading::from_si(f32::NAN, 100_000.0, 40.0).is_plausible());
        assert!(!ClimateReading::from_si(20.0, 0.0, 40.0).is_plausible());
        assert!(!ClimateReading::from_si(20.0, 100_000.0, 120.0).is_plausible());
    }

    #[test]
    fn probe_address_renders_as_padded_hex() {
        assert_eq!(ProbeAddress(0x28ff_0000_0a0b).to_string(), "000028ff00000a0b");
    }

    #[test]
    fn counts_failed_slots() {
        let readings = CycleReadings {
            climate: vec![None, Some(ClimateReading::from_si(20.0, 100_000.0, 50.0))],
            probes: Vec::new(),
        };

        assert_eq!(readings.failed_sensors(), 1);
        assert!(!readings.is_empty());
        assert!(CycleReadings::default().is_empty());
    }
}
