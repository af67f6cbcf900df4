//! Carbon plaintext lines.

use crate::{
    config::SensorLayout,
    names::{
        METRIC_HUMIDITY, METRIC_PRESSURE, METRIC_SUFFIX, METRIC_TEMPERATURE, PROBE_PREFIX,
        SENSOR1_PREFIX, SENSOR2_PREFIX,
    },
    reading::{ClimateReading, CycleReadings},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f32,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: impl Into<f32>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn line(&self, room: &str, timestamp: i64) -> String {
        format!(
            "{room}{}{METRIC_SUFFIX} {} {timestamp} \n",
            self.name, self.value
        )
    }
}

/// Metrics sharing one timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBatch {
    pub timestamp: i64,
    pub metrics: Vec<Metric>,
}

impl MetricBatch {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            metrics: Vec::new(),
        }
    }

    pub fn push(&mut self, metric: Metric) {
        if metric.value.is_finite() {
            self.metrics.push(metric);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn lines(&self, room: &str) -> Vec<String> {
        self.metrics
            .iter()
            .map(|metric| metric.line(room, self.timestamp))
            .collect()
    }
}

fn push_climate(batch: &mut MetricBatch, prefix: &str, reading: &ClimateReading) {
    batch.push(Metric::new(
        format!("{prefix}{METRIC_TEMPERATURE}"),
        reading.temperature_c,
    ));
    batch.push(Metric::new(
        format!("{prefix}{METRIC_PRESSURE}"),
        reading.pressure_hpa,
    ));
    batch.push(Metric::new(
        format!("{prefix}{METRIC_HUMIDITY}"),
        reading.humidity_pct,
    ));
}

/// Names every successful reading for the given layout.
pub fn batch_from_readings(
    layout: SensorLayout,
    readings: &CycleReadings,
    timestamp: i64,
) -> MetricBatch {
    let mut batch = MetricBatch::new(timestamp);

    match layout {
        SensorLayout::Indoor => {
            if let Some(Some(reading)) = readings.climate.first() {
                push_climate(&mut batch, "", reading);
            }
        }
        SensorLayout::Outdoor => {
            for (slot, prefix) in readings
                .climate
                .iter()
                .zip([SENSOR1_PREFIX, SENSOR2_PREFIX])
            {
                if let Some(reading) = slot {
                    push_climate(&mut batch, prefix, reading);
                }
            }
        }
    }

    for probe in &readings.probes {
        batch.push(Metric::new(
            format!("{PROBE_PREFIX}{}_{METRIC_TEMPERATURE}", probe.address),
            probe.temperature_c,
        ));
    }

    batch
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::reading::{ProbeAddress, ProbeReading};

    fn reading() -> ClimateReading {
        ClimateReading {
            temperature_c: 21.5,
            pressure_hpa: 1013.25,
            humidity_pct: 40.0,
        }
    }

    #[test]
    fn formats_carbon_line() {
        let metric = Metric::new("temperature", 21.5_f32);

        assert_eq!(
            metric.line("living_room_", 1_767_600_000),
            "living_room_temperature.metric 21.5 1767600000 \n"
        );
    }

    #[test]
    fn indoor_layout_emits_three_metrics() {
        let readings = CycleReadings {
            climate: vec![Some(reading())],
            probes: Vec::new(),
        };

        let batch = batch_from_readings(SensorLayout::Indoor, &readings, 100);
        let names: Vec<_> = batch.metrics.iter().map(|m| m.name.as_str()).collect();

        assert_eq!(names, ["temperature", "pressure", "humidity"]);
        assert_eq!(
            batch.lines("bed_room_").concat(),
            "bed_room_temperature.metric 21.5 100 \n\
             bed_room_pressure.metric 1013.25 100 \n\
             bed_room_humidity.metric 40 100 \n"
        );
    }

    #[test]
    fn outdoor_layout_skips_failed_sensor() {
        let readings = CycleReadings {
            climate: vec![None, Some(reading())],
            probes: vec![ProbeReading {
                address: ProbeAddress(0x28),
                temperature_c: -3.5,
            }],
        };

        let batch = batch_from_readings(SensorLayout::Outdoor, &readings, 100);
        let names: Vec<_> = batch.metrics.iter().map(|m| m.name.as_str()).collect();

        assert_eq!(
            names,
            [
                "sensor2_temperature",
                "sensor2_pressure",
                "sensor2_humidity",
                "probe_0000000000000028_temperature",
            ]
        );
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let mut batch = MetricBatch::new(0);
        batch.push(Metric::new("temperature", f32::NAN));
        assert!(batch.is_empty());
    }
}
