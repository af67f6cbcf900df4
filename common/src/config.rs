use serde::{Deserialize, Serialize};

use crate::names::{ROOM_BED, ROOM_KIDS, ROOM_LIVING, ROOM_OUTDOOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorLayout {
    /// One BME280.
    Indoor,
    /// Two BME280s on separate buses.
    Outdoor,
}

impl SensorLayout {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indoor => "indoor",
            Self::Outdoor => "outdoor",
        }
    }

    pub fn bme280_count(self) -> usize {
        match self {
            Self::Indoor => 1,
            Self::Outdoor => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StationConfig {
    pub room: String,
    pub layout: SensorLayout,
    /// Scan the onewire bus for DS18B20 probes as well.
    pub probes: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            room: ROOM_LIVING.to_string(),
            layout: SensorLayout::Indoor,
            probes: false,
        }
    }
}

impl StationConfig {
    /// Inline room presets the nodes are deployed with.
    pub fn preset(name: &str) -> Option<Self> {
        let (room, layout, probes) = match name {
            "living_room" => (ROOM_LIVING, SensorLayout::Indoor, false),
            "kids_room" => (ROOM_KIDS, SensorLayout::Indoor, false),
            "bed_room" => (ROOM_BED, SensorLayout::Indoor, false),
            "outdoor" => (ROOM_OUTDOOR, SensorLayout::Outdoor, true),
            _ => return None,
        };

        Some(Self {
            room: room.to_string(),
            layout,
            probes,
        })
    }

    pub fn sanitize(&mut self) {
        let mut room: String = self
            .room
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();

        if room.trim_matches('_').is_empty() {
            room = ROOM_LIVING.to_string();
        }
        if !room.ends_with('_') {
            room.push('_');
        }
        self.room = room;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub graphite_host: String,
    pub graphite_port: u16,
    pub ntp_host: String,
    pub ntp_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            graphite_host: "192.168.66.100".to_string(),
            graphite_port: 2003,
            ntp_host: "192.168.66.100".to_string(),
            ntp_port: 123,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    pub every_secs: u64,
    pub ntp_retry_delay_secs: u64,
    pub ntp_timeout_secs: u64,
    pub send_attempts: u8,
    pub send_retry_delay_secs: u64,
    pub send_timeout_secs: u64,
    pub deep_sleep: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            every_secs: 30 * 60,
            ntp_retry_delay_secs: 5,
            ntp_timeout_secs: 2,
            send_attempts: 2,
            send_retry_delay_secs: 3,
            send_timeout_secs: 10,
            deep_sleep: false,
        }
    }
}

impl ReportConfig {
    pub fn sanitize(&mut self) {
        self.every_secs = self.every_secs.clamp(10, 24 * 3600);
        self.ntp_retry_delay_secs = self.ntp_retry_delay_secs.clamp(1, 600);
        self.ntp_timeout_secs = self.ntp_timeout_secs.clamp(1, 30);
        self.send_attempts = self.send_attempts.clamp(1, 5);
        self.send_retry_delay_secs = self.send_retry_delay_secs.min(60);
        self.send_timeout_secs = self.send_timeout_secs.clamp(1, 60);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JournalConfig {
    pub path: String,
    pub max_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: "roomclimate.log".to_string(),
            max_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedConfig {
    pub pin: i32,
    pub active_low: bool,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            pin: 2,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub led: LedConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            station: StationConfig::default(),
            network: NetworkConfig::default(),
            report: ReportConfig::default(),
            journal: JournalConfig::default(),
            led: LedConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.station.sanitize();
        self.report.sanitize();

        if self.network.graphite_port == 0 {
            self.network.graphite_port = 2003;
        }
        if self.network.ntp_port == 0 {
            self.network.ntp_port = 123;
        }
        if self.journal.max_bytes < 1024 {
            self.journal.max_bytes = 1024;
        }
        if self.led.pin < 0 {
            self.led.pin = 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = RuntimeConfig::from_json(r#"{"station":{"room":"Attic","layout":"indoor"}}"#)
            .unwrap();

        assert_eq!(config.station.room, "attic_");
        assert_eq!(config.network.graphite_port, 2003);
        assert_eq!(config.report, ReportConfig::default());
    }

    #[test]
    fn single_field_sections_keep_other_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{
                "station": {"room": "attic"},
                "network": {"graphite_host": "10.0.0.5"},
                "report": {"every_secs": 600},
                "journal": {"max_bytes": 4096},
                "led": {"active_low": false}
            }"#,
        )
        .unwrap();

        assert_eq!(config.station.room, "attic_");
        assert_eq!(config.station.layout, SensorLayout::Indoor);
        assert_eq!(config.network.graphite_host, "10.0.0.5");
        assert_eq!(config.network.graphite_port, 2003);
        assert_eq!(config.network.ntp_port, 123);
        assert_eq!(config.report.every_secs, 600);
        assert_eq!(config.report.send_attempts, 2);
        assert_eq!(config.journal.max_bytes, 4096);
        assert_eq!(config.journal.path, "roomclimate.log");
        assert_eq!(config.led.pin, 2);
        assert!(!config.led.active_low);
    }

    #[test]
    fn sanitize_clamps_report_interval_and_attempts() {
        let mut report = ReportConfig {
            every_secs: 0,
            send_attempts: 0,
            ..ReportConfig::default()
        };
        report.sanitize();

        assert_eq!(report.every_secs, 10);
        assert_eq!(report.send_attempts, 1);
    }

    #[test]
    fn room_names_are_normalized() {
        let mut station = StationConfig {
            room: " Guest Room ".to_string(),
            ..StationConfig::default()
        };
        station.sanitize();
        assert_eq!(station.room, "guest_room_");

        station.room = "___".to_string();
        station.sanitize();
        assert_eq!(station.room, ROOM_LIVING);
    }

    #[test]
    fn outdoor_preset_uses_two_sensors_and_probes() {
        let station = StationConfig::preset("outdoor").unwrap();

        assert_eq!(station.room, ROOM_OUTDOOR);
        assert_eq!(station.layout.bme280_count(), 2);
        assert!(station.probes);
        assert!(StationConfig::preset("garage").is_none());
    }
}
