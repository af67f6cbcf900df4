pub mod config;
pub mod error;
pub mod journal;
pub mod metric;
pub mod names;
pub mod ntp;
pub mod reading;
pub mod schedule;
pub mod station;

pub use config::{
    JournalConfig, LedConfig, NetworkConfig, ReportConfig, RuntimeConfig, SensorLayout,
    StationConfig,
};
pub use error::{Error, Result};
pub use journal::{Journal, Level};
pub use metric::{Metric, MetricBatch};
pub use ntp::SyncedClock;
pub use reading::{ClimateReading, CycleReadings, ProbeAddress, ProbeReading};
pub use schedule::ReportSchedule;
pub use station::{Station, StationStatus};
