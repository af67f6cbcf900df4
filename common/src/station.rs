use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    config::{RuntimeConfig, SensorLayout, StationConfig},
    metric::{batch_from_readings, MetricBatch},
    ntp::SyncedClock,
    reading::CycleReadings,
    schedule::ReportSchedule,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StationStatus {
    pub room: String,
    pub layout: &'static str,
    pub cycles: u64,
    #[serde(rename = "sensorFailures")]
    pub sensor_failures: u64,
    #[serde(rename = "sendFailures")]
    pub send_failures: u64,
    #[serde(rename = "syncFailures")]
    pub sync_failures: u64,
    #[serde(rename = "linesSent")]
    pub lines_sent: u64,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "lastSyncEpoch")]
    pub last_sync_epoch: Option<i64>,
    #[serde(rename = "lastReportEpoch")]
    pub last_report_epoch: Option<i64>,
    #[serde(rename = "nextReportEpoch")]
    pub next_report_epoch: i64,
}

/// Target-independent half of the reporting loop: the clock, the schedule
/// and the counters. Targets own the sensors and sockets.
#[derive(Debug, Clone)]
pub struct Station {
    station: StationConfig,
    schedule: ReportSchedule,
    clock: SyncedClock,

    cycles: u64,
    sensor_failures: u64,
    send_failures: u64,
    sync_failures: u64,
    lines_sent: u64,
    last_report: Option<DateTime<Utc>>,
}

impl Station {
    pub fn new(config: &RuntimeConfig) -> Self {
        let mut station = config.station.clone();
        station.sanitize();

        Self {
            station,
            schedule: ReportSchedule::new(config.report.every_secs),
            clock: SyncedClock::new(),
            cycles: 0,
            sensor_failures: 0,
            send_failures: 0,
            sync_failures: 0,
            lines_sent: 0,
            last_report: None,
        }
    }

    pub fn room(&self) -> &str {
        &self.station.room
    }

    pub fn layout(&self) -> SensorLayout {
        self.station.layout
    }

    pub fn probes_enabled(&self) -> bool {
        self.station.probes
    }

    pub fn now(&self, local_now: DateTime<Utc>) -> DateTime<Utc> {
        self.clock.now(local_now)
    }

    pub fn sync_succeeded(&mut self, server_time: DateTime<Utc>, local_now: DateTime<Utc>) {
        self.clock.apply(server_time, local_now);
    }

    pub fn sync_failed(&mut self) {
        self.sync_failures = self.sync_failures.saturating_add(1);
    }

    /// Time left until the next aligned report.
    pub fn wait(&self, local_now: DateTime<Utc>) -> Duration {
        self.schedule.wait(self.now(local_now))
    }

    /// Time to sleep once a report has been sent, for boards that power down
    /// between reports.
    pub fn wait_after_report(&self, local_now: DateTime<Utc>) -> Duration {
        self.schedule.wait_after_report(self.now(local_now))
    }

    /// Starts a cycle: counts it and names the readings it produced.
    pub fn compose(&mut self, readings: &CycleReadings, local_now: DateTime<Utc>) -> MetricBatch {
        self.cycles = self.cycles.saturating_add(1);
        self.sensor_failures = self
            .sensor_failures
            .saturating_add(readings.failed_sensors() as u64);

        let timestamp = self.now(local_now).timestamp();
        batch_from_readings(self.station.layout, readings, timestamp)
    }

    pub fn send_succeeded(&mut self, lines: usize, local_now: DateTime<Utc>) {
        self.lines_sent = self.lines_sent.saturating_add(lines as u64);
        self.last_report = Some(self.now(local_now));
    }

    pub fn send_failed(&mut self) {
        self.send_failures = self.send_failures.saturating_add(1);
    }

    pub fn status(&self, local_now: DateTime<Utc>) -> StationStatus {
        let now = self.now(local_now);
        StationStatus {
            room: self.station.room.clone(),
            layout: self.station.layout.as_str(),
            cycles: self.cycles,
            sensor_failures: self.sensor_failures,
            send_failures: self.send_failures,
            sync_failures: self.sync_failures,
            lines_sent: self.lines_sent,
            time_synced: self.clock.is_synced(),
            last_sync_epoch: self.clock.last_sync().map(|t| t.timestamp()),
            last_report_epoch: self.last_report.map(|t| t.timestamp()),
            next_report_epoch: self.schedule.next_report(now).timestamp(),
        }
    }
}
