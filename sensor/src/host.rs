use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, info, warn};

use roomclimate_common::{
    ntp, ClimateReading, CycleReadings, Journal, Level, ProbeAddress, ProbeReading,
    RuntimeConfig, SensorLayout, Station, StationConfig,
};

const DEFAULT_CONFIG_PATH: &str = "roomclimate.json";
const DEFAULT_LOG_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SendReport {
    lines: usize,
    bytes: usize,
}

/// Stand-in for the BME280s and the probe bus.
#[derive(Debug, Default)]
struct SimulatedSensors {
    tick: u64,
}

impl SimulatedSensors {
    fn read(&mut self, layout: SensorLayout, probes: bool) -> CycleReadings {
        self.tick = self.tick.saturating_add(1);

        let climate = (0..layout.bme280_count())
            .map(|index| {
                let temperature_c = 20.0 + (self.tick % 8) as f32 * 0.25 - index as f32 * 1.5;
                let pressure_pa = 101_200.0 + (self.tick % 5) as f32 * 40.0;
                let humidity_pct = 42.0 + (self.tick % 6) as f32 * 0.5 + index as f32 * 10.0;
                Some(ClimateReading::from_si(temperature_c, pressure_pa, humidity_pct))
                    .filter(ClimateReading::is_plausible)
            })
            .collect();

        let probes = if probes {
            vec![ProbeReading {
                address: ProbeAddress(0x2800_0000_0000_00a1),
                temperature_c: 4.0 + (self.tick % 4) as f32 * 0.5,
            }]
        } else {
            Vec::new()
        };

        CycleReadings { climate, probes }
    }
}

#[derive(Debug, Default)]
struct HostLed {
    lit: bool,
}

impl HostLed {
    fn set(&mut self, lit: bool) {
        if self.lit != lit {
            self.lit = lit;
            debug!(lit, "activity led");
        }
    }
}

struct HostNode {
    config: RuntimeConfig,
    station: Station,
    journal: Journal,
    sensors: SimulatedSensors,
    led: HostLed,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        std::env::var("ROOMCLIMATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_config(Path::new(&config_path))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();

    let journal = Journal::open(&config.journal.path, config.journal.max_bytes);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("log") => {
            let count = args
                .get(1)
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(DEFAULT_LOG_TAIL);
            for line in journal.tail(count).context("failed to read journal")? {
                println!("{line}");
            }
            return Ok(());
        }
        Some("status") => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        Some(other) => {
            return Err(anyhow!("unknown command `{other}` (expected `log` or `status`)"));
        }
        None => {}
    }

    let mut node = HostNode {
        station: Station::new(&config),
        config,
        journal,
        sensors: SimulatedSensors::default(),
        led: HostLed::default(),
    };

    node.run().await
}

fn load_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read_to_string(path) {
        Ok(json) => RuntimeConfig::from_json(&json)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("no config at {}; using defaults", path.display());
            Ok(RuntimeConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn apply_env_overrides(config: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("GRAPHITE_HOST") {
        config.network.graphite_host = host;
    }
    if let Some(port) = lookup("GRAPHITE_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.graphite_port = port;
    }
    if let Some(host) = lookup("NTP_HOST") {
        config.network.ntp_host = host;
    }
    if let Some(port) = lookup("NTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.ntp_port = port;
    }
    if let Some(room) = lookup("ROOM") {
        config.station = StationConfig::preset(&room).unwrap_or_else(|| StationConfig {
            room,
            ..config.station.clone()
        });
    }
}

async fn query_ntp(host: &str, port: u16, timeout: Duration) -> anyhow::Result<DateTime<Utc>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect((host, port))
        .await
        .with_context(|| format!("failed to resolve ntp server {host}:{port}"))?;
    socket.send(&ntp::build_request()).await?;

    let mut buffer = [0_u8; 64];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buffer))
        .await
        .map_err(|_| anyhow!("ntp server {host}:{port} did not answer"))??;

    Ok(ntp::parse_response(&buffer[..len])?)
}

async fn send_lines(
    host: &str,
    port: u16,
    lines: &[String],
    timeout: Duration,
) -> anyhow::Result<SendReport> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow!("connect to {host}:{port} timed out"))?
        .with_context(|| format!("failed to connect to {host}:{port}"))?;

    let mut bytes = 0_usize;
    for line in lines {
        tokio::time::timeout(timeout, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| anyhow!("write to {host}:{port} timed out"))?
            .with_context(|| format!("failed to write to {host}:{port}"))?;
        bytes = bytes.saturating_add(line.len());
    }
    stream.shutdown().await.ok();

    Ok(SendReport {
        lines: lines.len(),
        bytes,
    })
}

impl HostNode {
    fn record(&self, level: Level, message: &str) {
        let now = self.station.now(Utc::now());
        if let Err(err) = self.journal.append(level, now, message) {
            warn!("failed to append to journal {}: {err}", self.journal.path().display());
        }
    }

    async fn sync_clock(&mut self) -> anyhow::Result<()> {
        let network = &self.config.network;
        let timeout = Duration::from_secs(self.config.report.ntp_timeout_secs);
        let server_time = query_ntp(&network.ntp_host, network.ntp_port, timeout).await?;
        self.station.sync_succeeded(server_time, Utc::now());
        info!("clock set from {}: {server_time}", network.ntp_host);
        Ok(())
    }

    async fn sync_until_valid(&mut self) {
        let delay = Duration::from_secs(self.config.report.ntp_retry_delay_secs);
        loop {
            match self.sync_clock().await {
                Ok(()) => return,
                Err(err) => {
                    self.station.sync_failed();
                    warn!("couldn't set time by ntp: {err:#}");
                    self.record(Level::Error, &format!("couldn't set time by ntp: {err:#}"));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_with_retry(&self, lines: &[String]) -> anyhow::Result<SendReport> {
        let network = &self.config.network;
        let report = &self.config.report;
        let timeout = Duration::from_secs(report.send_timeout_secs);

        let mut last_err = None;
        for attempt in 1..=report.send_attempts {
            match send_lines(&network.graphite_host, network.graphite_port, lines, timeout).await {
                Ok(sent) => return Ok(sent),
                Err(err) => {
                    warn!("send attempt {attempt}/{} failed: {err:#}", report.send_attempts);
                    last_err = Some(err);
                }
            }

            if attempt < report.send_attempts {
                tokio::time::sleep(Duration::from_secs(report.send_retry_delay_secs)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no send attempts configured")))
    }

    async fn cycle(&mut self, send: bool) {
        self.led.set(true);

        let readings = self
            .sensors
            .read(self.station.layout(), self.station.probes_enabled());
        for (index, slot) in readings.climate.iter().enumerate() {
            match slot {
                Some(reading) => info!(
                    "sensor{}: {:.2}C {:.2}hPa {:.2}%",
                    index + 1,
                    reading.temperature_c,
                    reading.pressure_hpa,
                    reading.humidity_pct
                ),
                None => self.record(Level::Error, &format!("couldn't query sensor{}", index + 1)),
            }
        }

        if send {
            let batch = self.station.compose(&readings, Utc::now());
            if batch.is_empty() {
                self.record(Level::Warn, "no readings to send");
            } else {
                let lines = batch.lines(self.station.room());
                match self.send_with_retry(&lines).await {
                    Ok(report) => {
                        self.station.send_succeeded(report.lines, Utc::now());
                        info!(
                            "sent {} lines ({} bytes) to {}:{}",
                            report.lines,
                            report.bytes,
                            self.config.network.graphite_host,
                            self.config.network.graphite_port
                        );
                    }
                    Err(err) => {
                        self.station.send_failed();
                        self.record(
                            Level::Error,
                            &format!(
                                "something went wrong while sending data to {}:{}: {err:#}",
                                self.config.network.graphite_host,
                                self.config.network.graphite_port
                            ),
                        );
                    }
                }
            }
        }

        self.led.set(false);
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            "starting loop for {} every {}s",
            self.station.room(),
            self.config.report.every_secs
        );
        self.record(
            Level::Info,
            &format!("started ({}, {})", self.station.room(), self.station.layout().as_str()),
        );

        if self.config.report.deep_sleep {
            warn!("deep sleep is only available on the board; idling between reports");
        }

        self.sync_until_valid().await;

        // Warm-up read; nothing is sent.
        self.cycle(false).await;

        loop {
            let wait = self.station.wait(Utc::now());
            info!("now: {}, wait for: {}s", self.station.now(Utc::now()), wait.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    self.record(Level::Info, "stopped");
                    return Ok(());
                }
            }

            self.cycle(true).await;

            if let Err(err) = self.sync_clock().await {
                self.station.sync_failed();
                warn!("couldn't set time by ntp: {err:#}");
                self.record(Level::Error, &format!("couldn't set time by ntp: {err:#}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;

    fn test_node(dir: &Path, graphite_port: u16, send_attempts: u8, send_retry_delay_secs: u64) -> HostNode {
        let config = RuntimeConfig {
            network: roomclimate_common::NetworkConfig {
                graphite_host: "127.0.0.1".to_string(),
                graphite_port,
                ..Default::default()
            },
            report: roomclimate_common::ReportConfig {
                send_attempts,
                send_retry_delay_secs,
                send_timeout_secs: 2,
                ..Default::default()
            },
            ..RuntimeConfig::default()
        };

        HostNode {
            station: Station::new(&config),
            journal: Journal::open(dir.join("node.log"), 64 * 1024),
            config,
            sensors: SimulatedSensors::default(),
            led: HostLed::default(),
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn sends_all_lines_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let lines = vec![
            "living_room_temperature.metric 21.5 100 \n".to_string(),
            "living_room_humidity.metric 40 100 \n".to_string(),
        ];
        let report = send_lines("127.0.0.1", port, &lines, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(report.lines, 2);
        assert_eq!(report.bytes, lines.concat().len());
        assert_eq!(server.await.unwrap(), lines.concat());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = send_lines("127.0.0.1", port, &["x 1 1 \n".to_string()], Duration::from_secs(2))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_attempt_reaches_a_server_that_came_back() {
        let port = closed_port().await;

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let dir = tempfile::tempdir().unwrap();
        let node = test_node(dir.path(), port, 2, 1);
        let lines = vec!["kids_room_temperature.metric 20 100 \n".to_string()];

        let report = node.send_with_retry(&lines).await.unwrap();

        assert_eq!(report.lines, 1);
        assert_eq!(server.await.unwrap(), lines.concat());
    }

    #[tokio::test]
    async fn failed_batch_is_dropped_and_journaled() {
        let port = closed_port().await;
        let dir = tempfile::tempdir().unwrap();
        let mut node = test_node(dir.path(), port, 2, 0);

        node.cycle(true).await;

        let status = node.station.status(Utc::now());
        assert_eq!(status.cycles, 1);
        assert_eq!(status.send_failures, 1);
        assert_eq!(status.lines_sent, 0);

        let entries = node.journal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains(&format!(
            "ERROR something went wrong while sending data to 127.0.0.1:{port}"
        )));

        // The next cycle runs as usual.
        node.cycle(true).await;
        let status = node.station.status(Utc::now());
        assert_eq!(status.cycles, 2);
        assert_eq!(status.send_failures, 2);
    }

    #[tokio::test]
    async fn warm_up_cycle_reads_without_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let mut node = test_node(dir.path(), port, 1, 0);

        node.cycle(false).await;

        assert_eq!(node.sensors.tick, 1);
        assert_eq!(node.station.status(Utc::now()).cycles, 0);
        let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err());
        assert!(node.journal.read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queries_fake_ntp_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut request = [0_u8; 64];
            let (len, peer) = server.recv_from(&mut request).await.unwrap();
            assert_eq!(len, ntp::NTP_PACKET_LEN);

            let mut reply = [0_u8; ntp::NTP_PACKET_LEN];
            reply[0] = 0x24;
            let seconds = (1_767_600_000 + ntp::NTP_UNIX_DELTA) as u32;
            reply[40..44].copy_from_slice(&seconds.to_be_bytes());
            server.send_to(&reply, peer).await.unwrap();
        });

        let time = query_ntp("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(time.timestamp(), 1_767_600_000);
    }

    #[tokio::test]
    async fn silent_ntp_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let result = query_ntp("127.0.0.1", port, Duration::from_millis(100)).await;

        assert!(result.is_err());
        drop(server);
    }

    #[test]
    fn simulated_outdoor_node_reads_two_sensors_and_a_probe() {
        let mut sensors = SimulatedSensors::default();
        let readings = sensors.read(SensorLayout::Outdoor, true);

        assert_eq!(readings.climate.len(), 2);
        assert!(readings.climate.iter().all(Option::is_some));
        assert_eq!(readings.probes.len(), 1);
    }

    #[test]
    fn env_overrides_select_preset_and_endpoint() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GRAPHITE_HOST", "graphite.local"),
            ("GRAPHITE_PORT", "2004"),
            ("ROOM", "outdoor"),
        ]);
        let mut config = RuntimeConfig::default();

        apply_env_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.graphite_host, "graphite.local");
        assert_eq!(config.network.graphite_port, 2004);
        assert_eq!(config.station.layout, SensorLayout::Outdoor);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();

        assert_eq!(config.report.every_secs, 30 * 60);
    }

    #[test]
    fn config_file_is_parsed_and_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"report":{"every_secs":1,"ntp_retry_delay_secs":5,"ntp_timeout_secs":2,"send_attempts":9,"send_retry_delay_secs":3,"send_timeout_secs":10}}"#)
            .unwrap();

        let config = load_config(&path).unwrap();

        assert_eq!(config.report.every_secs, 10);
        assert_eq!(config.report.send_attempts, 5);
    }
}
