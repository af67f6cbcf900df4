use core::convert::TryInto;
use std::{
    io::Write as _,
    net::{TcpStream, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280::i2c::BME280;
use chrono::{DateTime, Utc};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use roomclimate_common::{
    config::NetworkConfig, ntp, ClimateReading, CycleReadings, Journal, Level, ProbeAddress,
    ProbeReading, RuntimeConfig, SensorLayout, Station,
};

const NVS_NAMESPACE: &str = "roomclimate";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const STORAGE_BASE: &str = "/storage";
const ONE_WIRE_PIN: i32 = 4;
const JOURNAL_TAIL_LINES: usize = 50;

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_BOOT_RESTART_SECS: u64 = 60;

struct SendReport {
    lines: usize,
    bytes: usize,
}

struct SensorSuite {
    climate: Vec<BME280<I2cDriver<'static>>>,
    one_wire: Option<OneWire<PinDriver<'static, AnyIOPin, InputOutput>>>,
    probe_addresses: Vec<Address>,
    delay: Ets,
}

struct ActivityLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_low: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    station: roomclimate_common::StationStatus,
    mac: String,
    #[serde(rename = "uptimeSecs")]
    uptime_secs: u64,
}

impl SensorSuite {
    fn new(
        climate: Vec<I2cDriver<'static>>,
        one_wire_pin: Option<AnyIOPin>,
    ) -> anyhow::Result<Self> {
        let mut delay = Ets;

        let climate = climate
            .into_iter()
            .enumerate()
            .map(|(index, i2c)| {
                let mut bme = BME280::new_primary(i2c);
                if let Err(err) = bme.init(&mut delay) {
                    warn!("failed to init BME280 #{}: {err:?}", index + 1);
                }
                bme
            })
            .collect();

        let one_wire = match one_wire_pin {
            Some(pin) => {
                let mut pin = PinDriver::input_output_od(pin)?;
                pin.set_pull(Pull::Up)?;
                pin.set_high()?;
                Some(
                    OneWire::new(pin)
                        .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?,
                )
            }
            None => None,
        };

        let mut suite = Self {
            climate,
            one_wire,
            probe_addresses: Vec::new(),
            delay,
        };

        suite.refresh_probe_addresses();
        Ok(suite)
    }

    fn read(&mut self) -> CycleReadings {
        let climate = (0..self.climate.len())
            .map(|index| self.read_climate(index))
            .collect();

        CycleReadings {
            climate,
            probes: self.read_probes(),
        }
    }

    fn read_climate(&mut self, index: usize) -> Option<ClimateReading> {
        let bme = self.climate.get_mut(index)?;

        match bme.measure(&mut self.delay) {
            Ok(m) => {
                let reading = ClimateReading::from_si(m.temperature, m.pressure, m.humidity);
                info!(
                    "[BME280 #{}] {:.2}C {:.2}hPa {:.2}%",
                    index + 1,
                    reading.temperature_c,
                    reading.pressure_hpa,
                    reading.humidity_pct
                );
                Some(reading).filter(ClimateReading::is_plausible)
            }
            Err(err) => {
                warn!("failed to read BME280 #{}: {err:?}", index + 1);
                // A reset sensor needs its calibration reloaded.
                let _ = bme.init(&mut self.delay);
                None
            }
        }
    }

    fn refresh_probe_addresses(&mut self) {
        let Some(one_wire) = self.one_wire.as_mut() else {
            return;
        };

        let mut found = Vec::new();
        for addr in one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => found.push(address),
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        found.sort_by_key(|address| address.0);
        info!(
            "{} DS18B20 probe(s) on GPIO{}",
            found.len(),
            ONE_WIRE_PIN
        );
        self.probe_addresses = found;
    }

    fn read_probes(&mut self) -> Vec<ProbeReading> {
        if self.one_wire.is_none() {
            return Vec::new();
        }
        if self.probe_addresses.is_empty() {
            self.refresh_probe_addresses();
        }
        let Some(one_wire) = self.one_wire.as_mut() else {
            return Vec::new();
        };

        if let Err(err) = ds18b20::start_simultaneous_temp_measurement(one_wire, &mut self.delay) {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.probe_addresses.clear();
            return Vec::new();
        }
        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        let mut readings = Vec::with_capacity(self.probe_addresses.len());
        let mut lost_probe = false;
        for address in &self.probe_addresses {
            let sensor = match Ds18b20::new::<core::convert::Infallible>(*address) {
                Ok(sensor) => sensor,
                Err(err) => {
                    warn!("invalid DS18B20 address {:?}: {err:?}", address);
                    lost_probe = true;
                    continue;
                }
            };

            match sensor.read_data(one_wire, &mut self.delay) {
                Ok(data) => readings.push(ProbeReading {
                    address: ProbeAddress(address.0),
                    temperature_c: data.temperature,
                }),
                Err(err) => {
                    warn!("failed to read DS18B20 {:?}: {err:?}", address);
                    lost_probe = true;
                }
            }
        }

        if lost_probe {
            self.probe_addresses.clear();
        }
        readings
    }
}

impl ActivityLed {
    fn new(pin: i32, active_low: bool) -> anyhow::Result<Self> {
        let pin = PinDriver::output(unsafe { AnyOutputPin::new(pin) })?;
        let mut led = Self { pin, active_low };
        led.set(false);
        Ok(led)
    }

    fn set(&mut self, lit: bool) {
        let high = lit != self.active_low;
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive activity led: {err:?}");
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    if let Err(err) = mount_storage() {
        warn!("failed to mount {STORAGE_BASE}: {err:#}");
    }
    let journal = Journal::open(
        journal_path(&runtime.journal.path),
        runtime.journal.max_bytes,
    );

    let Peripherals {
        modem,
        pins,
        i2c0,
        i2c1,
        ..
    } = Peripherals::take()?;

    let mut led = ActivityLed::new(runtime.led.pin, runtime.led.active_low)?;

    let i2c_config = I2cConfig::new().baudrate(100.kHz().into());
    let mut buses = vec![I2cDriver::new(i2c0, pins.gpio21, pins.gpio22, &i2c_config)?];
    if runtime.station.layout == SensorLayout::Outdoor {
        buses.push(I2cDriver::new(i2c1, pins.gpio18, pins.gpio19, &i2c_config)?);
    }
    let one_wire_pin = runtime.station.probes.then(|| pins.gpio4.downgrade());
    let mut sensors =
        SensorSuite::new(buses, one_wire_pin).context("failed to initialize sensor suite")?;

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            let message = format!("wifi startup failed: {err:#}");
            warn!("{message}; restarting in {WIFI_BOOT_RESTART_SECS}s");
            if let Err(err) = journal.append(Level::Error, Utc::now(), &message) {
                warn!("failed to append to journal: {err}");
            }
            thread::sleep(Duration::from_secs(WIFI_BOOT_RESTART_SECS));
            unsafe { esp_idf_svc::sys::esp_restart() }
        }
    };
    let mac = wifi
        .sta_netif()
        .get_mac()
        .map(format_mac)
        .unwrap_or_else(|_| "unknown".to_string());
    info!("wifi connected, mac {mac}");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let station = Arc::new(Mutex::new(Station::new(&runtime)));
    let booted_at = Instant::now();
    let server = create_http_server(station.clone(), journal.clone(), mac.clone(), booted_at)?;

    record(&journal, &station, Level::Info, &format!("started, mac {mac}"));

    // Repeat until we get a valid time.
    loop {
        feed_watchdog();
        match sync_clock(&runtime, &station) {
            Ok(()) => break,
            Err(err) => {
                lock(&station).sync_failed();
                warn!("couldn't set time by ntp: {err:#}");
                record(&journal, &station, Level::Error, &format!("couldn't set time by ntp: {err:#}"));
                thread::sleep(Duration::from_secs(runtime.report.ntp_retry_delay_secs));
            }
        }
    }

    // The sleep timer only fires when a report is due.
    let mut report_due = runtime.report.deep_sleep && woke_by_timer();
    if report_due {
        info!("woke from deep sleep, reporting now");
    } else {
        // Warm-up read; nothing is sent.
        led.set(true);
        let _ = sensors.read();
        led.set(false);
    }

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let mut wifi_disconnected_since: Option<Instant> = None;

    loop {
        if !report_due {
            let wait = lock(&station).wait(Utc::now());
            info!(
                "now: {}, wait for: {}s",
                lock(&station).now(Utc::now()),
                wait.as_secs()
            );

            let wake_at = Instant::now() + wait;
            while Instant::now() < wake_at {
                feed_watchdog();
                maintain_wifi_health(&mut wifi_disconnected_since);
                thread::sleep(wake_at.saturating_duration_since(Instant::now()).min(Duration::from_secs(1)));
            }
        }
        report_due = false;

        feed_watchdog();
        led.set(true);
        run_cycle(&runtime, &mut sensors, &station, &journal);
        led.set(false);

        feed_watchdog();
        if let Err(err) = sync_clock(&runtime, &station) {
            lock(&station).sync_failed();
            warn!("couldn't set time by ntp: {err:#}");
            record(&journal, &station, Level::Error, &format!("couldn't set time by ntp: {err:#}"));
        }

        if runtime.report.deep_sleep {
            let wait = lock(&station).wait_after_report(Utc::now());
            record(&journal, &station, Level::Info, &format!("deep sleep for {}s", wait.as_secs()));
            unsafe { esp_idf_svc::sys::esp_deep_sleep(wait.as_micros() as u64) }
        }
    }
}

fn woke_by_timer() -> bool {
    let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
    cause == esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER
}

fn run_cycle(
    runtime: &RuntimeConfig,
    sensors: &mut SensorSuite,
    station: &Arc<Mutex<Station>>,
    journal: &Journal,
) {
    let readings = sensors.read();
    for (index, slot) in readings.climate.iter().enumerate() {
        if slot.is_none() {
            record(journal, station, Level::Error, &format!("couldn't query sensor{}", index + 1));
        }
    }

    let (batch, room) = {
        let mut station = lock(station);
        let batch = station.compose(&readings, Utc::now());
        (batch, station.room().to_string())
    };
    if batch.is_empty() {
        record(journal, station, Level::Warn, "no readings to send");
        return;
    }

    let lines = batch.lines(&room);
    match send_with_retry(runtime, &lines) {
        Ok(report) => {
            lock(station).send_succeeded(report.lines, Utc::now());
            info!(
                "sent {} lines ({} bytes) to {}:{}",
                report.lines, report.bytes, runtime.network.graphite_host, runtime.network.graphite_port
            );
        }
        Err(err) => {
            lock(station).send_failed();
            record(
                journal,
                station,
                Level::Error,
                &format!(
                    "something went wrong while sending data to {}:{}: {err:#}",
                    runtime.network.graphite_host, runtime.network.graphite_port
                ),
            );
        }
    }
}

fn lock(station: &Arc<Mutex<Station>>) -> std::sync::MutexGuard<'_, Station> {
    station.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(journal: &Journal, station: &Arc<Mutex<Station>>, level: Level, message: &str) {
    let now = lock(station).now(Utc::now());
    if let Err(err) = journal.append(level, now, message) {
        warn!("failed to append to journal: {err}");
    }
}

fn sync_clock(runtime: &RuntimeConfig, station: &Arc<Mutex<Station>>) -> anyhow::Result<()> {
    let network = &runtime.network;
    let timeout = Duration::from_secs(runtime.report.ntp_timeout_secs);
    let server_time = query_ntp(&network.ntp_host, network.ntp_port, timeout)?;
    lock(station).sync_succeeded(server_time, Utc::now());
    info!("clock set from {}: {server_time}", network.ntp_host);
    Ok(())
}

fn query_ntp(host: &str, port: u16, timeout: Duration) -> anyhow::Result<DateTime<Utc>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(timeout))?;
    socket
        .connect((host, port))
        .with_context(|| format!("failed to resolve ntp server {host}:{port}"))?;
    socket.send(&ntp::build_request())?;

    let mut buffer = [0_u8; 64];
    let len = socket
        .recv(&mut buffer)
        .with_context(|| format!("ntp server {host}:{port} did not answer"))?;

    Ok(ntp::parse_response(&buffer[..len])?)
}

fn send_lines(host: &str, port: u16, lines: &[String], timeout: Duration) -> anyhow::Result<SendReport> {
    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {host}:{port}"))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut bytes = 0_usize;
    for line in lines {
        stream
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write to {host}:{port}"))?;
        bytes = bytes.saturating_add(line.len());
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);

    Ok(SendReport {
        lines: lines.len(),
        bytes,
    })
}

fn send_with_retry(runtime: &RuntimeConfig, lines: &[String]) -> anyhow::Result<SendReport> {
    let network = &runtime.network;
    let report = &runtime.report;
    let timeout = Duration::from_secs(report.send_timeout_secs);

    let mut last_err = None;
    for attempt in 1..=report.send_attempts {
        match send_lines(&network.graphite_host, network.graphite_port, lines, timeout) {
            Ok(sent) => return Ok(sent),
            Err(err) => {
                warn!("send attempt {attempt}/{} failed: {err:#}", report.send_attempts);
                last_err = Some(err);
            }
        }

        if attempt < report.send_attempts {
            feed_watchdog();
            thread::sleep(Duration::from_secs(report.send_retry_delay_secs));
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no send attempts configured")))
}

fn create_http_server(
    station: Arc<Mutex<Station>>,
    journal: Journal,
    mac: String,
    booted_at: Instant,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/api/log", Method::Get, move |req| {
        let body = journal.tail(JOURNAL_TAIL_LINES)?.join("\n");
        req.into_response(200, Some("OK"), &[("Content-Type", "text/plain; charset=utf-8")])?
            .write_all(body.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
        let payload = StatusResponse {
            station: lock(&station).status(Utc::now()),
            mac: mac.clone(),
            uptime_secs: booted_at.elapsed().as_secs(),
        };
        let body = serde_json::to_vec(&payload)?;
        req.into_response(
            200,
            Some("OK"),
            &[("Content-Type", "application/json; charset=utf-8")],
        )?
        .write_all(&body)?;
        Ok(())
    })?;

    Ok(server)
}

fn journal_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{STORAGE_BASE}/{path}")
    }
}

fn mount_storage() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: c"/storage".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow::Error::from(err).context("all wifi connect attempts failed"));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(RuntimeConfig::from_json(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
    }
}
