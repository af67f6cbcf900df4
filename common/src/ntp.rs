use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::{Error, Result};

pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between the NTP era (1900) and the Unix epoch.
pub const NTP_UNIX_DELTA: i64 = 2_208_988_800;

const MODE_SERVER: u8 = 4;

/// LI=0, VN=3, Mode=3 (client).
pub fn build_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0_u8; NTP_PACKET_LEN];
    packet[0] = 0x1b;
    packet
}

/// Extracts the server's transmit timestamp.
pub fn parse_response(packet: &[u8]) -> Result<DateTime<Utc>> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(Error::Ntp(format!(
            "short packet ({} of {NTP_PACKET_LEN} bytes)",
            packet.len()
        )));
    }

    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(Error::Ntp(format!("unexpected mode {mode}")));
    }

    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    if seconds == 0 {
        return Err(Error::Ntp("server is not synchronized".to_string()));
    }

    let unix_secs = i64::from(seconds) - NTP_UNIX_DELTA;
    let nanos = ((u64::from(fraction) * 1_000_000_000) >> 32) as u32;

    Utc.timestamp_opt(unix_secs, nanos)
        .single()
        .ok_or_else(|| Error::Ntp(format!("timestamp {unix_secs} out of range")))
}

/// Wall clock derived from the board's free-running clock plus the offset
/// measured at the last successful sync.
#[derive(Debug, Clone, Default)]
pub struct SyncedClock {
    offset: Duration,
    last_sync: Option<DateTime<Utc>>,
}

impl SyncedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, server_time: DateTime<Utc>, local_now: DateTime<Utc>) {
        self.offset = server_time - local_now;
        self.last_sync = Some(server_time);
    }

    pub fn now(&self, local_now: DateTime<Utc>) -> DateTime<Utc> {
        local_now + self.offset
    }

    pub fn is_synced(&self) -> bool {
        self.last_sync.is_some()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }
}
