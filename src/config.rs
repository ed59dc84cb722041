//! Run configuration: which sensors exist and how hard to try reaching them.
//!
//! Built once at startup (from defaults or a JSON file) and shared read-only
//! through an `Arc` for the whole run.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::PPG_FREQUENCY;
use crate::types::DeviceIdentity;

/// The sensor pool, in subject order.
pub const DEFAULT_DEVICE_NAMES: [&str; 7] = [
    "Polar OH1 85E77F28",
    "Polar OH1 6EFADA2E",
    "Polar OH1 84BF0B2D",
    "Polar OH1 6E85CB22",
    "Polar OH1 D025F429",
    "Polar OH1 85EA7F2B",
    "Polar OH1 84BF1A2F",
];

/// Exponential backoff between connection attempts.
///
/// The first retry waits `initial_delay_ms`, each further one doubles it up to
/// `max_delay_ms`.  After `max_attempts` consecutive failed attempts the device
/// is given up for the run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `retry`-th consecutive retry, counted from zero.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration shared by every session of a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Known sensors.  Position `i` is worn by the `i`-th subject.
    pub devices: Vec<DeviceIdentity>,
    /// Advertised-name prefix reported by `discover`.  Default: `"Polar"`.
    pub name_prefix: String,
    pub scan_timeout_ms: u64,
    /// Bound on one connection attempt (lookup + link + service discovery).
    pub connect_timeout_ms: u64,
    /// Bound on subscribing to all measurement characteristics.
    pub subscribe_timeout_ms: u64,
    /// Bound on waiting for all sessions to stream or give up.
    pub start_timeout_ms: u64,
    /// How long a stop may take before the session task is aborted.
    pub stop_grace_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Samples buffered per session before the session waits on its consumer.
    pub channel_capacity: usize,
    /// Also stream raw PPG frames from the PMD service while recording.
    pub record_ppg: bool,
    pub ppg_sample_rate_hz: u16,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            devices: DEFAULT_DEVICE_NAMES
                .iter()
                .map(|&name| DeviceIdentity::named(name))
                .collect(),
            name_prefix: "Polar".into(),
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            subscribe_timeout_ms: 10_000,
            start_timeout_ms: 120_000,
            stop_grace_ms: 3_000,
            reconnect: ReconnectPolicy::default(),
            channel_capacity: 256,
            record_ppg: false,
            ppg_sample_rate_hz: PPG_FREQUENCY,
        }
    }
}

impl RecorderConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for d in &self.devices {
            if d.name.is_empty() && d.id.is_empty() {
                return Err(Error::Config("device without id or name".into()));
            }
            if !seen.insert((&d.id, &d.name)) {
                return Err(Error::Config(format!("device {d} listed twice")));
            }
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be positive".into()));
        }
        if self.ppg_sample_rate_hz == 0 {
            return Err(Error::Config("ppg_sample_rate_hz must be positive".into()));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(Error::Config(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Period between PPG frames at the configured sample rate.
    /// Spacing between PPG frames.  A zero rate, which [`Self::validate`]
    /// rejects, is treated as 1 Hz.
    pub fn ppg_interval(&self) -> chrono::Duration {
        chrono::Duration::nanoseconds(1_000_000_000 / i64::from(self.ppg_sample_rate_hz.max(1)))
    }
}
