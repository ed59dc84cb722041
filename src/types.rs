use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured sensor.
///
/// `id` is the platform BLE identifier (a MAC address on Linux, a UUID string
/// on macOS / Windows).  It may be left empty, in which case the transport
/// resolves the device by its advertised `name` at connect time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Identity known only by its advertised name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}

/// The label of a person wearing a sensor during a recording run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subject(String);

impl Subject {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Subject {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// Which measurement stream a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    /// Standard Heart Rate Measurement (0x2A37).
    HeartRate,
    /// Polar PMD data characteristic carrying PPG frames.
    Ppg,
}

/// One heart-rate measurement notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateSample {
    pub timestamp: DateTime<Utc>,
    /// Beats per minute.
    pub bpm: u16,
    /// RR intervals in milliseconds, oldest first.  Empty when the sensor did
    /// not report any beat in this notification.
    pub rr_intervals: Vec<u16>,
    /// Skin contact, when the sensor supports contact detection.
    pub sensor_contact: Option<bool>,
    /// Cumulative energy expended in kJ, when present.
    pub energy_expended: Option<u16>,
}

/// One optical frame: a reading from every PPG channel at the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpgSample {
    pub timestamp: DateTime<Utc>,
    /// Signed 24-bit readings in frame order: ppg0, ppg1, ppg2, ambient.
    pub channel_readings: Vec<i32>,
}

/// A decoded measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    HeartRate(HeartRateSample),
    Ppg(PpgSample),
}

impl Sample {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Sample::HeartRate(s) => s.timestamp,
            Sample::Ppg(s) => s.timestamp,
        }
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        match self {
            Sample::HeartRate(s) => s.timestamp = timestamp,
            Sample::Ppg(s) => s.timestamp = timestamp,
        }
    }

    /// Short type tag used in output files.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Sample::HeartRate(_) => "hr",
            Sample::Ppg(_) => "ppg",
        }
    }
}

/// Connection lifecycle of a single device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Subscribing,
    Streaming,
    Disconnected,
    Reconnecting,
    Closed,
}

impl SessionState {
    /// `true` once the session reached a state it will not leave on its own.
    pub fn is_settled(self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Closed)
    }

    /// `true` while a link is up and can serve reads.
    pub fn has_link(self) -> bool {
        matches!(self, SessionState::Subscribing | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A sample tagged with who wore the sensor and in which phase of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub subject: Subject,
    pub phase: String,
    pub device: DeviceIdentity,
    pub sample: Sample,
}

/// Lifecycle notifications emitted by sessions onto the registry's event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        device: DeviceIdentity,
        state: SessionState,
    },
    /// The reconnect budget ran out; the session is closed for this run.
    DeviceLost {
        device: DeviceIdentity,
        reason: String,
    },
    /// A notification could not be decoded and was dropped.
    MalformedPayload {
        device: DeviceIdentity,
        reason: String,
    },
}
