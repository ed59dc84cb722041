//! # polar-rec
//!
//! Record heart-rate (and optionally PPG) streams from several Polar optical
//! sensors at once over Bluetooth Low Energy, one CSV file per subject.
//!
//! Each sensor gets its own [`session::DeviceSession`], which connects,
//! subscribes, decodes notifications and reconnects with exponential backoff
//! when the link drops.  A [`registry::SessionRegistry`] owns the sessions of a
//! run and the positional device ↔ subject [`registry::DeviceAssignment`].  The
//! [`recorder`] pipeline tags every decoded sample with its subject and phase
//! and hands it to that subject's sink.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use polar_rec::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(RecorderConfig::default());
//!     let transport = Arc::new(BtleTransport::new(config.name_prefix.clone()).await?);
//!     let subjects = [Subject::from("alice"), Subject::from("bob")];
//!     let assignment = DeviceAssignment::new(&config.devices, &subjects)?;
//!
//!     let stop = CancellationToken::new();
//!     let ctrl_c = stop.clone();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         ctrl_c.cancel();
//!     });
//!
//!     let factory = Arc::new(CsvSinkFactory::new("data", chrono::Utc::now()));
//!     let report = commands::record(transport, assignment, "baseline", factory, config, stop).await?;
//!     println!("{} records written", report.total_written());
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`protocol`] | GATT UUIDs, PMD control commands and PPG constants |
//! | [`parse`] | Heart Rate Measurement and PMD PPG frame decoders |
//! | [`transport`] | BLE abstraction with `btleplug` and simulated backends |
//! | [`session`] | Per-device connection state machine |
//! | [`registry`] | Device assignment and concurrent start/stop of sessions |
//! | [`recorder`] | Record sinks and the per-subject recording pipeline |
//! | [`commands`] | discover, battery, test, read and record |
//! | [`config`] | Run configuration and reconnect policy |

pub mod commands;
pub mod config;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod recorder;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use error::{Error, Result};

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::commands;
    pub use crate::config::{ReconnectPolicy, RecorderConfig};
    pub use crate::error::{Error, Result};
    pub use crate::recorder::{
        CsvSink, CsvSinkFactory, RecordSink, RecordingReport, SinkFactory, SubjectReport,
    };
    pub use crate::registry::{DeviceAssignment, SessionRegistry, StartReport};
    pub use crate::session::{DeviceSession, SampleStream, SessionMode};
    pub use crate::transport::btle::BtleTransport;
    pub use crate::transport::simulated::{SimulatedDevice, SimulatedTransport};
    pub use crate::transport::{Link, Transport};
    pub use crate::types::{
        DeviceIdentity, HeartRateSample, PpgSample, Record, Sample, SessionEvent, SessionState,
        Subject,
    };
    pub use tokio_util::sync::CancellationToken;
}
