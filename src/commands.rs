//! The operations exposed by the `polar-rec` binary.
//!
//! Every command takes its transport and configuration explicitly so it can be
//! driven against [`crate::transport::simulated::SimulatedTransport`] as well
//! as real hardware.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::protocol::{encode_get_settings, PMD_CONTROL_UUID, PMD_DATA_UUID, PMD_MEASUREMENT_PPG};
use crate::recorder::{spawn_pipeline, RecordingReport, SinkFactory};
use crate::registry::{DeviceAssignment, SessionRegistry};
use crate::session::{SessionMode, SessionProbe};
use crate::transport::Transport;
use crate::types::{DeviceIdentity, SessionEvent};

/// Scan for `timeout` and list the matching peripherals.
pub async fn discover(transport: &dyn Transport, timeout: Duration) -> Result<Vec<DeviceIdentity>> {
    transport.scan(timeout).await
}

/// Connect to every device once and run `query` against it.
///
/// Devices that never reach a live link map to the error that kept them out.
async fn query_each<T, F, Fut>(
    transport: Arc<dyn Transport>,
    assignment: DeviceAssignment,
    config: Arc<RecorderConfig>,
    query: F,
) -> BTreeMap<DeviceIdentity, Result<T>>
where
    F: Fn(SessionProbe) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let cancel = CancellationToken::new();
    let mut registry = SessionRegistry::new(
        transport,
        Arc::new(assignment),
        Arc::clone(&config),
        SessionMode::Query,
        &cancel,
    );
    registry.start_all().await;

    let mut results = BTreeMap::new();
    for session in registry.sessions() {
        let device = session.device().clone();
        let state = session.state();
        let result = if state.has_link() {
            match tokio::time::timeout(config.connect_timeout(), query(session.probe())).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout),
            }
        } else if let Some(reason) = session.last_error() {
            Err(Error::Connect(reason))
        } else {
            debug!("{device}: still {state}");
            Err(Error::NotConnected)
        };
        results.insert(device, result);
    }

    registry.stop_all().await;
    results
}

/// Battery level of every device, in percent.
pub async fn check_battery(
    transport: Arc<dyn Transport>,
    assignment: DeviceAssignment,
    config: Arc<RecorderConfig>,
) -> BTreeMap<DeviceIdentity, Result<u8>> {
    query_each(transport, assignment, config, |probe| async move {
        let level = probe.query_battery().await?;
        info!("{}: battery {level}%", probe.device());
        Ok(level)
    })
    .await
}

/// Ask each device for its PPG settings over the PMD control point, then read
/// the PMD data characteristic.
pub async fn test(
    transport: Arc<dyn Transport>,
    assignment: DeviceAssignment,
    config: Arc<RecorderConfig>,
) -> BTreeMap<DeviceIdentity, Result<Vec<u8>>> {
    query_each(transport, assignment, config, |probe| async move {
        probe
            .write_characteristic(PMD_CONTROL_UUID, &encode_get_settings(PMD_MEASUREMENT_PPG))
            .await?;
        probe.read_characteristic(PMD_DATA_UUID).await
    })
    .await
}

/// Read one characteristic from every device.
pub async fn read_service(
    transport: Arc<dyn Transport>,
    assignment: DeviceAssignment,
    uuid: Uuid,
    config: Arc<RecorderConfig>,
) -> BTreeMap<DeviceIdentity, Result<Vec<u8>>> {
    query_each(transport, assignment, config, move |probe| async move {
        probe.read_characteristic(uuid).await
    })
    .await
}

/// Service UUIDs exposed by each device.
pub async fn list_services(
    transport: Arc<dyn Transport>,
    devices: &[DeviceIdentity],
    config: Arc<RecorderConfig>,
) -> BTreeMap<DeviceIdentity, Result<Vec<Uuid>>> {
    let assignment = DeviceAssignment::all_devices(devices);
    query_each(transport, assignment, config, |probe| async move {
        probe.services().await
    })
    .await
}

/// Record every assigned device into its subject's sink until `stop` fires.
///
/// Devices that cannot be reached, or that are lost mid-run, do not end the
/// recording for the others.
pub async fn record(
    transport: Arc<dyn Transport>,
    assignment: DeviceAssignment,
    phase: &str,
    factory: Arc<dyn SinkFactory>,
    config: Arc<RecorderConfig>,
    stop: CancellationToken,
) -> Result<RecordingReport> {
    if assignment.is_empty() {
        return Err(Error::Config("no subjects to record".into()));
    }
    for (device, subject) in assignment.entries() {
        info!("{subject} wears {device}");
    }

    let mode = SessionMode::Record {
        ppg: config.record_ppg,
    };
    let mut registry = SessionRegistry::new(
        transport,
        Arc::new(assignment),
        Arc::clone(&config),
        mode,
        &stop,
    );

    let pipeline = spawn_pipeline(phase, registry.take_streams(), factory);
    let events = registry.events().map(|mut rx| {
        tokio::spawn(async move {
            let mut lost = Vec::new();
            while let Some(event) = rx.recv().await {
                match event {
                    SessionEvent::DeviceLost { device, reason } => {
                        warn!("{device}: lost ({reason})");
                        lost.push(device);
                    }
                    SessionEvent::MalformedPayload { device, reason } => {
                        debug!("{device}: malformed payload: {reason}");
                    }
                    SessionEvent::StateChanged { device, state } => {
                        debug!("{device}: {state}");
                    }
                }
            }
            lost
        })
    });

    let started = registry.start_all().await;
    if started.streaming.is_empty() && started.pending.is_empty() {
        warn!("no device could be reached");
    } else {
        info!("recording phase {phase:?}, stop with Ctrl-C");
        stop.cancelled().await;
        info!("stopping");
    }
    registry.stop_all().await;
    drop(registry);

    // Every sender is gone once the sessions are stopped, so the pipeline
    // ends as soon as the sinks have taken what was already decoded.
    info!("draining recorded samples");
    let mut report = match pipeline.await {
        Ok(report) => report,
        Err(e) => {
            warn!("recording pipeline failed: {e}");
            RecordingReport::default()
        }
    };
    if let Some(events) = events {
        if let Ok(Ok(lost)) = tokio::time::timeout(config.stop_grace(), events).await {
            report.lost = lost;
        }
    }
    Ok(report)
}
