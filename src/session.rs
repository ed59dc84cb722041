//! Connection lifecycle of a single sensor.
//!
//! A [`DeviceSession`] owns one peripheral for the duration of a run:
//!
//! ```text
//! Idle → Connecting → Subscribing → Streaming ─┐
//!            │                          ▲      │ link lost
//!            ▼                          │      ▼
//!       Reconnecting ──────────▶ Subscribing  Disconnected
//!            │  ▲                              │
//!            │  └──────────────────────────────┘
//!            ▼
//!          Closed   (stop() or retry budget exhausted)
//! ```
//!
//! Every wait inside the session task (connect, subscribe, next notification,
//! handing a sample to the consumer, backoff) is raced against the session's
//! cancellation token, so [`DeviceSession::stop`] takes effect promptly.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::parse::decode;
use crate::protocol::{
    encode_start_stream, encode_stop_stream, BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID,
    PMD_CONTROL_UUID, PMD_DATA_UUID, PMD_MEASUREMENT_PPG, PPG_RESOLUTION,
};
use crate::transport::{Link, Notification, Transport};
use crate::types::{CharacteristicKind, DeviceIdentity, Sample, SessionEvent, SessionState};

/// What a session does once the link is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Hold the link without subscribing; used for battery, read and test.
    Query,
    /// Subscribe to heart rate, and to PPG frames when `ppg` is set.
    Record { ppg: bool },
}

impl SessionMode {
    fn kinds(self) -> &'static [CharacteristicKind] {
        match self {
            SessionMode::Query => &[],
            SessionMode::Record { ppg: false } => &[CharacteristicKind::HeartRate],
            SessionMode::Record { ppg: true } => {
                &[CharacteristicKind::HeartRate, CharacteristicKind::Ppg]
            }
        }
    }
}

fn characteristic_uuid(kind: CharacteristicKind) -> Uuid {
    match kind {
        CharacteristicKind::HeartRate => HEART_RATE_MEASUREMENT_UUID,
        CharacteristicKind::Ppg => PMD_DATA_UUID,
    }
}

fn characteristic_kind(uuid: Uuid) -> Option<CharacteristicKind> {
    if uuid == HEART_RATE_MEASUREMENT_UUID {
        Some(CharacteristicKind::HeartRate)
    } else if uuid == PMD_DATA_UUID {
        Some(CharacteristicKind::Ppg)
    } else {
        None
    }
}

// ── Sample stream ────────────────────────────────────────────────────────────

/// Ordered, single-consumer stream of a session's decoded samples.
///
/// Bounded: while the consumer lags, the session waits instead of dropping.
/// Ends once the session is closed.
pub struct SampleStream {
    rx: mpsc::Receiver<Sample>,
}

impl SampleStream {
    pub async fn recv(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }
}

impl futures::Stream for SampleStream {
    type Item = Sample;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Sample>> {
        self.rx.poll_recv(cx)
    }
}

// ── Monotonic stamping ───────────────────────────────────────────────────────

/// Keeps a device's sample timestamps non-decreasing.
///
/// Host receive times can step backwards (clock adjustments, PPG frames
/// back-dated by the sampling interval); such samples are pinned to the last
/// emitted timestamp.  Lives as long as the session, across reconnects.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    fn stamp(&mut self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last {
            Some(last) if ts < last => last,
            _ => ts,
        };
        self.last = Some(ts);
        ts
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared {
    device: DeviceIdentity,
    state: watch::Sender<SessionState>,
    /// The live link, present only while Subscribing or Streaming.
    link: tokio::sync::Mutex<Option<Arc<dyn Link>>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("{}: → {next}", self.device);
            self.emit(SessionEvent::StateChanged {
                device: self.device.clone(),
                state: next,
            });
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn record_error(&self, reason: String) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
    }

    async fn current_link(&self) -> Result<Arc<dyn Link>> {
        if !self.state.borrow().has_link() {
            return Err(Error::NotConnected);
        }
        self.link.lock().await.clone().ok_or(Error::NotConnected)
    }

    async fn release_link(&self, grace: std::time::Duration) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            match tokio::time::timeout(grace, link.disconnect()).await {
                Ok(Ok(())) => debug!("{}: link released", self.device),
                Ok(Err(e)) => debug!("{}: disconnect failed: {e}", self.device),
                Err(_) => warn!("{}: disconnect timed out", self.device),
            }
        }
    }
}

/// Cheap, cloneable access to a session's characteristic read/write path.
///
/// Reads go through whatever link the session currently holds and fail with
/// [`Error::NotConnected`] outside Subscribing/Streaming.
#[derive(Clone)]
pub struct SessionProbe {
    shared: Arc<Shared>,
}

impl SessionProbe {
    pub fn device(&self) -> &DeviceIdentity {
        &self.shared.device
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Battery level in percent.
    pub async fn query_battery(&self) -> Result<u8> {
        let value = self.read_characteristic(BATTERY_LEVEL_UUID).await?;
        value
            .first()
            .copied()
            .ok_or_else(|| Error::MalformedPayload("empty battery level".into()))
    }

    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let link = self.shared.current_link().await?;
        link.read(uuid).await
    }

    pub async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let link = self.shared.current_link().await?;
        link.write(uuid, data).await
    }

    pub async fn services(&self) -> Result<Vec<Uuid>> {
        let link = self.shared.current_link().await?;
        link.services().await
    }
}

// ── DeviceSession ────────────────────────────────────────────────────────────

pub struct DeviceSession {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: Arc<RecorderConfig>,
    mode: SessionMode,
    cancel: CancellationToken,
    samples_tx: Option<mpsc::Sender<Sample>>,
    samples_rx: Option<mpsc::Receiver<Sample>>,
    task: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Create an idle session.  `cancel` should be a child of the run-wide
    /// token so a global stop reaches every session.
    pub fn new(
        device: DeviceIdentity,
        transport: Arc<dyn Transport>,
        config: Arc<RecorderConfig>,
        mode: SessionMode,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        let (samples_tx, samples_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                device,
                state,
                link: tokio::sync::Mutex::new(None),
                events,
                last_error: Mutex::new(None),
            }),
            transport,
            config,
            mode,
            cancel,
            samples_tx: Some(samples_tx),
            samples_rx: Some(samples_rx),
            task: None,
        }
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.shared.device
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Most recent connect/subscribe failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn probe(&self) -> SessionProbe {
        SessionProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take the decoded sample stream.  Returns `None` after the first call.
    pub fn outbound_samples(&mut self) -> Option<SampleStream> {
        self.samples_rx.take().map(|rx| SampleStream { rx })
    }

    /// Spawn the session task.  No-op unless the session is idle.
    pub fn start(&mut self) {
        if self.task.is_some() || self.state() != SessionState::Idle {
            debug!("{}: start ignored in state {}", self.device(), self.state());
            return;
        }
        let Some(samples) = self.samples_tx.take() else {
            return;
        };
        self.shared.set_state(SessionState::Connecting);
        let runner = Runner {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            mode: self.mode,
            cancel: self.cancel.clone(),
            samples,
            clock: MonotonicClock::default(),
        };
        self.task = Some(tokio::spawn(runner.run()));
    }

    /// Stop the session and release its link.
    ///
    /// Returns within the configured stop grace period: a task that has not
    /// wound down by then is aborted.  Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            let grace = self.config.stop_grace();
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("{}: did not stop within {grace:?}, aborting", self.device());
                task.abort();
                self.shared.release_link(grace).await;
            }
        }
        // A session that never started still owns its sender.
        self.samples_tx = None;
        self.shared.set_state(SessionState::Closed);
    }

    /// Wait until the session streams or closes.
    pub async fn wait_settled(&self) -> SessionState {
        let mut rx = self.watch_state();
        let settled = rx.wait_for(|s| s.is_settled()).await.map(|s| *s);
        settled.unwrap_or(SessionState::Closed)
    }

    pub async fn query_battery(&self) -> Result<u8> {
        self.probe().query_battery().await
    }

    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.probe().read_characteristic(uuid).await
    }

    pub async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        self.probe().write_characteristic(uuid, data).await
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Session task ─────────────────────────────────────────────────────────────

enum StreamEnd {
    Stopped,
    LinkLost,
}

struct Runner {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: Arc<RecorderConfig>,
    mode: SessionMode,
    cancel: CancellationToken,
    samples: mpsc::Sender<Sample>,
    clock: MonotonicClock,
}

impl Runner {
    fn device(&self) -> &DeviceIdentity {
        &self.shared.device
    }

    async fn run(mut self) {
        let policy = self.config.reconnect.clone();
        let mut failures: u32 = 0;

        loop {
            let delay = match self.establish().await {
                Ok(None) => break,
                Ok(Some(notifications)) => {
                    failures = 0;
                    match self.stream(notifications).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::LinkLost => {
                            warn!("{}: link lost, reconnecting", self.device());
                            self.shared.link.lock().await.take();
                            self.shared.set_state(SessionState::Disconnected);
                            policy.delay(0)
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "{}: attempt {failures}/{} failed: {e}",
                        self.device(),
                        policy.max_attempts
                    );
                    self.shared.record_error(e.to_string());
                    if failures >= policy.max_attempts {
                        let lost = Error::DeviceLost {
                            device: self.device().to_string(),
                            attempts: failures,
                        };
                        error!("{lost}");
                        self.shared.record_error(lost.to_string());
                        self.shared.emit(SessionEvent::DeviceLost {
                            device: self.device().clone(),
                            reason: e.to_string(),
                        });
                        break;
                    }
                    policy.delay(failures - 1)
                }
            };

            self.shared.set_state(SessionState::Reconnecting);
            debug!("{}: next attempt in {delay:?}", self.device());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.mode == (SessionMode::Record { ppg: true }) {
            self.stop_ppg().await;
        }
        self.shared.release_link(self.config.stop_grace()).await;
        self.shared.set_state(SessionState::Closed);
        info!("{}: session closed", self.device());
    }

    /// Ask the sensor to end its PMD stream before the link goes away.
    async fn stop_ppg(&self) {
        let link = self.shared.link.lock().await.clone();
        let Some(link) = link else {
            return;
        };
        let stop = encode_stop_stream(PMD_MEASUREMENT_PPG);
        let write = link.write(PMD_CONTROL_UUID, &stop);
        match tokio::time::timeout(self.config.stop_grace(), write).await {
            Ok(Ok(())) => debug!("{}: PPG stream stopped", self.device()),
            Ok(Err(e)) => debug!("{}: PPG stop failed: {e}", self.device()),
            Err(_) => debug!("{}: PPG stop timed out", self.device()),
        }
    }

    /// Connect and subscribe.  `Ok(None)` means the session was cancelled.
    async fn establish(&self) -> Result<Option<mpsc::Receiver<Notification>>> {
        // The transport bounds the attempt itself, so time spent queued
        // behind a sibling's connect does not count against this device.
        let connect = self.transport.connect(self.device(), self.config.connect_timeout());
        let link: Arc<dyn Link> = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            r = connect => Arc::from(r?),
        };

        *self.shared.link.lock().await = Some(Arc::clone(&link));
        self.shared.set_state(SessionState::Subscribing);

        let subscribe = tokio::time::timeout(self.config.subscribe_timeout(), self.subscribe(&link));
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            r = subscribe => match r {
                Ok(Ok(rx)) => Ok(Some(rx)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Subscribe("timed out".into())),
            },
        };
        if !matches!(outcome, Ok(Some(_))) {
            self.shared.release_link(self.config.stop_grace()).await;
        }
        outcome
    }

    async fn subscribe(&self, link: &Arc<dyn Link>) -> Result<mpsc::Receiver<Notification>> {
        let rx = link.notifications().await?;
        for &kind in self.mode.kinds() {
            let uuid = characteristic_uuid(kind);
            link.subscribe(uuid).await.map_err(|e| match e {
                Error::Subscribe(_) => e,
                other => Error::Subscribe(format!("{uuid}: {other}")),
            })?;
            if kind == CharacteristicKind::Ppg {
                link.subscribe(PMD_CONTROL_UUID)
                    .await
                    .map_err(|e| Error::Subscribe(format!("PMD control: {e}")))?;
                let start = encode_start_stream(
                    PMD_MEASUREMENT_PPG,
                    self.config.ppg_sample_rate_hz,
                    PPG_RESOLUTION,
                );
                link.write(PMD_CONTROL_UUID, &start)
                    .await
                    .map_err(|e| Error::Subscribe(format!("PMD start stream: {e}")))?;
            }
        }
        Ok(rx)
    }

    async fn stream(&mut self, mut notifications: mpsc::Receiver<Notification>) -> StreamEnd {
        self.shared.set_state(SessionState::Streaming);
        info!("{}: streaming", self.device());
        let ppg_interval = Some(self.config.ppg_interval());

        loop {
            let notification = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Stopped,
                n = notifications.recv() => match n {
                    Some(n) => n,
                    None => return StreamEnd::LinkLost,
                },
            };

            let Some(kind) = characteristic_kind(notification.uuid) else {
                debug!("{}: ignoring notification from {}", self.device(), notification.uuid);
                continue;
            };

            let samples = match decode(
                kind,
                &notification.value,
                notification.received_at,
                ppg_interval,
            ) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("{}: dropped notification: {e}", self.device());
                    self.shared.emit(SessionEvent::MalformedPayload {
                        device: self.device().clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            // A decoded batch is handed off whole; cancellation is only
            // observed between notifications.
            for mut sample in samples {
                sample.set_timestamp(self.clock.stamp(sample.timestamp()));
                if self.samples.send(sample).await.is_err() {
                    debug!("{}: sample consumer gone", self.device());
                    break;
                }
            }
        }
    }
}
