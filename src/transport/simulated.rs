//! In-process BLE simulator.
//!
//! [`SimulatedTransport`] hosts scripted peripherals that sessions can connect
//! to, subscribe on, and lose, entirely in-process.  Each peripheral is driven
//! from the outside through its [`SimulatedDevice`] handle: push
//! notifications, drop the link, make connects fail or hang.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Link, Notification, Transport, NOTIFICATION_BUFFER};
use crate::error::{Error, Result};
use crate::protocol::{
    BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, PMD_CONTROL_UUID,
    PMD_DATA_UUID, PMD_SERVICE_UUID,
};
use crate::types::DeviceIdentity;

#[derive(Default)]
struct DeviceState {
    /// Readable characteristic values.
    values: HashMap<Uuid, Vec<u8>>,
    /// Characteristics that accept subscriptions and writes.
    characteristics: HashSet<Uuid>,
    services: Vec<Uuid>,
    /// Sender feeding the current link's notification channel.
    link_tx: Option<mpsc::Sender<Notification>>,
    subscriptions: HashSet<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    connect_delay: Duration,
}

struct DeviceInner {
    identity: DeviceIdentity,
    state: Mutex<DeviceState>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    failures_left: AtomicU32,
    connects: AtomicU32,
    disconnects: AtomicU32,
    /// Bumped on every new link so stale links cannot tear down a newer one.
    generation: AtomicU32,
}

/// Handle used by tests to drive one simulated peripheral.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<DeviceInner>,
}

impl SimulatedDevice {
    fn new(identity: DeviceIdentity) -> Self {
        let characteristics: HashSet<Uuid> = [
            HEART_RATE_MEASUREMENT_UUID,
            BATTERY_LEVEL_UUID,
            PMD_CONTROL_UUID,
            PMD_DATA_UUID,
        ]
        .into_iter()
        .collect();
        let state = DeviceState {
            values: HashMap::from([(BATTERY_LEVEL_UUID, vec![100])]),
            characteristics,
            services: vec![HEART_RATE_SERVICE_UUID, PMD_SERVICE_UUID],
            ..DeviceState::default()
        };
        Self {
            inner: Arc::new(DeviceInner {
                identity,
                state: Mutex::new(state),
                connected: AtomicBool::new(false),
                unreachable: AtomicBool::new(false),
                failures_left: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
                generation: AtomicU32::new(0),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// Set the battery level served on the Battery Level characteristic.
    pub fn set_battery(&self, percent: u8) {
        self.set_value(BATTERY_LEVEL_UUID, vec![percent]);
    }

    /// Serve `value` on `uuid`, adding the characteristic if needed.
    pub fn set_value(&self, uuid: Uuid, value: Vec<u8>) {
        let mut state = self.state();
        state.characteristics.insert(uuid);
        state.values.insert(uuid, value);
    }

    /// Remove a characteristic: reads, writes and subscriptions on it fail.
    pub fn remove_characteristic(&self, uuid: Uuid) {
        let mut state = self.state();
        state.characteristics.remove(&uuid);
        state.values.remove(&uuid);
    }

    /// Fail the next `n` connection attempts immediately.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failures_left.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay link setup by `delay`; a delay at or beyond the connect timeout
    /// makes the attempt time out.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Number of links successfully established so far.
    pub fn connections(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of links torn down by their owner through `disconnect`.
    pub fn disconnects(&self) -> u32 {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, uuid: Uuid) -> bool {
        self.state().subscriptions.contains(&uuid)
    }

    /// Every `(characteristic, bytes)` write received, oldest first.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state().writes.clone()
    }

    /// Push a notification stamped with the current time.
    ///
    /// Returns `false` when no link is up or `uuid` is not subscribed.
    pub async fn notify(&self, uuid: Uuid, value: impl Into<Vec<u8>>) -> bool {
        self.notify_at(uuid, value, Utc::now()).await
    }

    /// Push a notification with an explicit receive time.
    pub async fn notify_at(
        &self,
        uuid: Uuid,
        value: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> bool {
        let tx = {
            let state = self.state();
            if !state.subscriptions.contains(&uuid) {
                return false;
            }
            match &state.link_tx {
                Some(tx) => tx.clone(),
                None => return false,
            }
        };
        let notification = Notification {
            uuid,
            value: value.into(),
            received_at,
        };
        tx.send(notification).await.is_ok()
    }

    /// Simulate link loss: the current link's notification channel closes.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.link_tx = None;
        state.subscriptions.clear();
        self.inner.connected.store(false, Ordering::SeqCst);
    }
}

/// A set of simulated peripherals reachable by identity.
#[derive(Default)]
pub struct SimulatedTransport {
    devices: Mutex<Vec<SimulatedDevice>>,
    /// When set, connects queue one at a time like a real adapter.
    connect_lock: Option<tokio::sync::Mutex<()>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that runs one connect at a time.  Each attempt's timeout
    /// starts once it holds the adapter.
    pub fn serialized() -> Self {
        Self {
            connect_lock: Some(tokio::sync::Mutex::new(())),
            ..Self::default()
        }
    }

    /// Register a peripheral and return its control handle.
    pub fn add_device(&self, identity: DeviceIdentity) -> SimulatedDevice {
        let device = SimulatedDevice::new(identity);
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(device.clone());
        device
    }

    /// Control handle of a registered peripheral, matched by id or, for
    /// name-only identities, by name.
    pub fn device(&self, identity: &DeviceIdentity) -> Option<SimulatedDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|d| {
                let known = d.identity();
                if identity.id.is_empty() {
                    known.name == identity.name
                } else {
                    known.id == identity.id
                }
            })
            .cloned()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<DeviceIdentity>> {
        let mut found: Vec<DeviceIdentity> = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|d| d.identity().clone())
            .collect();
        found.sort();
        Ok(found)
    }

    async fn connect(&self, device: &DeviceIdentity, timeout: Duration) -> Result<Box<dyn Link>> {
        let sim = self
            .device(device)
            .ok_or_else(|| Error::Connect(format!("{device}: not found")))?;

        let _turn = match &self.connect_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let delay = sim.state().connect_delay;
        if delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(Error::Connect(format!("{device}: timed out")));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if sim.inner.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Connect(format!("{device}: unreachable")));
        }
        let failed = sim
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Connect(format!("{device}: scripted failure")));
        }

        sim.inner.connected.store(true, Ordering::SeqCst);
        sim.inner.connects.fetch_add(1, Ordering::SeqCst);
        let generation = sim.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(SimulatedLink {
            device: sim,
            generation,
        }))
    }
}

struct SimulatedLink {
    device: SimulatedDevice,
    generation: u32,
}

impl SimulatedLink {
    fn check(&self) -> Result<()> {
        let current = self.device.inner.generation.load(Ordering::SeqCst) == self.generation;
        if current && self.device.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl Link for SimulatedLink {
    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        self.check()?;
        let mut state = self.device.state();
        if !state.characteristics.contains(&uuid) {
            return Err(Error::Subscribe(format!("characteristic {uuid} not found")));
        }
        state.subscriptions.insert(uuid);
        Ok(())
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>> {
        self.check()?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        self.device.state().link_tx = Some(tx);
        Ok(rx)
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.check()?;
        let state = self.device.state();
        state
            .values
            .get(&uuid)
            .cloned()
            .ok_or(Error::Unsupported(uuid))
    }

    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        self.check()?;
        let mut state = self.device.state();
        if !state.characteristics.contains(&uuid) {
            return Err(Error::Unsupported(uuid));
        }
        state.writes.push((uuid, data.to_vec()));
        Ok(())
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        self.check()?;
        Ok(self.device.state().services.clone())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.device.inner.generation.load(Ordering::SeqCst) == self.generation {
            self.device.inner.disconnects.fetch_add(1, Ordering::SeqCst);
            self.device.drop_link();
        }
        Ok(())
    }
}
