use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::Utc;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{Link, Notification, Transport, NOTIFICATION_BUFFER};
use crate::error::{Error, Result};
use crate::types::DeviceIdentity;

/// `btleplug`-backed transport bound to the first Bluetooth adapter.
pub struct BtleTransport {
    adapter: Adapter,
    /// Only peripherals whose advertised name starts with this are reported by
    /// [`Transport::scan`].  Empty matches everything.
    name_prefix: String,
    /// Serialises device lookup and link setup: several BlueZ / CoreBluetooth
    /// connects racing on one adapter tend to stall each other.
    connect_lock: Mutex<()>,
}

impl BtleTransport {
    /// Open the first Bluetooth adapter.
    pub async fn new(name_prefix: impl Into<String>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Connect("no Bluetooth adapter found".into()))?;

        // CoreBluetooth starts in an "unknown" state; scanning before it
        // reports PoweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(state) if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(state) => debug!("macOS: adapter state = {state:?}, waiting"),
                    Err(e) => {
                        warn!("macOS: adapter_state() failed: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        Ok(Self {
            adapter,
            name_prefix: name_prefix.into(),
            connect_lock: Mutex::new(()),
        })
    }

    fn matches(device: &DeviceIdentity, peripheral_id: &str, name: Option<&str>) -> bool {
        if !device.id.is_empty() {
            return device.id.eq_ignore_ascii_case(peripheral_id);
        }
        name == Some(device.name.as_str())
    }

    async fn find_known(&self, device: &DeviceIdentity) -> Option<Peripheral> {
        for p in self.adapter.peripherals().await.unwrap_or_default() {
            let name = match p.properties().await {
                Ok(Some(props)) => props.local_name,
                _ => None,
            };
            if Self::matches(device, &p.id().to_string(), name.as_deref()) {
                return Some(p);
            }
        }
        None
    }

    /// Scan until `device` shows up.
    async fn find(&self, device: &DeviceIdentity) -> Result<Peripheral> {
        if let Some(p) = self.find_known(device).await {
            return Ok(p);
        }
        debug!("scanning for {device}");
        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = loop {
            if let Some(p) = self.find_known(device).await {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };
        self.adapter.stop_scan().await.ok();
        debug!("stopped scanning for {device}");
        Ok(found)
    }

    async fn open(&self, device: &DeviceIdentity) -> Result<BtleLink> {
        let peripheral = self.find(device).await?;

        info!("connecting to {device}");
        peripheral.connect().await?;

        // BlueZ signals the connection before the remote GATT cache is
        // populated; discovering too early returns an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        peripheral.discover_services().await?;
        let characteristics = peripheral.characteristics();
        info!(
            "connected to {device}: {} characteristic(s)",
            characteristics.len()
        );

        Ok(BtleLink {
            peripheral,
            adapter: self.adapter.clone(),
            characteristics,
        })
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceIdentity>> {
        info!("scanning for {} s", timeout.as_secs_f32());
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        self.adapter.stop_scan().await.ok();

        let mut found = Vec::new();
        for p in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if name.starts_with(&self.name_prefix) {
                        let id = p.id().to_string();
                        info!("found {name}  id={id}");
                        found.push(DeviceIdentity::new(id, name));
                    }
                }
            }
        }
        found.sort();
        info!("scan: {} device(s) found", found.len());
        Ok(found)
    }

    async fn connect(&self, device: &DeviceIdentity, timeout: Duration) -> Result<Box<dyn Link>> {
        // The timeout covers the lookup and link setup, not the queue.
        let _guard = self.connect_lock.lock().await;
        match tokio::time::timeout(timeout, self.open(device)).await {
            Ok(Ok(link)) => Ok(Box::new(link)),
            Ok(Err(e)) => Err(Error::Connect(format!("{device}: {e}"))),
            Err(_) => {
                self.adapter.stop_scan().await.ok();
                Err(Error::Connect(format!(
                    "{device}: timed out after {} s",
                    timeout.as_secs_f32()
                )))
            }
        }
    }
}

/// A connected `btleplug` peripheral.
pub struct BtleLink {
    peripheral: Peripheral,
    /// Adapter that owns the peripheral; its event stream reports link loss.
    adapter: Adapter,
    characteristics: BTreeSet<Characteristic>,
}

impl BtleLink {
    fn find_char(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::Unsupported(uuid))
    }
}

#[async_trait]
impl Link for BtleLink {
    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let c = self
            .find_char(uuid)
            .map_err(|_| Error::Subscribe(format!("characteristic {uuid} not found")))?;
        self.peripheral
            .subscribe(c)
            .await
            .map_err(|e| Error::Subscribe(format!("{uuid}: {e}")))
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>> {
        let mut notifications = self.peripheral.notifications().await?;
        let mut events = self.adapter.events().await?;
        let peripheral_id = self.peripheral.id();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);

        // Forward until the notification stream ends or the adapter reports
        // the disconnect, whichever comes first; dropping `tx` closes `rx`.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    n = notifications.next() => match n {
                        Some(n) => {
                            let notification = Notification {
                                uuid: n.uuid,
                                value: n.value,
                                received_at: Utc::now(),
                            };
                            if tx.send(notification).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("notification stream of {peripheral_id:?} ended");
                            break;
                        }
                    },
                    ev = events.next() => match ev {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("device {id:?} disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!("adapter event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let c = self.find_char(uuid)?;
        Ok(self.peripheral.read(c).await?)
    }

    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let c = self.find_char(uuid)?;
        self.peripheral
            .write(c, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        Ok(self.peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
