//! btleplug implementation of the BLE platform trait.
//!
//! Each request is spawned onto the tokio runtime and reports back through
//! the event channel, so the monitor loop never awaits the radio itself.
//! Listener tasks are owned here and aborted on unsubscribe or drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use ble_telemetry::discovery::peripheral_id;
use ble_telemetry::platform::failure_reason;
use ble_telemetry::{
    BlePlatform, ConnectAttempt, DiscoveryEvent, FailureReason, PeripheralId, PlatformEvent, ScanSettings,
};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as BtleplugId};
use futures::{Stream, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Peripherals seen by the central listener, by core identity
type PeripheralMap = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

/// BLE platform backed by the first local Bluetooth adapter.
pub struct BtleplugPlatform {
    adapter: Adapter,
    events: UnboundedSender<PlatformEvent>,
    peripherals: PeripheralMap,
    allow_duplicates: Arc<AtomicBool>,
    /// Forwards adapter events for the lifetime of the platform
    listener: JoinHandle<()>,
    scan: Option<JoinHandle<()>>,
    /// Notification forwarders, one per subscribed peripheral
    subscriptions: HashMap<PeripheralId, JoinHandle<()>>,
}

impl BtleplugPlatform {
    /// Open the first adapter and start listening for central events.
    ///
    /// Returns the platform and the receiving end of its event channel.
    pub async fn new() -> Result<(Self, UnboundedReceiver<PlatformEvent>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        let (events, receiver) = mpsc::unbounded_channel();
        let peripherals = PeripheralMap::default();
        let allow_duplicates = Arc::new(AtomicBool::new(true));

        let central_events = adapter.events().await?;
        let listener = tokio::spawn(forward_central_events(
            central_events,
            adapter.clone(),
            events.clone(),
            peripherals.clone(),
            allow_duplicates.clone(),
        ));

        let platform = Self {
            adapter,
            events,
            peripherals,
            allow_duplicates,
            listener,
            scan: None,
            subscriptions: HashMap::new(),
        };
        Ok((platform, receiver))
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, FailureReason> {
        lock(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| failure_reason("peripheral not discovered"))
    }

    fn stop_forwarding(&mut self, id: &PeripheralId) {
        if let Some(task) = self.subscriptions.remove(id) {
            task.abort();
        }
    }
}

impl BlePlatform for BtleplugPlatform {
    fn request_scan(&mut self, settings: &ScanSettings) -> Result<(), FailureReason> {
        self.allow_duplicates
            .store(settings.allow_duplicates, Ordering::Relaxed);

        let mut filter = ScanFilter::default();
        filter.services = settings.services.iter().copied().collect();
        let window = Duration::from_secs(settings.duration_secs.into());
        let adapter = self.adapter.clone();
        let events = self.events.clone();

        if let Some(previous) = self.scan.take() {
            previous.abort();
        }
        self.scan = Some(tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                let _ = events.send(PlatformEvent::ScanFailed(reason(e)));
                return;
            }
            tokio::time::sleep(window).await;
            if let Err(e) = adapter.stop_scan().await {
                warn!("stopping scan failed: {}", e);
            }
            let _ = events.send(PlatformEvent::ScanStopped);
        }));
        Ok(())
    }

    fn request_connect(&mut self, id: &PeripheralId, attempt: ConnectAttempt) -> Result<(), FailureReason> {
        let peripheral = self.peripheral(id)?;
        let events = self.events.clone();
        let id = id.clone();

        tokio::spawn(async move {
            let result = async {
                peripheral.connect().await?;
                peripheral.discover_services().await
            }
            .await
            .map_err(reason);
            let _ = events.send(PlatformEvent::ConnectCompleted { id, attempt, result });
        });
        Ok(())
    }

    fn request_disconnect(&mut self, id: &PeripheralId) -> Result<(), FailureReason> {
        self.stop_forwarding(id);
        let peripheral = self.peripheral(id)?;
        let events = self.events.clone();
        let id = id.clone();

        tokio::spawn(async move {
            let result = peripheral.disconnect().await.map_err(reason);
            let _ = events.send(PlatformEvent::DisconnectCompleted { id, result });
        });
        Ok(())
    }

    fn subscribe_notifications(
        &mut self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), FailureReason> {
        let peripheral = self.peripheral(id)?;
        let events = self.events.clone();
        let owner = id.clone();

        let task = tokio::spawn(async move {
            let id = owner;
            let subscribe = async {
                let target = find_characteristic(&peripheral, service, characteristic)
                    .ok_or_else(|| failure_reason("telemetry characteristic not found"))?;
                // Open the stream first so the earliest values are not missed
                let stream = peripheral.notifications().await.map_err(reason)?;
                peripheral.subscribe(&target).await.map_err(reason)?;
                Ok::<_, FailureReason>(stream)
            };

            let mut notifications = match subscribe.await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(PlatformEvent::SubscribeCompleted { id, result: Err(e) });
                    return;
                }
            };
            let _ = events.send(PlatformEvent::SubscribeCompleted {
                id: id.clone(),
                result: Ok(()),
            });

            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                let Ok(value) = heapless::Vec::from_slice(&notification.value) else {
                    warn!("dropping oversized notification ({} bytes)", notification.value.len());
                    continue;
                };
                if events
                    .send(PlatformEvent::Notification { id: id.clone(), value })
                    .is_err()
                {
                    break;
                }
            }
            debug!("notification stream for {} ended", id);
        });

        if let Some(previous) = self.subscriptions.insert(id.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn unsubscribe_notifications(
        &mut self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), FailureReason> {
        self.stop_forwarding(id);
        let peripheral = self.peripheral(id)?;
        let id = id.clone();

        tokio::spawn(async move {
            if let Some(target) = find_characteristic(&peripheral, service, characteristic) {
                if let Err(e) = peripheral.unsubscribe(&target).await {
                    warn!("unsubscribe from {} failed: {}", id, e);
                }
            }
        });
        Ok(())
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        self.listener.abort();
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

/// Translate adapter events into platform events until the channel closes.
async fn forward_central_events<S>(
    mut central_events: S,
    adapter: Adapter,
    events: UnboundedSender<PlatformEvent>,
    peripherals: PeripheralMap,
    allow_duplicates: Arc<AtomicBool>,
) where
    S: Stream<Item = CentralEvent> + Unpin,
{
    while let Some(central_event) = central_events.next().await {
        let event = match central_event {
            CentralEvent::DeviceDiscovered(pid) => discovery(&adapter, &pid, &peripherals).await,
            CentralEvent::DeviceUpdated(pid) if allow_duplicates.load(Ordering::Relaxed) => {
                discovery(&adapter, &pid, &peripherals).await
            }
            CentralEvent::DeviceDisconnected(pid) => {
                peripheral_id(&pid.to_string()).map(|id| PlatformEvent::PeripheralLost { id })
            }
            _ => None,
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                break;
            }
        }
    }
}

/// Build a discovery event and remember the peripheral for later requests.
async fn discovery(adapter: &Adapter, pid: &BtleplugId, peripherals: &PeripheralMap) -> Option<PlatformEvent> {
    let peripheral = adapter.peripheral(pid).await.ok()?;
    let name = match peripheral.properties().await {
        Ok(Some(props)) => props.local_name,
        _ => None,
    };

    let Some(event) = DiscoveryEvent::new(&pid.to_string(), name.as_deref(), now_ms()) else {
        warn!("ignoring peripheral with oversized identity {}", pid);
        return None;
    };
    lock(peripherals).insert(event.id.clone(), peripheral);
    Some(PlatformEvent::Discovered(event))
}

fn find_characteristic(peripheral: &Peripheral, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic && c.service_uuid == service)
}

fn lock(peripherals: &PeripheralMap) -> MutexGuard<'_, HashMap<PeripheralId, Peripheral>> {
    peripherals.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reason(error: impl std::fmt::Display) -> FailureReason {
    failure_reason(&error.to_string())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
