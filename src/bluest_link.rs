//! The BLE side of a session, on top of [`bluest`].
//!
//! Finds the BMS by its advertised name, connects, discovers the Kilovault
//! service and keeps the link up: notifications are forwarded to the session
//! task as [`LinkEvent`]s and queued [`Write`]s are written to the control
//! characteristic. When the link drops, the session is told and the link is
//! re-established after a delay.

use anyhow::{anyhow, Context};
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::adapter::{
    ConnectionState, CONTROL_CHARACTERISTIC_UUID, NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use crate::config::DeviceConfig;
use crate::driver::{LinkEvent, Write};
use crate::error::TransportError;

/// How long to scan for the device before giving up on this attempt.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Connection attempts per discovered device before scanning again.
const CONNECT_RETRIES: u32 = 2;

struct Link {
    device: Device,
    write: Characteristic,
    notify: Characteristic,
}

/// Keep a link to `device` up until the session task goes away.
pub async fn maintain(
    adapter: Adapter,
    device: DeviceConfig,
    mut writes: mpsc::UnboundedReceiver<Write>,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> anyhow::Result<()> {
    loop {
        if events
            .send(LinkEvent::Connection(ConnectionState::Connecting))
            .is_err()
        {
            return Ok(());
        }

        match establish(&adapter, &device.device_name).await {
            Ok(link) => {
                let result = serve(&link, &mut writes, &events).await;
                let _ = events.send(LinkEvent::Connection(ConnectionState::Disconnected));
                if let Err(err) = adapter.disconnect_device(&link.device).await {
                    debug!(id = %device.id, "disconnect failed: {err}");
                }
                match result {
                    Ok(Served::SessionGone) => return Ok(()),
                    Ok(Served::LinkLost) => info!(id = %device.id, "link lost"),
                    Err(err) => warn!(id = %device.id, "link failed: {err:#}"),
                }
            }
            Err(err) => {
                warn!(id = %device.id, "could not connect: {err:#}");
                if events
                    .send(LinkEvent::Connection(ConnectionState::Disconnected))
                    .is_err()
                {
                    return Ok(());
                }
            }
        }

        // Writes queued while down would go to a stale poll.
        while writes.try_recv().is_ok() {}
        sleep(device.reconnect_delay()).await;
    }
}

enum Served {
    LinkLost,
    SessionGone,
}

async fn serve(
    link: &Link,
    writes: &mut mpsc::UnboundedReceiver<Write>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> anyhow::Result<Served> {
    let mut notifications = link.notify.notify().await?;
    if events
        .send(LinkEvent::Connection(ConnectionState::Connected))
        .is_err()
    {
        return Ok(Served::SessionGone);
    }

    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(Ok(value)) => {
                    if events
                        .send(LinkEvent::Notification {
                            characteristic: NOTIFY_CHARACTERISTIC_UUID,
                            value,
                        })
                        .is_err()
                    {
                        return Ok(Served::SessionGone);
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => {
                    debug!("end of notification stream");
                    return Ok(Served::LinkLost);
                }
            },
            write = writes.recv() => {
                let Some(write) = write else {
                    return Ok(Served::SessionGone);
                };
                if write.characteristic != CONTROL_CHARACTERISTIC_UUID {
                    warn!(characteristic = %write.characteristic, "no such characteristic on this link");
                    continue;
                }
                if let Err(err) = link.write.write(&write.value).await {
                    let failed = LinkEvent::WriteFailed(TransportError::WriteFailed(err.to_string()));
                    if events.send(failed).is_err() {
                        return Ok(Served::SessionGone);
                    }
                }
            }
        }
    }
}

/// Discover, connect and find the Kilovault characteristics.
async fn establish(adapter: &Adapter, name: &str) -> anyhow::Result<Link> {
    let device = timeout(DISCOVERY_TIMEOUT, discover_device(name, adapter))
        .await
        .map_err(|_| anyhow!("Device not found"))??;

    try_connect(adapter, &device.device).await?;

    let service = device
        .device
        .discover_services_with_uuid(SERVICE_UUID)
        .await?
        .first()
        .ok_or(anyhow!("The specified device does not support the Kilovault BMS service."))?
        .clone();
    let write = service
        .discover_characteristics_with_uuid(CONTROL_CHARACTERISTIC_UUID)
        .await?
        .first()
        .ok_or(anyhow!("No control characteristic found at device, not a Kilovault BMS?"))?
        .clone();
    let notify = service
        .discover_characteristics_with_uuid(NOTIFY_CHARACTERISTIC_UUID)
        .await?
        .first()
        .ok_or(anyhow!("No notify characteristic found at device, not a Kilovault BMS?"))?
        .clone();

    info!(name, "connected");
    Ok(Link {
        device: device.device,
        write,
        notify,
    })
}

async fn discover_device(name: &str, adapter: &Adapter) -> anyhow::Result<AdvertisingDevice> {
    let required_services = [SERVICE_UUID];
    let mut adapter_events = adapter.scan(&required_services).await?;
    while let Some(device) = adapter_events.next().await {
        let device_name = device.device.name_async().await?;
        if device_name == name {
            return Ok(device);
        }
    }

    Err(anyhow!("Device not found"))
}

async fn try_connect(adapter: &Adapter, device: &Device) -> anyhow::Result<()> {
    if device.is_connected().await {
        return Ok(());
    }
    let mut retries = CONNECT_RETRIES;
    loop {
        match adapter.connect_device(device).await {
            Ok(()) => return Ok(()),
            Err(err) if retries > 0 => {
                warn!("failed to connect: {err}");
                retries -= 1;
            }
            Err(err) => return Err(err).context("failed to connect"),
        }
    }
}

/// The default adapter, once it is powered on.
pub async fn default_adapter() -> anyhow::Result<Adapter> {
    let adapter = Adapter::default()
        .await
        .ok_or(anyhow!("Default adapter not found"))?;
    adapter.wait_available().await?;
    Ok(adapter)
}
