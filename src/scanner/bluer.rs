//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisements, RawAdvertisement, ScanError};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start LE discovery with duplicate reporting enabled.
///
/// BlueZ re-announces a device whenever its advertised properties change, so
/// every fresh manufacturer payload shows up as a new [`RawAdvertisement`].
/// Runs until the receiver is dropped or the process exits.
pub async fn start_scan() -> Result<Advertisements, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        })
        .await?;

    let events = adapter.discover_devices_with_changes().await?;
    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // Spawn a task that owns all Bluetooth state and runs the event loop
    tokio::spawn(async move {
        let _session = session;
        let mut events = Box::pin(events);

        while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            match read_advertisements(&adapter, address).await {
                Ok(advertisements) => {
                    for advertisement in advertisements {
                        if tx.send(advertisement).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => debug!(%address, error = %e, "failed to read device properties"),
            }
        }
    });

    Ok(rx)
}

/// Snapshot the advertised properties of a device.
///
/// One advertisement is produced per manufacturer data entry; devices
/// without manufacturer data produce none.
async fn read_advertisements(
    adapter: &Adapter,
    address: Address,
) -> Result<Vec<RawAdvertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(Vec::new());
    };

    let local_name = device.name().await?;
    let services = device.uuids().await?.unwrap_or_default();
    let rssi = device.rssi().await?.unwrap_or_default();

    Ok(manufacturer_fields(manufacturer_data)
        .into_iter()
        .map(|manufacturer_data| RawAdvertisement {
            address: address.into(),
            rssi,
            local_name: local_name.clone(),
            services: services.iter().copied().collect(),
            manufacturer_data,
        })
        .collect())
}

/// Rebuild raw manufacturer data fields from BlueZ's company-id keyed map.
///
/// BlueZ strips the leading little-endian company id from each field; the
/// HumiTemp record starts at the first byte of the field, so it is put back.
fn manufacturer_fields(data: HashMap<u16, Vec<u8>>) -> Vec<Vec<u8>> {
    data.into_iter()
        .map(|(company_id, rest)| {
            let mut field = Vec::with_capacity(2 + rest.len());
            field.extend_from_slice(&company_id.to_le_bytes());
            field.extend_from_slice(&rest);
            field
        })
        .collect()
}
