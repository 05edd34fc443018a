//! BLE advertisement scanning.
//!
//! Backends turn radio reports into [`RawAdvertisement`] values and push them
//! into a channel. No filtering or decoding happens here; the scan pipeline
//! decides which advertisements matter.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Error type for scanner setup.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The advertisement stream ended on its own
    #[error("scanner stopped unexpectedly")]
    Stopped,
}

/// Channel buffer size for scanned advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Bluetooth Base UUID, used to expand 16-bit service ids.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned service id into its full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// One advertisement as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Address of the advertiser as reported by the controller.
    pub address: MacAddress,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: BTreeSet<Uuid>,
    /// Complete manufacturer-specific data field, including the two leading
    /// bytes BLE reserves for a company id.
    pub manufacturer_data: Vec<u8>,
}

/// Receiving end of a running scan.
pub type Advertisements = mpsc::Receiver<RawAdvertisement>;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Scanner abstraction so the pipeline can be driven without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<Box<dyn Future<Output = Result<Advertisements, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<Box<dyn Future<Output = Result<Advertisements, ScanError>> + Send + '_>> {
        Box::pin(async move { start_scan(backend).await })
    }
}

/// Start scanning with the given backend. Duplicate advertisements are
/// always reported.
pub async fn start_scan(backend: Backend) -> Result<Advertisements, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
    }
}
