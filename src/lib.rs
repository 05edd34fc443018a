//! `sense-ble-gateway` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process exit codes.
//! The startup sequence lives in [`crate::app`] and the per-advertisement work in
//! [`crate::pipeline`], both testable with an injected scanner and ingress client.

pub mod app;
pub mod config;
pub mod credential;
pub mod duration;
pub mod event;
pub mod ingress;
pub mod mac_address;
pub mod pipeline;
pub mod record;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use config::{Config, ConfigError};
pub use credential::{Credential, CredentialError, CredentialManager, Startup, TokenStore};
pub use event::{Event, EventBuilder, EventKind};
pub use ingress::{DeliveryError, HttpIngress, IngressApi, RegistrationReply};
pub use mac_address::{AddressFormatError, MacAddress};
pub use pipeline::{DevicePattern, Outcome, Pipeline};
pub use record::{DecodeError, SensorRecord};
pub use scanner::{Backend, RawAdvertisement, ScanError, Scanner};
