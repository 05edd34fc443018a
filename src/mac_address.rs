//! Device address type shared by the scanner backends and the event builder.

use std::fmt;
use thiserror::Error;

/// A 6-byte device address rendered as `AA:BB:CC:DD:EE:FF`.
///
/// Bytes are kept in the order they were received; no reversal is applied
/// when formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Returned when an address field does not hold exactly six bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid device address: expected 6 bytes, got {0}")]
pub struct AddressFormatError(pub usize);

impl TryFrom<&[u8]> for MacAddress {
    type Error = AddressFormatError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 6]>::try_from(bytes)
            .map(Self)
            .map_err(|_| AddressFormatError(bytes.len()))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}
