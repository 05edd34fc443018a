//! Fixed-layout HumiTemp sensor record.
//!
//! The sensor packs its readings into the manufacturer-specific data of every
//! advertisement as a flat little-endian record of single-byte fields followed
//! by the device address:
//!
//! | offset | field                   |
//! |--------|-------------------------|
//! | 0      | temperature sign flag   |
//! | 1      | temperature whole part  |
//! | 2      | temperature tenths      |
//! | 3      | humidity sign flag      |
//! | 4      | humidity whole part     |
//! | 5      | humidity tenths         |
//! | 6      | update rate             |
//! | 7..13  | device address          |

use thiserror::Error;

/// Total length of an encoded record in bytes.
pub const RECORD_LEN: usize = 13;

/// Length of the device address field.
pub const ADDRESS_LEN: usize = 6;

const TEMPERATURE_SIGN: usize = 0;
const TEMPERATURE_WHOLE: usize = 1;
const TEMPERATURE_TENTHS: usize = 2;
const HUMIDITY_SIGN: usize = 3;
const HUMIDITY_WHOLE: usize = 4;
const HUMIDITY_TENTHS: usize = 5;
const UPDATE_RATE: usize = 6;
const ADDRESS: usize = 7;

/// Errors returned when a payload does not match the record layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty manufacturer data")]
    Empty,
    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Oversized record: expected {expected} bytes, got {actual}")]
    Oversized { expected: usize, actual: usize },
}

/// One signed reading as transmitted: a sign flag, a whole part and a single
/// decimal digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reading {
    /// Zero means positive, anything else negative.
    pub sign: u8,
    pub whole: u8,
    pub tenths: u8,
}

impl Reading {
    pub fn is_negative(&self) -> bool {
        self.sign != 0
    }

    /// Signed decimal value of the reading.
    ///
    /// The tenths digit is not range checked, so a misbehaving sensor sending
    /// `tenths = 12` yields `whole + 1.2`.
    pub fn value(&self) -> f64 {
        let magnitude = f64::from(self.whole) + f64::from(self.tenths) / 10.0;
        if self.is_negative() {
            -magnitude
        } else {
            magnitude
        }
    }
}

/// A decoded HumiTemp record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorRecord {
    pub temperature: Reading,
    pub humidity: Reading,
    /// Reporting interval configured on the tag. Carried through but unused.
    pub update_rate: u8,
    /// Device address in record order.
    pub address: [u8; ADDRESS_LEN],
}

impl SensorRecord {
    /// Decode a record from manufacturer data.
    ///
    /// The payload must be exactly [`RECORD_LEN`] bytes long.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let bytes: &[u8; RECORD_LEN] = data
            .try_into()
            .map_err(|_| length_error(data.len()))?;

        let mut address = [0u8; ADDRESS_LEN];
        address.copy_from_slice(&bytes[ADDRESS..ADDRESS + ADDRESS_LEN]);

        Ok(Self {
            temperature: Reading {
                sign: bytes[TEMPERATURE_SIGN],
                whole: bytes[TEMPERATURE_WHOLE],
                tenths: bytes[TEMPERATURE_TENTHS],
            },
            humidity: Reading {
                sign: bytes[HUMIDITY_SIGN],
                whole: bytes[HUMIDITY_WHOLE],
                tenths: bytes[HUMIDITY_TENTHS],
            },
            update_rate: bytes[UPDATE_RATE],
            address,
        })
    }

    /// Encode the record using the same layout [`SensorRecord::decode`] reads.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[TEMPERATURE_SIGN] = self.temperature.sign;
        bytes[TEMPERATURE_WHOLE] = self.temperature.whole;
        bytes[TEMPERATURE_TENTHS] = self.temperature.tenths;
        bytes[HUMIDITY_SIGN] = self.humidity.sign;
        bytes[HUMIDITY_WHOLE] = self.humidity.whole;
        bytes[HUMIDITY_TENTHS] = self.humidity.tenths;
        bytes[UPDATE_RATE] = self.update_rate;
        bytes[ADDRESS..ADDRESS + ADDRESS_LEN].copy_from_slice(&self.address);
        bytes
    }
}

fn length_error(actual: usize) -> DecodeError {
    match actual {
        0 => DecodeError::Empty,
        n if n < RECORD_LEN => DecodeError::Truncated {
            expected: RECORD_LEN,
            actual: n,
        },
        n => DecodeError::Oversized {
            expected: RECORD_LEN,
            actual: n,
        },
    }
}

impl TryFrom<&[u8]> for SensorRecord {
    type Error = DecodeError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Self::decode(data)
    }
}
