//! Link parameters
//!
//! Port/baud pairs the prober searches over and the session keeps once a
//! device has answered.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProtocolError;

/// Baud rates the instruments are known to run at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    /// 9600 baud (sensor fixed rate, first motor candidate)
    B9600,
    /// 19200 baud
    B19200,
    /// 38400 baud
    B38400,
    /// 57600 baud
    B57600,
    /// 115200 baud
    B115200,
}

impl BaudRate {
    /// Every supported rate, in probing order (ascending)
    pub const ALL: [BaudRate; 5] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    /// Numeric rate in bits per second
    pub fn as_u32(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        BaudRate::ALL
            .into_iter()
            .find(|b| b.as_u32() == value)
            .ok_or_else(|| {
                ProtocolError::InvalidParameters(format!(
                    "unsupported baud rate {} (expected one of 9600, 19200, 38400, 57600, 115200)",
                    value
                ))
            })
    }
}

impl From<BaudRate> for u32 {
    fn from(value: BaudRate) -> Self {
        value.as_u32()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Port and baud rate of one serial link (always 8N1)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: BaudRate,
}

impl ConnectionParameters {
    /// Create parameters for a port at the given rate
    pub fn new(port: impl Into<String>, baud_rate: BaudRate) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl fmt::Display for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} baud", self.port, self.baud_rate)
    }
}

/// How transmit direction is switched on a half-duplex line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPolicy {
    /// Use the driver's native RS-485 mode when available, else toggle RTS
    #[default]
    Auto,
    /// Always toggle RTS around each transmission
    Manual,
    /// Full-duplex link, no direction control
    None,
}
