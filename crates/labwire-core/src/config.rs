//! Instrument configuration
//!
//! Typed settings for links, the motor and the sensor. Every struct
//! deserializes from partial documents (missing keys take their defaults).
//! Nothing here is ever written back to disk.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{
    BaudRate, DirectionPolicy, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_POLL_SLICE_MS,
    DEFAULT_PROBE_TIMEOUT_MS, DEFAULT_SENSOR_TIMEOUT_MS, SENSOR_BAUD_RATE,
};

/// Timing of a half-duplex link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTiming {
    /// Receive polling slice
    pub poll_slice_ms: u64,
    /// Wait after asserting RTS before writing, and after writing before release
    pub rts_settle_ms: u64,
    /// RTS lead/lag programmed into a native RS-485 driver
    pub native_delay_ms: u32,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            poll_slice_ms: DEFAULT_POLL_SLICE_MS,
            rts_settle_ms: 10,
            native_delay_ms: 5,
        }
    }
}

impl LinkTiming {
    /// Receive polling slice as a duration (never zero)
    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms.max(1))
    }

    /// RTS settle time as a duration
    pub fn rts_settle(&self) -> Duration {
        Duration::from_millis(self.rts_settle_ms)
    }
}

/// Motor controller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Port to scan when connecting without explicit parameters
    /// (every listed port is scanned when unset)
    pub port: Option<String>,
    /// Candidate baud rates, tried in order
    pub baud_rates: Vec<BaudRate>,
    /// Modbus slave id of the controller
    pub slave_id: u8,
    /// First register of the move block
    pub start_address: u16,
    /// Registers read by the probe request
    pub probe_register_count: u16,
    /// Speed written with every move
    pub speed: i32,
    /// Current limit written with every move
    pub current: i32,
    /// Calibration words written between speed and current
    pub calibration: [u8; 8],
    /// Deadline for a probe reply at one baud rate
    pub probe_timeout_ms: u64,
    /// Deadline for a move acknowledgement
    pub ack_timeout_ms: u64,
    /// Stop reading once this many acknowledgement bytes arrived
    pub ack_len: usize,
    /// Settle time between flushing and transmitting
    pub settle_ms: u64,
    /// Direction control of the RS-485 line
    pub direction: DirectionPolicy,
    /// Link timing
    pub timing: LinkTiming,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rates: BaudRate::ALL.to_vec(),
            slave_id: 1,
            start_address: 0x0058,
            probe_register_count: 2,
            speed: 1000,
            current: 1000,
            calibration: [0x00, 0x0F, 0x1F, 0x40, 0x00, 0x0F, 0x1F, 0x40],
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            ack_len: 8,
            settle_ms: 50,
            direction: DirectionPolicy::Auto,
            timing: LinkTiming::default(),
        }
    }
}

impl MotorConfig {
    /// Probe deadline as a duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Acknowledgement deadline as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Flush-to-transmit settle time as a duration
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// THP sensor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Ports to try during discovery (every listed port when empty)
    pub ports: Vec<String>,
    /// Link rate (the sensor only runs at 9600)
    pub baud_rate: BaudRate,
    /// Deadline of a steady-state read
    pub read_timeout_ms: u64,
    /// Deadline of a read during port discovery
    pub discovery_timeout_ms: u64,
    /// Wait after opening a port before the first command
    /// (USB-serial boards reset when the port opens)
    pub open_settle_ms: u64,
    /// Direction control (the sensor link is RS-232)
    pub direction: DirectionPolicy,
    /// Link timing
    pub timing: LinkTiming,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: SENSOR_BAUD_RATE,
            read_timeout_ms: DEFAULT_SENSOR_TIMEOUT_MS,
            discovery_timeout_ms: DEFAULT_SENSOR_TIMEOUT_MS,
            open_settle_ms: 500,
            direction: DirectionPolicy::None,
            timing: LinkTiming::default(),
        }
    }
}

impl SensorConfig {
    /// Steady-state read deadline as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Discovery read deadline as a duration
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Post-open settle time as a duration
    pub fn open_settle(&self) -> Duration {
        Duration::from_millis(self.open_settle_ms)
    }
}

/// Settings for both instruments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Motor controller
    pub motor: MotorConfig,
    /// THP sensor
    pub sensor: SensorConfig,
}

impl InstrumentConfig {
    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
